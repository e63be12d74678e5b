//! 基于目录的JSON索引存储
//!
//! 目录下每个文档对应两个文件：
//! - `<doc_id>.tree.json`：[`DocumentTree`]
//! - `<doc_id>.pages.json`：`[{"page_number": 1, "text": "..."}]`
//!
//! 树在打开时一次性加载；页面按文档懒加载并缓存。所有文件读取都在阻塞线程池中执行。

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use walkdir::WalkDir;

use super::{
    DocumentCatalog, DocumentInfo, DocumentTree, IndexError, MemoryIndex, NodeSummary,
    PageContentProvider, PageRecord, TreeIndexProvider,
};

const TREE_SUFFIX: &str = ".tree.json";
const PAGES_SUFFIX: &str = ".pages.json";

type PageMap = Arc<HashMap<u32, String>>;

pub struct JsonIndexStore {
    data_dir: PathBuf,
    trees: MemoryIndex,
    pages: RwLock<HashMap<String, PageMap>>,
}

impl JsonIndexStore {
    /// 扫描目录并加载全部树索引
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.to_path_buf();
        let trees = tokio::task::spawn_blocking(move || load_trees(&dir))
            .await
            .context("Tree loading task panicked")??;

        let mut index = MemoryIndex::new();
        for tree in trees {
            tracing::debug!(doc_id = %tree.doc_id, sections = tree.root_nodes.len(), "loaded tree index");
            index.insert_tree(tree);
        }

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            trees: index,
            pages: RwLock::new(HashMap::new()),
        })
    }

    pub fn document_count(&self) -> usize {
        self.trees.document_count()
    }

    async fn document_pages(&self, document_id: &str) -> Result<PageMap, IndexError> {
        if let Some(pages) = self.pages.read().await.get(document_id) {
            return Ok(pages.clone());
        }

        let path = self.data_dir.join(format!("{}{}", document_id, PAGES_SUFFIX));
        let doc = document_id.to_string();
        let pages = tokio::task::spawn_blocking(move || read_pages(&path, &doc))
            .await
            .map_err(|e| IndexError::Io(e.to_string()))??;
        let pages = Arc::new(pages);

        let mut cache = self.pages.write().await;
        Ok(cache
            .entry(document_id.to_string())
            .or_insert(pages)
            .clone())
    }
}

fn load_trees(data_dir: &Path) -> Result<Vec<DocumentTree>> {
    if !data_dir.is_dir() {
        anyhow::bail!("Index directory does not exist: {}", data_dir.display());
    }

    let mut trees = Vec::new();
    for entry in WalkDir::new(data_dir).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let is_tree = entry.file_type().is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TREE_SUFFIX));
        if !is_tree {
            continue;
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tree index: {}", path.display()))?;
        let tree: DocumentTree = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse tree index: {}", path.display()))?;
        trees.push(tree);
    }
    Ok(trees)
}

fn read_pages(path: &Path, document_id: &str) -> Result<HashMap<u32, String>, IndexError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(IndexError::DocumentNotFound(document_id.to_string()));
        }
        Err(e) => return Err(IndexError::Io(format!("{}: {}", path.display(), e))),
    };
    let records: Vec<PageRecord> = serde_json::from_str(&content)
        .map_err(|e| IndexError::Parse(format!("{}: {}", path.display(), e)))?;
    Ok(records
        .into_iter()
        .map(|r| (r.page_number, r.text))
        .collect())
}

#[async_trait]
impl TreeIndexProvider for JsonIndexStore {
    async fn root_summary(&self, document_id: &str) -> Result<String, IndexError> {
        self.trees.root_summary(document_id).await
    }

    async fn children(
        &self,
        document_id: &str,
        node_id: &str,
    ) -> Result<Vec<NodeSummary>, IndexError> {
        self.trees.children(document_id, node_id).await
    }
}

#[async_trait]
impl PageContentProvider for JsonIndexStore {
    async fn page_text(&self, document_id: &str, page_number: u32) -> Result<String, IndexError> {
        let pages = self.document_pages(document_id).await?;
        pages
            .get(&page_number)
            .cloned()
            .ok_or_else(|| IndexError::PageNotFound {
                document_id: document_id.to_string(),
                page_number,
            })
    }
}

#[async_trait]
impl DocumentCatalog for JsonIndexStore {
    async fn list_indexed_documents(&self) -> Result<Vec<DocumentInfo>, IndexError> {
        self.trees.list_indexed_documents().await
    }
}
