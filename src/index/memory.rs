use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

use super::{
    DocumentCatalog, DocumentInfo, DocumentTree, IndexError, NodeSummary, PageContentProvider,
    PageRecord, ROOT_NODE_ID, TreeIndexProvider, TreeNode,
};

#[derive(Debug, Default, Clone)]
struct IndexedDocument {
    summary: String,
    /// node_id -> 子节点视图，根节点使用 ROOT_NODE_ID
    children: HashMap<String, Vec<NodeSummary>>,
    pages: HashMap<u32, String>,
}

/// 内存中的树索引与页面存储
///
/// 构建完成后只读，可在并发查询间共享。
#[derive(Debug, Default, Clone)]
pub struct MemoryIndex {
    documents: BTreeMap<String, IndexedDocument>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入一棵文档树，已存在的同ID文档会被替换（页面保留）
    pub fn insert_tree(&mut self, tree: DocumentTree) {
        let entry = self.documents.entry(tree.doc_id.clone()).or_default();
        entry.summary = tree.root_summary();
        entry.children.clear();
        entry.children.insert(
            ROOT_NODE_ID.to_string(),
            tree.root_nodes.iter().map(TreeNode::to_summary).collect(),
        );
        for node in &tree.root_nodes {
            index_children(node, &mut entry.children);
        }
    }

    pub fn insert_pages(&mut self, document_id: &str, pages: Vec<PageRecord>) {
        let entry = self.documents.entry(document_id.to_string()).or_default();
        for page in pages {
            entry.pages.insert(page.page_number, page.text);
        }
    }

    pub fn with_tree(mut self, tree: DocumentTree) -> Self {
        self.insert_tree(tree);
        self
    }

    pub fn with_page(mut self, document_id: &str, page_number: u32, text: &str) -> Self {
        self.insert_pages(
            document_id,
            vec![PageRecord {
                page_number,
                text: text.to_string(),
            }],
        );
        self
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    fn document(&self, document_id: &str) -> Result<&IndexedDocument, IndexError> {
        self.documents
            .get(document_id)
            .ok_or_else(|| IndexError::DocumentNotFound(document_id.to_string()))
    }
}

fn index_children(node: &TreeNode, children: &mut HashMap<String, Vec<NodeSummary>>) {
    children.insert(
        node.node_id.clone(),
        node.children.iter().map(TreeNode::to_summary).collect(),
    );
    for child in &node.children {
        index_children(child, children);
    }
}

#[async_trait]
impl TreeIndexProvider for MemoryIndex {
    async fn root_summary(&self, document_id: &str) -> Result<String, IndexError> {
        Ok(self.document(document_id)?.summary.clone())
    }

    async fn children(
        &self,
        document_id: &str,
        node_id: &str,
    ) -> Result<Vec<NodeSummary>, IndexError> {
        self.document(document_id)?
            .children
            .get(node_id)
            .cloned()
            .ok_or_else(|| IndexError::NodeNotFound {
                document_id: document_id.to_string(),
                node_id: node_id.to_string(),
            })
    }
}

#[async_trait]
impl PageContentProvider for MemoryIndex {
    async fn page_text(&self, document_id: &str, page_number: u32) -> Result<String, IndexError> {
        self.document(document_id)?
            .pages
            .get(&page_number)
            .cloned()
            .ok_or_else(|| IndexError::PageNotFound {
                document_id: document_id.to_string(),
                page_number,
            })
    }
}

#[async_trait]
impl DocumentCatalog for MemoryIndex {
    async fn list_indexed_documents(&self) -> Result<Vec<DocumentInfo>, IndexError> {
        Ok(self
            .documents
            .iter()
            .map(|(id, doc)| DocumentInfo {
                document_id: id.clone(),
                summary: doc.summary.clone(),
            })
            .collect())
    }
}
