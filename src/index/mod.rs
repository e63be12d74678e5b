//! 树索引与页面内容 - 编排引擎消费的外部协作方接口
//!
//! 引擎只需要三件事：文档目录、按节点逐层获取子节点、按页获取原文。
//! 树的构建与PDF解析不在本crate范围内。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod json_store;
pub mod memory;

pub use json_store::JsonIndexStore;
pub use memory::MemoryIndex;

/// 文档根节点的保留ID，`children(doc, ROOT_NODE_ID)` 返回顶层章节
pub const ROOT_NODE_ID: &str = "root";

/// 闭区间页码范围（页码从1开始）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    /// 最多展开 `limit` 页
    pub fn pages(&self, limit: usize) -> Vec<u32> {
        (self.start..=self.end).take(limit).collect()
    }
}

impl std::fmt::Display for PageRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "p.{}", self.start)
        } else {
            write!(f, "p.{}-{}", self.start, self.end)
        }
    }
}

/// 树搜索时展示给模型的节点视图（只有标题与摘要，不含子树）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_id: String,
    pub title: String,
    pub summary: String,
    pub is_leaf: bool,
    pub page_range: Option<PageRange>,
}

/// 已索引文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub document_id: String,
    pub summary: String,
}

/// 持久化的树节点格式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub node_id: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    pub start_page: u32,
    pub end_page: u32,
    #[serde(default)]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn to_summary(&self) -> NodeSummary {
        NodeSummary {
            node_id: self.node_id.clone(),
            title: self.title.clone(),
            summary: self.summary.clone(),
            is_leaf: self.children.is_empty(),
            page_range: Some(PageRange::new(self.start_page, self.end_page)),
        }
    }
}

/// 单个文档的完整树索引
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentTree {
    pub doc_id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub root_nodes: Vec<TreeNode>,
}

impl DocumentTree {
    /// 用于文档选择的根摘要：优先描述，其次标题，最后顶层章节标题
    pub fn root_summary(&self) -> String {
        if !self.description.trim().is_empty() {
            return self.description.clone();
        }
        let mut parts = Vec::new();
        if !self.title.trim().is_empty() {
            parts.push(self.title.clone());
        }
        let sections: Vec<&str> = self.root_nodes.iter().map(|n| n.title.as_str()).collect();
        if !sections.is_empty() {
            parts.push(format!("Sections: {}", sections.join("; ")));
        }
        parts.join(". ")
    }
}

/// 单页原文记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub page_number: u32,
    pub text: String,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndexError {
    #[error("document `{0}` is not indexed")]
    DocumentNotFound(String),

    #[error("node `{node_id}` not found in document `{document_id}`")]
    NodeNotFound {
        document_id: String,
        node_id: String,
    },

    #[error("page {page_number} not found in document `{document_id}`")]
    PageNotFound {
        document_id: String,
        page_number: u32,
    },

    #[error("failed to read index file: {0}")]
    Io(String),

    #[error("failed to parse index file: {0}")]
    Parse(String),
}

/// 树索引提供方
#[async_trait]
pub trait TreeIndexProvider: Send + Sync {
    async fn root_summary(&self, document_id: &str) -> Result<String, IndexError>;

    async fn children(
        &self,
        document_id: &str,
        node_id: &str,
    ) -> Result<Vec<NodeSummary>, IndexError>;
}

/// 页面内容提供方
#[async_trait]
pub trait PageContentProvider: Send + Sync {
    async fn page_text(&self, document_id: &str, page_number: u32) -> Result<String, IndexError>;
}

/// 文档目录
#[async_trait]
pub trait DocumentCatalog: Send + Sync {
    async fn list_indexed_documents(&self) -> Result<Vec<DocumentInfo>, IndexError>;
}
