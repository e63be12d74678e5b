//! 单元测试共用的桩实现

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::engine::context::EngineContext;
use crate::index::{DocumentTree, MemoryIndex, TreeNode};
use crate::llm::{CompletionRequest, CompletionService, LlmError};
use crate::telemetry::{NoopTelemetrySink, Stage};

#[derive(Default)]
struct Script {
    responses: HashMap<Stage, VecDeque<Result<String, LlmError>>>,
    delays: HashMap<Stage, Duration>,
    requests: Vec<CompletionRequest>,
}

/// 按阶段预设回复的补全服务
///
/// 每个阶段的回复按顺序消费，只剩最后一条时重复使用；没有预设的阶段返回服务方错误。
#[derive(Clone, Default)]
pub struct ScriptedLlm {
    script: Arc<Mutex<Script>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, stage: Stage, response: &str) -> Self {
        self.push(stage, Ok(response.to_string()))
    }

    pub fn fail(self, stage: Stage) -> Self {
        self.push(
            stage,
            Err(LlmError::Provider {
                stage,
                message: "scripted failure".to_string(),
            }),
        )
    }

    pub fn delay(self, stage: Stage, delay: Duration) -> Self {
        self.script.lock().unwrap().delays.insert(stage, delay);
        self
    }

    fn push(self, stage: Stage, response: Result<String, LlmError>) -> Self {
        self.script
            .lock()
            .unwrap()
            .responses
            .entry(stage)
            .or_default()
            .push_back(response);
        self
    }

    pub fn calls(&self, stage: Stage) -> usize {
        self.requests_for(stage).len()
    }

    pub fn total_calls(&self) -> usize {
        self.script.lock().unwrap().requests.len()
    }

    pub fn requests_for(&self, stage: Stage) -> Vec<CompletionRequest> {
        self.script
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.stage == stage)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CompletionService for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let stage = request.stage;
        let (response, delay) = {
            let mut script = self.script.lock().unwrap();
            script.requests.push(request);
            let delay = script.delays.get(&stage).copied();
            let response = match script.responses.get_mut(&stage) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            };
            (response, delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        response.unwrap_or_else(|| {
            Err(LlmError::Provider {
                stage,
                message: "no scripted response".to_string(),
            })
        })
    }
}

pub fn leaf(node_id: &str, title: &str, start: u32, end: u32) -> TreeNode {
    TreeNode {
        node_id: node_id.to_string(),
        title: title.to_string(),
        summary: format!("{} summary", title),
        start_page: start,
        end_page: end,
        children: vec![],
    }
}

pub fn branch(node_id: &str, title: &str, children: Vec<TreeNode>) -> TreeNode {
    let start = children.iter().map(|c| c.start_page).min().unwrap_or(1);
    let end = children.iter().map(|c| c.end_page).max().unwrap_or(start);
    TreeNode {
        node_id: node_id.to_string(),
        title: title.to_string(),
        summary: format!("{} summary", title),
        start_page: start,
        end_page: end,
        children,
    }
}

pub fn tree(doc_id: &str, description: &str, root_nodes: Vec<TreeNode>) -> DocumentTree {
    DocumentTree {
        doc_id: doc_id.to_string(),
        filename: format!("{}.pdf", doc_id),
        title: doc_id.to_string(),
        description: description.to_string(),
        total_pages: 100,
        root_nodes,
    }
}

/// 带一篇年报的索引：财务报表(收入表 p.12, 资产负债表 p.14-15) 与 风险因素 p.30
pub fn annual_report_index() -> MemoryIndex {
    MemoryIndex::new()
        .with_tree(tree(
            "annual",
            "Annual report with financial statements",
            vec![
                branch(
                    "fin",
                    "Financial Statements",
                    vec![
                        leaf("income", "Income Statement", 12, 12),
                        leaf("balance", "Balance Sheet", 14, 15),
                    ],
                ),
                leaf("risk", "Risk Factors", 30, 30),
            ],
        ))
        .with_page("annual", 12, "Total revenue was $4.2 billion. Net income rose.")
        .with_page("annual", 14, "Total assets were $9.1 billion.")
        .with_page("annual", 15, "Total liabilities were $5.0 billion.")
        .with_page("annual", 30, "Currency risk may affect results.")
}

pub fn context_with(llm: ScriptedLlm, index: MemoryIndex) -> EngineContext {
    EngineContext::with_index(Config::default(), Arc::new(llm), Arc::new(index))
        .with_telemetry(Arc::new(NoopTelemetrySink))
}
