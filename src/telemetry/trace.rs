use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::engine::types::PipelineState;
use crate::telemetry::Stage;

/// 状态机的一次迁移记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// 迁移后进入的状态
    pub state: PipelineState,
    /// 触发迁移的阶段（Received / Done / Rejected 等没有对应阶段）
    pub stage: Option<Stage>,
    pub duration_ms: u64,
    /// 阶段结构化输出摘要
    pub summary: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// 单个查询的完整迁移日志
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryTrace {
    pub query_id: String,
    pub thread_id: String,
    pub started_at: DateTime<Utc>,
    pub entries: Vec<TraceEntry>,
}

impl QueryTrace {
    pub fn new(query_id: &str, thread_id: &str) -> Self {
        Self {
            query_id: query_id.to_string(),
            thread_id: thread_id.to_string(),
            started_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    pub fn record(
        &mut self,
        state: PipelineState,
        stage: Option<Stage>,
        duration_ms: u64,
        summary: serde_json::Value,
    ) {
        self.entries.push(TraceEntry {
            state,
            stage,
            duration_ms,
            summary,
            at: Utc::now(),
        });
    }

    /// 依次经过的状态
    pub fn states(&self) -> Vec<PipelineState> {
        self.entries.iter().map(|e| e.state).collect()
    }

    /// 某状态出现的次数（重试会使 Searched 出现多次）
    pub fn count(&self, state: PipelineState) -> usize {
        self.entries.iter().filter(|e| e.state == state).count()
    }

    pub fn last_state(&self) -> Option<PipelineState> {
        self.entries.last().map(|e| e.state)
    }
}

#[derive(Debug, Default)]
struct TraceStoreInner {
    traces: HashMap<String, QueryTrace>,
    order: VecDeque<String>,
}

/// 按查询ID保存的可回放追踪
///
/// 仅保存在进程内存中，超出容量时淘汰最早的记录。
#[derive(Debug, Clone)]
pub struct TraceStore {
    inner: Arc<RwLock<TraceStoreInner>>,
    capacity: usize,
}

impl Default for TraceStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl TraceStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TraceStoreInner::default())),
            capacity: capacity.max(1),
        }
    }

    /// 保存追踪，同ID覆盖
    pub async fn store(&self, trace: QueryTrace) {
        let mut inner = self.inner.write().await;
        let query_id = trace.query_id.clone();
        if inner.traces.insert(query_id.clone(), trace).is_none() {
            inner.order.push_back(query_id);
        }
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.traces.remove(&evicted);
            }
        }
    }

    pub async fn get(&self, query_id: &str) -> Option<QueryTrace> {
        let inner = self.inner.read().await;
        inner.traces.get(query_id).cloned()
    }

    /// 列出某个会话下的所有查询ID（按写入顺序）
    pub async fn list_thread(&self, thread_id: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .traces
                    .get(*id)
                    .is_some_and(|t| t.thread_id == thread_id)
            })
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.traces.len()
    }
}
