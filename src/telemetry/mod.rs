//! 遥测 - 阶段事件的发送与查询级追踪记录
//!
//! 事件发送是"发出即忘"的：[`TelemetrySink::emit`] 是同步、无返回值的接口，
//! 实现方不得阻塞调用方，也无法让流水线失败。

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod timing;
pub mod trace;

pub use timing::TimingScope;
pub use trace::{QueryTrace, TraceEntry, TraceStore};

/// 流水线阶段标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    InputGuard,
    Router,
    Planner,
    DocumentSelector,
    TreeSearch,
    PageAssembler,
    Critic,
    Generator,
    OutputGuard,
    HealthCheck,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::InputGuard => "input_guard",
            Stage::Router => "router",
            Stage::Planner => "planner",
            Stage::DocumentSelector => "document_selector",
            Stage::TreeSearch => "tree_search",
            Stage::PageAssembler => "page_assembler",
            Stage::Critic => "critic",
            Stage::Generator => "generator",
            Stage::OutputGuard => "output_guard",
            Stage::HealthCheck => "health_check",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个阶段执行完成后发出的结构化事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub query_id: String,
    pub stage: Stage,
    pub duration_ms: u64,
    /// 阶段输出摘要（不包含原始提供方错误正文以外的敏感内容）
    pub outcome: serde_json::Value,
}

/// 遥测接收端
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: StageEvent);
}

/// 写入 `tracing` 的默认接收端
#[derive(Debug, Default, Clone)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn emit(&self, event: StageEvent) {
        tracing::info!(
            target: "pageindex::telemetry",
            query_id = %event.query_id,
            stage = %event.stage,
            duration_ms = event.duration_ms,
            outcome = %event.outcome,
            "stage completed"
        );
    }
}

/// 转发到无界通道的接收端，供外部采集器异步消费
///
/// 通道关闭后事件被丢弃。
#[derive(Debug, Clone)]
pub struct ChannelTelemetrySink {
    sender: mpsc::UnboundedSender<StageEvent>,
}

impl ChannelTelemetrySink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StageEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl TelemetrySink for ChannelTelemetrySink {
    fn emit(&self, event: StageEvent) {
        let _ = self.sender.send(event);
    }
}

/// 不做任何事的接收端
#[derive(Debug, Default, Clone)]
pub struct NoopTelemetrySink;

impl TelemetrySink for NoopTelemetrySink {
    fn emit(&self, _event: StageEvent) {}
}
