use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

use crate::config::QueryConfig;
use crate::index::PageRange;

/// 流水线警告词表，所有阶段只从这里取值
pub mod warnings {
    pub const PROMPT_INJECTION_DETECTED: &str = "prompt_injection_detected";
    pub const INPUT_TOO_LONG: &str = "input_too_long";
    pub const INPUT_TOO_SHORT: &str = "input_too_short";
    pub const PII_MASKED: &str = "pii_masked";
    pub const GUARDRAIL_INTERNAL_ERROR: &str = "guardrail_internal_error";
    pub const CLASSIFICATION_DEGRADED: &str = "classification_degraded";
    pub const PLAN_DEGRADED: &str = "plan_degraded";
    pub const DOCUMENT_SELECTION_DEGRADED: &str = "document_selection_degraded";
    pub const NO_DOCUMENTS_INDEXED: &str = "no_documents_indexed";
    pub const SEARCH_EMPTY: &str = "search_empty";
    pub const CRITIC_DEGRADED: &str = "critic_degraded";
    pub const RETRY_BUDGET_EXHAUSTED: &str = "retry_budget_exhausted";
    pub const GENERATION_FAILED: &str = "generation_failed";
    pub const DEADLINE_EXCEEDED: &str = "deadline_exceeded";
    pub const MISSING_CITATION: &str = "missing_citation";
    pub const EMPTY_ANSWER: &str = "empty_answer";
    pub const SENSITIVE_DATA_REDACTED: &str = "sensitive_data_redacted";
    pub const FINANCIAL_DISCLAIMER_ADDED: &str = "financial_disclaimer_added";
    pub const INVESTMENT_ADVICE_FLAGGED: &str = "investment_advice_flagged";

    pub fn search_failed(document_id: &str) -> String {
        format!("search_failed:{}", document_id)
    }

    pub fn page_unavailable(document_id: &str, page_number: u32) -> String {
        format!("page_unavailable:{}:{}", document_id, page_number)
    }
}

/// 用户可见的固定回复文本
pub mod messages {
    pub const CANNOT_ANSWER: &str = "I cannot answer this question from the provided documents.";
    pub const INPUT_REJECTED: &str =
        "Your question could not be processed. Please rephrase it and try again.";
    pub const INJECTION_REJECTED: &str = "Your question appears to contain instructions aimed at the assistant rather than a question about the documents, so it was not processed.";
    pub const OUTPUT_REJECTED: &str =
        "A reliable, cited answer could not be produced for this question.";
    pub const TIMED_OUT: &str =
        "The question could not be answered within the time limit. Please try a narrower question.";
}

/// 查询输入，创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub question: String,
    /// 会话关联键
    pub thread_id: String,
    /// 调用方限定的文档范围
    #[serde(default)]
    pub requested_document_ids: Option<Vec<String>>,
}

impl Query {
    pub fn new(question: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            thread_id: thread_id.into(),
            requested_document_ids: None,
        }
    }

    pub fn with_documents(mut self, document_ids: Vec<String>) -> Self {
        self.requested_document_ids = Some(document_ids);
        self
    }
}

/// 执行路由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Fast,
    #[default]
    Standard,
    Complex,
}

impl Route {
    /// 分数到路由的映射，区间取左闭右开：
    /// `[0, fast)` → Fast，`[fast, complex)` → Standard，`[complex, 1]` → Complex
    pub fn from_score(score: f64, fast_threshold: f64, complex_threshold: f64) -> Route {
        if score < fast_threshold {
            Route::Fast
        } else if score < complex_threshold {
            Route::Standard
        } else {
            Route::Complex
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Fast => "fast",
            Route::Standard => "standard",
            Route::Complex => "complex",
        }
    }

    pub fn uses_plan(&self) -> bool {
        match self {
            Route::Fast | Route::Standard => false,
            Route::Complex => true,
        }
    }

    pub fn uses_critic(&self) -> bool {
        match self {
            Route::Fast => false,
            Route::Standard | Route::Complex => true,
        }
    }

    pub fn context_budget(&self, config: &QueryConfig) -> usize {
        match self {
            Route::Fast => config.fast_context_chars,
            Route::Standard => config.standard_context_chars,
            Route::Complex => config.complex_context_chars,
        }
    }

    pub fn max_tokens(&self, config: &QueryConfig) -> u32 {
        match self {
            Route::Fast => config.fast_max_tokens,
            Route::Standard => config.standard_max_tokens,
            Route::Complex => config.complex_max_tokens,
        }
    }

    pub fn deadline_ms(&self, config: &QueryConfig) -> u64 {
        match self {
            Route::Fast => config.fast_deadline_ms,
            Route::Standard => config.standard_deadline_ms,
            Route::Complex => config.complex_deadline_ms,
        }
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 候选文档（带树根摘要）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateDocument {
    pub document_id: String,
    pub summary: String,
}

/// 树搜索命中的单页
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub document_id: String,
    pub page_number: u32,
    pub traversal_confidence: f64,
    pub reasoning_note: String,
}

/// 树搜索中对单个节点的一次评估
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchStep {
    pub document_id: String,
    /// 深度，顶层章节为0
    pub level: usize,
    pub node_id: String,
    pub title: String,
    pub selected: bool,
    pub confidence: Option<f64>,
    pub reasoning: String,
    pub page_range: Option<PageRange>,
}

/// 组装后上下文中的一页
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPage {
    pub document_id: String,
    pub page_number: u32,
    pub text: String,
    pub confidence: f64,
}

/// 带字符预算的组装上下文
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub pages: Vec<ContextPage>,
    pub char_budget: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn total_chars(&self) -> usize {
        self.pages.iter().map(|p| p.text.chars().count()).sum()
    }

    pub fn sources(&self) -> Vec<SourceRef> {
        self.pages
            .iter()
            .map(|p| SourceRef {
                document_id: p.document_id.clone(),
                page_number: p.page_number,
            })
            .collect()
    }

    /// 以 `[doc_id p.N]` 为页眉渲染给模型
    pub fn render(&self) -> String {
        self.pages
            .iter()
            .map(|p| format!("[{} p.{}]\n{}", p.document_id, p.page_number, p.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticReason {
    EmptyContext,
    LowRelevance,
    Sufficient,
}

impl CriticReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CriticReason::EmptyContext => "empty_context",
            CriticReason::LowRelevance => "low_relevance",
            CriticReason::Sufficient => "sufficient",
        }
    }
}

impl Display for CriticReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticVerdict {
    pub relevance_score: f64,
    pub groundedness_score: f64,
    pub completeness_score: f64,
    pub needs_retry: bool,
    pub reason: CriticReason,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub suggested_query: Option<String>,
}

impl CriticVerdict {
    /// 重试时传给树搜索的提示：原因 + 建议的查询
    pub fn guidance(&self) -> String {
        match self.suggested_query.as_deref().map(str::trim) {
            Some(query) if !query.is_empty() => format!("{}: {}", self.reason, query),
            _ => self.reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_id: String,
    pub page_number: u32,
}

/// 状态机的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    InputGuarded,
    Routed,
    Planned,
    DocumentsSelected,
    Searched,
    Assembled,
    Critiqued,
    Generated,
    OutputGuarded,
    Done,
    Rejected,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Rejected)
    }

    /// 给定路由下 `self → to` 是否为合法迁移
    ///
    /// 截止时间到达时，InputGuarded 之后的任一非终止状态都可以直接进入 OutputGuarded。
    pub fn can_transition(&self, to: PipelineState, route: Route) -> bool {
        use PipelineState::*;

        if self.is_terminal() {
            return false;
        }
        if to == OutputGuarded
            && matches!(
                self,
                InputGuarded | Routed | Planned | DocumentsSelected | Searched | Assembled
                    | Critiqued | Generated
            )
        {
            return true;
        }

        match (self, to) {
            (Received, InputGuarded) | (Received, Rejected) => true,
            (InputGuarded, Routed) => true,
            (Routed, Planned) => route.uses_plan(),
            (Routed, DocumentsSelected) => !route.uses_plan(),
            (Planned, DocumentsSelected) => route.uses_plan(),
            (DocumentsSelected, Searched) => true,
            (Searched, Assembled) => true,
            (Assembled, Critiqued) => route.uses_critic(),
            (Assembled, Generated) => !route.uses_critic(),
            (Critiqued, Searched) | (Critiqued, Generated) => route.uses_critic(),
            (OutputGuarded, Done) => true,
            _ => false,
        }
    }
}

impl Display for PipelineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Received => "received",
            PipelineState::InputGuarded => "input_guarded",
            PipelineState::Routed => "routed",
            PipelineState::Planned => "planned",
            PipelineState::DocumentsSelected => "documents_selected",
            PipelineState::Searched => "searched",
            PipelineState::Assembled => "assembled",
            PipelineState::Critiqued => "critiqued",
            PipelineState::Generated => "generated",
            PipelineState::OutputGuarded => "output_guarded",
            PipelineState::Done => "done",
            PipelineState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("illegal transition {from} -> {to} on route {route}")]
    IllegalTransition {
        from: PipelineState,
        to: PipelineState,
        route: Route,
    },
}

/// 单个查询生命周期内唯一的可变状态
///
/// 由处理该查询的执行上下文独占；各阶段只做增量更新，
/// 只有 `search_results` 与 `assembled_context` 会在重试时被整体替换。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryState {
    pub query_id: String,
    pub query: Query,
    /// 经过输入护栏处理后的问题
    pub sanitized_question: String,
    pub route: Route,
    pub complexity_score: f64,
    pub plan: Vec<String>,
    pub candidate_documents: Vec<CandidateDocument>,
    pub search_results: Vec<SearchResult>,
    pub search_trace: Vec<SearchStep>,
    pub assembled_context: AssembledContext,
    pub critic_verdict: Option<CriticVerdict>,
    pub retry_count: u32,
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub confidence: f64,
    pub warnings: Vec<String>,
    pub pipeline_state: PipelineState,
}

impl QueryState {
    pub fn new(query_id: impl Into<String>, query: Query) -> Self {
        Self {
            query_id: query_id.into(),
            sanitized_question: query.question.clone(),
            query,
            route: Route::default(),
            complexity_score: 0.5,
            plan: Vec::new(),
            candidate_documents: Vec::new(),
            search_results: Vec::new(),
            search_trace: Vec::new(),
            assembled_context: AssembledContext::default(),
            critic_verdict: None,
            retry_count: 0,
            answer: String::new(),
            sources: Vec::new(),
            confidence: 0.0,
            warnings: Vec::new(),
            pipeline_state: PipelineState::Received,
        }
    }

    /// 追加警告，已存在的同名警告不重复记录
    pub fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }

    pub fn extend_warnings<I, S>(&mut self, warnings: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for warning in warnings {
            self.warn(warning);
        }
    }

    pub fn has_warning(&self, warning: &str) -> bool {
        self.warnings.iter().any(|w| w == warning)
    }

    pub fn transition(&mut self, to: PipelineState) -> Result<(), EngineError> {
        if !self.pipeline_state.can_transition(to, self.route) {
            return Err(EngineError::IllegalTransition {
                from: self.pipeline_state,
                to,
                route: self.route,
            });
        }
        self.pipeline_state = to;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Answered,
    CannotAnswer,
    InputRejected,
    OutputRejected,
    TimedOut,
}

/// 返回给调用方的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query_id: String,
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub confidence: f64,
    pub query_type: Route,
    pub complexity_score: f64,
    pub retry_count: u32,
    pub warnings: Vec<String>,
    pub status: QueryStatus,
    pub latency_ms: u64,
}

/// 流式查询事件
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    Done(QueryResponse),
}
