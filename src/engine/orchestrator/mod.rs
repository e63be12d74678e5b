//! 查询编排状态机
//!
//! 一个查询由一个执行上下文独占处理：输入护栏 → 路由 → (规划) → 文档选择 → 树搜索 →
//! 页面组装 → (评审 → 有界重试) → 回答生成 → 输出护栏。各阶段的失败都在本地降级为
//! 警告与安全默认值，`run_query` 对调用方不会失败。

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use uuid::Uuid;

use crate::engine::assembler::PageAssembler;
use crate::engine::context::EngineContext;
use crate::engine::generator::AnswerGenerator;
use crate::engine::guardrail::{OutputDraft, validate_input_fail_closed, validate_output_fail_closed};
use crate::engine::planner::PlanBuilder;
use crate::engine::router::ComplexityRouter;
use crate::engine::selector::DocumentSelector;
use crate::engine::tree_search::{SearchError, SearchTask, TreeSearcher};
use crate::engine::types::{
    CriticReason, EngineError, PipelineState, Query, QueryResponse, QueryState, QueryStatus,
    StreamEvent, messages, warnings,
};
use crate::telemetry::{QueryTrace, Stage, StageEvent, TimingScope, TraceStore};

/// 默认保留的查询轨迹数量
const DEFAULT_TRACE_CAPACITY: usize = 256;

/// 流式输出通道容量
const STREAM_BUFFER: usize = 32;

/// 单个查询的阶段计时与轨迹记录
struct RunLog {
    timing: TimingScope,
    trace: QueryTrace,
}

impl RunLog {
    fn new(state: &QueryState) -> Self {
        let mut trace = QueryTrace::new(&state.query_id, &state.query.thread_id);
        trace.record(state.pipeline_state, None, 0, json!({}));
        Self {
            timing: TimingScope::new(),
            trace,
        }
    }

    fn begin(&mut self, stage: Stage) {
        self.timing.start_phase(stage.as_str());
    }

    /// 阶段结束：发出遥测事件，并以迁移后的状态记录一条轨迹
    fn finish(
        &mut self,
        context: &EngineContext,
        state: &QueryState,
        stage: Stage,
        summary: serde_json::Value,
    ) {
        let duration_ms = self
            .timing
            .end_phase(stage.as_str())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        tracing::debug!(
            query_id = %state.query_id,
            stage = %stage,
            route = %state.route,
            state = %state.pipeline_state,
            duration_ms,
            "stage finished"
        );

        context.telemetry.emit(StageEvent {
            query_id: state.query_id.clone(),
            stage,
            duration_ms,
            outcome: summary.clone(),
        });
        self.trace
            .record(state.pipeline_state, Some(stage), duration_ms, summary);
    }

    /// 不属于任何阶段的迁移（如 Done）
    fn mark(&mut self, state: &QueryState, summary: serde_json::Value) {
        self.trace.record(state.pipeline_state, None, 0, summary);
    }
}

/// 查询引擎
///
/// 持有长期存在的协作方与轨迹存储，可被多个并发查询共享；克隆成本很低。
#[derive(Clone)]
pub struct QueryEngine {
    context: Arc<EngineContext>,
    traces: TraceStore,
}

impl QueryEngine {
    pub fn new(context: EngineContext) -> Self {
        Self {
            context: Arc::new(context),
            traces: TraceStore::new(DEFAULT_TRACE_CAPACITY),
        }
    }

    /// 按查询ID回放的状态迁移日志
    pub fn traces(&self) -> &TraceStore {
        &self.traces
    }

    pub async fn run_query(&self, query: Query) -> QueryResponse {
        self.run_query_with_state(query).await.0
    }

    /// 流式执行：答案通过输出护栏之后才按词切分发送，最后发送完整结果
    pub fn run_query_stream(&self, query: Query) -> mpsc::Receiver<StreamEvent> {
        let (sender, receiver) = mpsc::channel(STREAM_BUFFER);
        let engine = self.clone();
        tokio::spawn(async move {
            let response = engine.run_query(query).await;
            for token in response.answer.split_inclusive(char::is_whitespace) {
                if sender.send(StreamEvent::Token(token.to_string())).await.is_err() {
                    return;
                }
            }
            let _ = sender.send(StreamEvent::Done(response)).await;
        });
        receiver
    }

    /// 执行查询并同时返回最终的查询状态
    pub async fn run_query_with_state(&self, query: Query) -> (QueryResponse, QueryState) {
        let started = Instant::now();
        let mut state = QueryState::new(Uuid::new_v4().to_string(), query);
        let mut log = RunLog::new(&state);

        tracing::debug!(
            query_id = %state.query_id,
            thread_id = %state.query.thread_id,
            "query received"
        );

        let status = match self.guard_input(&mut state, &mut log) {
            Ok(true) => match self.drive(&mut state, &mut log, started).await {
                Ok(status) => status,
                Err(e) => self.abort(&mut state, &mut log, e),
            },
            Ok(false) => QueryStatus::InputRejected,
            Err(e) => self.abort(&mut state, &mut log, e),
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            query_id = %state.query_id,
            route = %state.route,
            status = ?status,
            retry_count = state.retry_count,
            latency_ms,
            "query finished"
        );
        tracing::debug!(
            query_id = %state.query_id,
            "stage timings\n{}",
            log.timing.generate_timing_report()
        );

        let response = QueryResponse {
            query_id: state.query_id.clone(),
            answer: state.answer.clone(),
            sources: state.sources.clone(),
            confidence: state.confidence,
            query_type: state.route,
            complexity_score: state.complexity_score,
            retry_count: state.retry_count,
            warnings: state.warnings.clone(),
            status,
            latency_ms,
        };
        self.traces.store(log.trace).await;
        (response, state)
    }

    /// 输入护栏；返回问题是否被放行
    fn guard_input(&self, state: &mut QueryState, log: &mut RunLog) -> Result<bool, EngineError> {
        log.begin(Stage::InputGuard);
        let verdict =
            validate_input_fail_closed(self.context.input_validator.as_ref(), &state.query.question);
        state.extend_warnings(verdict.warnings.iter().cloned());

        if verdict.valid {
            state.sanitized_question = verdict.sanitized_question;
            state.transition(PipelineState::InputGuarded)?;
        } else {
            tracing::warn!(query_id = %state.query_id, warnings = ?verdict.warnings, "question rejected");
            state.answer = if verdict.is_injection() {
                messages::INJECTION_REJECTED
            } else {
                messages::INPUT_REJECTED
            }
            .to_string();
            state.confidence = 0.0;
            state.transition(PipelineState::Rejected)?;
        }

        log.finish(
            &self.context,
            state,
            Stage::InputGuard,
            json!({ "valid": verdict.valid, "warnings": verdict.warnings }),
        );
        Ok(verdict.valid)
    }

    /// 在截止时间内推进到 Generated，然后经过输出护栏到达 Done
    ///
    /// 路由前使用最宽的截止时间，路由确定后收紧为该路由的截止时间。
    async fn drive(
        &self,
        state: &mut QueryState,
        log: &mut RunLog,
        started: Instant,
    ) -> Result<QueryStatus, EngineError> {
        let query = &self.context.config.query;
        let ceiling = query
            .fast_deadline_ms
            .max(query.standard_deadline_ms)
            .max(query.complex_deadline_ms);

        let mut timed_out = match timeout_at(deadline(started, ceiling), self.classify(state, log)).await
        {
            Ok(result) => {
                result?;
                false
            }
            Err(_) => true,
        };

        if !timed_out {
            let route_deadline = deadline(started, state.route.deadline_ms(query));
            timed_out = match timeout_at(route_deadline, self.retrieve_and_answer(state, log)).await {
                Ok(result) => {
                    result?;
                    false
                }
                Err(_) => true,
            };
        }

        if timed_out {
            tracing::warn!(
                query_id = %state.query_id,
                route = %state.route,
                state = %state.pipeline_state,
                "deadline exceeded"
            );
            state.warn(warnings::DEADLINE_EXCEEDED);
            if state.pipeline_state != PipelineState::Generated || state.answer.trim().is_empty() {
                state.answer = messages::TIMED_OUT.to_string();
                state.sources.clear();
                state.confidence = 0.0;
            }
        }

        let valid = self.guard_output(state, log)?;
        state.transition(PipelineState::Done)?;
        log.mark(state, json!({ "answer_chars": state.answer.chars().count() }));

        Ok(if timed_out {
            QueryStatus::TimedOut
        } else if !valid {
            QueryStatus::OutputRejected
        } else if state.confidence == 0.0 && state.answer == messages::CANNOT_ANSWER {
            QueryStatus::CannotAnswer
        } else {
            QueryStatus::Answered
        })
    }

    async fn classify(&self, state: &mut QueryState, log: &mut RunLog) -> Result<(), EngineError> {
        log.begin(Stage::Router);
        let decision = ComplexityRouter
            .classify(&self.context, &state.sanitized_question)
            .await;
        state.route = decision.route;
        state.complexity_score = decision.complexity_score;
        if decision.degraded {
            state.warn(warnings::CLASSIFICATION_DEGRADED);
        }
        state.transition(PipelineState::Routed)?;
        log.finish(
            &self.context,
            state,
            Stage::Router,
            json!({
                "route": decision.route,
                "complexity_score": decision.complexity_score,
                "degraded": decision.degraded,
            }),
        );
        Ok(())
    }

    async fn retrieve_and_answer(
        &self,
        state: &mut QueryState,
        log: &mut RunLog,
    ) -> Result<(), EngineError> {
        let context = self.context.as_ref();
        let max_retries = context.config.query.max_retries;

        if state.route.uses_plan() {
            log.begin(Stage::Planner);
            let plan = PlanBuilder
                .decompose(context, &state.sanitized_question)
                .await;
            if plan.degraded {
                state.warn(warnings::PLAN_DEGRADED);
            }
            state.plan = plan.steps;
            state.transition(PipelineState::Planned)?;
            log.finish(
                context,
                state,
                Stage::Planner,
                json!({ "steps": state.plan, "degraded": plan.degraded }),
            );
        }

        log.begin(Stage::DocumentSelector);
        let selection = DocumentSelector
            .select(
                context,
                &state.sanitized_question,
                state.query.requested_document_ids.as_deref(),
            )
            .await;
        state.extend_warnings(selection.warnings);
        state.candidate_documents = selection.documents;
        state.transition(PipelineState::DocumentsSelected)?;
        let selected: Vec<&str> = state
            .candidate_documents
            .iter()
            .map(|doc| doc.document_id.as_str())
            .collect();
        let summary = json!({ "documents": selected, "used_llm": selection.used_llm });
        log.finish(context, state, Stage::DocumentSelector, summary);

        let mut guidance: Option<String> = None;
        loop {
            let retry_possible = self.search(state, log, guidance.as_deref()).await?;
            self.assemble(state, log).await?;

            if !state.route.uses_critic() {
                break;
            }

            log.begin(Stage::Critic);
            let outcome = context
                .critic
                .evaluate(
                    context,
                    &state.sanitized_question,
                    &state.assembled_context,
                    state.retry_count,
                )
                .await;
            if outcome.degraded {
                state.warn(warnings::CRITIC_DEGRADED);
            }
            let verdict = outcome.verdict;
            state.transition(PipelineState::Critiqued)?;
            log.finish(
                context,
                state,
                Stage::Critic,
                json!({
                    "relevance_score": verdict.relevance_score,
                    "groundedness_score": verdict.groundedness_score,
                    "completeness_score": verdict.completeness_score,
                    "needs_retry": verdict.needs_retry,
                    "reason": verdict.reason,
                    "retry_count": state.retry_count,
                }),
            );

            let budget_left = state.retry_count < max_retries;
            if verdict.reason != CriticReason::Sufficient && !budget_left {
                state.warn(warnings::RETRY_BUDGET_EXHAUSTED);
            }
            let retry = verdict.needs_retry && budget_left && retry_possible;
            if retry {
                state.retry_count += 1;
                guidance = Some(verdict.guidance());
                tracing::debug!(
                    query_id = %state.query_id,
                    retry_count = state.retry_count,
                    guidance = ?guidance,
                    "retrying tree search"
                );
            }
            state.critic_verdict = Some(verdict);
            if !retry {
                break;
            }
        }

        log.begin(Stage::Generator);
        let generated = AnswerGenerator
            .generate(
                context,
                state.route,
                &state.sanitized_question,
                &state.plan,
                &state.assembled_context,
                state.critic_verdict.as_ref(),
            )
            .await;
        if generated.failed {
            state.warn(warnings::GENERATION_FAILED);
        }
        state.answer = generated.answer;
        state.sources = generated.sources;
        state.confidence = generated.confidence;
        state.transition(PipelineState::Generated)?;
        log.finish(
            context,
            state,
            Stage::Generator,
            json!({
                "confidence": state.confidence,
                "sources": state.sources.len(),
                "failed": generated.failed,
            }),
        );
        Ok(())
    }

    /// 一轮树搜索；返回之后是否还值得重试（所有搜索都因模型调用失败时不再重试）
    async fn search(
        &self,
        state: &mut QueryState,
        log: &mut RunLog,
        guidance: Option<&str>,
    ) -> Result<bool, EngineError> {
        log.begin(Stage::TreeSearch);

        let questions: Vec<String> = if state.route.uses_plan() && !state.plan.is_empty() {
            state.plan.clone()
        } else {
            vec![state.sanitized_question.clone()]
        };
        let tasks: Vec<SearchTask> = questions
            .iter()
            .flat_map(|question| {
                state.candidate_documents.iter().map(move |doc| SearchTask {
                    question: question.clone(),
                    document_id: doc.document_id.clone(),
                })
            })
            .collect();
        let task_count = tasks.len();

        let outcomes = TreeSearcher
            .search_many(&self.context, tasks, guidance)
            .await;

        let mut results = Vec::new();
        let mut provider_failures = 0;
        let mut failures = 0;
        for (task, outcome) in outcomes {
            match outcome {
                Ok(search) => {
                    results.extend(search.results);
                    state.search_trace.extend(search.steps);
                }
                Err(e) => {
                    tracing::warn!(
                        query_id = %state.query_id,
                        document_id = %task.document_id,
                        error = %e,
                        "tree search failed"
                    );
                    failures += 1;
                    if matches!(e, SearchError::Llm(_)) {
                        provider_failures += 1;
                    }
                    state.warn(warnings::search_failed(&task.document_id));
                }
            }
        }
        if results.is_empty() {
            state.warn(warnings::SEARCH_EMPTY);
        }

        let result_count = results.len();
        state.search_results = results;
        state.transition(PipelineState::Searched)?;
        log.finish(
            &self.context,
            state,
            Stage::TreeSearch,
            json!({
                "attempt": state.retry_count,
                "tasks": task_count,
                "results": result_count,
                "failed": failures,
                "guidance": guidance,
            }),
        );

        Ok(task_count > 0 && provider_failures < task_count)
    }

    async fn assemble(&self, state: &mut QueryState, log: &mut RunLog) -> Result<(), EngineError> {
        log.begin(Stage::PageAssembler);
        let budget = state.route.context_budget(&self.context.config.query);
        let assembly = PageAssembler
            .assemble(&self.context, &state.search_results, budget)
            .await;
        state.extend_warnings(assembly.warnings);
        state.assembled_context = assembly.context;
        state.transition(PipelineState::Assembled)?;
        log.finish(
            &self.context,
            state,
            Stage::PageAssembler,
            json!({
                "pages": state.assembled_context.pages.len(),
                "chars": state.assembled_context.total_chars(),
                "char_budget": budget,
            }),
        );
        Ok(())
    }

    /// 输出护栏；未通过时用户只会看到固定的拒答文本
    fn guard_output(&self, state: &mut QueryState, log: &mut RunLog) -> Result<bool, EngineError> {
        log.begin(Stage::OutputGuard);
        let verdict = validate_output_fail_closed(
            self.context.output_validator.as_ref(),
            OutputDraft {
                answer: &state.answer,
                sources: &state.sources,
                confidence: state.confidence,
            },
        );
        state.extend_warnings(verdict.warnings.iter().cloned());

        if verdict.valid {
            state.answer = verdict.final_answer;
        } else {
            tracing::warn!(query_id = %state.query_id, warnings = ?verdict.warnings, "answer rejected");
            state.answer = messages::OUTPUT_REJECTED.to_string();
            state.sources.clear();
            state.confidence = 0.0;
        }
        state.transition(PipelineState::OutputGuarded)?;
        log.finish(
            &self.context,
            state,
            Stage::OutputGuard,
            json!({ "valid": verdict.valid, "warnings": verdict.warnings }),
        );
        Ok(verdict.valid)
    }

    /// 状态机自身的错误不会暴露给调用方，只记录日志并返回拒答
    fn abort(&self, state: &mut QueryState, log: &mut RunLog, error: EngineError) -> QueryStatus {
        tracing::error!(query_id = %state.query_id, error = %error, "pipeline aborted");
        state.answer = messages::CANNOT_ANSWER.to_string();
        state.sources.clear();
        state.confidence = 0.0;
        log.mark(state, json!({ "error": error.to_string() }));
        QueryStatus::CannotAnswer
    }
}

fn deadline(started: Instant, millis: u64) -> Instant {
    started + Duration::from_millis(millis)
}

// Include tests
#[cfg(test)]
mod tests;
