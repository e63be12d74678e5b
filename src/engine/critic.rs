use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::engine::context::EngineContext;
use crate::engine::types::{AssembledContext, CriticReason, CriticVerdict};
use crate::telemetry::Stage;
use crate::utils::json::{extract_json, unit_interval};

const CRITIC_SYSTEM_PROMPT: &str = "You evaluate whether retrieved document pages can answer a question. Output ONLY valid JSON.";

/// 评审失败时的中性分数
const NEUTRAL_SCORE: f64 = 0.5;

/// 评审结果中的分数字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticField {
    Relevance,
    Groundedness,
    Completeness,
}

/// 模型输出字段名 → 评审结果字段，提示词中的字段名与此表一致
pub const CRITIC_FIELD_MAP: [(&str, CriticField); 3] = [
    ("relevance_score", CriticField::Relevance),
    ("groundedness_score", CriticField::Groundedness),
    ("completeness_score", CriticField::Completeness),
];

#[derive(Debug, Clone, PartialEq)]
pub struct CriticOutcome {
    pub verdict: CriticVerdict,
    /// LLM调用失败或输出无法解析，使用了中性结果
    pub degraded: bool,
    /// 是否调用了LLM（空上下文时不调用）
    pub used_llm: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct CriticScores {
    relevance: f64,
    groundedness: f64,
    completeness: f64,
    feedback: Option<String>,
    suggested_query: Option<String>,
}

/// 证据评审，只在standard/complex路由上使用
///
/// 实现方给出的 `needs_retry` 只是建议，是否重试仍由编排器按重试预算决定。
#[async_trait]
pub trait EvidenceEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        context: &EngineContext,
        question: &str,
        assembled: &AssembledContext,
        retry_count: u32,
    ) -> CriticOutcome;
}

/// 基于LLM打分的默认评审器
#[derive(Default)]
pub struct EvidenceCritic;

#[async_trait]
impl EvidenceEvaluator for EvidenceCritic {
    async fn evaluate(
        &self,
        context: &EngineContext,
        question: &str,
        assembled: &AssembledContext,
        retry_count: u32,
    ) -> CriticOutcome {
        let query = &context.config.query;
        let can_retry = retry_count < query.max_retries;

        if assembled.is_empty() {
            return CriticOutcome {
                verdict: CriticVerdict {
                    relevance_score: 0.0,
                    groundedness_score: 0.0,
                    completeness_score: 0.0,
                    needs_retry: can_retry,
                    reason: CriticReason::EmptyContext,
                    feedback: Some("No pages were retrieved".to_string()),
                    suggested_query: None,
                },
                degraded: false,
                used_llm: false,
            };
        }

        let field_list = CRITIC_FIELD_MAP
            .iter()
            .map(|(name, _)| format!("  \"{}\": 0.0", name))
            .collect::<Vec<_>>()
            .join(",\n");
        let prompt = format!(
            r#"Question: {question}

Retrieved pages:
{pages}

Score each aspect from 0.0 to 1.0:
- relevance_score: are the pages relevant to the question?
- groundedness_score: could an answer be fully supported by these pages alone?
- completeness_score: do the pages contain everything needed for a complete answer?

If relevance is low, suggest a refined search query.

Output JSON:
{{
{field_list},
  "feedback": "short explanation",
  "suggested_query": "refined query or empty string"
}}"#,
            pages = assembled.render()
        );

        let response = context
            .complete_efficient(Stage::Critic, CRITIC_SYSTEM_PROMPT, prompt, 256)
            .await;

        let scores = match response {
            Ok(text) => extract_json(&text).and_then(|v| v.as_object().and_then(map_scores)),
            Err(e) => {
                tracing::warn!(stage = %Stage::Critic, error = %e, "critic failed, proceeding to generation");
                None
            }
        };

        let Some(scores) = scores else {
            return CriticOutcome {
                verdict: CriticVerdict {
                    relevance_score: NEUTRAL_SCORE,
                    groundedness_score: NEUTRAL_SCORE,
                    completeness_score: NEUTRAL_SCORE,
                    needs_retry: false,
                    reason: CriticReason::Sufficient,
                    feedback: None,
                    suggested_query: None,
                },
                degraded: true,
                used_llm: true,
            };
        };

        let low = scores.relevance < query.relevance_threshold;
        CriticOutcome {
            verdict: CriticVerdict {
                relevance_score: scores.relevance,
                groundedness_score: scores.groundedness,
                completeness_score: scores.completeness,
                needs_retry: low && can_retry,
                reason: if low {
                    CriticReason::LowRelevance
                } else {
                    CriticReason::Sufficient
                },
                feedback: scores.feedback,
                suggested_query: scores.suggested_query,
            },
            degraded: false,
            used_llm: true,
        }
    }
}

/// 按 [`CRITIC_FIELD_MAP`] 逐字段映射；缺少相关性分数视为无法解析，其余缺失字段取中性值
fn map_scores(map: &Map<String, Value>) -> Option<CriticScores> {
    let mut relevance = None;
    let mut groundedness = NEUTRAL_SCORE;
    let mut completeness = NEUTRAL_SCORE;

    for (name, field) in CRITIC_FIELD_MAP {
        let Some(score) = map.get(name).and_then(unit_interval) else {
            continue;
        };
        match field {
            CriticField::Relevance => relevance = Some(score),
            CriticField::Groundedness => groundedness = score,
            CriticField::Completeness => completeness = score,
        }
    }

    let text_field = |key: &str| {
        map.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Some(CriticScores {
        relevance: relevance?,
        groundedness,
        completeness,
        feedback: text_field("feedback"),
        suggested_query: text_field("suggested_query"),
    })
}
