use serde::Deserialize;
use serde_json::Value;

use crate::engine::context::EngineContext;
use crate::telemetry::Stage;
use crate::utils::json::extract_json;

const PLANNER_SYSTEM_PROMPT: &str = "You are a query planner for a document question answering system. Output ONLY a valid JSON array.";

/// 计划生成结果
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub steps: Vec<String>,
    /// 使用了回退计划（原问题原样作为唯一步骤）
    pub degraded: bool,
}

/// 计划中的一步：纯字符串，或带 `query` 字段的对象
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlanStep {
    Text(String),
    Detailed {
        #[serde(alias = "question")]
        query: String,
    },
}

impl PlanStep {
    fn into_query(self) -> String {
        match self {
            PlanStep::Text(query) | PlanStep::Detailed { query } => query,
        }
    }
}

/// 复杂问题拆解器，只在complex路由上调用
#[derive(Default)]
pub struct PlanBuilder;

impl PlanBuilder {
    pub async fn decompose(&self, context: &EngineContext, question: &str) -> Plan {
        let max_steps = context.config.query.max_plan_steps;
        let prompt = format!(
            r#"Break the complex question below into 2-{max_steps} simpler sub-questions whose answers, taken in order, answer the original question.
For comparisons across documents or periods, write one sub-question per document or period.

Question: {question}

Output a JSON array:
[
  {{"step_id": 1, "query": "first sub-question", "rationale": "why it is needed"}}
]"#
        );

        let response = context
            .complete_efficient(Stage::Planner, PLANNER_SYSTEM_PROMPT, prompt, 512)
            .await;

        let steps = match response {
            Ok(text) => parse_steps(&text, max_steps),
            Err(e) => {
                tracing::warn!(stage = %Stage::Planner, error = %e, "planning failed, using single-step plan");
                Vec::new()
            }
        };

        if steps.is_empty() {
            Plan {
                steps: vec![question.to_string()],
                degraded: true,
            }
        } else {
            Plan {
                steps,
                degraded: false,
            }
        }
    }
}

/// 逐项解析，无法识别的步骤跳过
fn parse_steps(text: &str, max_steps: usize) -> Vec<String> {
    let Some(Value::Array(items)) = extract_json(text) else {
        return Vec::new();
    };

    items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<PlanStep>(item).ok())
        .map(|step| step.into_query().trim().to_string())
        .filter(|query| !query.is_empty())
        .take(max_steps)
        .collect()
}
