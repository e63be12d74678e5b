use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::engine::context::EngineContext;
use crate::engine::types::{AssembledContext, CriticVerdict, Route, SourceRef, messages};
use crate::telemetry::Stage;

static RE_CITATION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[([^\[\]\s]+)\s+p\.?\s*(\d+)\]").ok());

const GENERATOR_SYSTEM_PROMPT: &str = "You are a careful financial document analyst. Answer strictly from the provided pages and cite every fact.";

/// 没有评审结果时（评审降级）使用的置信度
const UNREVIEWED_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAnswer {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub confidence: f64,
    /// LLM调用失败，回答为拒答文本
    pub failed: bool,
}

impl GeneratedAnswer {
    fn cannot_answer(failed: bool) -> Self {
        Self {
            answer: messages::CANNOT_ANSWER.to_string(),
            sources: Vec::new(),
            confidence: 0.0,
            failed,
        }
    }
}

/// 回答生成器
#[derive(Default)]
pub struct AnswerGenerator;

impl AnswerGenerator {
    pub async fn generate(
        &self,
        context: &EngineContext,
        route: Route,
        question: &str,
        plan: &[String],
        assembled: &AssembledContext,
        verdict: Option<&CriticVerdict>,
    ) -> GeneratedAnswer {
        if assembled.is_empty() {
            return GeneratedAnswer::cannot_answer(false);
        }

        let query = &context.config.query;
        let llm = &context.config.llm;
        let (model, confidence) = match route {
            Route::Fast => (llm.model_efficient.clone(), query.fast_route_confidence),
            Route::Standard | Route::Complex => (
                llm.model_powerful.clone(),
                verdict
                    .map(|v| v.relevance_score)
                    .unwrap_or(UNREVIEWED_CONFIDENCE)
                    .clamp(0.01, 1.0),
            ),
        };

        let prompt = build_prompt(route, question, plan, assembled);
        let response = context
            .complete(
                Stage::Generator,
                GENERATOR_SYSTEM_PROMPT,
                prompt,
                route.max_tokens(query),
                model,
            )
            .await;

        match response {
            Ok(answer) => {
                let answer = answer.trim().to_string();
                let sources = cited_sources(&answer, assembled);
                GeneratedAnswer {
                    answer,
                    sources,
                    confidence,
                    failed: false,
                }
            }
            Err(e) => {
                tracing::warn!(stage = %Stage::Generator, route = %route, error = %e, "generation failed");
                GeneratedAnswer::cannot_answer(true)
            }
        }
    }
}

fn build_prompt(route: Route, question: &str, plan: &[String], assembled: &AssembledContext) -> String {
    let pages = assembled.render();
    match route {
        Route::Fast => format!(
            r#"Pages:
{pages}

Question: {question}

Answer concisely using only the pages above. Cite the page after each fact as [document_id p.N]."#
        ),
        Route::Standard | Route::Complex => {
            let mut prompt = format!("Pages:\n{}\n\nQuestion: {}\n", pages, question);
            if plan.len() > 1 {
                prompt.push_str("\nWork through these sub-questions in order, then synthesize one answer:\n");
                for (i, step) in plan.iter().enumerate() {
                    prompt.push_str(&format!("{}. {}\n", i + 1, step));
                }
            }
            prompt.push_str(
                r#"
Instructions:
1. Answer based ONLY on the pages above
2. Cite the page after each fact as [document_id p.N]
3. Include specific numbers, dates and names when available
4. If the pages do not contain enough information, say so explicitly
5. Do NOT make up information"#,
            );
            prompt
        }
    }
}

/// 回答中引用的、且确实在上下文中的页；没有可识别的引用时使用全部上下文页
fn cited_sources(answer: &str, assembled: &AssembledContext) -> Vec<SourceRef> {
    let available: HashSet<SourceRef> = assembled.sources().into_iter().collect();
    let mut seen = HashSet::new();
    let cited: Vec<SourceRef> = LazyLock::force(&RE_CITATION)
        .as_ref()
        .map(|re| {
            re.captures_iter(answer)
                .filter_map(|caps| {
                    Some(SourceRef {
                        document_id: caps.get(1)?.as_str().to_string(),
                        page_number: caps.get(2)?.as_str().parse().ok()?,
                    })
                })
                .filter(|source| available.contains(source))
                .filter(|source| seen.insert(source.clone()))
                .collect()
        })
        .unwrap_or_default();

    if cited.is_empty() {
        assembled.sources()
    } else {
        cited
    }
}
