use serde::Deserialize;
use std::collections::HashSet;

use crate::engine::context::EngineContext;
use crate::engine::types::{CandidateDocument, warnings};
use crate::telemetry::Stage;
use crate::utils::json::extract_json;

const SELECTOR_SYSTEM_PROMPT: &str = "You decide which documents in a library are relevant to a question. Output ONLY valid JSON.";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub documents: Vec<CandidateDocument>,
    pub warnings: Vec<String>,
    /// 是否调用了LLM（单文档时短路）
    pub used_llm: bool,
}

/// 模型的选择回复：带 `selected_doc_ids` 的对象或直接的ID数组
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SelectionReply {
    Ids(Vec<String>),
    Detailed {
        #[serde(alias = "document_ids")]
        selected_doc_ids: Vec<String>,
    },
}

/// 文档选择器
#[derive(Default)]
pub struct DocumentSelector;

impl DocumentSelector {
    pub async fn select(
        &self,
        context: &EngineContext,
        question: &str,
        requested_document_ids: Option<&[String]>,
    ) -> Selection {
        let available = match context.catalog.list_indexed_documents().await {
            Ok(documents) => documents,
            Err(e) => {
                tracing::warn!(stage = %Stage::DocumentSelector, error = %e, "document catalog unavailable");
                return Selection {
                    warnings: vec![warnings::DOCUMENT_SELECTION_DEGRADED.to_string()],
                    ..Selection::default()
                };
            }
        };

        let available: Vec<CandidateDocument> = available
            .into_iter()
            .filter(|doc| {
                requested_document_ids
                    .is_none_or(|ids| ids.iter().any(|id| id == &doc.document_id))
            })
            .map(|doc| CandidateDocument {
                document_id: doc.document_id,
                summary: doc.summary,
            })
            .collect();

        match available.len() {
            0 => Selection {
                warnings: vec![warnings::NO_DOCUMENTS_INDEXED.to_string()],
                ..Selection::default()
            },
            1 => Selection {
                documents: available,
                ..Selection::default()
            },
            _ => self.select_with_llm(context, question, available).await,
        }
    }

    async fn select_with_llm(
        &self,
        context: &EngineContext,
        question: &str,
        available: Vec<CandidateDocument>,
    ) -> Selection {
        let max_documents = context.config.query.max_selected_documents;
        let catalog = available
            .iter()
            .map(|doc| format!("- [{}] {}", doc.document_id, doc.summary))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            r#"Question: {question}

Documents:
{catalog}

Select at most {max_documents} documents whose content is likely needed to answer the question.
Return an empty list if none of them is relevant.
Respond with JSON: {{"selected_doc_ids": ["document id"], "reasoning": "one sentence"}}"#
        );

        let response = context
            .complete_efficient(Stage::DocumentSelector, SELECTOR_SYSTEM_PROMPT, prompt, 256)
            .await;

        let ids = match response {
            Ok(text) => parse_ids(&text),
            Err(e) => {
                tracing::warn!(stage = %Stage::DocumentSelector, error = %e, "document selection failed");
                None
            }
        };

        let Some(ids) = ids else {
            return Selection {
                warnings: vec![warnings::DOCUMENT_SELECTION_DEGRADED.to_string()],
                used_llm: true,
                ..Selection::default()
            };
        };

        let mut seen = HashSet::new();
        let documents = ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| available.iter().find(|doc| &doc.document_id == id))
            .take(max_documents)
            .cloned()
            .collect();

        Selection {
            documents,
            warnings: Vec::new(),
            used_llm: true,
        }
    }
}

/// 无法解析时返回None
fn parse_ids(text: &str) -> Option<Vec<String>> {
    let reply = serde_json::from_value::<SelectionReply>(extract_json(text)?).ok()?;
    let ids = match reply {
        SelectionReply::Ids(ids) | SelectionReply::Detailed { selected_doc_ids: ids } => ids,
    };
    Some(ids.into_iter().map(|id| id.trim().to_string()).collect())
}
