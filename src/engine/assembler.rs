use std::cmp::Ordering;
use std::collections::HashMap;

use crate::engine::context::EngineContext;
use crate::engine::types::{AssembledContext, ContextPage, SearchResult, warnings};
use crate::utils::threads::do_parallel_with_limit;

/// 组装结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assembly {
    pub context: AssembledContext,
    pub warnings: Vec<String>,
}

/// 页面组装器
///
/// 去重后按置信度降序（同分按文档ID、页码升序）排列，整页装入字符预算；
/// 第一页装不下时停止，被丢弃的页不会出现在来源中。
#[derive(Default)]
pub struct PageAssembler;

impl PageAssembler {
    pub async fn assemble(
        &self,
        context: &EngineContext,
        results: &[SearchResult],
        char_budget: usize,
    ) -> Assembly {
        let candidates = rank(results);

        let futures: Vec<_> = candidates
            .iter()
            .map(|(document_id, page_number, _)| {
                Box::pin(async move {
                    context
                        .pages
                        .page_text(document_id, *page_number)
                        .await
                })
            })
            .collect();
        let texts = do_parallel_with_limit(futures, context.config.llm.max_parallels).await;

        let mut warnings = Vec::new();
        let mut fetched = Vec::new();
        for ((document_id, page_number, confidence), text) in candidates.into_iter().zip(texts) {
            match text {
                Ok(text) if !text.trim().is_empty() => fetched.push(ContextPage {
                    document_id,
                    page_number,
                    text,
                    confidence,
                }),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(document_id = %document_id, page_number, error = %e, "page unavailable");
                    warnings.push(warnings::page_unavailable(&document_id, page_number));
                }
            }
        }

        Assembly {
            context: pack(fetched, char_budget),
            warnings,
        }
    }
}

/// 按 (文档, 页) 去重取最高置信度，再排序
fn rank(results: &[SearchResult]) -> Vec<(String, u32, f64)> {
    let mut best: HashMap<(&str, u32), f64> = HashMap::new();
    for result in results {
        let entry = best
            .entry((result.document_id.as_str(), result.page_number))
            .or_insert(result.traversal_confidence);
        if result.traversal_confidence > *entry {
            *entry = result.traversal_confidence;
        }
    }

    let mut ranked: Vec<(String, u32, f64)> = best
        .into_iter()
        .map(|((doc, page), confidence)| (doc.to_string(), page, confidence))
        .collect();
    ranked.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
            .then_with(|| a.1.cmp(&b.1))
    });
    ranked
}

/// 整页装入预算；一页都装不下时，把第一页在句子边界处截断
fn pack(pages: Vec<ContextPage>, char_budget: usize) -> AssembledContext {
    let mut packed = Vec::new();
    let mut used = 0;

    for page in pages {
        let len = page.text.chars().count();
        if used + len > char_budget {
            if packed.is_empty() {
                if let Some(text) = truncate_at_sentence(&page.text, char_budget) {
                    packed.push(ContextPage { text, ..page });
                }
            }
            break;
        }
        used += len;
        packed.push(page);
    }

    AssembledContext {
        pages: packed,
        char_budget,
    }
}

/// 在预算内最后一个句末标点处截断，找不到句子边界时返回None
fn truncate_at_sentence(text: &str, char_budget: usize) -> Option<String> {
    let prefix: String = text.chars().take(char_budget).collect();
    let end = prefix
        .char_indices()
        .filter(|(_, c)| matches!(c, '.' | '!' | '?' | '。' | '！' | '？' | '\n'))
        .map(|(i, c)| i + c.len_utf8())
        .next_back()?;
    let truncated = prefix[..end].trim_end().to_string();
    (!truncated.is_empty()).then_some(truncated)
}
