//! 基于推理的树搜索
//!
//! 从文档根开始逐层下钻：每一层把当前候选节点的标题与摘要（不含子树）交给模型，
//! 由模型选择值得继续的分支并给出是否继续的判断，直到到达叶子或达到最大深度。
//! 每层只发起一次LLM调用。

use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::engine::context::EngineContext;
use crate::engine::types::{SearchResult, SearchStep};
use crate::index::{IndexError, NodeSummary, ROOT_NODE_ID};
use crate::llm::LlmError;
use crate::telemetry::Stage;
use crate::utils::json::{extract_json, unit_interval};
use crate::utils::threads::do_parallel_with_limit;

const SEARCH_SYSTEM_PROMPT: &str = "You are a precise document navigation assistant. Analyze section summaries to find relevant content. Output ONLY valid JSON.";

const FALLBACK_REASONING: &str = "Fallback: parse error, selecting by position";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SearchError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// 单个文档的搜索结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentSearch {
    pub results: Vec<SearchResult>,
    pub steps: Vec<SearchStep>,
}

/// 一次待执行的搜索
#[derive(Debug, Clone, PartialEq)]
pub struct SearchTask {
    pub question: String,
    pub document_id: String,
}

#[derive(Debug, Clone, PartialEq)]
struct NodeEvaluation {
    selected: bool,
    confidence: Option<f64>,
    reasoning: String,
}

#[derive(Debug, Clone, PartialEq)]
struct LevelEvaluation {
    /// 与候选节点一一对应
    nodes: Vec<NodeEvaluation>,
    keep_descending: bool,
}

/// 树搜索器
#[derive(Default)]
pub struct TreeSearcher;

impl TreeSearcher {
    /// 在多个文档/子问题上并发执行搜索，并发度受 `llm.max_parallels` 限制
    pub async fn search_many(
        &self,
        context: &EngineContext,
        tasks: Vec<SearchTask>,
        guidance: Option<&str>,
    ) -> Vec<(SearchTask, Result<DocumentSearch, SearchError>)> {
        let futures: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                Box::pin(async move {
                    let outcome = self
                        .search(context, &task.question, &task.document_id, guidance)
                        .await;
                    (task, outcome)
                })
            })
            .collect();

        do_parallel_with_limit(futures, context.config.llm.max_parallels).await
    }

    pub async fn search(
        &self,
        context: &EngineContext,
        question: &str,
        document_id: &str,
        guidance: Option<&str>,
    ) -> Result<DocumentSearch, SearchError> {
        let query = &context.config.query;
        let mut search = DocumentSearch::default();
        let mut frontier = context
            .tree_index
            .children(document_id, ROOT_NODE_ID)
            .await?;
        // 与 frontier 一一对应：每个候选节点的祖先标题链
        let mut paths: Vec<Vec<String>> = vec![Vec::new(); frontier.len()];
        let mut hits: Vec<(NodeSummary, f64, String)> = Vec::new();

        for level in 0..query.max_tree_depth {
            if frontier.is_empty() {
                break;
            }

            tracing::debug!(
                document_id,
                level,
                candidates = frontier.len(),
                "evaluating tree level"
            );

            let evaluation = self
                .evaluate_level(context, question, guidance, &frontier, &paths)
                .await?;

            for (node, eval) in frontier.iter().zip(&evaluation.nodes) {
                search.steps.push(SearchStep {
                    document_id: document_id.to_string(),
                    level,
                    node_id: node.node_id.clone(),
                    title: node.title.clone(),
                    selected: eval.selected,
                    confidence: eval.confidence,
                    reasoning: eval.reasoning.clone(),
                    page_range: node.page_range,
                });
            }

            let picks: Vec<(&NodeSummary, &Vec<String>, &NodeEvaluation)> = frontier
                .iter()
                .zip(&paths)
                .zip(&evaluation.nodes)
                .filter(|(_, eval)| eval.selected)
                .map(|((node, path), eval)| (node, path, eval))
                .collect();
            if picks.is_empty() {
                tracing::debug!(document_id, level, "no relevant branch selected");
                break;
            }

            let last_level = level + 1 >= query.max_tree_depth || !evaluation.keep_descending;
            let mut next = Vec::new();
            let mut next_paths = Vec::new();
            for (node, path, eval) in picks {
                let confidence = eval
                    .confidence
                    .filter(|c| *c > 0.0)
                    .unwrap_or(query.default_leaf_confidence);
                if node.is_leaf || last_level {
                    hits.push((node.clone(), confidence, eval.reasoning.clone()));
                    continue;
                }

                let children = context
                    .tree_index
                    .children(document_id, &node.node_id)
                    .await?;
                if children.is_empty() {
                    hits.push((node.clone(), confidence, eval.reasoning.clone()));
                } else {
                    let mut child_path = path.clone();
                    child_path.push(node.title.clone());
                    next_paths.extend(std::iter::repeat_n(child_path, children.len()));
                    next.extend(children);
                }
            }
            frontier = next;
            paths = next_paths;
        }

        search.results = collect_pages(document_id, hits, query.max_pages_per_leaf);
        Ok(search)
    }

    async fn evaluate_level(
        &self,
        context: &EngineContext,
        question: &str,
        guidance: Option<&str>,
        frontier: &[NodeSummary],
        paths: &[Vec<String>],
    ) -> Result<LevelEvaluation, LlmError> {
        let breadth = context.config.query.max_search_breadth;
        let prompt = build_prompt(question, guidance, frontier, paths, breadth);
        let response = context
            .complete_efficient(Stage::TreeSearch, SEARCH_SYSTEM_PROMPT, prompt, 1024)
            .await?;

        Ok(parse_level(&response, frontier, breadth).unwrap_or_else(|| {
            tracing::warn!(
                stage = %Stage::TreeSearch,
                preview = %response.chars().take(200).collect::<String>(),
                "unparseable node evaluation, selecting by position"
            );
            fallback_level(frontier.len(), breadth, context.config.query.default_leaf_confidence)
        }))
    }
}

fn build_prompt(
    question: &str,
    guidance: Option<&str>,
    frontier: &[NodeSummary],
    paths: &[Vec<String>],
    breadth: usize,
) -> String {
    let mut distinct_paths: Vec<String> = Vec::new();
    for path in paths.iter().filter(|p| !p.is_empty()) {
        let joined = path.join(" → ");
        if !distinct_paths.contains(&joined) {
            distinct_paths.push(joined);
        }
    }
    // 同一层来自多个分支时，逐个节点标出所属分支
    let show_parent = distinct_paths.len() > 1;

    let node_list = frontier
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let pages = node
                .page_range
                .map(|r| format!(" ({})", r))
                .unwrap_or_default();
            let kind = if node.is_leaf { "leaf" } else { "section" };
            let summary = if node.summary.trim().is_empty() {
                "(no summary)"
            } else {
                node.summary.as_str()
            };
            let parent = match paths.get(i) {
                Some(path) if show_parent && !path.is_empty() => {
                    format!("\n   Under: {}", path.join(" → "))
                }
                _ => String::new(),
            };
            format!(
                "{}. [{}] \"{}\"{} [{}]{}\n   Summary: {}",
                i + 1,
                node.node_id,
                node.title,
                pages,
                kind,
                parent,
                summary
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut prompt = format!("Question: {}\n\n", question);
    if let Some(guidance) = guidance.filter(|g| !g.trim().is_empty()) {
        prompt.push_str(&format!(
            "Retry guidance from a previous attempt: {}\n(Previous results were not sufficient. Prefer branches that were not explored before or that match this hint more narrowly.)\n\n",
            guidance
        ));
    }
    match distinct_paths.as_slice() {
        [] => {}
        [path] => prompt.push_str(&format!(
            "Navigation path so far: {}\n(You are now looking at the children of the sections above)\n\n",
            path
        )),
        many => prompt.push_str(&format!(
            "Navigation paths so far:\n{}\n(You are now looking at the children of these sections; each one shows the section it belongs to)\n\n",
            many.iter()
                .map(|p| format!("- {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        )),
    }
    prompt.push_str(&format!(
        r#"Available sections at this level:
{node_list}

Evaluate EACH section and decide whether it likely contains information needed to answer the question.

Output JSON:
{{
  "evaluations": [
    {{"node_id": "section id", "selected": true, "reasoning": "brief explanation", "confidence": 0.0}}
  ],
  "continue": true
}}

Rules:
1. Select at most {breadth} sections, the most relevant first
2. confidence is 0.0-1.0, how sure you are the section is relevant
3. Set "continue" to false when the selected sections are already specific enough to read directly
4. Select nothing if no section is relevant"#
    ));
    prompt
}

/// 解析一层的评估结果；结构无法识别时返回None
fn parse_level(text: &str, frontier: &[NodeSummary], breadth: usize) -> Option<LevelEvaluation> {
    let value = extract_json(text)?;
    let (items, keep_descending) = match &value {
        Value::Array(items) => (items.as_slice(), true),
        Value::Object(map) => {
            let items = ["evaluations", "selected", "nodes"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_array))?;
            let keep = map
                .get("continue")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            (items.as_slice(), keep)
        }
        _ => return None,
    };

    let index_of: HashMap<&str, usize> = frontier
        .iter()
        .enumerate()
        .map(|(i, node)| (node.node_id.as_str(), i))
        .collect();

    let mut nodes: Vec<Option<NodeEvaluation>> = vec![None; frontier.len()];
    let mut selected_count = 0;

    for (position, item) in items.iter().enumerate() {
        let Some(map) = item.as_object() else {
            continue;
        };
        // 只有未给出 node_id 时才按位置对应；给出了但不认识的 node_id 直接忽略
        let index = match map.get("node_id") {
            Some(Value::String(id)) => index_of.get(id.as_str()).copied(),
            Some(Value::Number(id)) => index_of.get(id.to_string().as_str()).copied(),
            _ => (position < frontier.len()).then_some(position),
        };
        let Some(index) = index else {
            continue;
        };
        if nodes[index].is_some() {
            continue;
        }

        let mut evaluation = read_evaluation(map);
        if evaluation.selected {
            if selected_count >= breadth {
                evaluation.selected = false;
                evaluation.reasoning.push_str(" (breadth limit reached)");
            } else {
                selected_count += 1;
            }
        }
        nodes[index] = Some(evaluation);
    }

    Some(LevelEvaluation {
        nodes: nodes
            .into_iter()
            .map(|eval| {
                eval.unwrap_or_else(|| NodeEvaluation {
                    selected: false,
                    confidence: None,
                    reasoning: "Not evaluated by the model".to_string(),
                })
            })
            .collect(),
        keep_descending,
    })
}

fn read_evaluation(map: &Map<String, Value>) -> NodeEvaluation {
    NodeEvaluation {
        // 只列出选中节点的回复里不带 selected 字段
        selected: map.get("selected").and_then(Value::as_bool).unwrap_or(true),
        confidence: map.get("confidence").and_then(unit_interval),
        reasoning: map
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or("No reasoning provided")
            .to_string(),
    }
}

fn fallback_level(len: usize, breadth: usize, confidence: f64) -> LevelEvaluation {
    LevelEvaluation {
        nodes: (0..len)
            .map(|i| NodeEvaluation {
                selected: i < breadth,
                confidence: Some(confidence),
                reasoning: FALLBACK_REASONING.to_string(),
            })
            .collect(),
        keep_descending: true,
    }
}

/// 展开命中节点的页码，同一页保留最高置信度
fn collect_pages(
    document_id: &str,
    hits: Vec<(NodeSummary, f64, String)>,
    max_pages_per_leaf: usize,
) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = Vec::new();
    for (node, confidence, reasoning) in hits {
        let Some(range) = node.page_range else {
            continue;
        };
        for page_number in range.pages(max_pages_per_leaf) {
            match results.iter_mut().find(|r| r.page_number == page_number) {
                Some(existing) if existing.traversal_confidence >= confidence => {}
                Some(existing) => {
                    existing.traversal_confidence = confidence;
                    existing.reasoning_note = format!("{}: {}", node.title, reasoning);
                }
                None => results.push(SearchResult {
                    document_id: document_id.to_string(),
                    page_number,
                    traversal_confidence: confidence,
                    reasoning_note: format!("{}: {}", node.title, reasoning),
                }),
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{
        ScriptedLlm, annual_report_index, branch, context_with, leaf, tree,
    };
    use crate::index::MemoryIndex;

    const QUESTION: &str = "What was total revenue?";

    #[tokio::test]
    async fn test_descends_to_leaf() {
        let llm = ScriptedLlm::new()
            .on(
                Stage::TreeSearch,
                r#"{"evaluations": [{"node_id": "fin", "selected": true, "reasoning": "statements", "confidence": 0.9}, {"node_id": "risk", "selected": false, "reasoning": "no"}], "continue": true}"#,
            )
            .on(
                Stage::TreeSearch,
                r#"[{"node_id": "income", "selected": true, "reasoning": "revenue line", "confidence": 0.8}, {"node_id": "balance", "selected": false, "reasoning": "assets"}]"#,
            );
        let context = context_with(llm.clone(), annual_report_index());

        let search = TreeSearcher
            .search(&context, QUESTION, "annual", None)
            .await
            .unwrap();

        assert_eq!(search.results.len(), 1);
        assert_eq!(search.results[0].page_number, 12);
        assert_eq!(search.results[0].traversal_confidence, 0.8);
        assert_eq!(llm.calls(Stage::TreeSearch), 2);
        assert_eq!(search.steps.len(), 4);
        assert!(search.steps.iter().any(|s| s.node_id == "income" && s.selected && s.level == 1));

        // 第二层的提示中包含导航路径，且只展示子节点
        let second = &llm.requests_for(Stage::TreeSearch)[1].user_prompt;
        assert!(second.contains("Navigation path so far: Financial Statements"));
        assert!(second.contains("[income]"));
        assert!(!second.contains("[risk]"));
    }

    #[tokio::test]
    async fn test_zero_selection_yields_no_results() {
        let llm = ScriptedLlm::new().on(
            Stage::TreeSearch,
            r#"{"evaluations": [{"node_id": "fin", "selected": false}, {"node_id": "risk", "selected": false}], "continue": false}"#,
        );
        let context = context_with(llm.clone(), annual_report_index());
        let search = TreeSearcher
            .search(&context, QUESTION, "annual", None)
            .await
            .unwrap();
        assert!(search.results.is_empty());
        assert_eq!(llm.calls(Stage::TreeSearch), 1);
    }

    #[tokio::test]
    async fn test_missing_confidence_defaults_to_moderate() {
        let llm = ScriptedLlm::new().on(
            Stage::TreeSearch,
            r#"{"selected": [{"node_id": "risk", "reasoning": "risk question"}]}"#,
        );
        let context = context_with(llm, annual_report_index());
        let search = TreeSearcher
            .search(&context, "What are the currency risks?", "annual", None)
            .await
            .unwrap();
        assert_eq!(search.results.len(), 1);
        assert_eq!(search.results[0].page_number, 30);
        assert_eq!(search.results[0].traversal_confidence, 0.5);
    }

    #[tokio::test]
    async fn test_stop_decision_uses_section_range() {
        let llm = ScriptedLlm::new().on(
            Stage::TreeSearch,
            r#"{"evaluations": [{"node_id": "fin", "selected": true, "confidence": 0.6}], "continue": false}"#,
        );
        let context = context_with(llm.clone(), annual_report_index());
        let search = TreeSearcher
            .search(&context, QUESTION, "annual", None)
            .await
            .unwrap();
        let pages: Vec<u32> = search.results.iter().map(|r| r.page_number).collect();
        assert_eq!(pages, vec![12, 13, 14, 15]);
        assert_eq!(llm.calls(Stage::TreeSearch), 1);
    }

    #[tokio::test]
    async fn test_breadth_limit_enforced() {
        let index = MemoryIndex::new().with_tree(tree(
            "wide",
            "wide",
            vec![
                leaf("a", "A", 1, 1),
                leaf("b", "B", 2, 2),
                leaf("c", "C", 3, 3),
                leaf("d", "D", 4, 4),
            ],
        ));
        let llm = ScriptedLlm::new().on(
            Stage::TreeSearch,
            r#"[{"node_id": "a", "selected": true}, {"node_id": "b", "selected": true}, {"node_id": "c", "selected": true}, {"node_id": "d", "selected": true}]"#,
        );
        let context = context_with(llm, index);
        let search = TreeSearcher
            .search(&context, QUESTION, "wide", None)
            .await
            .unwrap();
        assert_eq!(search.results.len(), 3);
        let dropped = search.steps.iter().find(|s| s.node_id == "d").unwrap();
        assert!(!dropped.selected);
        assert!(dropped.reasoning.ends_with("(breadth limit reached)"));
    }

    #[tokio::test]
    async fn test_parse_failure_selects_by_position() {
        let llm = ScriptedLlm::new().on(Stage::TreeSearch, "I think Financial Statements.");
        let context = context_with(llm, annual_report_index());
        let search = TreeSearcher
            .search(&context, QUESTION, "annual", None)
            .await
            .unwrap();
        // 两个顶层节点都被选中；fin 继续下钻后两个叶子也被选中
        let pages: Vec<u32> = search.results.iter().map(|r| r.page_number).collect();
        assert_eq!(pages, vec![30, 12, 14, 15]);
        assert!(search.results.iter().all(|r| r.traversal_confidence == 0.5));
    }

    #[tokio::test]
    async fn test_max_depth_stops_descent() {
        let index = MemoryIndex::new().with_tree(tree(
            "deep",
            "deep",
            vec![branch(
                "l0",
                "Level 0",
                vec![branch("l1", "Level 1", vec![leaf("l2", "Level 2", 7, 8)])],
            )],
        ));
        let llm = ScriptedLlm::new().on(Stage::TreeSearch, r#"{"selected": [{"confidence": 0.9}]}"#);
        let mut context = context_with(llm.clone(), index);
        context.config.query.max_tree_depth = 2;

        let search = TreeSearcher
            .search(&context, QUESTION, "deep", None)
            .await
            .unwrap();
        assert_eq!(llm.calls(Stage::TreeSearch), 2);
        assert_eq!(search.results[0].page_number, 7);
        assert_eq!(search.results[0].traversal_confidence, 0.9);
    }

    #[tokio::test]
    async fn test_guidance_reaches_prompt() {
        let llm = ScriptedLlm::new().on(Stage::TreeSearch, r#"{"evaluations": []}"#);
        let context = context_with(llm.clone(), annual_report_index());
        TreeSearcher
            .search(&context, QUESTION, "annual", Some("empty_context: segment revenue"))
            .await
            .unwrap();
        let prompt = &llm.requests_for(Stage::TreeSearch)[0].user_prompt;
        assert!(prompt.contains("Retry guidance from a previous attempt: empty_context: segment revenue"));
    }

    #[tokio::test]
    async fn test_unknown_node_id_is_not_matched_by_position() {
        let llm = ScriptedLlm::new().on(
            Stage::TreeSearch,
            r#"{"selected": [{"node_id": "Risk Factors", "confidence": 0.9}], "continue": false}"#,
        );
        let context = context_with(llm, annual_report_index());
        let search = TreeSearcher
            .search(&context, QUESTION, "annual", None)
            .await
            .unwrap();
        assert!(search.results.is_empty());
        assert!(search.steps.iter().all(|s| !s.selected));
    }

    #[tokio::test]
    async fn test_sibling_branches_keep_separate_paths() {
        let index = MemoryIndex::new().with_tree(tree(
            "ops",
            "ops",
            vec![
                branch("seg", "Segments", vec![leaf("na", "North America", 5, 6)]),
                branch("mda", "Management Discussion", vec![leaf("liq", "Liquidity", 9, 9)]),
            ],
        ));
        let llm = ScriptedLlm::new()
            .on(
                Stage::TreeSearch,
                r#"{"evaluations": [{"node_id": "seg", "selected": true}, {"node_id": "mda", "selected": true}], "continue": true}"#,
            )
            .on(Stage::TreeSearch, r#"{"evaluations": [], "continue": false}"#);
        let context = context_with(llm.clone(), index);
        TreeSearcher
            .search(&context, QUESTION, "ops", None)
            .await
            .unwrap();

        let second = &llm.requests_for(Stage::TreeSearch)[1].user_prompt;
        assert!(!second.contains("Segments → Management Discussion"));
        assert!(second.contains("Navigation paths so far:\n- Segments\n- Management Discussion"));
        assert!(second.contains("[na] \"North America\" (p.5-6) [leaf]\n   Under: Segments"));
        assert!(second.contains("[liq] \"Liquidity\" (p.9) [leaf]\n   Under: Management Discussion"));
    }

    #[tokio::test]
    async fn test_provider_failure_and_unknown_document() {
        let context = context_with(ScriptedLlm::new().fail(Stage::TreeSearch), annual_report_index());
        assert!(matches!(
            TreeSearcher.search(&context, QUESTION, "annual", None).await,
            Err(SearchError::Llm(_))
        ));
        assert!(matches!(
            TreeSearcher.search(&context, QUESTION, "ghost", None).await,
            Err(SearchError::Index(IndexError::DocumentNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_search_many_keeps_task_order() {
        let index = annual_report_index()
            .with_tree(tree("esg", "esg", vec![leaf("e1", "Emissions", 3, 3)]));
        let llm = ScriptedLlm::new().on(Stage::TreeSearch, r#"{"selected": [{"confidence": 0.7}], "continue": false}"#);
        let context = context_with(llm, index);
        let tasks = vec![
            SearchTask {
                question: QUESTION.to_string(),
                document_id: "esg".to_string(),
            },
            SearchTask {
                question: QUESTION.to_string(),
                document_id: "annual".to_string(),
            },
        ];
        let outcomes = TreeSearcher.search_many(&context, tasks, None).await;
        assert_eq!(outcomes[0].0.document_id, "esg");
        assert_eq!(outcomes[0].1.as_ref().unwrap().results[0].page_number, 3);
        assert_eq!(outcomes[1].0.document_id, "annual");
    }
}
