use anyhow::Result;
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use pageindex_rs::cli::Args;
use pageindex_rs::engine::{EngineContext, QueryEngine, QueryResponse, StreamEvent};
use pageindex_rs::index::{DocumentCatalog, JsonIndexStore};
use pageindex_rs::llm::client::LLMClient;

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pageindex_rs={}", default_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.into_config()?;
    init_tracing(config.verbose);

    if args.check {
        LLMClient::new(config.llm.clone())?.check_connection().await?;
        if args.question.is_none() && !args.list_docs {
            return Ok(());
        }
    }

    let store = JsonIndexStore::open(&config.index.data_dir).await?;
    eprintln!(
        "📚 已加载 {} 个文档索引: {}",
        store.document_count(),
        config.index.data_dir.display()
    );

    if args.list_docs {
        for doc in store.list_indexed_documents().await? {
            println!("{}\t{}", doc.document_id, doc.summary);
        }
        return Ok(());
    }

    let Some(query) = args.to_query() else {
        anyhow::bail!("No question given. Use --question \"...\" or --list-docs");
    };

    let llm = Arc::new(LLMClient::new(config.llm.clone())?);
    let engine = QueryEngine::new(EngineContext::with_index(config, llm, Arc::new(store)));

    eprintln!("🔎 正在检索: {}", query.question);
    let response = if args.stream && !args.json {
        stream_answer(&engine, query).await?
    } else {
        engine.run_query(query).await
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        if !args.stream {
            println!("{}", response.answer);
        }
        print_summary(&response);
    }

    if args.trace {
        if let Some(trace) = engine.traces().get(&response.query_id).await {
            eprintln!("\n🧭 状态迁移日志 ({}):", trace.query_id);
            let path: Vec<String> = trace.states().iter().map(|s| s.to_string()).collect();
            eprintln!("  {}", path.join(" → "));
            for entry in &trace.entries {
                let stage = entry.stage.map(|s| s.to_string()).unwrap_or_default();
                eprintln!(
                    "  {:<20} {:<18} {:>6}ms  {}",
                    entry.state.to_string(),
                    stage,
                    entry.duration_ms,
                    entry.summary
                );
            }
        }
    }

    Ok(())
}

async fn stream_answer(
    engine: &QueryEngine,
    query: pageindex_rs::engine::Query,
) -> Result<QueryResponse> {
    let mut receiver = engine.run_query_stream(query);
    let mut stdout = std::io::stdout();
    while let Some(event) = receiver.recv().await {
        match event {
            StreamEvent::Token(token) => {
                write!(stdout, "{}", token)?;
                stdout.flush()?;
            }
            StreamEvent::Done(response) => {
                writeln!(stdout)?;
                return Ok(response);
            }
        }
    }
    anyhow::bail!("Query stream closed before the final result")
}

fn print_summary(response: &QueryResponse) {
    eprintln!();
    if response.sources.is_empty() {
        eprintln!("📄 来源: 无");
    } else {
        let sources: Vec<String> = response
            .sources
            .iter()
            .map(|s| format!("{} p.{}", s.document_id, s.page_number))
            .collect();
        eprintln!("📄 来源: {}", sources.join(", "));
    }
    eprintln!(
        "📊 路由: {}  复杂度: {:.2}  置信度: {:.2}  重试: {}  耗时: {}ms",
        response.query_type,
        response.complexity_score,
        response.confidence,
        response.retry_count,
        response.latency_ms
    );
    if !response.warnings.is_empty() {
        eprintln!("⚠️ 警告: {}", response.warnings.join(", "));
    }
}
