use crate::config::{Config, LLMProvider};
use crate::engine::types::Query;
use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};

/// 未显式指定配置文件时，在当前目录查找的默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "pageindex.toml";

/// PageIndex-RS - 基于树索引推理的长文档问答引擎
#[derive(Parser, Debug)]
#[command(name = "pageindex-rs")]
#[command(
    about = "Reasoning-based question answering over long documents. Navigates a precomputed tree index of each document with an LLM instead of vector search, and answers with page citations."
)]
#[command(version)]
pub struct Args {
    /// 要回答的问题
    #[arg(short, long)]
    pub question: Option<String>,

    /// 会话ID，用于关联同一会话下的多次查询
    #[arg(short, long, default_value = "cli")]
    pub thread_id: String,

    /// 限定查询的文档ID，可重复指定
    #[arg(long = "doc")]
    pub documents: Vec<String>,

    /// 以流式方式输出回答
    #[arg(long)]
    pub stream: bool,

    /// 以JSON格式输出完整结果
    #[arg(long)]
    pub json: bool,

    /// 回答后打印该查询的状态迁移日志
    #[arg(long)]
    pub trace: bool,

    /// 列出已索引的文档
    #[arg(long)]
    pub list_docs: bool,

    /// 检查模型连接
    #[arg(long)]
    pub check: bool,

    /// 配置文件路径
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 树索引目录
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// 是否启用详细日志
    #[arg(short, long)]
    pub verbose: bool,

    /// 高能效模型，用于路由、规划、检索与fast路由的回答
    #[arg(long)]
    pub model_efficient: Option<String>,

    /// 高质量模型，用于standard/complex路由的回答
    #[arg(long)]
    pub model_powerful: Option<String>,

    /// LLM API基地址
    #[arg(long)]
    pub llm_api_base_url: Option<String>,

    /// LLM API KEY
    #[arg(long)]
    pub llm_api_key: Option<String>,

    /// LLM Provider (openai, groq, deepseek, anthropic, ollama)
    #[arg(long)]
    pub llm_provider: Option<String>,

    /// 温度参数
    #[arg(long)]
    pub temperature: Option<f64>,

    /// 树搜索的最大并发数
    #[arg(long)]
    pub max_parallels: Option<usize>,

    /// 单次LLM调用超时（毫秒）
    #[arg(long)]
    pub call_timeout_ms: Option<u64>,

    /// critic→树搜索 的最大重试次数
    #[arg(long)]
    pub max_retries: Option<u32>,
}

impl Args {
    /// 将CLI参数转换为配置
    ///
    /// 配置来源依次为 `--config`、当前目录下的 `pageindex.toml`、内置默认值，命令行参数最后覆盖。
    pub fn into_config(&self) -> Result<Config> {
        let default_config_path = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(DEFAULT_CONFIG_FILE);
        self.resolve_config(&default_config_path)
    }

    fn resolve_config(&self, default_config_path: &Path) -> Result<Config> {
        let mut config = if let Some(config_path) = &self.config {
            Config::from_file(config_path)?
        } else if default_config_path.exists() {
            Config::from_file(default_config_path)?
        } else {
            Config::default()
        };

        if let Some(data_dir) = &self.data_dir {
            config.index.data_dir = data_dir.clone();
        }

        // 覆盖LLM配置
        if let Some(provider_str) = &self.llm_provider {
            if let Ok(provider) = provider_str.parse::<LLMProvider>() {
                config.llm.provider = provider;
            } else {
                eprintln!(
                    "⚠️ 警告: 未知的provider: {}，使用默认provider",
                    provider_str
                );
            }
        }
        if let Some(llm_api_base_url) = &self.llm_api_base_url {
            config.llm.api_base_url = llm_api_base_url.clone();
        }
        if let Some(llm_api_key) = &self.llm_api_key {
            config.llm.api_key = llm_api_key.clone();
        }
        if let Some(model_efficient) = &self.model_efficient {
            config.llm.model_efficient = model_efficient.clone();
        }
        if let Some(model_powerful) = &self.model_powerful {
            config.llm.model_powerful = model_powerful.clone();
        }
        if let Some(temperature) = self.temperature {
            config.llm.temperature = temperature;
        }
        if let Some(max_parallels) = self.max_parallels {
            config.llm.max_parallels = max_parallels;
        }
        if let Some(call_timeout_ms) = self.call_timeout_ms {
            config.llm.call_timeout_ms = call_timeout_ms;
        }
        if let Some(max_retries) = self.max_retries {
            config.query.max_retries = max_retries;
        }

        config.verbose = config.verbose || self.verbose;
        config.validate()?;
        Ok(config)
    }

    /// 由 `--question` 构造查询，未给出问题时返回None
    pub fn to_query(&self) -> Option<Query> {
        let question = self.question.as_ref()?;
        let query = Query::new(question.clone(), self.thread_id.clone());
        if self.documents.is_empty() {
            Some(query)
        } else {
            Some(query.with_documents(self.documents.clone()))
        }
    }
}
