//! 输入/输出护栏
//!
//! 校验器本身可以替换（[`InputValidator`] / [`OutputValidator`]），但编排器只通过
//! [`validate_input_fail_closed`] / [`validate_output_fail_closed`] 调用它们：
//! 校验器返回错误或发生panic时，结果一律视为拒绝。

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::LazyLock;
use thiserror::Error;

use crate::engine::types::{SourceRef, warnings};

mod finance;
mod input;
mod output;
mod patterns;

pub use finance::FinanceCompliance;
pub use input::InputGuard;
pub use output::OutputGuard;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GuardrailError {
    #[error("guardrail internal error: {0}")]
    Internal(String),
}

/// 输入校验结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputVerdict {
    pub sanitized_question: String,
    pub valid: bool,
    pub warnings: Vec<String>,
}

impl InputVerdict {
    pub fn rejected(question: &str, warning: &str) -> Self {
        Self {
            sanitized_question: question.to_string(),
            valid: false,
            warnings: vec![warning.to_string()],
        }
    }

    pub fn is_injection(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| w == warnings::PROMPT_INJECTION_DETECTED)
    }
}

/// 待校验的回答
#[derive(Debug, Clone, Copy)]
pub struct OutputDraft<'a> {
    pub answer: &'a str,
    pub sources: &'a [SourceRef],
    /// 0 表示拒答，拒答不要求引用
    pub confidence: f64,
}

/// 输出校验结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputVerdict {
    pub final_answer: String,
    pub valid: bool,
    pub warnings: Vec<String>,
}

pub trait InputValidator: Send + Sync {
    fn validate_input(&self, question: &str) -> Result<InputVerdict, GuardrailError>;
}

pub trait OutputValidator: Send + Sync {
    fn validate_output(&self, draft: OutputDraft<'_>) -> Result<OutputVerdict, GuardrailError>;
}

/// 执行输入校验，错误与panic都转换为拒绝
pub fn validate_input_fail_closed(validator: &dyn InputValidator, question: &str) -> InputVerdict {
    let outcome = catch_unwind(AssertUnwindSafe(|| validator.validate_input(question)));
    match outcome {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "input validator failed, rejecting query");
            InputVerdict::rejected(question, warnings::GUARDRAIL_INTERNAL_ERROR)
        }
        Err(_) => {
            tracing::error!("input validator panicked, rejecting query");
            InputVerdict::rejected(question, warnings::GUARDRAIL_INTERNAL_ERROR)
        }
    }
}

/// 执行输出校验，错误与panic都转换为拒绝
pub fn validate_output_fail_closed(
    validator: &dyn OutputValidator,
    draft: OutputDraft<'_>,
) -> OutputVerdict {
    let outcome = catch_unwind(AssertUnwindSafe(|| validator.validate_output(draft)));
    let failure = match outcome {
        Ok(Ok(verdict)) => return verdict,
        Ok(Err(e)) => e.to_string(),
        Err(_) => "validator panicked".to_string(),
    };
    tracing::error!(error = %failure, "output validator failed, rejecting answer");
    OutputVerdict {
        final_answer: String::new(),
        valid: false,
        warnings: vec![warnings::GUARDRAIL_INTERNAL_ERROR.to_string()],
    }
}

/// 取出已编译的正则，编译失败视为内部错误
pub(crate) fn compiled(
    name: &str,
    pattern: &'static LazyLock<Option<Regex>>,
) -> Result<&'static Regex, GuardrailError> {
    LazyLock::force(pattern)
        .as_ref()
        .ok_or_else(|| GuardrailError::Internal(format!("pattern `{}` failed to compile", name)))
}
