use super::patterns::{RE_ACCOUNT_NUMBER, RE_INVESTMENT_ADVICE, RE_MONETARY};
use super::{GuardrailError, compiled};
use crate::engine::types::warnings;

const ADVICE_WARNING: &str = "\n\n> ⚠️ **Important**: The above should not be interpreted as investment advice. Always conduct your own research and consult with a licensed financial advisor before making investment decisions.";

/// 金融领域的回答合规处理
#[derive(Debug, Clone)]
pub struct FinanceCompliance {
    disclaimer: String,
}

impl FinanceCompliance {
    pub fn new(disclaimer: impl Into<String>) -> Self {
        Self {
            disclaimer: disclaimer.into(),
        }
    }

    /// 依次执行：账号脱敏、投资建议警告、金额免责声明
    pub fn process(&self, answer: &str) -> Result<(String, Vec<String>), GuardrailError> {
        let mut text = answer.to_string();
        let mut issues = Vec::new();

        let accounts = compiled("account_number", &RE_ACCOUNT_NUMBER)?;
        let redacted = accounts.replace_all(&text, "$1 [ACCOUNT-REDACTED]");
        if redacted != text {
            text = redacted.into_owned();
            issues.push(warnings::SENSITIVE_DATA_REDACTED.to_string());
        }

        if compiled("investment_advice", &RE_INVESTMENT_ADVICE)?.is_match(&text) {
            text.push_str(ADVICE_WARNING);
            issues.push(warnings::INVESTMENT_ADVICE_FLAGGED.to_string());
        }

        if compiled("monetary", &RE_MONETARY)?.is_match(answer)
            && !self.disclaimer.is_empty()
            && !text.contains(self.disclaimer.trim())
        {
            text.push_str(&self.disclaimer);
            issues.push(warnings::FINANCIAL_DISCLAIMER_ADDED.to_string());
        }

        Ok((text, issues))
    }
}
