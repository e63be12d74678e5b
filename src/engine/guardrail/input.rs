use unicode_normalization::UnicodeNormalization;

use super::patterns::{RE_CARD, RE_EMAIL, RE_PHONE, RE_SSN};
use super::{GuardrailError, InputValidator, InputVerdict, compiled};
use crate::config::GuardrailConfig;
use crate::engine::types::warnings;

/// 去掉空白与标点后仍需达到该长度，特征短语才参与紧凑匹配，避免短语跨词误报
const COMPACT_MATCH_MIN_CHARS: usize = 16;

#[derive(Debug, Clone)]
struct Signature {
    spaced: String,
    compact: String,
}

/// 默认输入护栏
///
/// 检查顺序：过短 → 超长 → 注入特征 → PII掩码。注入检测是尽力而为的：
/// 先做NFKC归一化、去除零宽字符、小写化与空白折叠，再做子串匹配。
#[derive(Debug, Clone)]
pub struct InputGuard {
    config: GuardrailConfig,
    signatures: Vec<Signature>,
}

impl InputGuard {
    pub fn new(config: GuardrailConfig) -> Self {
        let signatures = config
            .injection_signatures
            .iter()
            .map(|s| normalize(s))
            .filter(|s| !s.is_empty())
            .map(|spaced| Signature {
                compact: compact(&spaced),
                spaced,
            })
            .collect();
        Self { config, signatures }
    }

    fn detect_injection(&self, question: &str) -> bool {
        let spaced = normalize(question);
        let compacted = compact(&spaced);
        self.signatures.iter().any(|sig| {
            spaced.contains(&sig.spaced)
                || (sig.compact.chars().count() >= COMPACT_MATCH_MIN_CHARS
                    && compacted.contains(&sig.compact))
        })
    }

    fn mask_pii(&self, text: &str) -> Result<(String, bool), GuardrailError> {
        let mut masked = text.to_string();
        for (name, pattern, placeholder) in [
            ("email", &RE_EMAIL, "[EMAIL]"),
            ("card", &RE_CARD, "[CARD]"),
            ("ssn", &RE_SSN, "[SSN]"),
            ("phone", &RE_PHONE, "[PHONE]"),
        ] {
            let regex = compiled(name, pattern)?;
            masked = regex.replace_all(&masked, placeholder).into_owned();
        }
        let changed = masked != text;
        Ok((masked, changed))
    }
}

impl InputValidator for InputGuard {
    fn validate_input(&self, question: &str) -> Result<InputVerdict, GuardrailError> {
        let mut sanitized = question.trim().to_string();
        let mut issues = Vec::new();

        if sanitized.chars().count() < self.config.min_question_chars {
            return Ok(InputVerdict::rejected(&sanitized, warnings::INPUT_TOO_SHORT));
        }

        if sanitized.chars().count() > self.config.max_question_chars {
            if !self.config.truncate_oversized {
                return Ok(InputVerdict::rejected(&sanitized, warnings::INPUT_TOO_LONG));
            }
            sanitized = sanitized
                .chars()
                .take(self.config.max_question_chars)
                .collect();
            issues.push(warnings::INPUT_TOO_LONG.to_string());
        }

        if self.detect_injection(&sanitized) {
            return Ok(InputVerdict::rejected(
                &sanitized,
                warnings::PROMPT_INJECTION_DETECTED,
            ));
        }

        if self.config.pii_masking {
            let (masked, changed) = self.mask_pii(&sanitized)?;
            if changed {
                issues.push(warnings::PII_MASKED.to_string());
                sanitized = masked;
            }
        }

        Ok(InputVerdict {
            sanitized_question: sanitized,
            valid: true,
            warnings: issues,
        })
    }
}

/// NFKC → 去零宽/格式字符 → 小写 → 空白折叠
fn normalize(text: &str) -> String {
    let folded: String = text
        .nfkc()
        .filter(|c| !matches!(c, '\u{200B}'..='\u{200F}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}'))
        .flat_map(char::to_lowercase)
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn compact(text: &str) -> String {
    text.chars().filter(|c| c.is_alphanumeric()).collect()
}
