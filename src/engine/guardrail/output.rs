use super::patterns::{
    RE_CARD, RE_EMAIL, RE_PHONE, RE_SENSITIVE_CARD, RE_SENSITIVE_SECRET, RE_SENSITIVE_SSN,
};
use super::{FinanceCompliance, GuardrailError, OutputDraft, OutputValidator, OutputVerdict, compiled};
use crate::config::GuardrailConfig;
use crate::engine::types::warnings;

/// 默认输出护栏
///
/// - 空回答无效
/// - `confidence > 0` 的回答必须至少带一个来源
/// - 掩码回答中泄露的PII，脱敏敏感片段，再做金融合规处理
#[derive(Debug, Clone)]
pub struct OutputGuard {
    finance: FinanceCompliance,
}

impl OutputGuard {
    pub fn new(config: &GuardrailConfig) -> Self {
        Self {
            finance: FinanceCompliance::new(config.financial_disclaimer.clone()),
        }
    }

    fn mask_pii(&self, text: &str) -> Result<String, GuardrailError> {
        let mut masked = text.to_string();
        for (name, pattern, placeholder) in [
            ("email", &RE_EMAIL, "[EMAIL]"),
            ("card", &RE_CARD, "[CARD]"),
            ("phone", &RE_PHONE, "[PHONE]"),
        ] {
            masked = compiled(name, pattern)?
                .replace_all(&masked, placeholder)
                .into_owned();
        }
        Ok(masked)
    }

    fn redact_sensitive(&self, text: &str) -> Result<String, GuardrailError> {
        let mut redacted = text.to_string();
        for (name, pattern) in [
            ("sensitive_ssn", &RE_SENSITIVE_SSN),
            ("sensitive_card", &RE_SENSITIVE_CARD),
            ("sensitive_secret", &RE_SENSITIVE_SECRET),
        ] {
            redacted = compiled(name, pattern)?
                .replace_all(&redacted, "[REDACTED]")
                .into_owned();
        }
        Ok(redacted)
    }
}

impl OutputValidator for OutputGuard {
    fn validate_output(&self, draft: OutputDraft<'_>) -> Result<OutputVerdict, GuardrailError> {
        let answer = draft.answer.trim();
        if answer.is_empty() {
            return Ok(OutputVerdict {
                final_answer: String::new(),
                valid: false,
                warnings: vec![warnings::EMPTY_ANSWER.to_string()],
            });
        }

        if draft.confidence > 0.0 && draft.sources.is_empty() {
            return Ok(OutputVerdict {
                final_answer: String::new(),
                valid: false,
                warnings: vec![warnings::MISSING_CITATION.to_string()],
            });
        }

        let mut issues = Vec::new();

        // 敏感片段先于PII掩码，避免 "SSN: 123-45-6789" 只被部分替换
        let redacted = self.redact_sensitive(answer)?;
        if redacted != answer {
            issues.push(warnings::SENSITIVE_DATA_REDACTED.to_string());
        }

        let masked = self.mask_pii(&redacted)?;
        if masked != redacted {
            issues.push(warnings::PII_MASKED.to_string());
        }

        let (final_answer, finance_issues) = self.finance.process(&masked)?;
        for issue in finance_issues {
            if !issues.contains(&issue) {
                issues.push(issue);
            }
        }

        Ok(OutputVerdict {
            final_answer,
            valid: true,
            warnings: issues,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::SourceRef;

    fn guard() -> OutputGuard {
        OutputGuard::new(&GuardrailConfig {
            financial_disclaimer: "\n\n*Disclaimer*".to_string(),
            ..GuardrailConfig::default()
        })
    }

    fn source() -> Vec<SourceRef> {
        vec![SourceRef {
            document_id: "annual".to_string(),
            page_number: 12,
        }]
    }

    #[test]
    fn test_cited_answer_passes_with_disclaimer() {
        let sources = source();
        let verdict = guard()
            .validate_output(OutputDraft {
                answer: "Total revenue was $4.2 billion [annual p.12].",
                sources: &sources,
                confidence: 0.7,
            })
            .unwrap();
        assert!(verdict.valid);
        assert_eq!(
            verdict.final_answer,
            "Total revenue was $4.2 billion [annual p.12].\n\n*Disclaimer*"
        );
        assert_eq!(verdict.warnings, vec!["financial_disclaimer_added"]);
    }

    #[test]
    fn test_uncited_factual_answer_rejected() {
        let verdict = guard()
            .validate_output(OutputDraft {
                answer: "Total revenue was $4.2 billion.",
                sources: &[],
                confidence: 0.7,
            })
            .unwrap();
        assert!(!verdict.valid);
        assert_eq!(verdict.warnings, vec!["missing_citation"]);
    }

    #[test]
    fn test_refusal_needs_no_citation() {
        let verdict = guard()
            .validate_output(OutputDraft {
                answer: "I cannot answer this question from the provided documents.",
                sources: &[],
                confidence: 0.0,
            })
            .unwrap();
        assert!(verdict.valid);
        assert!(verdict.warnings.is_empty());
    }

    #[test]
    fn test_empty_answer_rejected() {
        let verdict = guard()
            .validate_output(OutputDraft {
                answer: "   ",
                sources: &[],
                confidence: 0.0,
            })
            .unwrap();
        assert!(!verdict.valid);
        assert_eq!(verdict.warnings, vec!["empty_answer"]);
    }

    #[test]
    fn test_leaked_pii_and_secrets_are_scrubbed() {
        let sources = source();
        let verdict = guard()
            .validate_output(OutputDraft {
                answer: "Contact ir@example.com; the admin password: hunter2 was listed.",
                sources: &sources,
                confidence: 0.6,
            })
            .unwrap();
        assert!(verdict.valid);
        assert_eq!(
            verdict.final_answer,
            "Contact [EMAIL]; the admin [REDACTED] was listed."
        );
        assert_eq!(verdict.warnings, vec!["sensitive_data_redacted", "pii_masked"]);
    }

    #[test]
    fn test_bare_figures_are_not_phone_numbers() {
        let sources = source();
        let verdict = guard()
            .validate_output(OutputDraft {
                answer: "Shares outstanding were 1234567890 [annual p.12].",
                sources: &sources,
                confidence: 0.6,
            })
            .unwrap();
        assert_eq!(verdict.final_answer, "Shares outstanding were 1234567890 [annual p.12].");
        assert!(verdict.warnings.is_empty());

        let verdict = guard()
            .validate_output(OutputDraft {
                answer: "Investor relations: (555) 123-4567 or 555.987.6543 [annual p.12].",
                sources: &sources,
                confidence: 0.6,
            })
            .unwrap();
        assert_eq!(
            verdict.final_answer,
            "Investor relations: [PHONE] or [PHONE] [annual p.12]."
        );
        assert_eq!(verdict.warnings, vec!["pii_masked"]);
    }
}
