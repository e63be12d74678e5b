use regex::Regex;
use std::sync::LazyLock;

macro_rules! guard_pattern {
    ($name:ident, $regex_str:expr) => {
        pub static $name: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new($regex_str).ok());
    };
}

// ── PII ────────────────────────────────────────────────────────────────────
guard_pattern!(
    RE_EMAIL,
    r"\b[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}\b"
);
guard_pattern!(RE_CARD, r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b");
guard_pattern!(RE_SSN, r"\b\d{3}-\d{2}-\d{4}\b");
// 只认带分隔符或区号括号的写法，连续的十位数字按普通数值处理
guard_pattern!(
    RE_PHONE,
    r"(?:\+1[-. ]?)?(?:\(\d{3}\)\s?|\b\d{3}[-. ])\d{3}[-. ]\d{4}\b"
);

// ── 回答中的敏感片段 ────────────────────────────────────────────────────────
guard_pattern!(
    RE_SENSITIVE_SSN,
    r"(?i)\b(?:social security(?: number)?|ssn)[\s:#]*\d[\d\-]*"
);
guard_pattern!(
    RE_SENSITIVE_CARD,
    r"(?i)\b(?:credit card|card number)[\s:#]*\d[\d\-\s]*\d"
);
guard_pattern!(RE_SENSITIVE_SECRET, r"(?i)\b(?:password|secret)[\s:]+\S+");
guard_pattern!(
    RE_ACCOUNT_NUMBER,
    r"(?i)\b(account|acct|routing)(\s+(?:number|no\.?|#))?[\s:#]*\d{6,17}\b"
);

// ── 金融合规 ────────────────────────────────────────────────────────────────
guard_pattern!(
    RE_MONETARY,
    r"(?i)(?:[$€£¥]\s?\d)|(?:\b\d[\d,]*(?:\.\d+)?\s?(?:million|billion|trillion|thousand|usd|eur|gbp|dollars?|euros?)\b)"
);
guard_pattern!(
    RE_INVESTMENT_ADVICE,
    r"(?i)you should (?:buy|sell|invest in)|i recommend (?:buying|selling|investing)|guaranteed (?:returns|profit)|risk[- ]free investment|can't lose|double your money|insider (?:tip|information)|hot stock|get rich quick"
);
