//! 从模型输出中提取JSON
//!
//! 模型经常在JSON外包裹代码块标记或解释性文字，这里按以下顺序尝试：
//! 整体解析、去掉 ``` 代码块、截取第一个 `{`/`[` 到最后一个 `}`/`]`。

use serde_json::Value;

pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(inner) = strip_code_fence(trimmed) {
        if let Ok(value) = serde_json::from_str(inner) {
            return Some(value);
        }
    }

    let start = trimmed.find(['{', '['])?;
    let open = trimmed[start..].chars().next()?;
    let close = if open == '{' { '}' } else { ']' };
    let end = trimmed.rfind(close)?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

fn strip_code_fence(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // 跳过语言标记（如 json）
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// 读取 [0, 1] 区间内的数值字段，支持数字与数字字符串
pub fn unit_interval(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if number.is_finite() {
        Some(number.clamp(0.0, 1.0))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_json() {
        assert_eq!(extract_json(r#"{"score": 0.3}"#), Some(json!({"score": 0.3})));
    }

    #[test]
    fn test_fenced_json() {
        let text = "Here you go:\n```json\n[\"a\", \"b\"]\n```\nDone.";
        assert_eq!(extract_json(text), Some(json!(["a", "b"])));
    }

    #[test]
    fn test_json_inside_prose() {
        let text = "The evaluation is {\"relevance_score\": 0.9} as requested.";
        assert_eq!(extract_json(text), Some(json!({"relevance_score": 0.9})));
    }

    #[test]
    fn test_garbage() {
        assert_eq!(extract_json("no structured output"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }

    #[test]
    fn test_unit_interval() {
        assert_eq!(unit_interval(&json!(0.25)), Some(0.25));
        assert_eq!(unit_interval(&json!("0.8")), Some(0.8));
        assert_eq!(unit_interval(&json!(1.7)), Some(1.0));
        assert_eq!(unit_interval(&json!(-2)), Some(0.0));
        assert_eq!(unit_interval(&json!("high")), None);
        assert_eq!(unit_interval(&json!(null)), None);
    }
}
