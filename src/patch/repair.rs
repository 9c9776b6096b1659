//! Bounded JSON repair for malformed builder output.
//!
//! The repair pass never invents content: it only closes unterminated
//! strings, balances open brackets, and drops trailing fragments back to
//! the last structural boundary. Every repair is recorded so the attempt
//! record can carry it for audit. If no valid JSON can be produced within
//! the step bound, repair gives up and the caller declares the output
//! unparseable.

/// Maximum number of truncate-and-close attempts before giving up.
const MAX_REPAIR_STEPS: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub repaired: String,
    pub repairs: Vec<String>,
}

/// Attempt to repair `text` into valid JSON. Returns `None` if the input
/// has no object start or no repair within bounds yields valid JSON.
pub fn repair_json(text: &str) -> Option<RepairOutcome> {
    let start = text.find('{')?;
    let candidate = &text[start..];

    let mut cut = candidate.len();
    for step in 0..MAX_REPAIR_STEPS {
        let slice = &candidate[..cut];
        if let Some(outcome) = close_and_parse(slice, start > 0, step) {
            return Some(outcome);
        }
        // Drop back to the previous structural boundary and retry.
        match slice.rfind([',', '{', '[']) {
            Some(boundary) if boundary > 0 => cut = boundary,
            _ => return None,
        }
    }
    None
}

/// Close open strings/brackets on `slice` and validate the result.
fn close_and_parse(slice: &str, had_prefix: bool, step: usize) -> Option<RepairOutcome> {
    let mut repairs = Vec::new();
    if had_prefix {
        repairs.push("dropped non-JSON prefix".to_string());
    }
    if step > 0 {
        repairs.push(format!("truncated tail to byte {}", slice.len()));
    }

    let mut in_string = false;
    let mut escaped = false;
    let mut stack: Vec<char> = Vec::new();

    for ch in slice.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut repaired = slice.to_string();
    if in_string {
        repaired.push('"');
        repairs.push("closed unterminated string".to_string());
    }
    while let Some(closer) = stack.pop() {
        repaired.push(closer);
        repairs.push(format!("closed unbalanced '{}'", closer));
    }

    if serde_json::from_str::<serde_json::Value>(&repaired).is_ok() {
        Some(RepairOutcome { repaired, repairs })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_valid_passes_through() {
        let outcome = repair_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(outcome.repaired, r#"{"a": 1}"#);
        assert!(outcome.repairs.is_empty());
    }

    #[test]
    fn test_closes_unterminated_string_and_braces() {
        let outcome = repair_json(r#"{"files": [{"path": "a.py", "content": "x = 1"#).unwrap();
        let value: serde_json::Value = serde_json::from_str(&outcome.repaired).unwrap();
        assert_eq!(value["files"][0]["path"], "a.py");
        assert!(outcome.repairs.iter().any(|r| r.contains("string")));
        assert!(outcome.repairs.iter().any(|r| r.contains("unbalanced")));
    }

    #[test]
    fn test_drops_dangling_key() {
        // `"content":` with no value cannot be closed; the repair truncates
        // back past the dangling key instead of inventing a value.
        let outcome = repair_json(r#"{"files": [{"path": "a.py", "content":"#).unwrap();
        let value: serde_json::Value = serde_json::from_str(&outcome.repaired).unwrap();
        assert!(value.get("files").is_some());
        assert!(outcome.repairs.iter().any(|r| r.contains("truncated")));
    }

    #[test]
    fn test_drops_prose_prefix() {
        let outcome = repair_json(r#"Sure, here it is: {"a": [1, 2"#).unwrap();
        let value: serde_json::Value = serde_json::from_str(&outcome.repaired).unwrap();
        assert_eq!(value["a"][0], 1);
        assert!(outcome.repairs.iter().any(|r| r.contains("prefix")));
    }

    #[test]
    fn test_no_object_start_gives_up() {
        assert!(repair_json("no json here at all").is_none());
    }

    #[test]
    fn test_never_invents_content() {
        let outcome = repair_json(r#"{"key": "val"#).unwrap();
        // The only change is the closing punctuation.
        assert!(outcome.repaired.starts_with(r#"{"key": "val"#));
        assert_eq!(outcome.repaired, r#"{"key": "val"}"#);
    }
}
