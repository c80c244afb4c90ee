//! JSON extraction and tolerant repair for raw model output.
//!
//! Models wrap JSON in code fences, prepend reasoning blocks, add prose
//! around it, or stop mid-object. [`parse_json`] peels those layers off in a
//! fixed order and, if strict parsing still fails, applies a single-pass
//! repair for the syntax mistakes models actually make. No regex is used.

use serde_json::Value;
use thiserror::Error;

/// Why no JSON value could be recovered.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractError {
    /// The text contains no `{` or `[` at all.
    #[error("no JSON object or array found in response")]
    NoJson,
    /// A candidate was found but stayed invalid after repair.
    #[error("invalid JSON after repair: {0}")]
    Invalid(String),
}

/// A value recovered from model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedJson {
    pub value: Value,
    /// Whether the tolerant repair pass was needed.
    pub repaired: bool,
}

/// Recover a JSON value from raw model output.
///
/// Steps, in order: drop `<think>`/`<thinking>` blocks, unwrap a markdown
/// code fence, slice from the first `{` or `[` to the last matching closer,
/// parse strictly, and on failure parse again after [`repair_json`].
pub fn parse_json(raw: &str) -> Result<ParsedJson, ExtractError> {
    let text = strip_thinking(raw);
    let text = strip_code_fence(&text);
    let candidate = locate_json_span(&text).ok_or(ExtractError::NoJson)?;

    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return Ok(ParsedJson {
            value,
            repaired: false,
        });
    }

    let (mut repaired, auto_closed) = repair(candidate);

    // A span that needed closing was cut at an inner closer; the output was
    // truncated, so repair everything from the opener instead.
    if auto_closed > 0 {
        if let Some(start) = text.find(['{', '[']) {
            let remainder = &text[start..];
            if remainder.len() > candidate.len() {
                repaired = repair(remainder).0;
            }
        }
    }

    serde_json::from_str::<Value>(&repaired)
        .map(|value| ParsedJson {
            value,
            repaired: true,
        })
        .map_err(|e| ExtractError::Invalid(e.to_string()))
}

/// Remove reasoning blocks (`<think>…</think>`, `<thinking>…</thinking>`).
///
/// A closing tag without an opener drops everything before it. An opener
/// without a closer is left alone.
pub fn strip_thinking(text: &str) -> String {
    let mut out = text.to_string();
    for (open, close) in [("<think>", "</think>"), ("<thinking>", "</thinking>")] {
        loop {
            let Some(end) = out.find(close) else { break };
            let start = out[..end].rfind(open).unwrap_or(0);
            out.replace_range(start..end + close.len(), "");
        }
    }
    out.trim().to_string()
}

/// Return the body of the first markdown code fence, or the input unchanged.
///
/// The info string after the opening fence (`json`, `JSON`, ...) is dropped.
/// An unterminated fence yields everything after the opener.
pub fn strip_code_fence(text: &str) -> String {
    let Some(start) = text.find("```") else {
        return text.trim().to_string();
    };
    let after = &text[start + 3..];
    let body_start = match after.find('\n') {
        Some(nl) if after[..nl].chars().all(|c| c.is_alphanumeric() || c == '_') => nl + 1,
        _ => 0,
    };
    let body = &after[body_start..];
    let body = match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    };
    body.trim().to_string()
}

/// Slice from the first `{` or `[` to the last closer of the same kind.
///
/// If no closer follows, the slice runs to the end of the text so the
/// repair pass can close it.
pub fn locate_json_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    match text[start..].rfind(close) {
        Some(end) => Some(&text[start..start + end + close.len_utf8()]),
        None => Some(&text[start..]),
    }
}

/// Single-pass repair of common syntax defects.
///
/// Handles `//` and `/* */` comments, Python `True`/`False`/`None`,
/// trailing commas, raw newlines inside strings, an unterminated string and
/// unclosed brackets at the end of the text.
pub fn repair_json(s: &str) -> String {
    repair(s).0
}

/// Repair `s`, also returning how many brackets had to be closed.
fn repair(s: &str) -> (String, usize) {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len();
    let mut out = String::with_capacity(s.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;
    let mut i = 0;

    while i < len {
        let c = chars[i];

        if in_string {
            if escape_next {
                escape_next = false;
                out.push(c);
            } else if c == '\\' {
                escape_next = true;
                out.push(c);
            } else if c == '"' {
                in_string = false;
                out.push(c);
            } else if c == '\n' {
                out.push_str("\\n");
            } else if c == '\r' {
                out.push_str("\\r");
            } else if c == '\t' {
                out.push_str("\\t");
            } else {
                out.push(c);
            }
            i += 1;
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < len && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < len && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i = (i + 2).min(len);
            }
            '{' => {
                closers.push('}');
                out.push(c);
                i += 1;
            }
            '[' => {
                closers.push(']');
                out.push(c);
                i += 1;
            }
            '}' | ']' => {
                drop_trailing_comma(&mut out);
                if closers.last() == Some(&c) {
                    closers.pop();
                }
                out.push(c);
                i += 1;
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < len && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    if in_string {
        if escape_next {
            out.pop();
        }
        out.push('"');
    }

    let auto_closed = closers.len();
    while let Some(closer) = closers.pop() {
        drop_trailing_comma(&mut out);
        if out.trim_end().ends_with(':') {
            out.push_str(" null");
        }
        out.push(closer);
    }
    (out, auto_closed)
}

/// Remove a comma that is followed only by whitespace at the end of `out`.
fn drop_trailing_comma(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    if out[..trimmed_len].ends_with(',') {
        out.truncate(trimmed_len - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_json() {
        let parsed = parse_json(r#"{"title": "Dawn"}"#).unwrap();
        assert_eq!(parsed.value, json!({"title": "Dawn"}));
        assert!(!parsed.repaired);
    }

    #[test]
    fn test_code_fence_and_prose() {
        let raw = "Here is the outline:\n```json\n{\"chapters\": 12}\n```\nHope it helps!";
        let parsed = parse_json(raw).unwrap();
        assert_eq!(parsed.value["chapters"], 12);
        assert!(!parsed.repaired);
    }

    #[test]
    fn test_unlabelled_fence() {
        assert_eq!(strip_code_fence("```\n[1, 2]\n```"), "[1, 2]");
        assert_eq!(strip_code_fence("no fence here "), "no fence here");
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn test_thinking_blocks_removed() {
        let raw = "<think>The user wants {json}.</think>\n{\"ok\": true}";
        assert_eq!(parse_json(raw).unwrap().value, json!({"ok": true}));

        let raw = "<thinking>plan [a]</thinking>{\"ok\": 1}<think>more</think>";
        assert_eq!(strip_thinking(raw), "{\"ok\": 1}");

        let raw = "reasoning without opener</think>{\"ok\": 2}";
        assert_eq!(strip_thinking(raw), "{\"ok\": 2}");
    }

    #[test]
    fn test_span_prefers_first_opener() {
        assert_eq!(locate_json_span("x [1, {\"a\": 2}] y"), Some("[1, {\"a\": 2}]"));
        assert_eq!(locate_json_span("x {\"a\": [1]} y ]"), Some("{\"a\": [1]}"));
        assert_eq!(locate_json_span("{\"a\": 1"), Some("{\"a\": 1"));
        assert_eq!(locate_json_span("nothing here"), None);
    }

    #[test]
    fn test_trailing_commas_and_comments() {
        let raw = r#"{
            // chapter data
            "title": "Dawn", /* working title */
            "tags": ["a", "b",],
        }"#;
        let parsed = parse_json(raw).unwrap();
        assert!(parsed.repaired);
        assert_eq!(parsed.value, json!({"title": "Dawn", "tags": ["a", "b"]}));
    }

    #[test]
    fn test_python_literals() {
        let parsed = parse_json(r#"{"done": True, "draft": False, "notes": None}"#).unwrap();
        assert_eq!(parsed.value, json!({"done": true, "draft": false, "notes": null}));
    }

    #[test]
    fn test_literals_inside_strings_untouched() {
        let parsed = parse_json(r#"{"line": "None shall pass", "x": None,}"#).unwrap();
        assert_eq!(parsed.value["line"], "None shall pass");
        assert!(parsed.value["x"].is_null());
    }

    #[test]
    fn test_unclosed_brackets() {
        let parsed = parse_json(r#"{"chapters": [{"n": 1}, {"n": 2"#).unwrap();
        assert_eq!(parsed.value, json!({"chapters": [{"n": 1}, {"n": 2}]}));
        assert!(parsed.repaired);
    }

    #[test]
    fn test_unterminated_string_and_dangling_key() {
        assert_eq!(
            parse_json(r#"{"summary": "It was a dark"#).unwrap().value,
            json!({"summary": "It was a dark"})
        );
        assert_eq!(
            parse_json(r#"{"a": 1, "b":"#).unwrap().value,
            json!({"a": 1, "b": null})
        );
    }

    #[test]
    fn test_raw_newline_in_string() {
        let parsed = parse_json("{\"text\": \"line one\nline two\"}").unwrap();
        assert_eq!(parsed.value["text"], "line one\nline two");
    }

    #[test]
    fn test_no_json() {
        assert_eq!(parse_json("I cannot help with that."), Err(ExtractError::NoJson));
    }

    #[test]
    fn test_unrepairable() {
        assert!(matches!(
            parse_json("{\"a\": @@@}"),
            Err(ExtractError::Invalid(_))
        ));
    }
}
