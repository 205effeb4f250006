//! Extraction of JSON and SQL from LLM responses.
//!
//! Model output often wraps the payload in markdown fences or surrounds it
//! with prose. Extraction tries, in order:
//! 1. A ```json fenced block
//! 2. Any fenced block
//! 3. The whole trimmed content
//! 4. The largest balanced object or array anywhere in the content, later
//!    occurrences winning ties
//!
//! ```
//! use sqlforge::utils::json_extraction::try_extract_json_from_response;
//!
//! let response = "Here you go:\n```json\n{\"keywords\": [\"schools\"]}\n```";
//! let value = try_extract_json_from_response(response).into_value().unwrap();
//! assert_eq!(value["keywords"][0], "schools");
//! ```

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Result of a JSON extraction attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonExtractionResult {
    Success(Value),
    /// JSON started but never closed, usually a length-capped completion.
    Truncated { unclosed: usize },
    NotFound,
}

impl JsonExtractionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JsonExtractionResult::Success(_))
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            JsonExtractionResult::Success(value) => Some(value),
            _ => None,
        }
    }

    /// Human-readable reason for a failed extraction.
    pub fn describe(&self) -> String {
        match self {
            JsonExtractionResult::Success(_) => "ok".to_string(),
            JsonExtractionResult::Truncated { unclosed } => {
                format!("JSON appears truncated ({} unclosed delimiters)", unclosed)
            }
            JsonExtractionResult::NotFound => "no JSON content found in response".to_string(),
        }
    }
}

fn fenced_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"```([A-Za-z]*)[ \t]*\r?\n?([\s\S]*?)```").expect("fence pattern is valid")
    })
}

/// Contents of fenced blocks, paired with their language tag.
fn fenced_blocks(content: &str) -> impl Iterator<Item = (&str, &str)> {
    fenced_block_regex().captures_iter(content).filter_map(|caps| {
        let lang = caps.get(1).map_or("", |m| m.as_str());
        let body = caps.get(2)?.as_str().trim();
        Some((lang, body))
    })
}

/// Extracts the JSON payload of an LLM response.
pub fn try_extract_json_from_response(content: &str) -> JsonExtractionResult {
    let trimmed = content.trim();

    let blocks: Vec<(&str, &str)> = fenced_blocks(trimmed).collect();
    let tagged = blocks
        .iter()
        .filter(|(lang, _)| lang.eq_ignore_ascii_case("json"));
    let untagged = blocks
        .iter()
        .filter(|(lang, _)| !lang.eq_ignore_ascii_case("json"));
    for (_, body) in tagged.chain(untagged) {
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            return JsonExtractionResult::Success(value);
        }
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() || value.is_array() {
            return JsonExtractionResult::Success(value);
        }
    }

    if let Some(value) = largest_embedded_json(trimmed) {
        return JsonExtractionResult::Success(value);
    }

    match unclosed_delimiters(trimmed) {
        0 => JsonExtractionResult::NotFound,
        unclosed => JsonExtractionResult::Truncated { unclosed },
    }
}

/// Byte offset of the delimiter closing the one at the start of `s`.
///
/// Delimiters inside string literals are ignored.
pub fn find_matching_delimiter(s: &str) -> Option<usize> {
    let (open, close) = match s.chars().next()? {
        '{' => ('{', '}'),
        '[' => ('[', ']'),
        _ => return None,
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

fn largest_embedded_json(content: &str) -> Option<Value> {
    let mut best: Option<(usize, Value)> = None;

    for (start, c) in content.char_indices() {
        if c != '{' && c != '[' {
            continue;
        }
        let candidate = &content[start..];
        let Some(end) = find_matching_delimiter(candidate) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&candidate[..=end]) else {
            continue;
        };
        if best.as_ref().map_or(true, |(len, _)| end + 1 >= *len) {
            best = Some((end + 1, value));
        }
    }

    best.map(|(_, value)| value)
}

fn unclosed_delimiters(content: &str) -> usize {
    let Some(start) = content.find(['{', '[']) else {
        return 0;
    };

    let mut depth: isize = 0;
    let mut in_string = false;
    let mut escape_next = false;
    for c in content[start..].chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => depth -= 1,
            _ => {}
        }
    }

    depth.max(0) as usize
}

/// Extracts a SQL statement from an LLM response.
///
/// Accepts a JSON object with a `SQL`/`sql` key, a ```sql fenced block,
/// any fenced block, or bare text starting with a SQL keyword.
pub fn extract_sql_from_response(content: &str) -> Option<String> {
    if let JsonExtractionResult::Success(Value::Object(map)) = try_extract_json_from_response(content)
    {
        if let Some(sql) = ["SQL", "sql", "query"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
        {
            return non_empty(sql);
        }
    }

    let trimmed = content.trim();
    let blocks: Vec<(&str, &str)> = fenced_blocks(trimmed).collect();
    if let Some((_, body)) = blocks
        .iter()
        .find(|(lang, _)| lang.eq_ignore_ascii_case("sql"))
        .or_else(|| blocks.first())
    {
        return non_empty(body);
    }

    let upper = trimmed.to_ascii_uppercase();
    if upper.starts_with("SELECT") || upper.starts_with("WITH") {
        return non_empty(trimmed);
    }

    None
}

fn non_empty(sql: &str) -> Option<String> {
    let sql = sql.trim().trim_end_matches(';').trim();
    (!sql.is_empty()).then(|| sql.to_string())
}
