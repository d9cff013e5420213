//! Input sanitization pre-filter for strings entering the core from HTTP.

const MAX_TEXT_LEN: usize = 500;
const MAX_PSEUDONYM_LEN: usize = 20;
const MIN_PSEUDONYM_LEN: usize = 3;

const ALLOWED_CATEGORIES: &[&str] = &[
    "academic",
    "social",
    "events",
    "policies",
    "technology",
    "health",
    "other",
];

/// Strips control characters and HTML-escapes the rest, then truncates to
/// `max_len`.
pub fn sanitize_string(input: &str, max_len: usize) -> String {
    let cleaned: String = input.chars().filter(|c| !c.is_control() || *c == '\n').collect();
    let escaped = html_escape(&cleaned);
    escaped.chars().take(max_len).collect()
}

fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}

pub fn sanitize_text(input: &str) -> String {
    sanitize_string(input, MAX_TEXT_LEN)
}

/// Accepts only `[a-zA-Z0-9_-]` between 3 and 20 characters.
pub fn sanitize_pseudonym(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.len() < MIN_PSEUDONYM_LEN || trimmed.len() > MAX_PSEUDONYM_LEN {
        return None;
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    Some(trimmed.to_string())
}

/// Maps an arbitrary category string onto the fixed allow-list, defaulting
/// to `"other"`.
pub fn sanitize_category(input: &str) -> String {
    let lower = input.trim().to_lowercase();
    if ALLOWED_CATEGORIES.contains(&lower.as_str()) {
        lower
    } else {
        "other".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudonym_rejects_too_short_and_too_long() {
        assert!(sanitize_pseudonym("ab").is_none());
        assert!(sanitize_pseudonym(&"a".repeat(21)).is_none());
    }

    #[test]
    fn pseudonym_rejects_special_characters() {
        assert!(sanitize_pseudonym("bad name!").is_none());
        assert_eq!(sanitize_pseudonym("good_name-1").as_deref(), Some("good_name-1"));
    }

    #[test]
    fn category_falls_back_to_other() {
        assert_eq!(sanitize_category("Academic"), "academic");
        assert_eq!(sanitize_category("nonsense"), "other");
    }

    #[test]
    fn text_is_html_escaped_and_truncated() {
        let result = sanitize_text("<script>alert(1)</script>");
        assert!(!result.contains('<'));
        assert!(result.contains("&lt;script&gt;"));
    }
}
