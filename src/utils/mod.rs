//! Common utilities and helper functions

pub mod retry;

use regex::Regex;
use std::sync::OnceLock;
use url::Url;

pub use retry::{RetryPolicies, RetryPolicy};

/// Normalize whitespace in text
pub fn normalize_whitespace(text: &str) -> String {
    static WHITESPACE_RE: OnceLock<Regex> = OnceLock::new();

    let re = WHITESPACE_RE.get_or_init(|| Regex::new(r"[ \t\u{a0}]+").expect("Invalid regex pattern"));

    re.replace_all(text.trim(), " ").to_string()
}

/// Collapse runs of blank lines to a single empty line
pub fn collapse_blank_lines(text: &str) -> String {
    static BLANK_LINES_RE: OnceLock<Regex> = OnceLock::new();

    let re = BLANK_LINES_RE.get_or_init(|| Regex::new(r"\n\s*\n+").expect("Invalid regex pattern"));

    re.replace_all(text.trim(), "\n\n").to_string()
}

/// Truncate text to at most `max_chars` characters, ending with an ellipsis
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", kept.trim_end())
}

/// Escape characters that legacy Telegram Markdown treats as markup
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Check that `url` is an absolute http(s) URL
pub fn is_http_url(url: &str) -> bool {
    Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}
