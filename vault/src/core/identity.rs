//! Stable identifiers derived from content.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

const TASK_ID_LEN: usize = 8;

static NON_SLUG_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\-]").expect("slug pattern should compile"));

/// Loop identity for a goal prompt: a short SHA-256 prefix of the trimmed text.
pub fn prompt_task_id(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.trim().as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(TASK_ID_LEN);
    id
}

/// File-name-safe slug: non-word characters become `_`, capped at `max_chars`.
pub fn slug(name: &str, max_chars: usize) -> String {
    NON_SLUG_CHARS
        .replace_all(name, "_")
        .chars()
        .take(max_chars)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_id_ignores_surrounding_whitespace() {
        let a = prompt_task_id("Process all items");
        let b = prompt_task_id("  Process all items\n");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, prompt_task_id("Process all items twice"));
    }

    #[test]
    fn slug_replaces_and_truncates() {
        assert_eq!(slug("EMAIL_re: invoice.md", 60), "EMAIL_re__invoice_md");
        assert_eq!(slug(&"a".repeat(80), 60).len(), 60);
        assert_eq!(slug("keep-dashes_ok", 60), "keep-dashes_ok");
    }
}
