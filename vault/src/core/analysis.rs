//! Lightweight content analysis attached to classified tasks.

use serde::{Deserialize, Serialize};

/// Rough work category, chosen by the first keyword group that hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "bug/fix")]
    BugFix,
    #[serde(rename = "feature")]
    Feature,
    #[serde(rename = "documentation")]
    Documentation,
    #[serde(rename = "research")]
    Research,
    #[serde(rename = "urgent")]
    Urgent,
    #[serde(rename = "general")]
    General,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::BugFix => "bug/fix",
            Category::Feature => "feature",
            Category::Documentation => "documentation",
            Category::Research => "research",
            Category::Urgent => "urgent",
            Category::General => "general",
        }
    }
}

const CATEGORY_KEYWORDS: &[(Category, &[&str])] = &[
    (
        Category::BugFix,
        &["bug", "fix", "error", "issue", "broken", "crash"],
    ),
    (
        Category::Feature,
        &["feature", "add", "implement", "create", "build", "new"],
    ),
    (
        Category::Documentation,
        &["doc", "readme", "write up", "summary", "notes"],
    ),
    (
        Category::Research,
        &["research", "investigate", "explore", "analyze", "study"],
    ),
    (
        Category::Urgent,
        &["urgent", "asap", "critical", "immediately", "deadline"],
    ),
];

pub const KEY_PHRASE_LIMIT: usize = 5;

/// Counts and highlights for a task body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub word_count: usize,
    pub line_count: usize,
    /// Characters after trimming surrounding whitespace.
    pub char_count: usize,
    pub key_phrases: Vec<String>,
    pub category: Category,
}

pub fn analyze(content: &str) -> Analysis {
    Analysis {
        word_count: content.split_whitespace().count(),
        line_count: content.lines().count(),
        char_count: content.trim().chars().count(),
        key_phrases: non_empty_lines(content)
            .take(KEY_PHRASE_LIMIT)
            .map(str::to_string)
            .collect(),
        category: categorize(content),
    }
}

pub fn categorize(content: &str) -> Category {
    let lower = content.to_lowercase();
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| lower.contains(kw)))
        .map_or(Category::General, |(category, _)| *category)
}

/// Non-empty lines among the first `limit` lines, trimmed.
pub fn leading_lines(content: &str, limit: usize) -> Vec<String> {
    content
        .lines()
        .take(limit)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// First `limit` characters, with `...` appended when anything was cut.
pub fn preview(content: &str, limit: usize) -> String {
    let mut chars = content.char_indices();
    match chars.nth(limit) {
        Some((cut, _)) => format!("{}...", &content[..cut]),
        None => content.to_string(),
    }
}

/// Last `limit` characters of `content`.
pub fn tail(content: &str, limit: usize) -> &str {
    let count = content.chars().count();
    if count <= limit {
        return content;
    }
    match content.char_indices().nth(count - limit) {
        Some((start, _)) => &content[start..],
        None => content,
    }
}

fn non_empty_lines(content: &str) -> impl Iterator<Item = &str> {
    content.lines().map(str::trim).filter(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyze_counts_and_phrases() {
        let content = "\n  Fix login crash  \n\nsteps:\n1\n2\n3\n4\n";
        let analysis = analyze(content);
        assert_eq!(analysis.word_count, 8);
        assert_eq!(analysis.line_count, 8);
        assert_eq!(analysis.char_count, "Fix login crash  \n\nsteps:\n1\n2\n3\n4".len());
        assert_eq!(
            analysis.key_phrases,
            vec!["Fix login crash", "steps:", "1", "2", "3"]
        );
        assert_eq!(analysis.category, Category::BugFix);
    }

    #[test]
    fn category_order_is_significant() {
        // "new" (feature) and "notes" (documentation) both hit; feature is first.
        assert_eq!(categorize("new meeting notes"), Category::Feature);
        assert_eq!(categorize("please study this"), Category::Research);
        assert_eq!(categorize("hello there"), Category::General);
    }

    #[test]
    fn preview_appends_ellipsis_only_when_cut() {
        assert_eq!(preview("abcdef", 3), "abc...");
        assert_eq!(preview("abc", 3), "abc");
        assert_eq!(preview("héllo", 2), "hé...");
    }

    #[test]
    fn tail_is_char_aware() {
        assert_eq!(tail("abcdef", 2), "ef");
        assert_eq!(tail("ab", 5), "ab");
        assert_eq!(tail("naïve", 3), "ïve");
    }

    #[test]
    fn leading_lines_skips_blanks_within_window() {
        let content = "one\n\ntwo\n\n\n\nseven";
        assert_eq!(leading_lines(content, 6), vec!["one", "two"]);
    }
}
