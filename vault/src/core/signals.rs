//! Keyword evidence for domain classification.
//!
//! Two independent category tables (business and personal) are matched by
//! lowercase substring search. Monetary and urgency signals are derived from
//! the same text but do not influence the domain.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::types::Domain;

pub type KeywordTable = &'static [(&'static str, &'static [&'static str])];

pub const BUSINESS_CATEGORIES: KeywordTable = &[
    (
        "finance",
        &[
            "invoice",
            "payment",
            "bank",
            "transfer",
            "balance",
            "odoo",
            "budget",
            "revenue",
            "profit",
            "expense",
            "refund",
            "receipt",
            "purchase order",
            "po #",
            "statement of work",
            "sow",
        ],
    ),
    (
        "operations",
        &[
            "client",
            "vendor",
            "supplier",
            "contract",
            "project",
            "deadline",
            "milestone",
            "deliverable",
            "scope",
        ],
    ),
    (
        "hr",
        &[
            "employee",
            "salary",
            "payroll",
            "leave request",
            "onboard",
            "offboard",
            "performance review",
        ],
    ),
    (
        "sales_crm",
        &[
            "lead",
            "prospect",
            "deal",
            "proposal",
            "quote",
            "crm",
            "b2b",
            "pipeline",
            "opportunity",
        ],
    ),
    (
        "communication",
        &[
            "board meeting",
            "standup",
            "sprint",
            "retrospective",
            "stakeholder",
            "investor",
        ],
    ),
];

pub const PERSONAL_CATEGORIES: KeywordTable = &[
    (
        "family",
        &[
            "family",
            "kids",
            "school",
            "spouse",
            "parent",
            "children",
            "birthday",
            "wedding",
            "anniversary",
            "baby",
        ],
    ),
    (
        "health",
        &[
            "doctor",
            "appointment",
            "health",
            "medicine",
            "hospital",
            "clinic",
            "prescription",
            "therapy",
        ],
    ),
    (
        "lifestyle",
        &[
            "vacation",
            "holiday",
            "grocery",
            "home repair",
            "hobby",
            "personal",
            "friends",
            "dinner",
            "party",
        ],
    ),
    (
        "personal_finance",
        &[
            "personal loan",
            "rent",
            "utilities",
            "electricity",
            "gas bill",
            "subscription",
        ],
    ),
];

pub const URGENT_KEYWORDS: &[&str] = &[
    "urgent",
    "asap",
    "immediately",
    "deadline",
    "critical",
    "emergency",
];

/// Words that make an email a ledger-verification candidate.
pub const INVOICE_CONTRACT_WORDS: &[&str] = &[
    "invoice",
    "contract",
    "purchase order",
    "po #",
    "statement of work",
    "sow",
    "agreement",
];

/// Metadata fields appended to the content before matching.
pub const HINT_FIELDS: &[&str] = &[
    "subject",
    "sender",
    "title",
    "body_preview",
    "notification_text",
];

pub const DEFAULT_SOURCE: &str = "inbox";

static MONETARY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\$|£|€|USD|GBP|PKR|rs\.|₹|\d[\d,]*\s*(?:dollars?|pounds?|euros?|rupees?))",
    )
    .expect("monetary pattern should compile")
});

/// Matched categories mapped to the keywords that hit, in table order.
pub type CategoryHits = BTreeMap<&'static str, Vec<&'static str>>;

/// Evidence recomputed for every classification. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signals {
    pub business: CategoryHits,
    pub personal: CategoryHits,
    pub monetary: bool,
    pub urgent: bool,
    pub source: String,
}

impl Signals {
    /// Gather evidence from `text` for a task received via `source`.
    pub fn detect(text: &str, source: &str) -> Self {
        let lower = text.to_lowercase();
        Self {
            business: match_categories(&lower, BUSINESS_CATEGORIES),
            personal: match_categories(&lower, PERSONAL_CATEGORIES),
            monetary: is_monetary(text),
            urgent: URGENT_KEYWORDS.iter().any(|kw| lower.contains(kw)),
            source: source.trim().to_lowercase(),
        }
    }

    pub fn domain(&self) -> Domain {
        classify_domain(!self.business.is_empty(), !self.personal.is_empty())
    }

    pub fn business_category(&self, category: &str) -> &[&'static str] {
        self.business.get(category).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every matched keyword, business first, in table order.
    pub fn keywords(&self) -> Vec<&'static str> {
        ordered_hits(&self.business, BUSINESS_CATEGORIES)
            .chain(ordered_hits(&self.personal, PERSONAL_CATEGORIES))
            .collect()
    }
}

/// Domain from table hits: both, else whichever hit, else personal.
pub fn classify_domain(business_hit: bool, personal_hit: bool) -> Domain {
    match (business_hit, personal_hit) {
        (true, true) => Domain::Both,
        (true, false) => Domain::Business,
        _ => Domain::Personal,
    }
}

pub fn is_monetary(text: &str) -> bool {
    MONETARY_PATTERN.is_match(text)
}

fn match_categories(lower: &str, table: KeywordTable) -> CategoryHits {
    let mut matched = CategoryHits::new();
    for (category, keywords) in table {
        let hits: Vec<&'static str> = keywords
            .iter()
            .copied()
            .filter(|kw| lower.contains(kw))
            .collect();
        if !hits.is_empty() {
            matched.insert(*category, hits);
        }
    }
    matched
}

fn ordered_hits<'a>(
    hits: &'a CategoryHits,
    table: KeywordTable,
) -> impl Iterator<Item = &'static str> + 'a {
    table
        .iter()
        .filter_map(move |(category, _)| hits.get(category))
        .flat_map(|keywords| keywords.iter().copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_and_personal_hits_make_both() {
        let signals = Signals::detect("Invoice for the birthday cake", "inbox");
        assert_eq!(signals.business_category("finance"), ["invoice"]);
        assert_eq!(signals.personal.get("family"), Some(&vec!["birthday"]));
        assert_eq!(signals.domain(), Domain::Both);
    }

    #[test]
    fn no_hits_default_to_personal() {
        let signals = Signals::detect("Water the plants", "inbox");
        assert!(signals.business.is_empty());
        assert!(signals.personal.is_empty());
        assert_eq!(signals.domain(), Domain::Personal);
    }

    #[test]
    fn business_only() {
        let signals = Signals::detect("Send the proposal to the vendor", "email");
        assert_eq!(signals.domain(), Domain::Business);
        assert_eq!(signals.keywords(), vec!["vendor", "proposal"]);
    }

    #[test]
    fn monetary_detector_accepts_symbols_codes_and_words() {
        assert!(is_monetary("Pay $40 now"));
        assert!(is_monetary("total: 1,200 rupees"));
        assert!(is_monetary("amount in gbp"));
        assert!(is_monetary("Rs. 500"));
        assert!(is_monetary("€9"));
        assert!(!is_monetary("meet at 5 pm"));
    }

    #[test]
    fn urgency_is_case_insensitive() {
        assert!(Signals::detect("Reply ASAP", "inbox").urgent);
        assert!(!Signals::detect("Reply whenever", "inbox").urgent);
    }

    #[test]
    fn source_is_normalized() {
        let signals = Signals::detect("hi", " WhatsApp ");
        assert_eq!(signals.source, "whatsapp");
    }
}
