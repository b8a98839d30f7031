//! Ordered cross-domain rule table.
//!
//! Rules are evaluated top to bottom and the first match fully determines the
//! routing decision. Order is part of the policy: the email invoice rule must
//! win over the generic urgency rule, and the dual-domain split shadows the
//! urgency rule for `both` tasks.

use serde::{Deserialize, Serialize};

use super::signals::{INVOICE_CONTRACT_WORDS, Signals};
use super::types::{Domain, Priority, Route};

/// Rule id recorded when no rule matched.
pub const NO_RULE: &str = "none";

/// Verification a downstream executor must perform before acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossCheck {
    /// Look up the matching open invoice in the accounting ledger.
    LedgerVerification,
    /// Confirm the bank balance covers the requested amount.
    BalanceVerification,
    /// Search prior correspondence with the sender.
    ContactLookup,
    /// Emit independent personal and business plans.
    SplitPlans,
}

/// What a matching rule decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleOutcome {
    pub sensitive: bool,
    pub priority: Priority,
    pub route: Route,
    pub domain_override: Option<Domain>,
    pub checks: &'static [CrossCheck],
}

/// An identified `(predicate, outcome)` pair.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    /// Stable id (`CD-1`..) persisted as `cross_domain_rule`.
    pub id: &'static str,
    pub description: &'static str,
    pub applies: fn(&Signals, Domain) -> bool,
    pub outcome: RuleOutcome,
}

/// Routing decision persisted into task metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub rule: &'static str,
    pub description: &'static str,
    pub domain: Domain,
    pub sensitive: bool,
    pub priority: Priority,
    pub route: Route,
    pub checks: &'static [CrossCheck],
}

impl Decision {
    pub fn requires(&self, check: CrossCheck) -> bool {
        self.checks.contains(&check)
    }
}

pub const RULES: &[Rule] = &[
    Rule {
        id: "CD-1",
        description: "WhatsApp payment request: ledger invoice check and bank balance check required",
        applies: whatsapp_payment_request,
        outcome: RuleOutcome {
            sensitive: true,
            priority: Priority::High,
            route: Route::HumanApproval,
            domain_override: Some(Domain::Business),
            checks: &[CrossCheck::LedgerVerification, CrossCheck::BalanceVerification],
        },
    },
    Rule {
        id: "CD-2",
        description: "WhatsApp personal message mentioning money: human approval required",
        applies: whatsapp_personal_money,
        outcome: RuleOutcome {
            sensitive: true,
            priority: Priority::Normal,
            route: Route::HumanApproval,
            domain_override: Some(Domain::Both),
            checks: &[],
        },
    },
    Rule {
        id: "CD-3",
        description: "LinkedIn contact: check whether the sender is a known business contact",
        applies: linkedin_contact,
        outcome: RuleOutcome {
            sensitive: false,
            priority: Priority::Normal,
            route: Route::PlanCreation,
            domain_override: None,
            checks: &[CrossCheck::ContactLookup],
        },
    },
    Rule {
        id: "CD-4",
        description: "Email invoice or contract: ledger cross-check required before any action",
        applies: email_invoice_contract,
        outcome: RuleOutcome {
            sensitive: true,
            priority: Priority::Normal,
            route: Route::HumanApproval,
            domain_override: Some(Domain::Business),
            checks: &[CrossCheck::LedgerVerification],
        },
    },
    Rule {
        id: "CD-5",
        description: "Dual domain: split into independent personal and business plans",
        applies: dual_domain,
        outcome: RuleOutcome {
            sensitive: false,
            priority: Priority::Normal,
            route: Route::Split,
            domain_override: None,
            checks: &[CrossCheck::SplitPlans],
        },
    },
    Rule {
        id: "CD-6",
        description: "Urgent business task: immediate escalation to human approval",
        applies: urgent_business,
        outcome: RuleOutcome {
            sensitive: true,
            priority: Priority::High,
            route: Route::HumanApproval,
            domain_override: None,
            checks: &[],
        },
    },
];

fn whatsapp_payment_request(signals: &Signals, _domain: Domain) -> bool {
    signals.source == "whatsapp"
        && signals.monetary
        && !signals.business_category("finance").is_empty()
}

fn whatsapp_personal_money(signals: &Signals, _domain: Domain) -> bool {
    signals.source == "whatsapp" && signals.monetary && !signals.personal.is_empty()
}

fn linkedin_contact(signals: &Signals, _domain: Domain) -> bool {
    signals.source == "linkedin"
}

fn email_invoice_contract(signals: &Signals, _domain: Domain) -> bool {
    signals.source == "email"
        && signals
            .business_category("finance")
            .iter()
            .chain(signals.business_category("operations"))
            .any(|hit| INVOICE_CONTRACT_WORDS.contains(hit))
}

fn dual_domain(_signals: &Signals, domain: Domain) -> bool {
    domain == Domain::Both
}

fn urgent_business(signals: &Signals, domain: Domain) -> bool {
    signals.urgent && matches!(domain, Domain::Both | Domain::Business)
}

/// Evaluate the built-in rule table.
pub fn evaluate(signals: &Signals, domain: Domain) -> Decision {
    evaluate_with(RULES, signals, domain)
}

/// Evaluate `rules` in order; the first match wins.
pub fn evaluate_with(rules: &[Rule], signals: &Signals, domain: Domain) -> Decision {
    for rule in rules {
        if (rule.applies)(signals, domain) {
            let outcome = rule.outcome;
            return Decision {
                rule: rule.id,
                description: rule.description,
                domain: outcome.domain_override.unwrap_or(domain),
                sensitive: outcome.sensitive,
                priority: outcome.priority,
                route: outcome.route,
                checks: outcome.checks,
            };
        }
    }
    default_decision(signals, domain)
}

fn default_decision(signals: &Signals, domain: Domain) -> Decision {
    let sensitive = domain == Domain::Business && signals.monetary;
    Decision {
        rule: NO_RULE,
        description: "Default routing: no cross-domain rule matched",
        domain,
        sensitive,
        priority: if signals.urgent {
            Priority::High
        } else {
            Priority::Normal
        },
        route: if sensitive {
            Route::HumanApproval
        } else {
            Route::PlanCreation
        },
        checks: &[],
    }
}

/// Full classification of one task's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub signals: Signals,
    /// Domain detected from keyword evidence, before any rule override.
    pub detected_domain: Domain,
    pub decision: Decision,
}

pub fn classify(text: &str, source: &str) -> Classification {
    let signals = Signals::detect(text, source);
    let detected_domain = signals.domain();
    let decision = evaluate(&signals, detected_domain);
    Classification {
        signals,
        detected_domain,
        decision,
    }
}
