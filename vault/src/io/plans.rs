//! Plan documents handed to downstream executors.

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::atomic::write_atomic;
use super::paths::VaultPaths;
use super::templates::{PLAN, TemplateEngine};
use crate::core::analysis::{Analysis, leading_lines, preview};
use crate::core::identity::slug;
use crate::core::rules::{Classification, CrossCheck, Decision};
use crate::core::types::Domain;

pub const SLUG_LIMIT: usize = 60;
pub const KEY_LINE_LIMIT: usize = 6;
pub const PREVIEW_LIMIT: usize = 1200;

/// Everything a plan is rendered from.
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    pub task_name: &'a str,
    pub content: &'a str,
    pub source: &'a str,
    pub classification: &'a Classification,
    pub analysis: &'a Analysis,
}

#[derive(Serialize)]
struct PlanContext<'a> {
    title: String,
    source: &'a str,
    domain: Domain,
    keywords: String,
    decision: &'a Decision,
    sensitive_label: &'static str,
    analysis: &'a Analysis,
    generated_at: String,
    ledger_check: bool,
    balance_check: bool,
    contact_lookup: bool,
    split: bool,
    monetary: bool,
    key_lines: Vec<String>,
    preview: String,
}

/// Render one plan. `label` marks a per-domain half of a split task.
pub fn render_plan(
    engine: &TemplateEngine,
    input: &PlanInput<'_>,
    domain: Domain,
    label: Option<&str>,
    generated_at: DateTime<Utc>,
) -> Result<String> {
    let decision = &input.classification.decision;
    let keywords = input.classification.signals.keywords();
    let ctx = PlanContext {
        title: match label {
            Some(label) => format!("{label} {}", input.task_name),
            None => input.task_name.to_string(),
        },
        source: input.source,
        domain,
        keywords: if keywords.is_empty() {
            "none".to_string()
        } else {
            keywords.join(", ")
        },
        decision,
        sensitive_label: if decision.sensitive { "Yes" } else { "No" },
        analysis: input.analysis,
        generated_at: generated_at.to_rfc3339(),
        ledger_check: decision.requires(CrossCheck::LedgerVerification),
        balance_check: decision.requires(CrossCheck::BalanceVerification),
        contact_lookup: decision.requires(CrossCheck::ContactLookup),
        split: decision.requires(CrossCheck::SplitPlans),
        monetary: input.classification.signals.monetary,
        key_lines: leading_lines(input.content, KEY_LINE_LIMIT),
        preview: preview(input.content, PREVIEW_LIMIT),
    };
    engine.render(PLAN, ctx)
}

/// Write the plan (or the personal and business pair for split tasks) into
/// `plans/`. Returns the written paths.
pub fn write_plans(
    paths: &VaultPaths,
    engine: &TemplateEngine,
    input: &PlanInput<'_>,
    now: DateTime<Utc>,
) -> Result<Vec<PathBuf>> {
    let base = slug(input.task_name, SLUG_LIMIT);
    let decision = &input.classification.decision;
    let variants: Vec<(String, Domain, Option<&str>)> =
        if decision.requires(CrossCheck::SplitPlans) {
            vec![
                (format!("Plan_PERSONAL_{base}.md"), Domain::Personal, Some("PERSONAL")),
                (format!("Plan_BUSINESS_{base}.md"), Domain::Business, Some("BUSINESS")),
            ]
        } else {
            vec![(format!("Plan_{base}.md"), decision.domain, None)]
        };

    let mut written = Vec::with_capacity(variants.len());
    for (file_name, domain, label) in variants {
        let body = render_plan(engine, input, domain, label, now)?;
        let path = paths.plans_dir.join(file_name);
        write_atomic(&path, body.as_bytes())?;
        debug!(plan = %path.display(), "plan written");
        written.push(path);
    }
    Ok(written)
}
