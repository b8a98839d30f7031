//! Classification stage: eligible tasks → plans + processing metadata.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};

use crate::core::analysis::analyze;
use crate::core::rules::classify;
use crate::core::types::{Domain, Priority, Route, TaskStatus};
use crate::escalation::{RequeueOutcome, RequeueRequest, cooldown_from_hours, requeue};
use crate::io::audit::{AuditEntry, actors, failure, status_transition};
use crate::io::plans::{PlanInput, write_plans};
use crate::pipeline::Pipeline;
use crate::retry::{Sleeper, retry};

/// Classification result for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteReport {
    pub task: String,
    pub domain: Domain,
    pub rule: &'static str,
    pub priority: Priority,
    pub sensitive: bool,
    pub route: Route,
    /// Vault-relative plan paths.
    pub plans: Vec<String>,
}

/// What happened to one eligible task during [`route_eligible`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteResult {
    Routed(RouteReport),
    Escalated {
        task: String,
        error: String,
        outcome: RequeueOutcome,
    },
    Failed {
        task: String,
        error: String,
    },
}

/// Classify one task, write its plan(s), and move it to `processing`.
#[instrument(skip_all, fields(task = %name))]
pub fn route_task(pipeline: &Pipeline, name: &str, now: DateTime<Utc>) -> Result<RouteReport> {
    let record = pipeline.store.require(name)?;
    let content = pipeline.store.read_content(&record)?;
    let hints = record.meta.hint_text();
    let text = if hints.is_empty() {
        content.clone()
    } else {
        format!("{content}\n{hints}")
    };
    let source = record.meta.source().to_string();
    let classification = classify(&text, &source);
    let analysis = analyze(&content);

    let written = write_plans(
        &pipeline.paths,
        &pipeline.templates,
        &PlanInput {
            task_name: name,
            content: &content,
            source: &source,
            classification: &classification,
            analysis: &analysis,
        },
        now,
    )?;
    let plans: Vec<String> = written
        .iter()
        .map(|path| pipeline.paths.relative(path).display().to_string())
        .collect();

    let decision = &classification.decision;
    let previous = record.meta.status;
    pipeline.store.begin_processing(name, now, |meta| {
        meta.set("analyzed_at", now.to_rfc3339());
        meta.set("domain", decision.domain.as_str());
        meta.set("domain_signals", json!(classification.signals.keywords()));
        meta.set("cross_domain_rule", decision.rule);
        meta.set("cross_domain_rule_description", decision.description);
        meta.set("priority", decision.priority.as_str());
        meta.set("sensitive", decision.sensitive);
        meta.set("plans", json!(plans));
        meta.set("route", decision.route.as_str());
        meta.set("category", analysis.category.as_str());
        meta.set("analysis", json!(analysis));
    })?;

    for plan in &plans {
        pipeline.audit.record(
            AuditEntry::new("plan_created", actors::TASK_ROUTER, plan.as_str())
                .at(now)
                .param("task", name)
                .param("rule", decision.rule)
                .param("domain", decision.domain.as_str()),
        );
    }
    pipeline.audit.record(
        status_transition(
            actors::TASK_ROUTER,
            name,
            previous.as_str(),
            TaskStatus::Processing.as_str(),
        )
        .at(now)
        .param("route", decision.route.as_str()),
    );
    info!(
        rule = decision.rule,
        domain = %decision.domain,
        priority = %decision.priority,
        sensitive = decision.sensitive,
        "task routed"
    );

    Ok(RouteReport {
        task: name.to_string(),
        domain: decision.domain,
        rule: decision.rule,
        priority: decision.priority,
        sensitive: decision.sensitive,
        route: decision.route,
        plans,
    })
}

/// Route every task eligible at `now`.
///
/// Each task is classified under the retry policy. A task whose retries are
/// exhausted is handed to Tier-1 requeue with its stored retry count; past
/// the ceiling, requeue abandons it.
pub fn route_eligible<S: Sleeper + ?Sized>(
    pipeline: &Pipeline,
    sleeper: &S,
    now: DateTime<Utc>,
) -> Result<Vec<RouteResult>> {
    let policy = pipeline.config.retry.policy();
    let mut results = Vec::new();
    for record in pipeline.store.eligible(now)? {
        let name = record.name.clone();
        match retry(&policy, sleeper, |_| route_task(pipeline, &name, now)) {
            Ok(report) => results.push(RouteResult::Routed(report)),
            Err(err) => {
                let error = format!("{err:#}");
                warn!(task = %name, err = %error, "routing failed after retries");
                pipeline
                    .audit
                    .record(failure(actors::TASK_ROUTER, &name, "error", &error).at(now));
                results.push(escalate(pipeline, &name, record.meta.retry_count, error, now));
            }
        }
    }
    Ok(results)
}

fn escalate(
    pipeline: &Pipeline,
    name: &str,
    retry_count: u32,
    error: String,
    now: DateTime<Utc>,
) -> RouteResult {
    let mut extra = Map::new();
    extra.insert("failed_stage".to_string(), Value::from("route"));
    let request = RequeueRequest {
        task: name,
        error: &error,
        retry_count,
        max_retries: pipeline.config.requeue.max_retries,
        cooldown: cooldown_from_hours(pipeline.config.requeue.cooldown_hours),
        extra,
    };
    match requeue(pipeline, &request, now) {
        Ok(outcome) => RouteResult::Escalated {
            task: name.to_string(),
            error,
            outcome,
        },
        Err(escalation_err) => {
            let message = format!("{error}; escalation failed: {escalation_err:#}");
            pipeline.audit.record(
                failure(actors::ERROR_RECOVERY, name, "escalation_failed", &message).at(now),
            );
            RouteResult::Failed {
                task: name.to_string(),
                error: message,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lifecycle::Location;
    use crate::io::task_store::TaskMeta;
    use crate::test_support::{RecordingSleeper, TestVault, pending_meta};
    use chrono::TimeDelta;
    use std::fs;

    #[test]
    fn route_task_annotates_metadata_in_place() {
        let vault = TestVault::new().expect("vault");
        vault
            .add_task(
                "mail.md",
                "URGENT: invoice #88 due, $1,200 outstanding",
                pending_meta("mail.md").with("source", "email"),
            )
            .expect("task");
        let now = Utc::now();

        let report = route_task(&vault.pipeline, "mail.md", now).expect("route");
        assert_eq!(report.rule, "CD-4");
        assert_eq!(report.domain, Domain::Business);
        assert_eq!(report.plans, vec!["plans/Plan_mail_md.md"]);

        let record = vault.pipeline.store.require("mail.md").expect("task");
        assert_eq!(record.location, Location::Active);
        assert_eq!(record.meta.status, TaskStatus::Processing);
        assert_eq!(record.meta.str_field("cross_domain_rule"), Some("CD-4"));
        assert!(
            record
                .meta
                .str_field("cross_domain_rule_description")
                .is_some_and(|text| text.starts_with("Email invoice or contract"))
        );
        assert_eq!(record.meta.str_field("route"), Some("human-approval-workflow"));
        assert_eq!(record.meta.fields["sensitive"], true);
        assert_eq!(record.meta.str_field("category"), Some("urgent"));
        assert!(vault.pipeline.paths.root.join("plans/Plan_mail_md.md").is_file());

        let actions: Vec<_> = vault
            .pipeline
            .audit
            .for_date(now.date_naive())
            .expect("audit")
            .into_iter()
            .map(|entry| entry.action_type)
            .collect();
        assert_eq!(actions, vec!["plan_created", "status_transition"]);
    }

    /// Subject lines from collector metadata count as classification evidence.
    #[test]
    fn metadata_hints_feed_classification() {
        let vault = TestVault::new().expect("vault");
        vault
            .add_task(
                "note.md",
                "see attached",
                pending_meta("note.md").with("subject", "Birthday party for the kids"),
            )
            .expect("task");
        let report = route_task(&vault.pipeline, "note.md", Utc::now()).expect("route");
        assert_eq!(report.domain, Domain::Personal);
    }

    #[test]
    fn dual_domain_task_gets_two_plans() {
        let vault = TestVault::new().expect("vault");
        vault
            .add_task(
                "mixed.md",
                "Client proposal review, then dinner with family",
                pending_meta("mixed.md"),
            )
            .expect("task");
        let report = route_task(&vault.pipeline, "mixed.md", Utc::now()).expect("route");
        assert_eq!(report.route, Route::Split);
        assert_eq!(report.plans.len(), 2);
    }

    #[test]
    fn route_eligible_skips_cooling_down_tasks() {
        let vault = TestVault::new().expect("vault");
        let now = Utc::now();
        vault
            .add_task("a.md", "hello", pending_meta("a.md"))
            .expect("task");
        let mut cooling = TaskMeta::new("RETRY_b.md", TaskStatus::RetryQueued);
        cooling.retry_after = Some(now + TimeDelta::hours(1));
        vault.add_task("RETRY_b.md", "later", cooling).expect("task");

        let results =
            route_eligible(&vault.pipeline, &RecordingSleeper::default(), now).expect("route");
        assert_eq!(results.len(), 1);
        assert!(matches!(&results[0], RouteResult::Routed(report) if report.task == "a.md"));
        assert_eq!(
            vault.pipeline.store.require("RETRY_b.md").expect("task").meta.status,
            TaskStatus::RetryQueued
        );
    }

    /// A task whose content has vanished exhausts its retries and is requeued
    /// with a stub body.
    #[test]
    fn exhausted_routing_failure_is_requeued() {
        let mut vault = TestVault::new().expect("vault");
        vault.pipeline.config.retry.max_retries = 2;
        vault
            .add_task("broken.md", "body", pending_meta("broken.md"))
            .expect("task");
        fs::remove_file(vault.pipeline.paths.needs_action_dir.join("broken.md"))
            .expect("remove content");

        let sleeper = RecordingSleeper::default();
        let results = route_eligible(&vault.pipeline, &sleeper, Utc::now()).expect("route");
        assert_eq!(sleeper.slept().len(), 2);
        let [RouteResult::Escalated { outcome, .. }] = results.as_slice() else {
            panic!("expected one escalation, got {results:?}");
        };
        let RequeueOutcome::Queued { name, retry_count, .. } = outcome else {
            panic!("expected a queued copy");
        };
        assert_eq!(*retry_count, 1);
        let copy = vault.pipeline.store.require(name).expect("copy");
        assert_eq!(copy.meta.str_field("failed_stage"), Some("route"));
        assert_eq!(copy.meta.str_field("original_task"), Some("broken.md"));
        assert!(vault.pipeline.store.get("broken.md").expect("lookup").is_none());
    }
}
