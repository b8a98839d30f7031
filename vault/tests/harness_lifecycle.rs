//! End-to-end harness for the task pipeline.
//!
//! Drives collect → route → complete through the public API and checks the
//! task locations, sidecars, and audit trail left behind, then pushes a task
//! through Tier-1 escalation until it is abandoned.

use std::fs;

use chrono::{TimeDelta, Utc};

use vault::complete::complete_task;
use vault::core::lifecycle::Location;
use vault::core::types::{Domain, Priority, Route, TaskStatus};
use vault::cycle::run_inbox_cycle;
use vault::escalation::{
    DegradeRequest, RequeueOutcome, RequeueRequest, cooldown_from_hours, graceful_degrade, requeue,
};
use vault::io::audit::actors;
use vault::io::ledger::DeferredStatus;
use vault::route::{RouteResult, route_eligible};
use vault::test_support::{RecordingSleeper, TestVault};

/// Inbox file → processing task with a plan → done, with every step audited.
#[test]
fn inbox_file_is_routed_and_completed() {
    let vault = TestVault::new().expect("vault");
    let pipeline = &vault.pipeline;
    fs::write(
        pipeline.paths.inbox_dir.join("client.md"),
        "Client wants the project milestone moved; send a revised proposal",
    )
    .expect("inbox file");
    let now = Utc::now();

    let report = run_inbox_cycle(pipeline, &RecordingSleeper::default(), now).expect("cycle");
    assert_eq!(report.collected.created, vec!["client.md"]);
    let [RouteResult::Routed(routed)] = report.routed.as_slice() else {
        panic!("expected one routed task, got {:?}", report.routed);
    };
    assert_eq!(routed.domain, Domain::Business);
    assert_eq!(routed.route, Route::PlanCreation);
    assert_eq!(routed.priority, Priority::Normal);

    let plan = fs::read_to_string(vault.root().join(&routed.plans[0])).expect("plan");
    assert!(plan.contains("client.md"));

    let done = complete_task(pipeline, "client.md", now).expect("complete");
    assert_eq!(done.location, Location::Done);
    assert!(pipeline.paths.done_dir.join("client.md.meta.json").is_file());
    assert!(pipeline.store.verify().expect("verify").is_empty());

    let actions: Vec<String> = pipeline
        .audit
        .for_date(now.date_naive())
        .expect("audit")
        .into_iter()
        .map(|entry| entry.action_type)
        .collect();
    assert_eq!(
        actions,
        vec![
            "watcher_scan",
            "file_write",
            "watcher_scan",
            "plan_created",
            "status_transition",
            "status_transition",
        ]
    );
}

/// A task that keeps failing is requeued until the ceiling, then abandoned
/// with an alert awaiting approval.
#[test]
fn repeated_failures_end_in_abandonment() {
    let mut vault = TestVault::new().expect("vault");
    vault.pipeline.config.retry.max_retries = 0;
    vault.pipeline.config.requeue.max_retries = 2;
    vault.pipeline.config.requeue.cooldown_hours = 1.0;
    let pipeline = &vault.pipeline;
    let sleeper = RecordingSleeper::default();
    let mut now = Utc::now();

    fs::write(pipeline.paths.inbox_dir.join("flaky.md"), "body").expect("inbox file");
    run_inbox_cycle(pipeline, &sleeper, now - TimeDelta::hours(10)).expect("collect");
    // Re-open as pending and lose the content so every routing attempt fails.
    let record = pipeline.store.require("flaky.md").expect("task");
    let mut meta = record.meta.clone();
    meta.status = TaskStatus::Pending;
    fs::write(&record.meta_path, serde_json::to_vec(&meta).expect("json")).expect("meta");
    fs::remove_file(&record.content_path).expect("remove content");

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let results = route_eligible(pipeline, &sleeper, now).expect("route");
        let [RouteResult::Escalated { outcome, .. }] = results.as_slice() else {
            panic!("expected one escalation, got {results:?}");
        };
        outcomes.push(outcome.clone());
        now += TimeDelta::hours(2);
        if let RequeueOutcome::Queued { name, .. } = outcome {
            // Each copy is stub content; drop it again so routing keeps failing.
            fs::remove_file(pipeline.paths.needs_action_dir.join(name)).expect("remove copy");
        }
    }

    assert!(matches!(&outcomes[0], RequeueOutcome::Queued { retry_count: 1, .. }));
    assert!(matches!(&outcomes[1], RequeueOutcome::Queued { retry_count: 2, .. }));
    let RequeueOutcome::Abandoned { alert, task_moved } = &outcomes[2] else {
        panic!("expected abandonment, got {:?}", outcomes[2]);
    };
    assert!(*task_moved);
    assert!(alert.starts_with(&pipeline.paths.pending_approval_dir));
    assert!(alert.is_file());

    let abandoned = pipeline.store.list(Some(TaskStatus::Abandoned)).expect("list");
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].meta.str_field("original_task"), Some("flaky.md"));
    assert!(pipeline.store.eligible(now).expect("eligible").is_empty());
}

#[test]
fn requeue_respects_cooldown_then_routes() {
    let vault = TestVault::new().expect("vault");
    let pipeline = &vault.pipeline;
    let now = Utc::now();
    fs::write(pipeline.paths.inbox_dir.join("memo.md"), "Family dinner on Friday").expect("inbox");
    run_inbox_cycle(pipeline, &RecordingSleeper::default(), now).expect("cycle");

    let outcome = requeue(
        pipeline,
        &RequeueRequest {
            task: "memo.md",
            error: "downstream unavailable",
            retry_count: 0,
            max_retries: 3,
            cooldown: cooldown_from_hours(1.0),
            extra: Default::default(),
        },
        now,
    )
    .expect("requeue");
    let RequeueOutcome::Queued { name, retry_after, .. } = outcome else {
        panic!("expected a queued copy");
    };
    assert_eq!(retry_after, now + TimeDelta::hours(1));

    let sleeper = RecordingSleeper::default();
    assert!(route_eligible(pipeline, &sleeper, now).expect("route").is_empty());
    let later = route_eligible(pipeline, &sleeper, retry_after).expect("route");
    assert!(matches!(&later[..], [RouteResult::Routed(report)] if report.task == name));
}

#[test]
fn graceful_degradation_pairs_ledger_entry_and_alert() {
    let vault = TestVault::new().expect("vault");
    let pipeline = &vault.pipeline;
    let now = Utc::now();

    let outcome = graceful_degrade(
        pipeline,
        &DegradeRequest {
            action: "post_update",
            error: "token expired",
            payload: serde_json::json!({"text": "hello"}),
            service: Some("social"),
            priority: Priority::Critical,
            actor: actors::TASK_AGENT,
        },
        now,
    )
    .expect("degrade");

    let entries = pipeline.ledger.entries().expect("ledger");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, outcome.entry.id);
    assert_eq!(entries[0].status, DeferredStatus::Deferred);
    assert_eq!(entries[0].payload["text"], "hello");
    let alert = fs::read_to_string(&outcome.alert).expect("alert");
    assert!(alert.contains(&outcome.entry.id));

    let resolved = pipeline
        .ledger
        .resolve(&outcome.entry.id, DeferredStatus::Retried, now)
        .expect("resolve");
    assert_eq!(resolved.status, DeferredStatus::Retried);
}
