//! File-based task vault with retry, escalation, and a persistent agent loop.
//!
//! Tasks arrive in `inbox/`, are classified into plans, and move through
//! `needs_action/`, `done/`, and `abandoned/`. Every state change is recorded
//! in the daily audit log under `Logs/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;

use vault::complete::{complete_all, complete_task};
use vault::core::types::{Priority, TaskStatus};
use vault::cycle::{CycleReport, run_inbox_cycle, watch};
use vault::escalation::{
    DegradeRequest, RequeueOutcome, RequeueRequest, cooldown_from_hours, graceful_degrade, requeue,
};
use vault::exit_codes;
use vault::io::agent::CommandAgent;
use vault::io::audit::{actors, parse_date, render_table};
use vault::io::collector::{InboxCollector, SeenIds, collect_once, seen_path};
use vault::io::ledger::{DeferredStatus, DeferredLedger};
use vault::io::paths::{InitOptions, init_vault};
use vault::logging;
use vault::looping::{LoopRequest, LoopStop, run_loop};
use vault::pipeline::Pipeline;
use vault::retry::ThreadSleeper;
use vault::route::{RouteResult, route_eligible};

#[derive(Parser)]
#[command(
    name = "vault",
    version,
    about = "File-based task vault with retry, escalation, and a persistent agent loop"
)]
struct Cli {
    /// Vault root directory.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the vault layout and a default `vault.toml`.
    Init {
        /// Overwrite an existing `vault.toml`.
        #[arg(short, long)]
        force: bool,
    },
    /// Copy new inbox files into `needs_action/`.
    Collect,
    /// Classify every eligible task and write its plan(s).
    Route,
    /// Move processing tasks to `done/`.
    Complete {
        /// Task names to complete.
        tasks: Vec<String>,
        /// Complete every processing task.
        #[arg(long, conflicts_with = "tasks")]
        all: bool,
    },
    /// Collect then route, once or on a polling interval.
    Cycle {
        /// Keep polling until interrupted.
        #[arg(long)]
        watch: bool,
    },
    /// Re-invoke the agent on a goal until it reports completion.
    Loop {
        /// Goal prompt.
        prompt: Option<String>,
        /// Read the goal prompt from a file.
        #[arg(long, conflicts_with = "prompt")]
        prompt_file: Option<PathBuf>,
        /// Iteration budget for this invocation.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Output token that signals completion.
        #[arg(long)]
        completion_token: Option<String>,
        /// Continue the saved run for this goal.
        #[arg(long)]
        resume: bool,
    },
    /// Queue a failed task for a later retry, or abandon it past the ceiling.
    Requeue {
        task: String,
        /// Error that caused the failure.
        #[arg(long)]
        error: String,
        /// Retries already spent (defaults to the task's recorded count).
        #[arg(long)]
        retry_count: Option<u32>,
    },
    /// Defer a critically failed action for human review.
    Degrade {
        #[arg(long)]
        action: String,
        #[arg(long)]
        error: String,
        /// Original action payload as JSON.
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Failed service, when it differs from the action.
        #[arg(long)]
        service: Option<String>,
        #[arg(long, default_value = "critical", value_parser = parse_priority)]
        priority: Priority,
        #[arg(long, default_value = actors::CLI)]
        actor: String,
    },
    /// Print audit entries as a table.
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    /// Inspect or resolve deferred actions.
    Deferred {
        #[command(subcommand)]
        command: DeferredCommand,
    },
    /// Summarize tasks, pending alerts, and open deferred actions.
    Status,
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Most recent entries across all days.
    Recent {
        #[arg(short, default_value_t = 20)]
        n: usize,
    },
    /// Every entry recorded on one UTC day.
    Date {
        /// Day as YYYY-MM-DD.
        date: String,
    },
}

#[derive(Subcommand)]
enum DeferredCommand {
    /// List every ledger entry.
    List,
    /// Record a human decision on an entry.
    Resolve {
        id: String,
        /// One of retried, resolved, dismissed.
        #[arg(value_parser = parse_deferred_status)]
        status: DeferredStatus,
    },
}

fn parse_priority(raw: &str) -> Result<Priority, String> {
    Priority::parse(raw).ok_or_else(|| format!("unknown priority {raw:?}"))
}

fn parse_deferred_status(raw: &str) -> Result<DeferredStatus, String> {
    DeferredStatus::parse(raw).ok_or_else(|| format!("unknown status {raw:?}"))
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Collect => cmd_collect(root),
        Command::Route => cmd_route(root),
        Command::Complete { tasks, all } => cmd_complete(root, &tasks, all),
        Command::Cycle { watch } => cmd_cycle(root, watch),
        Command::Loop {
            prompt,
            prompt_file,
            max_iterations,
            completion_token,
            resume,
        } => cmd_loop(
            root,
            prompt,
            prompt_file.as_deref(),
            max_iterations,
            completion_token,
            resume,
        ),
        Command::Requeue {
            task,
            error,
            retry_count,
        } => cmd_requeue(root, &task, &error, retry_count),
        Command::Degrade {
            action,
            error,
            payload,
            service,
            priority,
            actor,
        } => cmd_degrade(
            root,
            &action,
            &error,
            &payload,
            service.as_deref(),
            priority,
            &actor,
        ),
        Command::Audit { command } => cmd_audit(root, command),
        Command::Deferred { command } => cmd_deferred(root, command),
        Command::Status => cmd_status(root),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_vault(root, &InitOptions { force })?;
    println!("initialized {}", paths.root.display());
    Ok(exit_codes::OK)
}

fn cmd_collect(root: &Path) -> Result<i32> {
    let pipeline = Pipeline::open(root)?;
    let seen_file = seen_path(&pipeline.paths.seen_dir, InboxCollector::NAME);
    let mut seen = SeenIds::load(&seen_file)?;
    let mut collector = InboxCollector::new(&pipeline.paths.inbox_dir);
    let report = collect_once(
        &mut collector,
        &mut seen,
        &pipeline.store,
        &pipeline.audit,
        Utc::now(),
    );
    seen.save(&seen_file)?;
    let report = report?;
    for name in &report.created {
        println!("collected {name}");
    }
    for (item, error) in &report.failed {
        eprintln!("failed {item}: {error}");
    }
    Ok(exit_codes::OK)
}

fn cmd_route(root: &Path) -> Result<i32> {
    let pipeline = Pipeline::open(root)?;
    let results = route_eligible(&pipeline, &ThreadSleeper, Utc::now())?;
    print_route_results(&results);
    Ok(exit_codes::OK)
}

fn print_route_results(results: &[RouteResult]) {
    for result in results {
        match result {
            RouteResult::Routed(report) => println!(
                "routed {} domain={} rule={} priority={} route={}",
                report.task, report.domain, report.rule, report.priority, report.route
            ),
            RouteResult::Escalated { task, outcome, .. } => match outcome {
                RequeueOutcome::Queued {
                    name, retry_after, ..
                } => println!("requeued {task} as {name} until {}", retry_after.to_rfc3339()),
                RequeueOutcome::Abandoned { alert, .. } => {
                    println!("abandoned {task} (alert {})", alert.display());
                }
            },
            RouteResult::Failed { task, error } => eprintln!("failed {task}: {error}"),
        }
    }
}

fn cmd_complete(root: &Path, tasks: &[String], all: bool) -> Result<i32> {
    let pipeline = Pipeline::open(root)?;
    let now = Utc::now();
    if all {
        for record in complete_all(&pipeline, now)? {
            println!("completed {}", record.name);
        }
        return Ok(exit_codes::OK);
    }
    if tasks.is_empty() {
        return Err(anyhow!("name at least one task, or pass --all"));
    }
    for task in tasks {
        complete_task(&pipeline, task, now)?;
        println!("completed {task}");
    }
    Ok(exit_codes::OK)
}

fn cmd_cycle(root: &Path, watch_mode: bool) -> Result<i32> {
    let pipeline = Pipeline::open(root)?;
    if watch_mode {
        watch(&pipeline, &ThreadSleeper, None, print_cycle);
        return Ok(exit_codes::OK);
    }
    let report = run_inbox_cycle(&pipeline, &ThreadSleeper, Utc::now())?;
    print_cycle(&report);
    Ok(exit_codes::OK)
}

fn print_cycle(report: &CycleReport) {
    for name in &report.collected.created {
        println!("collected {name}");
    }
    for (item, error) in &report.collected.failed {
        eprintln!("failed {item}: {error}");
    }
    print_route_results(&report.routed);
}

fn cmd_loop(
    root: &Path,
    prompt: Option<String>,
    prompt_file: Option<&Path>,
    max_iterations: Option<u32>,
    completion_token: Option<String>,
    resume: bool,
) -> Result<i32> {
    let prompt = match (prompt_file, prompt) {
        (Some(path), _) => fs::read_to_string(path)
            .with_context(|| format!("read prompt file {}", path.display()))?
            .trim()
            .to_string(),
        (None, Some(prompt)) => prompt,
        (None, None) => return Err(anyhow!("provide a prompt or --prompt-file")),
    };
    let pipeline = Pipeline::open(root)?;
    let cfg = &pipeline.config.loop_;
    let request = LoopRequest {
        max_iterations: max_iterations.unwrap_or(cfg.max_iterations),
        completion_token: completion_token.unwrap_or_else(|| cfg.completion_token.clone()),
        resume,
        ..LoopRequest::new(prompt, cfg)
    };
    let agent = CommandAgent::from_config(cfg)?;

    let outcome = run_loop(&pipeline, &agent, &ThreadSleeper, &request, |record| {
        println!(
            "iteration {} exit={} output={} chars complete={}",
            record.iteration, record.exit_code, record.output_length, record.complete
        );
    })?;
    match outcome.stop {
        LoopStop::Complete {
            iteration,
            method,
            new_terminal_files,
        } => {
            println!(
                "complete task_id={} iteration={iteration} method={}",
                outcome.task_id,
                method.as_str()
            );
            for file in new_terminal_files {
                println!("new file done/{file}");
            }
            Ok(exit_codes::OK)
        }
        LoopStop::MaxIterationsReached { last_iteration } => {
            println!(
                "incomplete task_id={} last_iteration={last_iteration} (rerun with --resume)",
                outcome.task_id
            );
            Ok(exit_codes::INCOMPLETE)
        }
    }
}

fn cmd_requeue(root: &Path, task: &str, error: &str, retry_count: Option<u32>) -> Result<i32> {
    let pipeline = Pipeline::open(root)?;
    let retry_count = match retry_count {
        Some(count) => count,
        None => pipeline
            .store
            .get(task)?
            .map_or(0, |record| record.meta.retry_count),
    };
    let request = RequeueRequest {
        task,
        error,
        retry_count,
        max_retries: pipeline.config.requeue.max_retries,
        cooldown: cooldown_from_hours(pipeline.config.requeue.cooldown_hours),
        extra: Default::default(),
    };
    match requeue(&pipeline, &request, Utc::now())? {
        RequeueOutcome::Queued {
            name, retry_after, ..
        } => println!("requeued {task} as {name} until {}", retry_after.to_rfc3339()),
        RequeueOutcome::Abandoned { alert, .. } => println!(
            "abandoned {task} (alert {})",
            pipeline.paths.relative(&alert).display()
        ),
    }
    Ok(exit_codes::OK)
}

fn cmd_degrade(
    root: &Path,
    action: &str,
    error: &str,
    payload: &str,
    service: Option<&str>,
    priority: Priority,
    actor: &str,
) -> Result<i32> {
    let payload: Value = serde_json::from_str(payload).context("parse --payload as JSON")?;
    let pipeline = Pipeline::open(root)?;
    let outcome = graceful_degrade(
        &pipeline,
        &DegradeRequest {
            action,
            error,
            payload,
            service,
            priority,
            actor,
        },
        Utc::now(),
    )?;
    println!("{}", outcome.entry.id);
    println!("{}", pipeline.paths.relative(&outcome.alert).display());
    Ok(exit_codes::OK)
}

fn cmd_audit(root: &Path, command: AuditCommand) -> Result<i32> {
    let pipeline = Pipeline::open(root)?;
    let entries = match command {
        AuditCommand::Recent { n } => pipeline.audit.most_recent(n)?,
        AuditCommand::Date { date } => pipeline.audit.for_date(parse_date(&date)?)?,
    };
    println!("{}", render_table(&entries));
    Ok(exit_codes::OK)
}

fn cmd_deferred(root: &Path, command: DeferredCommand) -> Result<i32> {
    let pipeline = Pipeline::open(root)?;
    match command {
        DeferredCommand::List => print_deferred(&pipeline.ledger, false)?,
        DeferredCommand::Resolve { id, status } => {
            let entry = pipeline.ledger.resolve(&id, status, Utc::now())?;
            println!("{} {}", entry.id, entry.status);
        }
    }
    Ok(exit_codes::OK)
}

fn print_deferred(ledger: &DeferredLedger, open_only: bool) -> Result<()> {
    for entry in ledger.entries()? {
        if open_only && entry.status != DeferredStatus::Deferred {
            continue;
        }
        println!(
            "{} {} action={} service={} queued_at={}",
            entry.id,
            entry.status,
            entry.action,
            entry.service,
            entry.queued_at.to_rfc3339()
        );
    }
    Ok(())
}

fn cmd_status(root: &Path) -> Result<i32> {
    let pipeline = Pipeline::open(root)?;
    let counts = pipeline.store.counts()?;
    for status in TaskStatus::ALL {
        println!("{status}: {}", counts.get(&status).copied().unwrap_or(0));
    }
    println!(
        "alerts awaiting approval: {}",
        count_documents(&pipeline.paths.pending_approval_dir)?
    );
    println!("open deferred actions:");
    print_deferred(&pipeline.ledger, true)?;
    Ok(exit_codes::OK)
}

/// Markdown documents in `dir`, not counting sidecars.
fn count_documents(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let name = entry
            .with_context(|| format!("list {}", dir.display()))?
            .file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".md") && !name.starts_with('.') {
            count += 1;
        }
    }
    Ok(count)
}
