//! Persistent loop controller for `vault loop`.
//!
//! Re-invokes an external agent on the same goal until it reports completion
//! (the completion token appears in its output) or a new file lands in the
//! terminal location. State is saved after every iteration so an exhausted
//! run can be resumed later.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::analysis::tail;
use crate::core::identity::prompt_task_id;
use crate::io::agent::{AgentInvoker, AgentRequest, AgentResponse};
use crate::io::audit::{ActionResult, AuditEntry, actors};
use crate::io::config::LoopConfig;
use crate::io::iteration_log::{clear_iteration_logs, read_iteration_log, write_iteration_log};
use crate::io::loop_state::{
    CompletionMethod, IterationRecord, LoopState, LoopStatus, load_loop_state, loop_state_path,
    write_loop_state,
};
use crate::io::process::NO_EXIT_CODE;
use crate::io::templates::{CONTINUATION_PROMPT, TemplateEngine};
use crate::pipeline::Pipeline;
use crate::retry::Sleeper;

/// One `vault loop` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopRequest {
    pub prompt: String,
    /// Iteration budget for this invocation.
    pub max_iterations: u32,
    pub completion_token: String,
    pub resume: bool,
}

impl LoopRequest {
    /// Request using the configured budget and token.
    pub fn new(prompt: impl Into<String>, cfg: &LoopConfig) -> Self {
        Self {
            prompt: prompt.into(),
            max_iterations: cfg.max_iterations,
            completion_token: cfg.completion_token.clone(),
            resume: false,
        }
    }
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    Complete {
        iteration: u32,
        method: CompletionMethod,
        /// Terminal files that appeared since the loop started.
        new_terminal_files: Vec<String>,
    },
    MaxIterationsReached { last_iteration: u32 },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub task_id: String,
    pub started_at_iter: u32,
    pub iterations_run: u32,
    pub stop: LoopStop,
}

impl LoopOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self.stop, LoopStop::Complete { .. })
    }
}

#[derive(Serialize)]
struct ContinuationContext<'a> {
    iteration: u32,
    token: &'a str,
    goal: &'a str,
    tail: &'a str,
}

/// Prompt sent on `iteration`.
///
/// The first iteration gets the goal plus the completion instruction; later
/// ones get the continuation template quoting the end of the previous output.
pub fn build_iteration_prompt(
    templates: &TemplateEngine,
    goal: &str,
    iteration: u32,
    previous_output: &str,
    token: &str,
    tail_chars: usize,
) -> Result<String> {
    if iteration <= 1 {
        return Ok(format!(
            "{}\n\nWhen the task is fully complete, output exactly: {token}",
            goal.trim_end()
        ));
    }
    templates.render(
        CONTINUATION_PROMPT,
        ContinuationContext {
            iteration,
            token,
            goal: goal.trim(),
            tail: tail(previous_output, tail_chars).trim(),
        },
    )
}

/// Names of the task files currently in the terminal location. Sidecars and
/// hidden files are not tasks.
pub fn snapshot_terminal(dir: &Path) -> Result<BTreeSet<String>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => return Err(err).with_context(|| format!("list {}", dir.display())),
    };
    let mut names = BTreeSet::new();
    for entry in read_dir {
        let entry = entry.with_context(|| format!("list {}", dir.display()))?;
        if !entry.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') || name.ends_with(".meta.json") {
            continue;
        }
        names.insert(name);
    }
    Ok(names)
}

/// Drive the agent until completion evidence appears or the budget runs out.
///
/// A fresh run starts at iteration 1 and replaces any saved state for the
/// same goal. A resumed run continues numbering after the last saved
/// iteration; resuming a finished goal returns immediately without invoking
/// the agent. Agent failures count as incomplete iterations. A timed-out
/// iteration cannot complete by token, but a terminal file it produced still
/// counts.
#[instrument(skip_all, fields(max_iterations = request.max_iterations, resume = request.resume))]
pub fn run_loop<A, S, F>(
    pipeline: &Pipeline,
    agent: &A,
    sleeper: &S,
    request: &LoopRequest,
    mut on_iteration: F,
) -> Result<LoopOutcome>
where
    A: AgentInvoker + ?Sized,
    S: Sleeper + ?Sized,
    F: FnMut(&IterationRecord),
{
    if request.prompt.trim().is_empty() {
        return Err(anyhow!("loop prompt is empty"));
    }
    if request.max_iterations == 0 {
        return Err(anyhow!("max_iterations must be at least 1"));
    }
    if request.completion_token.is_empty() {
        return Err(anyhow!("completion token is empty"));
    }

    let cfg = &pipeline.config.loop_;
    let state_dir = &pipeline.paths.loop_state_dir;
    let task_id = prompt_task_id(&request.prompt);
    let state_path = loop_state_path(state_dir, &task_id);
    let now = Utc::now();

    let previous = if request.resume {
        load_loop_state(&state_path)
    } else {
        None
    };
    if let Some(state) = &previous
        && state.status == LoopStatus::Complete
        && let Some(method) = state.completion_method
    {
        info!(task_id = %task_id, iteration = state.iteration, "goal already complete");
        return Ok(LoopOutcome {
            task_id,
            started_at_iter: state.iteration,
            iterations_run: 0,
            stop: LoopStop::Complete {
                iteration: state.iteration,
                method,
                new_terminal_files: state.new_terminal_files.clone(),
            },
        });
    }

    let (mut state, mut previous_output) = match previous {
        Some(mut state) => {
            state.status = LoopStatus::Running;
            state.max_iterations = request.max_iterations;
            state.completion_token = request.completion_token.clone();
            let output = last_output(state_dir, &task_id, state.iteration);
            info!(task_id = %task_id, from = state.iteration + 1, "resuming loop");
            (state, output)
        }
        None => {
            clear_iteration_logs(state_dir, &task_id)?;
            let state = LoopState::new(
                &task_id,
                &request.prompt,
                request.max_iterations,
                &request.completion_token,
                now,
            );
            (state, String::new())
        }
    };

    let started_at_iter = state.iteration + 1;
    let last_iteration = state
        .iteration
        .checked_add(request.max_iterations)
        .ok_or_else(|| {
            anyhow!(
                "max_iterations {} after iteration {} exceeds the iteration counter",
                request.max_iterations,
                state.iteration
            )
        })?;
    let baseline = snapshot_terminal(&pipeline.paths.done_dir)?;
    save_state(&state_path, &state);
    pipeline.audit.record(
        AuditEntry::new("loop_start", actors::LOOP_CONTROLLER, &task_id)
            .at(now)
            .param("start_iteration", started_at_iter)
            .param("max_iterations", request.max_iterations)
            .param("resume", request.resume)
            .result(ActionResult::Pending),
    );
    info!(task_id = %task_id, started_at_iter, last_iteration, "loop started");

    let pause = Duration::from_secs(cfg.pause_secs);
    for iteration in started_at_iter..=last_iteration {
        state.iteration = iteration;
        save_state(&state_path, &state);

        let prompt = build_iteration_prompt(
            &pipeline.templates,
            &request.prompt,
            iteration,
            &previous_output,
            &request.completion_token,
            cfg.continuation_tail_chars,
        )?;
        let response = invoke(
            agent,
            &AgentRequest {
                workdir: pipeline.paths.root.clone(),
                prompt,
                timeout: Duration::from_secs(cfg.iteration_timeout_secs),
                output_limit_bytes: cfg.output_limit_bytes,
            },
        );
        if let Err(err) = write_iteration_log(state_dir, &task_id, iteration, &response.output) {
            warn!(iteration, err = %format!("{err:#}"), "failed to write iteration log");
        }

        let current = snapshot_terminal(&pipeline.paths.done_dir)?;
        let new_terminal_files: Vec<String> = current.difference(&baseline).cloned().collect();
        let token_found =
            !response.timed_out && response.output.contains(&request.completion_token);
        let method = CompletionMethod::from_evidence(token_found, !new_terminal_files.is_empty());
        let record = IterationRecord {
            iteration,
            timestamp: Utc::now(),
            output_length: response.output.chars().count(),
            exit_code: response.exit_code,
            timed_out: response.timed_out,
            complete: method.is_some(),
            completion_method: method,
            new_terminal_files: new_terminal_files.clone(),
        };
        debug!(
            iteration,
            exit_code = record.exit_code,
            output_length = record.output_length,
            token_found,
            new_files = new_terminal_files.len(),
            "iteration finished"
        );
        state.iterations.push(record.clone());
        on_iteration(&record);

        if let Some(method) = method {
            let finished = Utc::now();
            state.status = LoopStatus::Complete;
            state.completion_method = Some(method);
            state.completed_at = Some(finished);
            state.new_terminal_files = new_terminal_files.clone();
            save_state(&state_path, &state);
            pipeline.audit.record(
                AuditEntry::new("loop_complete", actors::LOOP_CONTROLLER, &task_id)
                    .at(finished)
                    .param("iteration", iteration)
                    .param("method", method.as_str())
                    .param("new_terminal_files", new_terminal_files.clone()),
            );
            info!(task_id = %task_id, iteration, method = method.as_str(), "loop complete");
            return Ok(LoopOutcome {
                task_id,
                started_at_iter,
                iterations_run: iteration - started_at_iter + 1,
                stop: LoopStop::Complete {
                    iteration,
                    method,
                    new_terminal_files,
                },
            });
        }

        save_state(&state_path, &state);
        previous_output = response.output;
        if iteration < last_iteration {
            debug!(pause_secs = pause.as_secs(), "not complete, pausing");
            sleeper.sleep(pause);
        }
    }

    state.status = LoopStatus::MaxIterationsReached;
    save_state(&state_path, &state);
    pipeline.audit.record(
        AuditEntry::new("loop_max_iterations", actors::LOOP_CONTROLLER, &task_id)
            .at(Utc::now())
            .param("last_iteration", last_iteration)
            .param("max_iterations", request.max_iterations)
            .result(ActionResult::Fail),
    );
    warn!(
        task_id = %task_id,
        last_iteration,
        "iteration budget exhausted; rerun with --resume to continue"
    );
    Ok(LoopOutcome {
        task_id,
        started_at_iter,
        iterations_run: request.max_iterations,
        stop: LoopStop::MaxIterationsReached { last_iteration },
    })
}

fn invoke<A: AgentInvoker + ?Sized>(agent: &A, request: &AgentRequest) -> AgentResponse {
    match agent.invoke(request) {
        Ok(response) => response,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "agent invocation failed");
            AgentResponse {
                output: String::new(),
                exit_code: NO_EXIT_CODE,
                timed_out: false,
            }
        }
    }
}

fn last_output(state_dir: &Path, task_id: &str, iteration: u32) -> String {
    if iteration == 0 {
        return String::new();
    }
    match read_iteration_log(state_dir, task_id, iteration) {
        Ok(output) => output.unwrap_or_default(),
        Err(err) => {
            warn!(iteration, err = %format!("{err:#}"), "failed to read previous iteration log");
            String::new()
        }
    }
}

fn save_state(path: &Path, state: &LoopState) {
    if let Err(err) = write_loop_state(path, state) {
        warn!(path = %path.display(), err = %format!("{err:#}"), "failed to save loop state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingSleeper, ScriptedAgent, TestVault};

    fn request(vault: &TestVault, prompt: &str, max_iterations: u32) -> LoopRequest {
        LoopRequest {
            max_iterations,
            ..LoopRequest::new(prompt, &vault.pipeline.config.loop_)
        }
    }

    #[test]
    fn first_prompt_appends_completion_instruction() {
        let prompt =
            build_iteration_prompt(&TemplateEngine::new(), "Do it\n\n", 1, "", "<DONE>", 600)
                .expect("prompt");
        assert_eq!(prompt, "Do it\n\nWhen the task is fully complete, output exactly: <DONE>");
    }

    #[test]
    fn continuation_prompt_quotes_bounded_tail() {
        let previous = format!("{}END", "x".repeat(50));
        let prompt =
            build_iteration_prompt(&TemplateEngine::new(), "Do it", 3, &previous, "<DONE>", 10)
                .expect("prompt");
        assert!(prompt.contains("(Iteration 3)"));
        assert!(prompt.contains("...xxxxxxxEND"));
        assert!(!prompt.contains(&"x".repeat(11)));
        assert!(prompt.contains("Do NOT repeat work already completed"));
    }

    #[test]
    fn continuation_prompt_without_output_says_so() {
        let prompt = build_iteration_prompt(&TemplateEngine::new(), "Do it", 2, "  ", "<DONE>", 10)
            .expect("prompt");
        assert!(prompt.contains("(no output captured)"));
    }

    #[test]
    fn snapshot_ignores_sidecars_and_hidden_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.md"), "a").expect("write");
        fs::write(temp.path().join("a.md.meta.json"), "{}").expect("write");
        fs::write(temp.path().join(".tmp"), "").expect("write");
        let names = snapshot_terminal(temp.path()).expect("snapshot");
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["a.md"]);
        assert!(snapshot_terminal(&temp.path().join("missing")).expect("missing").is_empty());
    }

    #[test]
    fn token_stops_loop_with_budget_remaining() {
        let vault = TestVault::new().expect("vault");
        let agent = ScriptedAgent::new(["working...", "all done <TASK_COMPLETE>"]);
        let sleeper = RecordingSleeper::default();
        let mut seen = Vec::new();

        let outcome = run_loop(
            &vault.pipeline,
            &agent,
            &sleeper,
            &request(&vault, "Write report", 5),
            |record| seen.push(record.iteration),
        )
        .expect("loop");

        assert_eq!(outcome.iterations_run, 2);
        assert_eq!(
            outcome.stop,
            LoopStop::Complete {
                iteration: 2,
                method: CompletionMethod::Token,
                new_terminal_files: Vec::new(),
            }
        );
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(3)]);
        let prompts = agent.prompts();
        assert!(prompts[0].ends_with("output exactly: <TASK_COMPLETE>"));
        assert!(prompts[1].contains("...working..."));

        let state = load_loop_state(&loop_state_path(
            &vault.pipeline.paths.loop_state_dir,
            &outcome.task_id,
        ))
        .expect("state");
        assert_eq!(state.status, LoopStatus::Complete);
        assert_eq!(state.completion_method, Some(CompletionMethod::Token));
        assert_eq!(state.iterations.len(), 2);
    }

    /// A file landing in `done/` completes the loop even without the token.
    #[test]
    fn terminal_file_completes_loop() {
        let vault = TestVault::new().expect("vault");
        let agent = ScriptedAgent::new(["nothing yet", "filed it"])
            .writing_on_call(2, vault.pipeline.paths.done_dir.join("briefing.md"));

        let outcome = run_loop(
            &vault.pipeline,
            &agent,
            &RecordingSleeper::default(),
            &request(&vault, "Write briefing", 5),
            |_| {},
        )
        .expect("loop");

        assert_eq!(
            outcome.stop,
            LoopStop::Complete {
                iteration: 2,
                method: CompletionMethod::TerminalFile,
                new_terminal_files: vec!["briefing.md".to_string()],
            }
        );
    }

    #[test]
    fn files_present_before_start_do_not_count() {
        let vault = TestVault::new().expect("vault");
        fs::write(vault.pipeline.paths.done_dir.join("old.md"), "old").expect("write");
        let agent = ScriptedAgent::new(["a", "b"]);

        let outcome = run_loop(
            &vault.pipeline,
            &agent,
            &RecordingSleeper::default(),
            &request(&vault, "Goal", 2),
            |_| {},
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::MaxIterationsReached { last_iteration: 2 });
    }

    #[test]
    fn exhausted_budget_resumes_at_next_iteration() {
        let vault = TestVault::new().expect("vault");
        let sleeper = RecordingSleeper::default();
        let first = ScriptedAgent::new(["one", "two"]);
        let outcome = run_loop(
            &vault.pipeline,
            &first,
            &sleeper,
            &request(&vault, "Long goal", 2),
            |_| {},
        )
        .expect("first run");
        assert_eq!(outcome.stop, LoopStop::MaxIterationsReached { last_iteration: 2 });
        assert_eq!(sleeper.slept().len(), 1);

        let second = ScriptedAgent::new(["<TASK_COMPLETE>"]);
        let resumed = run_loop(
            &vault.pipeline,
            &second,
            &sleeper,
            &LoopRequest {
                resume: true,
                ..request(&vault, "Long goal", 2)
            },
            |_| {},
        )
        .expect("resume");
        assert_eq!(resumed.started_at_iter, 3);
        assert_eq!(resumed.iterations_run, 1);
        assert!(matches!(resumed.stop, LoopStop::Complete { iteration: 3, .. }));
        let prompts = second.prompts();
        assert!(prompts[0].contains("(Iteration 3)"));
        assert!(prompts[0].contains("...two"));
    }

    #[test]
    fn resuming_completed_goal_does_not_invoke_agent() {
        let vault = TestVault::new().expect("vault");
        let done = ScriptedAgent::new(["<TASK_COMPLETE>"]);
        run_loop(
            &vault.pipeline,
            &done,
            &RecordingSleeper::default(),
            &request(&vault, "Quick goal", 3),
            |_| {},
        )
        .expect("first run");

        let idle = ScriptedAgent::new(Vec::<String>::new());
        let outcome = run_loop(
            &vault.pipeline,
            &idle,
            &RecordingSleeper::default(),
            &LoopRequest {
                resume: true,
                ..request(&vault, "Quick goal", 3)
            },
            |_| {},
        )
        .expect("resume");
        assert_eq!(outcome.iterations_run, 0);
        assert!(outcome.is_complete());
        assert!(idle.prompts().is_empty());
    }

    /// Without `--resume`, a previous run for the same goal is discarded.
    #[test]
    fn fresh_run_restarts_numbering() {
        let vault = TestVault::new().expect("vault");
        let sleeper = RecordingSleeper::default();
        run_loop(
            &vault.pipeline,
            &ScriptedAgent::new(["a"]),
            &sleeper,
            &request(&vault, "Goal", 1),
            |_| {},
        )
        .expect("first");
        let outcome = run_loop(
            &vault.pipeline,
            &ScriptedAgent::new(["<TASK_COMPLETE>"]),
            &sleeper,
            &request(&vault, "Goal", 1),
            |_| {},
        )
        .expect("second");
        assert_eq!(outcome.started_at_iter, 1);
    }

    #[test]
    fn agent_errors_and_timeouts_do_not_complete() {
        let vault = TestVault::new().expect("vault");
        let agent = ScriptedAgent::from_responses(vec![
            Err("spawn failed".to_string()),
            Ok(AgentResponse {
                output: "<TASK_COMPLETE>".to_string(),
                exit_code: NO_EXIT_CODE,
                timed_out: true,
            }),
        ]);
        let mut records = Vec::new();

        let outcome = run_loop(
            &vault.pipeline,
            &agent,
            &RecordingSleeper::default(),
            &request(&vault, "Flaky goal", 2),
            |record| records.push(record.clone()),
        )
        .expect("loop");

        assert_eq!(outcome.stop, LoopStop::MaxIterationsReached { last_iteration: 2 });
        assert_eq!(records[0].exit_code, NO_EXIT_CODE);
        assert_eq!(records[0].output_length, 0);
        assert!(records[1].timed_out);
        assert!(!records[1].complete);
    }

    #[test]
    fn timed_out_iteration_still_counts_terminal_file() {
        let vault = TestVault::new().expect("vault");
        let agent = ScriptedAgent::from_responses(vec![Ok(AgentResponse {
            output: "partial".to_string(),
            exit_code: NO_EXIT_CODE,
            timed_out: true,
        })])
        .writing_on_call(1, vault.pipeline.paths.done_dir.join("briefing.md"));

        let outcome = run_loop(
            &vault.pipeline,
            &agent,
            &RecordingSleeper::default(),
            &request(&vault, "Slow briefing", 1),
            |_| {},
        )
        .expect("loop");

        assert_eq!(
            outcome.stop,
            LoopStop::Complete {
                iteration: 1,
                method: CompletionMethod::TerminalFile,
                new_terminal_files: vec!["briefing.md".to_string()],
            }
        );
    }

    #[test]
    fn resume_budget_past_counter_limit_is_rejected() {
        let vault = TestVault::new().expect("vault");
        run_loop(
            &vault.pipeline,
            &ScriptedAgent::new(["one"]),
            &RecordingSleeper::default(),
            &request(&vault, "Endless goal", 1),
            |_| {},
        )
        .expect("first run");

        let agent = ScriptedAgent::new(Vec::<String>::new());
        let err = run_loop(
            &vault.pipeline,
            &agent,
            &RecordingSleeper::default(),
            &LoopRequest {
                resume: true,
                ..request(&vault, "Endless goal", u32::MAX)
            },
            |_| {},
        )
        .expect_err("overflowing budget");
        assert!(err.to_string().contains("exceeds the iteration counter"));
        assert!(agent.prompts().is_empty());
    }

    #[test]
    fn iteration_output_is_logged() {
        let vault = TestVault::new().expect("vault");
        let outcome = run_loop(
            &vault.pipeline,
            &ScriptedAgent::new(["full output <TASK_COMPLETE>"]),
            &RecordingSleeper::default(),
            &request(&vault, "Log me", 1),
            |_| {},
        )
        .expect("loop");
        let logged = read_iteration_log(&vault.pipeline.paths.loop_state_dir, &outcome.task_id, 1)
            .expect("read");
        assert_eq!(logged.as_deref(), Some("full output <TASK_COMPLETE>"));
    }
}
