//! One collect → route pass, and the polling loop around it.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{error, info, instrument};

use crate::io::audit::{actors, failure};
use crate::io::collector::{CollectReport, Collector, InboxCollector, SeenIds, collect_once, seen_path};
use crate::pipeline::Pipeline;
use crate::retry::Sleeper;
use crate::route::{RouteResult, route_eligible};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub collected: CollectReport,
    pub routed: Vec<RouteResult>,
}

/// Collect from `collector` once, persist its seen ids, then route every
/// eligible task.
#[instrument(skip_all, fields(collector = %collector.name()))]
pub fn run_cycle<C: Collector, S: Sleeper + ?Sized>(
    pipeline: &Pipeline,
    collector: &mut C,
    sleeper: &S,
    now: DateTime<Utc>,
) -> Result<CycleReport> {
    let seen_file = seen_path(&pipeline.paths.seen_dir, collector.name());
    let mut seen = SeenIds::load(&seen_file)?;
    let collected = collect_once(collector, &mut seen, &pipeline.store, &pipeline.audit, now);
    // Items created before a scan error are still marked seen.
    seen.save(&seen_file)?;
    let collected = collected?;
    let routed = route_eligible(pipeline, sleeper, now)?;
    Ok(CycleReport { collected, routed })
}

/// [`run_cycle`] over the inbox collector.
pub fn run_inbox_cycle<S: Sleeper + ?Sized>(
    pipeline: &Pipeline,
    sleeper: &S,
    now: DateTime<Utc>,
) -> Result<CycleReport> {
    let mut collector = InboxCollector::new(&pipeline.paths.inbox_dir);
    run_cycle(pipeline, &mut collector, sleeper, now)
}

/// Poll the inbox every `cycle.poll_interval_secs` until `max_cycles` passes
/// have run (forever when `None`). A failed pass is logged and audited; the
/// next pass still runs.
pub fn watch<S, F>(
    pipeline: &Pipeline,
    sleeper: &S,
    max_cycles: Option<usize>,
    mut on_cycle: F,
) -> usize
where
    S: Sleeper + ?Sized,
    F: FnMut(&CycleReport),
{
    let interval = Duration::from_secs(pipeline.config.cycle.poll_interval_secs);
    info!(interval_secs = interval.as_secs(), "watching inbox");
    let mut cycles = 0;
    loop {
        let now = Utc::now();
        match run_inbox_cycle(pipeline, sleeper, now) {
            Ok(report) => on_cycle(&report),
            Err(err) => {
                let message = format!("{err:#}");
                error!(err = %message, "cycle failed");
                pipeline
                    .audit
                    .record(failure(actors::WATCHER, "cycle", "cycle_error", &message).at(now));
            }
        }
        cycles += 1;
        if max_cycles.is_some_and(|max| cycles >= max) {
            return cycles;
        }
        sleeper.sleep(interval);
    }
}
