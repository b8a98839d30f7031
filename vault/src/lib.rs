//! Resilience and orchestration core for a file-based task vault.
//!
//! Tasks move through directories (`needs_action/`, `done/`, `abandoned/`)
//! with a JSON sidecar per task. The crate keeps the same split as the rest
//! of the workspace:
//!
//! - **[`core`]**: Pure, deterministic logic (lifecycle rules, backoff
//!   schedule, keyword signals, the cross-domain rule table). No I/O.
//! - **[`io`]**: Side-effecting adapters (vault layout, audit store, deferred
//!   ledger, alerts, task store, agent processes).
//!
//! Orchestration modules ([`retry`], [`escalation`], [`route`], [`complete`],
//! [`cycle`], [`looping`]) combine the two to implement CLI commands.

pub mod complete;
pub mod core;
pub mod cycle;
pub mod escalation;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod pipeline;
pub mod retry;
pub mod route;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
