//! I/O adapters for the vault pipeline.

pub mod agent;
pub mod alerts;
pub mod atomic;
pub mod audit;
pub mod collector;
pub mod config;
pub mod iteration_log;
pub mod ledger;
pub mod loop_state;
pub mod paths;
pub mod plans;
pub mod process;
pub mod task_store;
pub mod templates;
