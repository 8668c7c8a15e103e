//! Side-effecting boundaries: filesystem store, child processes, providers.

pub mod attempt_log;
pub mod config;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod runner;
pub mod store;
pub mod validate;
