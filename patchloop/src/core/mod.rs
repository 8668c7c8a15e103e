//! Pure, deterministic logic for the repair loop.
//!
//! No I/O. Everything here is testable in isolation and must behave
//! identically across runs.

pub mod bundle;
pub mod classify;
pub mod diff;
pub mod state;
pub mod types;
