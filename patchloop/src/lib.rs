//! Generate, run, and repair small LLM-written Python projects.
//!
//! This crate implements a bounded generate → run → diagnose → repair loop:
//! a model writes a project, the project is run, failures are classified and
//! fed back to the model, and each proposed fix is validated and committed
//! atomically or discarded. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (bundle codec, failure
//!   classification, diff guard, escalation state). No I/O, fully testable in
//!   isolation.
//! - **[`io`]**: Side-effecting operations (filesystem store, providers,
//!   process execution). Isolated behind traits to enable scripting in tests.
//!
//! Orchestration modules ([`orchestrate`], [`generate`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod core;
pub mod generate;
pub mod io;
pub mod logging;
pub mod orchestrate;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
