//! Iterative code-execution agent loop for producing data visualizations.
//!
//! A reasoner plans, writes a Python snippet, and sees the outcome of running
//! it, until a chart artifact exists or the iteration budget is spent. The
//! architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (state, extraction, observation
//!   protocol, termination). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (sandboxed execution, reasoner
//!   processes, config, prompts).
//!
//! Orchestration modules ([`step`], [`looping`]) drive the Plan → Act →
//! Observe cycle; [`tool`] adapts the execution engine to observation text.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tool;
