//! I/O helpers: sandboxed execution, reasoner processes, config, prompts and signals.

pub mod artifact;
pub mod config;
pub mod process;
pub mod prompt;
pub mod reasoner;
pub mod sandbox;
pub mod signals;
