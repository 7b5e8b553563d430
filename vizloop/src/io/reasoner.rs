//! Reasoner abstraction: turns a transcript into the next reply.
//!
//! The [`Reasoner`] trait decouples the loop from the language model backend.
//! [`CommandReasoner`] pipes the prompt into an external command; tests use
//! scripted reasoners that return predetermined replies.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::types::Turn;
use crate::io::config::ReasonerConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::build_reasoner_input;

/// Structured request to call a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

/// What the reasoner answered.
#[derive(Debug, Clone, PartialEq)]
pub enum ReasonerReply {
    Text(String),
    Action(ActionRequest),
}

/// Abstraction over reasoning backends.
pub trait Reasoner {
    /// Produce the next reply for `transcript`, steered by `preamble`.
    ///
    /// Errors are planning failures and end the run.
    fn invoke(&self, transcript: &[Turn], preamble: &str) -> Result<ReasonerReply>;
}

impl<R: Reasoner + ?Sized> Reasoner for &R {
    fn invoke(&self, transcript: &[Turn], preamble: &str) -> Result<ReasonerReply> {
        (**self).invoke(transcript, preamble)
    }
}

/// Reasoner that runs an external command per invocation.
///
/// The preamble and rendered transcript are written to stdin; stdout is the
/// reply.
#[derive(Debug, Clone)]
pub struct CommandReasoner {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: Option<CancelToken>,
}

impl CommandReasoner {
    pub fn new(cfg: &ReasonerConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
            cancel: None,
        }
    }

    /// Kill the reasoner process and fail the call once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl Reasoner for CommandReasoner {
    #[instrument(skip_all, fields(turns = transcript.len(), timeout_secs = self.timeout.as_secs()))]
    fn invoke(&self, transcript: &[Turn], preamble: &str) -> Result<ReasonerReply> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("reasoner command is empty"))?;
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(anyhow!("reasoner cancelled"));
        }
        let input = build_reasoner_input(preamble, transcript);

        let mut cmd = Command::new(program);
        cmd.args(args);
        info!(program = %program, input_bytes = input.len(), "invoking reasoner");
        let output = run_command_with_timeout(
            cmd,
            Some(input.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
            self.cancel.as_ref(),
        )
        .with_context(|| format!("run reasoner {program}"))?;

        if output.cancelled {
            info!("reasoner cancelled");
            return Err(anyhow!("reasoner cancelled"));
        }
        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "reasoner timed out");
            return Err(anyhow!("reasoner timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            warn!(exit_code = ?output.status.code(), "reasoner failed");
            return Err(anyhow!(
                "reasoner failed with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            ));
        }

        let reply = parse_reply(&output.stdout_lossy());
        debug!(action = matches!(reply, ReasonerReply::Action(_)), "reasoner replied");
        Ok(reply)
    }
}

/// Interpret raw reasoner output.
///
/// A JSON object with a string `tool` field is an action request; anything
/// else is free text.
pub fn parse_reply(raw: &str) -> ReasonerReply {
    let trimmed = raw.trim();
    match parse_action(trimmed) {
        Some(action) => ReasonerReply::Action(action),
        None => ReasonerReply::Text(trimmed.to_string()),
    }
}

fn parse_action(text: &str) -> Option<ActionRequest> {
    if !text.starts_with('{') {
        return None;
    }
    let Value::Object(map) = serde_json::from_str::<Value>(text).ok()? else {
        return None;
    };
    let tool = map.get("tool")?.as_str()?.to_string();
    Some(ActionRequest {
        tool,
        arguments: map.get("arguments").cloned().unwrap_or(Value::Null),
    })
}
