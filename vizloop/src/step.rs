//! The three phases of one agent cycle.
//!
//! Each phase reads the current [`AgentState`] and returns a [`StateDelta`];
//! only the driver in [`crate::looping`] applies deltas.

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::extract::extract_code;
use crate::core::protocol::{
    contains_sentinel, decode_pending_code, encode_pending_code, signals_artifact,
};
use crate::core::types::{AgentState, Role, StateDelta, Turn};
use crate::io::prompt::{coder_preamble, planner_preamble};
use crate::io::reasoner::{Reasoner, ReasonerReply};
use crate::tool::{EXECUTE_TOOL_NAME, SnippetRunner, snippet_from_action};

/// Note appended when Act could not obtain a snippet.
pub const NO_CODE_NOTE: &str =
    "No code generated. Rethink the approach and produce a python code block.";

/// Plan: ask the reasoner for the next step and latch `done` on the sentinel.
#[instrument(skip_all, fields(iteration = state.iteration()))]
pub fn plan<R: Reasoner>(state: &AgentState, reasoner: &R) -> Result<StateDelta> {
    let preamble = planner_preamble()?;
    let reply = reasoner
        .invoke(&visible_transcript(state), &preamble)
        .context("plan: reasoner invocation failed")?;
    let text = reply_text(&reply);

    let mut delta = StateDelta::empty();
    if contains_sentinel(&text) {
        info!("completion sentinel received");
        delta = delta.done();
    }
    Ok(delta.push(Turn::assistant(text)))
}

/// Act: obtain a snippet from the reasoner and queue it for Observe.
///
/// Does nothing once `done` is set. A missing or rejected snippet is recorded
/// as a note, not an error.
#[instrument(skip_all, fields(iteration = state.iteration()))]
pub fn act<R: Reasoner>(state: &AgentState, reasoner: &R) -> Result<StateDelta> {
    if state.done() {
        debug!("done already set, skipping act");
        return Ok(StateDelta::empty());
    }

    let preamble = coder_preamble()?;
    let reply = reasoner
        .invoke(&visible_transcript(state), &preamble)
        .context("act: reasoner invocation failed")?;

    let snippet = match &reply {
        ReasonerReply::Text(text) => extract_code(text)
            .map(|extracted| {
                debug!(source = ?extracted.source, "extracted snippet");
                extracted.code
            })
            .ok_or_else(|| NO_CODE_NOTE.to_string()),
        ReasonerReply::Action(action) => snippet_from_action(action)
            .map_err(|err| format!("{NO_CODE_NOTE}\nRejected action: {err:#}")),
    };

    match snippet {
        Ok(code) => {
            info!(code_bytes = code.len(), "queued snippet");
            Ok(StateDelta::empty()
                .push(Turn::note(action_note(&code)))
                .push(Turn::internal(encode_pending_code(&code))))
        }
        Err(note) => {
            warn!("no snippet extracted");
            Ok(StateDelta::empty().push(Turn::note(note)))
        }
    }
}

/// Observe: run the queued snippet and count the cycle.
///
/// A successful observation that reports an artifact latches `done`,
/// whatever the reasoner said.
#[instrument(skip_all, fields(iteration = state.iteration()))]
pub fn observe<T: SnippetRunner>(state: &AgentState, tool: &T) -> StateDelta {
    let delta = StateDelta::empty().advance();
    if state.done() {
        debug!("done already set, nothing to execute");
        return delta;
    }
    let Some(code) = pending_snippet(state.transcript()) else {
        debug!("no pending snippet");
        return delta;
    };

    let observation = tool.run_snippet(code);
    let artifact = signals_artifact(&observation);
    info!(artifact, "observed execution");
    let delta = delta.push(Turn::observation(observation));
    if artifact { delta.done() } else { delta }
}

/// Most recent queued snippet that has not been observed yet.
pub fn pending_snippet(transcript: &[Turn]) -> Option<&str> {
    for turn in transcript.iter().rev() {
        match turn.role {
            Role::Observation => return None,
            Role::Internal => {
                if let Some(code) = decode_pending_code(&turn.text) {
                    return Some(code);
                }
            }
            _ => {}
        }
    }
    None
}

fn visible_transcript(state: &AgentState) -> Vec<Turn> {
    state.visible_turns().cloned().collect()
}

fn reply_text(reply: &ReasonerReply) -> String {
    match reply {
        ReasonerReply::Text(text) => text.clone(),
        ReasonerReply::Action(action) => {
            let code = action.arguments.get("code").and_then(Value::as_str);
            match code {
                Some(code) => fenced_python(code),
                None => format!("{} {}", action.tool, action.arguments),
            }
        }
    }
}

fn action_note(code: &str) -> String {
    format!("Action: {EXECUTE_TOOL_NAME}\n{}", fenced_python(code))
}

fn fenced_python(code: &str) -> String {
    format!("```python\n{}\n```", code.trim_end())
}
