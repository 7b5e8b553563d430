//! Plan → Act → Observe driver for one run.

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

pub use crate::core::cancel::CancelToken;
use crate::core::termination::check_termination;
use crate::core::types::{AgentState, LoopStop, StateDelta, Turn};
use crate::io::config::VizloopConfig;
use crate::io::reasoner::Reasoner;
use crate::step::{act, observe, plan};
use crate::tool::SnippetRunner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub iteration_limit: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { iteration_limit: 5 }
    }
}

impl From<&VizloopConfig> for LoopConfig {
    fn from(cfg: &VizloopConfig) -> Self {
        Self {
            iteration_limit: cfg.iteration_limit,
        }
    }
}

/// Final state of a run and why it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub state: AgentState,
    pub stop: LoopStop,
}

impl RunOutcome {
    /// Last turn a user should see.
    pub fn final_turn(&self) -> Option<&Turn> {
        self.state.visible_turns().last()
    }
}

/// Run the agent loop for `query` until completion, budget exhaustion or
/// cancellation.
///
/// `on_turn` sees every visible turn as it is appended. Reasoner failures end
/// the run with an error unless the run was cancelled meanwhile; execution
/// failures are observations.
#[instrument(skip_all, fields(iteration_limit = config.iteration_limit))]
pub fn run_agent<R, T, F>(
    query: &str,
    reasoner: &R,
    tool: &T,
    config: &LoopConfig,
    cancel: &CancelToken,
    mut on_turn: F,
) -> Result<RunOutcome>
where
    R: Reasoner,
    T: SnippetRunner,
    F: FnMut(&Turn),
{
    let mut state = AgentState::new(config.iteration_limit);
    merge(
        &mut state,
        StateDelta::empty().push(Turn::user(query)),
        &mut on_turn,
    );

    loop {
        if cancel.is_cancelled() {
            return Ok(cancelled(state));
        }
        let delta = match plan(&state, reasoner) {
            Ok(delta) => delta,
            Err(err) if cancel.is_cancelled() => return Ok(interrupted(state, &err)),
            Err(err) => return Err(err),
        };
        merge(&mut state, delta, &mut on_turn);

        if cancel.is_cancelled() {
            return Ok(cancelled(state));
        }
        let delta = match act(&state, reasoner) {
            Ok(delta) => delta,
            Err(err) if cancel.is_cancelled() => return Ok(interrupted(state, &err)),
            Err(err) => return Err(err),
        };
        merge(&mut state, delta, &mut on_turn);

        if cancel.is_cancelled() {
            return Ok(cancelled(state));
        }
        let delta = observe(&state, tool);
        merge(&mut state, delta, &mut on_turn);
        if cancel.is_cancelled() {
            return Ok(cancelled(state));
        }

        info!(
            iteration = state.iteration(),
            done = state.done(),
            "cycle finished"
        );
        if let Some(stop) = check_termination(&state) {
            info!(stop = stop.describe(), iteration = state.iteration(), "run finished");
            return Ok(RunOutcome { state, stop });
        }
    }
}

fn merge<F: FnMut(&Turn)>(state: &mut AgentState, delta: StateDelta, on_turn: &mut F) {
    for turn in state.apply(delta) {
        if turn.role.is_visible() {
            on_turn(turn);
        }
    }
}

/// A reasoner call that failed because the run was cancelled under it.
fn interrupted(state: AgentState, err: &anyhow::Error) -> RunOutcome {
    debug!(err = %format!("{err:#}"), "reasoner stopped by cancellation");
    cancelled(state)
}

fn cancelled(state: AgentState) -> RunOutcome {
    warn!(iteration = state.iteration(), "run cancelled");
    RunOutcome {
        state,
        stop: LoopStop::Cancelled,
    }
}
