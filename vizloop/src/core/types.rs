//! Shared deterministic types for the agent loop.
//!
//! These types define stable contracts between the loop phases. They do not
//! depend on external state or I/O.

use serde::{Deserialize, Serialize};

/// Author of a transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The caller's query.
    User,
    /// Text produced by the reasoner.
    Assistant,
    /// Notes authored by the loop itself (actions, extraction misses).
    Note,
    /// Rendered execution outcome fed back to the reasoner.
    Observation,
    /// Loop-private handoff entries. Never shown to the reasoner or the user.
    Internal,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Note => "note",
            Role::Observation => "observation",
            Role::Internal => "internal",
        }
    }

    pub fn is_visible(self) -> bool {
        self != Role::Internal
    }
}

/// One entry of the append-only transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn note(text: impl Into<String>) -> Self {
        Self::new(Role::Note, text)
    }

    pub fn observation(text: impl Into<String>) -> Self {
        Self::new(Role::Observation, text)
    }

    pub fn internal(text: impl Into<String>) -> Self {
        Self::new(Role::Internal, text)
    }
}

/// Partial state update produced by one loop phase.
///
/// Phases never touch [`AgentState`] directly; the driver merges deltas with
/// [`AgentState::apply`], so a phase cannot drop a field it did not mention.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDelta {
    /// Turns to append, in order.
    pub append: Vec<Turn>,
    /// Latch `done` to true. A delta can never clear it.
    pub mark_done: bool,
    /// Count one completed Observe step.
    pub advance_iteration: bool,
}

impl StateDelta {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn push(mut self, turn: Turn) -> Self {
        self.append.push(turn);
        self
    }

    pub fn done(mut self) -> Self {
        self.mark_done = true;
        self
    }

    pub fn advance(mut self) -> Self {
        self.advance_iteration = true;
        self
    }
}

/// Evolving record of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentState {
    transcript: Vec<Turn>,
    iteration: u32,
    iteration_limit: u32,
    done: bool,
}

impl AgentState {
    /// Start a run. `iteration_limit` is clamped to at least one cycle.
    pub fn new(iteration_limit: u32) -> Self {
        Self {
            transcript: Vec::new(),
            iteration: 0,
            iteration_limit: iteration_limit.max(1),
            done: false,
        }
    }

    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn iteration_limit(&self) -> u32 {
        self.iteration_limit
    }

    pub fn done(&self) -> bool {
        self.done
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.transcript.last()
    }

    /// Visible turns only (internal handoff markers removed).
    pub fn visible_turns(&self) -> impl Iterator<Item = &Turn> {
        self.transcript.iter().filter(|turn| turn.role.is_visible())
    }

    /// Merge a phase delta. Returns the newly appended turns.
    pub fn apply(&mut self, delta: StateDelta) -> &[Turn] {
        let start = self.transcript.len();
        self.transcript.extend(delta.append);
        self.done |= delta.mark_done;
        if delta.advance_iteration {
            self.iteration += 1;
        }
        &self.transcript[start..]
    }
}

/// Why a run reached the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStop {
    /// `done` was set: the sentinel was emitted or an artifact was produced.
    Complete,
    /// `iteration` reached `iteration_limit` with `done` still false.
    BudgetExhausted,
    /// The caller cancelled the run at a phase boundary.
    Cancelled,
}

impl LoopStop {
    pub fn describe(self) -> &'static str {
        match self {
            LoopStop::Complete => "completed",
            LoopStop::BudgetExhausted => "stopped (budget exhausted)",
            LoopStop::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_starts_at_zero_and_not_done() {
        let state = AgentState::new(3);
        assert_eq!(state.iteration(), 0);
        assert_eq!(state.iteration_limit(), 3);
        assert!(!state.done());
        assert!(state.transcript().is_empty());
    }

    #[test]
    fn zero_limit_is_clamped_to_one() {
        assert_eq!(AgentState::new(0).iteration_limit(), 1);
    }

    #[test]
    fn apply_appends_in_order_and_returns_new_turns() {
        let mut state = AgentState::new(2);
        state.apply(StateDelta::empty().push(Turn::user("q")));
        let appended = state
            .apply(
                StateDelta::empty()
                    .push(Turn::assistant("a"))
                    .push(Turn::note("b")),
            )
            .to_vec();

        assert_eq!(appended, vec![Turn::assistant("a"), Turn::note("b")]);
        let roles: Vec<Role> = state.transcript().iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Note]);
    }

    #[test]
    fn done_is_latched_by_later_deltas() {
        let mut state = AgentState::new(2);
        state.apply(StateDelta::empty().done());
        state.apply(StateDelta::empty().push(Turn::note("later")));
        assert!(state.done());
    }

    #[test]
    fn iteration_advances_once_per_delta() {
        let mut state = AgentState::new(5);
        state.apply(StateDelta::empty().advance());
        state.apply(StateDelta::empty());
        state.apply(StateDelta::empty().advance());
        assert_eq!(state.iteration(), 2);
    }

    #[test]
    fn visible_turns_hide_internal_entries() {
        let mut state = AgentState::new(1);
        state.apply(
            StateDelta::empty()
                .push(Turn::note("action"))
                .push(Turn::internal("marker")),
        );
        let visible: Vec<&Turn> = state.visible_turns().collect();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].text, "action");
    }
}
