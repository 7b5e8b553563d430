//! Termination decision evaluated after every Observe step.

use crate::core::protocol::signals_artifact;
use crate::core::types::{AgentState, LoopStop, Role};

/// Decide whether the run must stop after the current Observe step.
///
/// Stops when `done` is latched, when the iteration budget is spent, or when
/// the latest turn already reports an artifact (mirrors the Observe rule).
pub fn check_termination(state: &AgentState) -> Option<LoopStop> {
    if state.done() {
        return Some(LoopStop::Complete);
    }
    if last_turn_signals_artifact(state) {
        return Some(LoopStop::Complete);
    }
    if state.iteration() >= state.iteration_limit() {
        return Some(LoopStop::BudgetExhausted);
    }
    None
}

fn last_turn_signals_artifact(state: &AgentState) -> bool {
    state
        .last_turn()
        .is_some_and(|turn| turn.role == Role::Observation && signals_artifact(&turn.text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{StateDelta, Turn};

    #[test]
    fn continues_while_budget_remains() {
        let mut state = AgentState::new(2);
        state.apply(StateDelta::empty().advance());
        assert_eq!(check_termination(&state), None);
    }

    #[test]
    fn budget_exhaustion_is_distinct_from_completion() {
        let mut state = AgentState::new(1);
        state.apply(StateDelta::empty().advance());
        assert_eq!(check_termination(&state), Some(LoopStop::BudgetExhausted));
    }

    #[test]
    fn done_wins_over_budget() {
        let mut state = AgentState::new(1);
        state.apply(StateDelta::empty().advance().done());
        assert_eq!(check_termination(&state), Some(LoopStop::Complete));
    }

    #[test]
    fn artifact_observation_stops_even_without_done() {
        let mut state = AgentState::new(5);
        state.apply(StateDelta::empty().advance().push(Turn::observation(
            "Code executed successfully.\n\nGenerated plot available at: /o/p.html",
        )));
        assert_eq!(check_termination(&state), Some(LoopStop::Complete));
    }

    #[test]
    fn plain_success_observation_does_not_stop() {
        let mut state = AgentState::new(5);
        state.apply(
            StateDelta::empty()
                .advance()
                .push(Turn::observation("Code executed successfully.\nok\n")),
        );
        assert_eq!(check_termination(&state), None);
    }
}
