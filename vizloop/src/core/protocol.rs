//! Observation protocol shared by the tool adapter and the control loop.
//!
//! The loop never inspects an [`ExecutionResult`] directly. It only sees the
//! rendered observation, so the marker strings below are wire protocol:
//! rewording them changes when runs terminate.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// Prefix of every successful observation.
pub const SUCCESS_MARKER: &str = "Code executed successfully";
/// Present iff the observation reports a relocated artifact.
pub const ARTIFACT_MARKER: &str = "Generated plot available at:";
/// Prefix of every failed observation.
pub const FAILURE_MARKER: &str = "Code execution failed with error:";
/// Reasoner token that declares the goal satisfied.
pub const COMPLETION_SENTINEL: &str = "TASK_COMPLETE";
/// Prefix of the internal transcript entry carrying a queued snippet.
pub const PENDING_CODE_PREFIX: &str = "__VIZLOOP_PENDING_CODE__\n";

/// Outcome of one engine invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    /// True iff the process exited with status zero.
    pub succeeded: bool,
    pub stdout: String,
    pub stderr: String,
    /// Relocated artifact, independent of `succeeded`.
    pub artifact_path: Option<PathBuf>,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl ExecutionResult {
    /// Failure that never reached (or never finished) the interpreter.
    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            stdout: String::new(),
            stderr: stderr.into(),
            artifact_path: None,
            timed_out: false,
            exit_code: None,
            duration: Duration::ZERO,
        }
    }
}

/// Render an execution outcome into the observation text.
pub fn render_observation(result: &ExecutionResult) -> String {
    if !result.succeeded {
        return format!("{FAILURE_MARKER}\n{}", result.stderr);
    }
    let mut out = format!("{SUCCESS_MARKER}.\n{}", result.stdout);
    if let Some(path) = &result.artifact_path {
        out.push('\n');
        out.push_str(ARTIFACT_MARKER);
        out.push(' ');
        out.push_str(&path.display().to_string());
    }
    out
}

/// True when an observation reports success and an artifact together.
pub fn signals_artifact(observation: &str) -> bool {
    observation.contains(SUCCESS_MARKER) && observation.contains(ARTIFACT_MARKER)
}

pub fn contains_sentinel(text: &str) -> bool {
    text.contains(COMPLETION_SENTINEL)
}

pub fn encode_pending_code(code: &str) -> String {
    format!("{PENDING_CODE_PREFIX}{code}")
}

pub fn decode_pending_code(text: &str) -> Option<&str> {
    text.strip_prefix(PENDING_CODE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(stdout: &str, artifact: Option<&str>) -> ExecutionResult {
        ExecutionResult {
            succeeded: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
            artifact_path: artifact.map(PathBuf::from),
            timed_out: false,
            exit_code: Some(0),
            duration: Duration::from_millis(5),
        }
    }

    #[test]
    fn success_without_artifact_renders_stdout_only() {
        let rendered = render_observation(&ok("ok\n", None));
        assert_eq!(rendered, "Code executed successfully.\nok\n");
        assert!(!signals_artifact(&rendered));
    }

    #[test]
    fn success_with_artifact_appends_path_line() {
        let rendered = render_observation(&ok("done\n", Some("/out/plot_1.html")));
        assert_eq!(
            rendered,
            "Code executed successfully.\ndone\n\nGenerated plot available at: /out/plot_1.html"
        );
        assert!(signals_artifact(&rendered));
    }

    #[test]
    fn failure_renders_stderr_and_hides_artifact() {
        let mut result = ExecutionResult::failure("Traceback: boom");
        result.artifact_path = Some(PathBuf::from("/out/plot_2.html"));
        let rendered = render_observation(&result);
        assert_eq!(rendered, "Code execution failed with error:\nTraceback: boom");
        assert!(!signals_artifact(&rendered));
    }

    #[test]
    fn artifact_marker_alone_is_not_enough() {
        assert!(!signals_artifact("Generated plot available at: /x"));
    }

    #[test]
    fn pending_code_marker_round_trips() {
        let encoded = encode_pending_code("print(1)");
        assert_eq!(decode_pending_code(&encoded), Some("print(1)"));
        assert_eq!(decode_pending_code("print(1)"), None);
    }
}
