//! Execution tool adapter: code in, observation text out.
//!
//! The loop only ever sees the rendered observation string, never the
//! [`ExecutionResult`] behind it.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::protocol::{ExecutionResult, render_observation};
use crate::io::reasoner::ActionRequest;
use crate::io::sandbox::Engine;

/// Name of the structured action that runs a snippet.
pub const EXECUTE_TOOL_NAME: &str = "execute_python";

/// Timeout applied when the caller does not configure one.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

const EXECUTE_SCHEMA: &str = include_str!("../schemas/execute_python.schema.json");

/// Runs a snippet and reports the outcome as an observation.
pub trait SnippetRunner {
    fn run_snippet(&self, code: &str) -> String;
}

impl<R: SnippetRunner + ?Sized> SnippetRunner for &R {
    fn run_snippet(&self, code: &str) -> String {
        (**self).run_snippet(code)
    }
}

/// Adapter from an [`Engine`] to the observation protocol.
#[derive(Debug, Clone)]
pub struct CodeTool<E> {
    engine: E,
    timeout: Duration,
}

impl<E: Engine> CodeTool<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `code` and return the raw result.
    pub fn execute(&self, code: &str) -> ExecutionResult {
        self.engine.execute(code, self.timeout)
    }
}

impl<E: Engine> SnippetRunner for CodeTool<E> {
    #[instrument(skip_all, fields(code_bytes = code.len()))]
    fn run_snippet(&self, code: &str) -> String {
        let result = self.execute(code);
        let observation = render_observation(&result);
        debug!(
            succeeded = result.succeeded,
            observation_bytes = observation.len(),
            "rendered observation"
        );
        observation
    }
}

/// Extract the snippet from a structured action request.
///
/// Fails for any tool other than [`EXECUTE_TOOL_NAME`] and for arguments that
/// do not match the tool's input schema.
pub fn snippet_from_action(action: &ActionRequest) -> Result<String> {
    if action.tool != EXECUTE_TOOL_NAME {
        bail!(
            "unknown tool '{}'; the only available tool is '{EXECUTE_TOOL_NAME}'",
            action.tool
        );
    }
    validate_arguments(&action.arguments)?;
    action
        .arguments
        .get("code")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{EXECUTE_TOOL_NAME} arguments missing string field 'code'"))
}

fn validate_arguments(arguments: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(EXECUTE_SCHEMA).context("parse tool schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile tool schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(arguments)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!(
            "invalid {EXECUTE_TOOL_NAME} arguments:\n- {}",
            messages.join("\n- ")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedEngine;
    use serde_json::json;
    use std::path::PathBuf;

    fn action(tool: &str, arguments: Value) -> ActionRequest {
        ActionRequest {
            tool: tool.to_string(),
            arguments,
        }
    }

    #[test]
    fn success_without_artifact_renders_stdout() {
        let engine = ScriptedEngine::new(vec![ScriptedEngine::ok("ok\n")]);
        let tool = CodeTool::new(&engine);

        assert_eq!(
            tool.run_snippet("print(\"ok\")"),
            "Code executed successfully.\nok\n"
        );
        assert_eq!(engine.calls(), vec!["print(\"ok\")".to_string()]);
    }

    #[test]
    fn success_with_artifact_appends_path() {
        let engine = ScriptedEngine::new(vec![ScriptedEngine::with_artifact(
            "",
            PathBuf::from("/out/plot_a.html"),
        )]);
        let tool = CodeTool::new(&engine);

        assert_eq!(
            tool.run_snippet("x"),
            "Code executed successfully.\n\nGenerated plot available at: /out/plot_a.html"
        );
    }

    #[test]
    fn failure_renders_stderr() {
        let engine = ScriptedEngine::new(vec![ExecutionResult::failure("NameError: x")]);
        let tool = CodeTool::new(&engine);

        assert_eq!(
            tool.run_snippet("x"),
            "Code execution failed with error:\nNameError: x"
        );
    }

    #[test]
    fn configured_timeout_reaches_engine() {
        let engine = ScriptedEngine::new(vec![ScriptedEngine::ok("")]);
        let tool = CodeTool::new(&engine).with_timeout(Duration::from_secs(7));
        tool.run_snippet("pass");
        assert_eq!(engine.timeouts(), vec![Duration::from_secs(7)]);
    }

    #[test]
    fn default_timeout_is_thirty_seconds() {
        let engine = ScriptedEngine::new(Vec::new());
        assert_eq!(CodeTool::new(&engine).timeout(), DEFAULT_EXECUTION_TIMEOUT);
    }

    #[test]
    fn action_with_code_yields_snippet() {
        let snippet =
            snippet_from_action(&action(EXECUTE_TOOL_NAME, json!({"code": "print(1)"})))
                .expect("snippet");
        assert_eq!(snippet, "print(1)");
    }

    #[test]
    fn unknown_tool_is_rejected() {
        let err = snippet_from_action(&action("browse", json!({"url": "x"}))).unwrap_err();
        assert!(err.to_string().contains("unknown tool 'browse'"));
    }

    #[test]
    fn schema_violations_are_reported() {
        let err = snippet_from_action(&action(EXECUTE_TOOL_NAME, json!({"code": 5}))).unwrap_err();
        assert!(err.to_string().contains("invalid execute_python arguments"));

        let err =
            snippet_from_action(&action(EXECUTE_TOOL_NAME, json!({"code": "x", "extra": true})))
                .unwrap_err();
        assert!(err.to_string().contains("invalid execute_python arguments"));

        assert!(snippet_from_action(&action(EXECUTE_TOOL_NAME, Value::Null)).is_err());
    }
}
