//! Execution engine: runs one untrusted snippet in a scoped, throwaway workspace.
//!
//! One invocation is one scope: acquire a workspace, run the interpreter under
//! a hard deadline, relocate the artifact, release the workspace. The
//! workspace is a [`TempDir`], so release also happens on early returns and
//! unwinding.

use std::ffi::OsString;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;
use tracing::{debug, error, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::protocol::ExecutionResult;
use crate::io::artifact::{find_artifact, relocate_artifact};
use crate::io::config::EngineConfig;
use crate::io::process::run_command_with_timeout;

/// Name of the materialized snippet inside the workspace.
pub const SCRIPT_FILE_NAME: &str = "script.py";

const WORKSPACE_PREFIX: &str = "vizloop-ws-";

const CANCELLED_MESSAGE: &str = "execution cancelled";

/// Abstraction over snippet execution backends.
pub trait Engine {
    /// Run `code` with a wall-clock ceiling. Never fails: every problem is
    /// reported as an unsuccessful [`ExecutionResult`].
    fn execute(&self, code: &str, timeout: Duration) -> ExecutionResult;
}

impl<E: Engine + ?Sized> Engine for &E {
    fn execute(&self, code: &str, timeout: Duration) -> ExecutionResult {
        (**self).execute(code, timeout)
    }
}

/// Settings for a [`Sandbox`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxOptions {
    /// Interpreter argv; the script name is appended.
    pub interpreter: Vec<String>,
    /// Persistent, shared artifact directory.
    pub output_dir: PathBuf,
    /// Where workspaces are created (system temp dir when `None`).
    pub workspace_parent: Option<PathBuf>,
    /// Host variables copied into the restricted environment when set.
    pub env_passthrough: Vec<String>,
}

impl SandboxOptions {
    pub fn from_config(
        engine: &EngineConfig,
        output_dir: &Path,
        workspace_parent: Option<&Path>,
    ) -> Self {
        Self {
            interpreter: engine.interpreter.clone(),
            output_dir: output_dir.to_path_buf(),
            workspace_parent: workspace_parent.map(Path::to_path_buf),
            env_passthrough: engine.env_passthrough.clone(),
        }
    }
}

/// Process-level sandbox backed by a local interpreter.
#[derive(Debug, Clone)]
pub struct Sandbox {
    options: SandboxOptions,
    cancel: Option<CancelToken>,
}

impl Sandbox {
    /// Validate options and create the output directory.
    pub fn new(mut options: SandboxOptions) -> Result<Self> {
        let program = options
            .interpreter
            .first()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| anyhow!("interpreter must be a non-empty array"))?;
        debug!(interpreter = %program, "configuring sandbox");

        fs::create_dir_all(&options.output_dir)
            .with_context(|| format!("create output dir {}", options.output_dir.display()))?;
        options.output_dir = fs::canonicalize(&options.output_dir)
            .with_context(|| format!("resolve output dir {}", options.output_dir.display()))?;
        if let Some(parent) = options.workspace_parent.take() {
            fs::create_dir_all(&parent)
                .with_context(|| format!("create workspace parent {}", parent.display()))?;
            let parent = fs::canonicalize(&parent)
                .with_context(|| format!("resolve workspace parent {}", parent.display()))?;
            options.workspace_parent = Some(parent);
        }
        Ok(Self {
            options,
            cancel: None,
        })
    }

    /// Stop a running snippet (and its process group) once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.options.output_dir
    }

    fn try_execute(&self, code: &str, timeout: Duration) -> Result<ExecutionResult> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Ok(ExecutionResult::failure(CANCELLED_MESSAGE));
        }
        let workspace = Workspace::create(self.options.workspace_parent.as_deref())?;
        workspace.write_script(code)?;

        let cmd = self.build_command(workspace.path());
        let output = match run_command_with_timeout(
            cmd,
            None,
            timeout,
            usize::MAX,
            self.cancel.as_ref(),
        ) {
            Ok(output) => output,
            Err(err) => {
                error!(err = %format!("{err:#}"), "interpreter launch failed");
                workspace.release();
                return Ok(ExecutionResult::failure(format!(
                    "failed to launch interpreter '{}': {err:#}",
                    self.options.interpreter.join(" ")
                )));
            }
        };

        let stdout = output.stdout_lossy();
        if output.cancelled {
            warn!("snippet cancelled");
            workspace.release();
            return Ok(ExecutionResult {
                stdout,
                duration: output.elapsed,
                ..ExecutionResult::failure(CANCELLED_MESSAGE)
            });
        }
        if output.timed_out {
            warn!(timeout_ms = timeout.as_millis() as u64, "snippet timed out");
            workspace.release();
            return Ok(ExecutionResult {
                succeeded: false,
                stdout,
                stderr: format!("execution timed out after {}", format_timeout(timeout)),
                artifact_path: None,
                timed_out: true,
                exit_code: None,
                duration: output.elapsed,
            });
        }

        let mut result = ExecutionResult {
            succeeded: output.status.success(),
            stdout,
            stderr: output.stderr_lossy(),
            artifact_path: None,
            timed_out: false,
            exit_code: output.status.code(),
            duration: output.elapsed,
        };

        if let Some(artifact) = find_artifact(workspace.path()) {
            match relocate_artifact(&artifact, &self.options.output_dir) {
                Ok(path) => result.artifact_path = Some(path),
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "artifact relocation failed");
                    result.succeeded = false;
                    if !result.stderr.is_empty() && !result.stderr.ends_with('\n') {
                        result.stderr.push('\n');
                    }
                    result
                        .stderr
                        .push_str(&format!("failed to capture {}: {err:#}", artifact.display()));
                }
            }
        }

        workspace.release();
        Ok(result)
    }

    fn build_command(&self, workspace: &Path) -> Command {
        let mut argv = self.options.interpreter.iter();
        let program = argv.next().map_or("python3", String::as_str);
        let mut cmd = Command::new(program);
        cmd.args(argv)
            .arg(SCRIPT_FILE_NAME)
            .current_dir(workspace)
            .env_clear()
            .envs(restricted_env(workspace, &self.options.env_passthrough));
        cmd
    }
}

impl Engine for Sandbox {
    #[instrument(skip_all, fields(code_bytes = code.len(), timeout_ms = timeout.as_millis() as u64))]
    fn execute(&self, code: &str, timeout: Duration) -> ExecutionResult {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.try_execute(code, timeout)));
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                error!(err = %format!("{err:#}"), "sandbox error");
                ExecutionResult::failure(format!("sandbox error: {err:#}"))
            }
            Err(_) => {
                error!("sandbox panicked");
                ExecutionResult::failure("sandbox error: internal panic during execution")
            }
        };
        info!(
            succeeded = result.succeeded,
            timed_out = result.timed_out,
            artifact = ?result.artifact_path,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "snippet executed"
        );
        result
    }
}

/// Ephemeral working directory owned by exactly one invocation.
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn create(parent: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKSPACE_PREFIX);
        let dir = match parent {
            Some(parent) => builder
                .tempdir_in(parent)
                .with_context(|| format!("create workspace in {}", parent.display()))?,
            None => builder.tempdir().context("create workspace")?,
        };
        let workspace = Self { dir };
        for sub in scratch_dirs() {
            let path = workspace.path().join(sub);
            fs::create_dir_all(&path)
                .with_context(|| format!("create workspace dir {}", path.display()))?;
        }
        debug!(path = %workspace.path().display(), "workspace created");
        Ok(workspace)
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn write_script(&self, code: &str) -> Result<PathBuf> {
        let path = self.path().join(SCRIPT_FILE_NAME);
        fs::write(&path, code).with_context(|| format!("write script {}", path.display()))?;
        Ok(path)
    }

    /// Remove the workspace now, logging instead of failing.
    fn release(self) {
        let path = self.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(err = %e, path = %path.display(), "failed to remove workspace");
        } else {
            debug!(path = %path.display(), "workspace removed");
        }
    }
}

fn scratch_dirs() -> [&'static str; 4] {
    ["tmp", ".config", ".cache", ".local/share"]
}

/// Environment for the snippet: selected host variables, with every home and
/// config location pointed inside the workspace.
pub fn restricted_env(workspace: &Path, passthrough: &[String]) -> Vec<(OsString, OsString)> {
    let mut env: Vec<(OsString, OsString)> = passthrough
        .iter()
        .filter_map(|key| std::env::var_os(key).map(|value| (OsString::from(key), value)))
        .collect();

    let ws = workspace.as_os_str().to_os_string();
    let tmp = workspace.join("tmp").into_os_string();
    let fixed: [(&str, OsString); 12] = [
        ("HOME", ws.clone()),
        ("USERPROFILE", ws),
        ("XDG_CONFIG_HOME", workspace.join(".config").into_os_string()),
        ("XDG_CACHE_HOME", workspace.join(".cache").into_os_string()),
        ("XDG_DATA_HOME", workspace.join(".local/share").into_os_string()),
        ("MPLCONFIGDIR", workspace.join(".config").into_os_string()),
        ("TMPDIR", tmp.clone()),
        ("TMP", tmp.clone()),
        ("TEMP", tmp),
        ("PYTHONDONTWRITEBYTECODE", OsString::from("1")),
        ("PYTHONUNBUFFERED", OsString::from("1")),
        ("PYTHONIOENCODING", OsString::from("utf-8")),
    ];
    env.extend(fixed.into_iter().map(|(k, v)| (OsString::from(k), v)));
    env
}

fn format_timeout(timeout: Duration) -> String {
    if timeout.subsec_nanos() == 0 {
        format!("{}s", timeout.as_secs())
    } else {
        format!("{:.3}s", timeout.as_secs_f64())
    }
}
