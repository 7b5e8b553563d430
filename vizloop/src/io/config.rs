//! Run configuration stored in `vizloop.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "vizloop.toml";

/// Loop configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values the
/// CLI uses when no file exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VizloopConfig {
    /// Maximum number of Plan/Act/Observe cycles per run.
    pub iteration_limit: u32,

    /// Wall-clock ceiling for one snippet execution, in seconds.
    pub execution_timeout_secs: u64,

    /// Persistent directory receiving relocated artifacts.
    pub output_dir: PathBuf,

    /// Parent directory for ephemeral workspaces (system temp when unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_parent: Option<PathBuf>,

    /// Also write logs to this file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    pub engine: EngineConfig,

    pub reasoner: ReasonerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Interpreter argv (e.g. `["python3","-u"]`); the script name is appended.
    pub interpreter: Vec<String>,

    /// Host environment variables copied into the sandbox when set.
    pub env_passthrough: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string(), "-u".to_string()],
            env_passthrough: ["PATH", "LANG", "LC_ALL", "LC_CTYPE", "TZ", "SYSTEMROOT"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReasonerConfig {
    /// Command that reads a prompt on stdin and answers on stdout.
    pub command: Vec<String>,

    /// Deadline for one reasoner invocation, in seconds.
    pub timeout_secs: u64,

    /// Truncate reasoner stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm".to_string()],
            timeout_secs: 300,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for VizloopConfig {
    fn default() -> Self {
        Self {
            iteration_limit: 5,
            execution_timeout_secs: 30,
            output_dir: PathBuf::from("output"),
            workspace_parent: None,
            log_file: None,
            engine: EngineConfig::default(),
            reasoner: ReasonerConfig::default(),
        }
    }
}

impl VizloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.iteration_limit == 0 {
            return Err(anyhow!("iteration_limit must be > 0"));
        }
        if self.execution_timeout_secs == 0 {
            return Err(anyhow!("execution_timeout_secs must be > 0"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(anyhow!("output_dir must not be empty"));
        }
        if self.engine.interpreter.is_empty() || self.engine.interpreter[0].trim().is_empty() {
            return Err(anyhow!("engine.interpreter must be a non-empty array"));
        }
        if self.reasoner.command.is_empty() || self.reasoner.command[0].trim().is_empty() {
            return Err(anyhow!("reasoner.command must be a non-empty array"));
        }
        if self.reasoner.timeout_secs == 0 {
            return Err(anyhow!("reasoner.timeout_secs must be > 0"));
        }
        if self.reasoner.output_limit_bytes == 0 {
            return Err(anyhow!("reasoner.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `VizloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<VizloopConfig> {
    if !path.exists() {
        let cfg = VizloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: VizloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &VizloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
