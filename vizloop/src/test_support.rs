//! Test-only doubles for the reasoner, engine and tool seams, plus process helpers.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

use crate::core::protocol::ExecutionResult;
use crate::core::types::Turn;
use crate::io::reasoner::{Reasoner, ReasonerReply};
use crate::io::sandbox::Engine;
use crate::tool::SnippetRunner;

/// One recorded reasoner invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonerCall {
    pub preamble: String,
    pub transcript: Vec<Turn>,
}

/// Reasoner that replays a fixed script. `Err(msg)` entries fail the call.
pub struct ScriptedReasoner {
    replies: RefCell<VecDeque<std::result::Result<ReasonerReply, String>>>,
    calls: RefCell<Vec<ReasonerCall>>,
}

impl ScriptedReasoner {
    pub fn new(replies: Vec<std::result::Result<ReasonerReply, String>>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Script of plain text replies.
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            texts
                .into_iter()
                .map(|t| Ok(ReasonerReply::Text(t.into())))
                .collect(),
        )
    }

    pub fn calls(&self) -> Vec<ReasonerCall> {
        self.calls.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.borrow().len()
    }
}

impl Reasoner for ScriptedReasoner {
    fn invoke(&self, transcript: &[Turn], preamble: &str) -> Result<ReasonerReply> {
        self.calls.borrow_mut().push(ReasonerCall {
            preamble: preamble.to_string(),
            transcript: transcript.to_vec(),
        });
        match self.replies.borrow_mut().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(msg)) => Err(anyhow!(msg)),
            None => Err(anyhow!("scripted reasoner exhausted")),
        }
    }
}

/// Engine returning predetermined results and recording what it was asked to run.
pub struct ScriptedEngine {
    results: RefCell<VecDeque<ExecutionResult>>,
    calls: RefCell<Vec<(String, Duration)>>,
}

impl ScriptedEngine {
    pub fn new(results: Vec<ExecutionResult>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn ok(stdout: &str) -> ExecutionResult {
        ExecutionResult {
            succeeded: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
            artifact_path: None,
            timed_out: false,
            exit_code: Some(0),
            duration: Duration::from_millis(1),
        }
    }

    pub fn with_artifact(stdout: &str, path: PathBuf) -> ExecutionResult {
        ExecutionResult {
            artifact_path: Some(path),
            ..Self::ok(stdout)
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.calls.borrow().iter().map(|(_, t)| *t).collect()
    }
}

impl Engine for ScriptedEngine {
    fn execute(&self, code: &str, timeout: Duration) -> ExecutionResult {
        self.calls.borrow_mut().push((code.to_string(), timeout));
        self.results
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| ExecutionResult::failure("scripted engine exhausted"))
    }
}

/// Tool returning predetermined observation strings.
pub struct ScriptedTool {
    observations: RefCell<VecDeque<String>>,
    snippets: RefCell<Vec<String>>,
}

impl ScriptedTool {
    pub fn new<I, S>(observations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            observations: RefCell::new(observations.into_iter().map(Into::into).collect()),
            snippets: RefCell::new(Vec::new()),
        }
    }

    pub fn snippets(&self) -> Vec<String> {
        self.snippets.borrow().clone()
    }
}

impl SnippetRunner for ScriptedTool {
    fn run_snippet(&self, code: &str) -> String {
        self.snippets.borrow_mut().push(code.to_string());
        self.observations
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| "Code execution failed with error:\nscripted tool exhausted".into())
    }
}

/// True when `python3` can be launched on this machine.
pub fn python3_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// True while `pid` names a live, non-zombie process.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let stat = PathBuf::from(format!("/proc/{pid}/stat"));
    if PathBuf::from("/proc/self/stat").exists() {
        return match std::fs::read_to_string(&stat) {
            // Field 3 is the state; the command name in field 2 may contain spaces.
            Ok(contents) => contents
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z" && state != "X"),
            Err(_) => false,
        };
    }
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Poll until `pid` is gone, for up to two seconds.
#[cfg(unix)]
pub fn wait_until_gone(pid: u32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if !process_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}
