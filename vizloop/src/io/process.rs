//! Helpers for running child processes with hard deadlines and captured output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::cancel::CancelToken;

/// How long readers may keep draining pipes after the child is gone.
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Wait slice between cancellation checks.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// Killed because the caller's [`CancelToken`] fired.
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

type SharedCapture = Arc<Mutex<Captured>>;

/// How the wait on the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Waited {
    Exited,
    TimedOut,
    Cancelled,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// The child runs in its own process group. On timeout the whole group is killed; after a
/// normal exit any descendants left in the group are killed as well. Output is read
/// concurrently; `output_limit_bytes` bounds what is kept in memory (the rest is drained and
/// discarded). Readers get [`DRAIN_GRACE`] after the child is gone, then whatever was captured
/// is returned.
///
/// With a `cancel` token the wait wakes up every few milliseconds; once the token fires the
/// group is killed and reaped, and the output comes back with `cancelled` set.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: Option<&CancelToken>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    debug!(program = ?cmd.get_program(), "spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // Written off-thread so a child that never reads stdin cannot stall the deadline.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                debug!(err = %e, "child closed stdin early");
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (done_tx, done_rx) = mpsc::channel();
    let stdout_capture = spawn_reader(stdout, output_limit_bytes, done_tx.clone());
    let stderr_capture = spawn_reader(stderr, output_limit_bytes, done_tx);

    let (status, waited) = match wait_with_deadline(&mut child, timeout, cancel) {
        Ok(result) => result,
        Err(err) => {
            kill_tree(&mut child);
            return Err(err);
        }
    };
    let elapsed = started.elapsed();

    wait_for_readers(&done_rx, 2);
    let (stdout, stdout_truncated) = take_capture(&stdout_capture);
    let (stderr, stderr_truncated) = take_capture(&stderr_capture);

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(
        exit_code = ?status.code(),
        ?waited,
        elapsed_ms = elapsed.as_millis() as u64,
        "command finished"
    );
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out: waited == Waited::TimedOut,
        cancelled: waited == Waited::Cancelled,
        elapsed,
    })
}

/// Block until the child exits, the deadline fires or `cancel` is set; on expiry or
/// cancellation kill the tree and reap.
fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
    cancel: Option<&CancelToken>,
) -> Result<(ExitStatus, Waited)> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let slice = if cancel.is_some() {
            left.min(CANCEL_POLL)
        } else {
            left
        };
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            // The leader is gone; take down anything it left behind in its group.
            kill_process_group(child.id());
            return Ok((status, Waited::Exited));
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            warn!(pid = child.id(), "command cancelled, killing process tree");
            kill_tree(child);
            let status = child.wait().context("wait command after kill")?;
            return Ok((status, Waited::Cancelled));
        }
        if Instant::now() >= deadline {
            warn!(
                timeout_secs = timeout.as_secs(),
                pid = child.id(),
                "command timed out, killing process tree"
            );
            kill_tree(child);
            let status = child.wait().context("wait command after kill")?;
            return Ok((status, Waited::TimedOut));
        }
    }
}

fn kill_tree(child: &mut Child) {
    kill_process_group(child.id());
    if let Err(e) = child.kill() {
        debug!(err = %e, "kill after group kill failed (already exited)");
    }
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

/// SIGKILL every process in the group led by `pid`. Missing groups are ignored.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    let target = format!("-{pid}");
    let result = Command::new("kill")
        .args(["-KILL", "--", &target])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match result {
        Ok(status) if status.success() => debug!(pgid = pid, "killed process group"),
        Ok(_) => {}
        Err(e) => warn!(err = %e, pgid = pid, "could not run kill for process group"),
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) {}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
    done: Sender<()>,
) -> SharedCapture {
    let capture = SharedCapture::default();
    let sink = Arc::clone(&capture);
    thread::spawn(move || {
        read_stream_limited(reader, limit, &sink);
        let _ = done.send(());
    });
    capture
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize, sink: &Mutex<Captured>) {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(err = %e, "output reader stopped");
                break;
            }
        };
        let Ok(mut captured) = sink.lock() else {
            break;
        };
        let remaining = limit.saturating_sub(captured.bytes.len());
        let keep = n.min(remaining);
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.truncated += n - keep;
    }
}

fn wait_for_readers(done: &Receiver<()>, readers: usize) {
    let deadline = Instant::now() + DRAIN_GRACE;
    for _ in 0..readers {
        let left = deadline.saturating_duration_since(Instant::now());
        if done.recv_timeout(left).is_err() {
            warn!(
                grace_ms = DRAIN_GRACE.as_millis() as u64,
                "output pipes still open after drain grace, returning partial output"
            );
            return;
        }
    }
}

fn take_capture(capture: &SharedCapture) -> (Vec<u8>, usize) {
    match capture.lock() {
        Ok(mut captured) => (std::mem::take(&mut captured.bytes), captured.truncated),
        Err(poisoned) => {
            let mut captured = poisoned.into_inner();
            (std::mem::take(&mut captured.bytes), captured.truncated)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::wait_until_gone;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn read_pid(path: &std::path::Path) -> u32 {
        std::fs::read_to_string(path)
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid")
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let output = run_command_with_timeout(
            sh("echo out; echo err >&2"),
            None,
            Duration::from_secs(5),
            1024,
            None,
        )
        .expect("run");
        assert!(output.status.success());
        assert!(!output.timed_out);
        assert!(!output.cancelled);
        assert_eq!(output.stdout_lossy(), "out\n");
        assert_eq!(output.stderr_lossy(), "err\n");
    }

    #[test]
    fn feeds_stdin() {
        let output = run_command_with_timeout(
            sh("cat"),
            Some(b"hello"),
            Duration::from_secs(5),
            1024,
            None,
        )
        .expect("run");
        assert_eq!(output.stdout, b"hello");
    }

    #[test]
    fn reports_non_zero_exit() {
        let output = run_command_with_timeout(sh("exit 7"), None, Duration::from_secs(5), 1024, None)
            .expect("run");
        assert_eq!(output.status.code(), Some(7));
    }

    #[test]
    fn truncates_beyond_limit() {
        let output = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(5),
            4,
            None,
        )
        .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
    }

    #[test]
    fn timeout_kills_child_and_grandchildren() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pid_file = temp.path().join("grandchild.pid");
        let script = format!(
            "echo started; sleep 30 & echo $! > '{}'; wait",
            pid_file.display()
        );

        let started = Instant::now();
        let output = run_command_with_timeout(
            sh(&script),
            None,
            Duration::from_millis(300),
            1024,
            None,
        )
        .expect("run");

        assert!(output.timed_out);
        assert!(!output.status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(output.stdout_lossy(), "started\n");
        assert!(wait_until_gone(read_pid(&pid_file)), "grandchild should be gone");
    }

    #[test]
    fn normal_exit_kills_background_descendants() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pid_file = temp.path().join("background.pid");
        let script = format!(
            "sleep 30 & echo $! > '{}'; echo done",
            pid_file.display()
        );

        let started = Instant::now();
        let output =
            run_command_with_timeout(sh(&script), None, Duration::from_secs(10), 1024, None)
                .expect("run");

        // The background sleep holds stdout open; returning before the drain
        // grace means the group kill closed it.
        assert!(started.elapsed() < DRAIN_GRACE);
        assert!(output.status.success());
        assert!(!output.timed_out);
        assert_eq!(output.stdout_lossy(), "done\n");
        assert!(wait_until_gone(read_pid(&pid_file)), "background sleep should be gone");
    }

    #[test]
    fn cancel_kills_group_before_deadline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pid_file = temp.path().join("grandchild.pid");
        let script = format!(
            "echo started; sleep 30 & echo $! > '{}'; wait",
            pid_file.display()
        );
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let watched = pid_file.clone();
        let canceller = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            let written = || {
                std::fs::read_to_string(&watched).is_ok_and(|pid| pid.ends_with('\n'))
            };
            while !written() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            trigger.cancel();
        });

        let started = Instant::now();
        let output = run_command_with_timeout(
            sh(&script),
            None,
            Duration::from_secs(60),
            1024,
            Some(&cancel),
        )
        .expect("run");
        canceller.join().expect("canceller thread");

        assert!(output.cancelled);
        assert!(!output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(output.stdout_lossy(), "started\n");
        assert!(wait_until_gone(read_pid(&pid_file)), "grandchild should be gone");
    }

    #[test]
    fn already_cancelled_token_stops_at_first_check() {
        let cancel = CancelToken::new();
        cancel.cancel();

        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 30"),
            None,
            Duration::from_secs(60),
            1024,
            Some(&cancel),
        )
        .expect("run");

        assert!(output.cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_command_with_timeout(
            Command::new("/nonexistent/definitely-not-here"),
            None,
            Duration::from_secs(1),
            16,
            None,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("spawn"));
    }
}
