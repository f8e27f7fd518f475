//! Command execution with wall-clock timeouts.
//!
//! All verification steps funnel through here so that output capture,
//! timeout handling, and exit-code normalization behave identically
//! everywhere.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Exit code reported for commands killed on timeout, mirroring coreutils
/// `timeout(1)`.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long to keep draining captured output after the child is gone.
/// A killed child's grandchildren can inherit the pipes and keep them open
/// indefinitely; past this point we return with whatever was captured.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Run an argv-style command in `cwd` with a timeout.
pub fn run_capture(
    program: &str,
    args: &[String],
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandResult, String> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    run_with_timeout(cmd, cwd, timeout)
}

/// Run a verbatim shell command line via `sh -c` in `cwd` with a timeout.
pub fn run_shell_capture(
    command: &str,
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandResult, String> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    run_with_timeout(cmd, cwd, timeout)
}

fn run_with_timeout(
    mut cmd: Command,
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandResult, String> {
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to spawn command: {}", e))?;

    let stdout_rx = spawn_reader(child.stdout.take());
    let stderr_rx = spawn_reader(child.stderr.take());

    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(format!("failed to wait for command: {}", e)),
        }
    };

    // Wall-clock time of the command itself; reader threads may outlive a
    // killed child whose grandchildren still hold the pipes, so they are
    // never joined, only drained with a deadline.
    let duration_ms = start.elapsed().as_millis() as u64;

    let stdout = drain_output(&stdout_rx, OUTPUT_DRAIN_GRACE);
    let stderr = drain_output(&stderr_rx, OUTPUT_DRAIN_GRACE);

    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        status.and_then(|s| s.code()).unwrap_or(-1)
    };

    Ok(CommandResult {
        exit_code,
        duration_ms,
        stdout,
        stderr,
        timed_out,
    })
}

/// Detached reader thread forwarding pipe contents in chunks. The thread
/// lives until the pipe closes; it is intentionally never joined, because a
/// grandchild of a killed command can hold the write end open for an
/// arbitrary time.
fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    std::thread::spawn(move || {
        let Some(mut reader) = source else { return };
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Collect chunks until the sender disconnects or `grace` elapses. Chunks
/// already queued are always consumed, so a finished command never loses
/// output.
fn drain_output(rx: &mpsc::Receiver<Vec<u8>>, grace: Duration) -> String {
    let deadline = Instant::now() + grace;
    let mut bytes: Vec<u8> = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(chunk) => bytes.extend_from_slice(&chunk),
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
