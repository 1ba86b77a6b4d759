//! Shared subprocess-timeout enforcement for external CLI calls (`git`,
//! `gh`). Polls `Child::try_wait` rather than blocking on `Command::output`,
//! so the §5 30-second external-call ceiling is an actual kill, not just a
//! documented constant.
//!
//! Grounded on the same `sipag-core/src/worker/docker_runtime.rs` "shell out,
//! check exit status" idiom `worktree.rs`/`code_host.rs` already cite; no
//! example in this workspace pulls in a timeout crate (`wait-timeout` et
//! al.), so this stays on `std::process` rather than adding one.

use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Run `cmd`, killing it and returning an error if it hasn't exited within
/// `timeout`. On success or ordinary failure, behaves like `Command::output`.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> std::io::Result<Output> {
    let mut child = cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()?;
    let start = Instant::now();

    loop {
        if let Some(status) = child.try_wait()? {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(mut out) = child.stdout.take() {
                out.read_to_end(&mut stdout)?;
            }
            if let Some(mut err) = child.stderr.take() {
                err.read_to_end(&mut stderr)?;
            }
            return Ok(Output { status, stdout, stderr });
        }

        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("command timed out after {timeout:?}"),
            ));
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_command_completes_normally() {
        let mut cmd = Command::new("echo");
        cmd.arg("hi");
        let out = run_with_timeout(cmd, Duration::from_secs(5)).unwrap();
        assert!(out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hi");
    }

    #[test]
    fn slow_command_is_killed_and_errors() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = run_with_timeout(cmd, Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }
}
