//! Supervision of the runtime or emulator process.
//!
//! On a terminal the child inherits stdio. Otherwise its output goes through
//! a pseudo-terminal whose master side is polled with a bounded wait, so a
//! silent child never stalls the loop and buffered output is drained once
//! it exits.

use std::fs::File;
use std::io::{self, IsTerminal, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, ExitStatus, Stdio};

use burrow_common::constants::POLL_INTERVAL_SECS;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::error::RunError;
use crate::filebind::FileBinding;

/// Runs `cmd` to completion and releases `binding` afterwards.
///
/// Stdio is inherited when standard output is a terminal; otherwise the
/// output is streamed to standard output through a pseudo-terminal.
///
/// # Errors
///
/// Returns [`RunError::Launch`] if the process cannot be started.
pub fn supervise(cmd: &mut Command, binding: Option<&mut dyn FileBinding>) -> Result<i32, RunError> {
    if io::stdout().is_terminal() {
        run_interactive(cmd, binding)
    } else {
        run_streamed(cmd, binding)
    }
}

/// Runs `cmd` with inherited stdio, waits for it and releases `binding`.
///
/// # Errors
///
/// Returns [`RunError::Launch`] if the process cannot be started or waited on.
pub fn run_interactive(cmd: &mut Command, binding: Option<&mut dyn FileBinding>) -> Result<i32, RunError> {
    let result = cmd.status().map(exit_code).map_err(|e| launch_error(cmd, e));
    release(binding);
    result
}

/// Runs `cmd` with its output streamed to standard output and releases
/// `binding`, whatever the outcome.
///
/// # Errors
///
/// Returns [`RunError::Launch`] if the process cannot be started or reaped.
pub fn run_streamed(cmd: &mut Command, binding: Option<&mut dyn FileBinding>) -> Result<i32, RunError> {
    let result = run_streamed_to(cmd, &mut io::stdout().lock());
    release(binding);
    result
}

/// Runs `cmd` with its output on a pseudo-terminal copied to `sink`.
///
/// The loop ends when the child exits or the terminal hangs up; remaining
/// output is drained and a child still unreaped is sent `SIGTERM` and reaped.
///
/// # Errors
///
/// Returns [`RunError::Launch`] if the terminal cannot be opened or the
/// process cannot be started or reaped.
pub fn run_streamed_to(cmd: &mut Command, sink: &mut dyn Write) -> Result<i32, RunError> {
    let pty = nix::pty::openpty(None, None).map_err(|e| launch_error(cmd, e.into()))?;
    let stdout = pty.slave.try_clone().map_err(|e| launch_error(cmd, e))?;
    let _ = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(pty.slave));
    let spawned = cmd.spawn();
    // Drop the command's copies of the slave so the master sees a hangup.
    let _ = cmd.stdout(Stdio::null()).stderr(Stdio::null());
    let mut child = spawned.map_err(|e| launch_error(cmd, e))?;
    tracing::debug!(pid = child.id(), "child started on pty");

    let mut master = File::from(pty.master);
    let status = stream(&mut child, &mut master, sink);
    drain(&mut master, sink);
    let status = match status {
        Some(status) => status,
        None => {
            terminate(&child);
            child.wait().map_err(|e| launch_error(cmd, e))?
        }
    };
    let _ = sink.flush();
    Ok(exit_code(status))
}

/// Copies output until the child exits (returning its status) or the
/// terminal hangs up (returning `None`).
fn stream(child: &mut Child, master: &mut File, sink: &mut dyn Write) -> Option<ExitStatus> {
    let timeout = PollTimeout::from(POLL_INTERVAL_SECS * 1000);
    let mut buf = [0u8; 4096];
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "child status unavailable");
                return None;
            }
        }
        let mut fds = [PollFd::new(master.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) | Err(nix::errno::Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "poll failed");
                return None;
            }
        }
        let events = fds[0].revents().unwrap_or_else(PollFlags::empty);
        if events.contains(PollFlags::POLLIN) {
            match master.read(&mut buf) {
                Ok(n) if n > 0 => {
                    let _ = sink.write_all(&buf[..n]);
                    continue;
                }
                _ => return None,
            }
        }
        if events.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
            return None;
        }
    }
}

/// Copies whatever is still buffered in the terminal without blocking.
fn drain(master: &mut File, sink: &mut dyn Write) {
    let mut buf = [0u8; 4096];
    loop {
        let mut fds = [PollFd::new(master.as_fd(), PollFlags::POLLIN)];
        let ready = matches!(poll(&mut fds, PollTimeout::ZERO), Ok(n) if n > 0)
            && fds[0].revents().is_some_and(|e| e.contains(PollFlags::POLLIN));
        if !ready {
            return;
        }
        match master.read(&mut buf) {
            Ok(n) if n > 0 => {
                let _ = sink.write_all(&buf[..n]);
            }
            _ => return,
        }
    }
}

fn release(binding: Option<&mut dyn FileBinding>) {
    if let Some(binding) = binding {
        binding.finish();
    }
}

fn terminate(child: &Child) {
    if let Ok(pid) = i32::try_from(child.id()) {
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
}

/// Maps an exit status to a shell-style code: the exit code, or
/// `128 + signal` when the process was killed.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

fn launch_error(cmd: &Command, source: io::Error) -> RunError {
    RunError::Launch {
        program: cmd.get_program().to_string_lossy().into_owned(),
        source,
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant};

    use burrow_common::error::Result as BurrowResult;

    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        let _ = cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn output_is_streamed_and_status_returned() {
        let mut out = Vec::new();
        let code = run_streamed_to(&mut sh("echo hello; echo oops >&2; exit 3"), &mut out).expect("run");
        assert_eq!(code, 3);
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("hello"));
        assert!(text.contains("oops"));
    }

    #[test]
    fn silent_child_exit_is_observed_promptly() {
        let mut out = Vec::new();
        let started = Instant::now();
        let code = run_streamed_to(&mut sh("sleep 1"), &mut out).expect("run");
        assert_eq!(code, 0);
        assert!(started.elapsed() < Duration::from_secs(u64::from(POLL_INTERVAL_SECS) + 2));
    }

    #[test]
    fn signal_death_maps_above_128() {
        let mut out = Vec::new();
        let code = run_streamed_to(&mut sh("kill -9 $$"), &mut out).expect("run");
        assert_eq!(code, 128 + 9);
    }

    struct CountingBinding {
        finished: usize,
    }

    impl FileBinding for CountingBinding {
        fn start(&mut self, _system_files: &[PathBuf]) -> BurrowResult<(PathBuf, PathBuf)> {
            Ok((PathBuf::new(), PathBuf::new()))
        }
        fn set_file(&mut self, _host_file: &Path, _cont_file: &Path) -> BurrowResult<()> {
            Ok(())
        }
        fn add_file(&mut self, _host_file: &Path, _cont_file: &Path) -> BurrowResult<()> {
            Ok(())
        }
        fn get_path(&self, _cont_file: &Path) -> PathBuf {
            PathBuf::new()
        }
        fn finish(&mut self) {
            self.finished += 1;
        }
    }

    #[test]
    fn binding_is_released_on_success_and_launch_failure() {
        let mut binding = CountingBinding { finished: 0 };
        let code = run_interactive(&mut sh("exit 4"), Some(&mut binding)).expect("run");
        assert_eq!(code, 4);
        assert_eq!(binding.finished, 1);

        let result = run_streamed(&mut Command::new("/nonexistent/burrow-runtime"), Some(&mut binding));
        assert!(result.is_err());
        assert_eq!(binding.finished, 2);
    }

    #[test]
    fn missing_program_is_a_launch_error() {
        let mut out = Vec::new();
        let result = run_streamed_to(&mut Command::new("/nonexistent/burrow-runtime"), &mut out);
        assert!(matches!(result, Err(RunError::Launch { .. })));
    }
}
