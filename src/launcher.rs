//! Check launcher: runs one check under a pseudo-terminal.
//!
//! The check's stdout and stderr are both attached to the PTY slave, so
//! color and other terminal-only behavior matches what an operator would
//! see. A reader thread pumps bytes from the PTY master into a channel; the
//! launching thread races that channel against the liveness monitor's
//! silence deadline with `recv_timeout`. Once the PTY reaches EOF the same
//! deadline bounds the wait for the process itself, so a check that closes
//! its output and keeps running is still killed. A stalled check's process
//! group is killed and reaped before `launch` returns.

use std::io::{Read, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use portable_pty::{Child, CommandBuilder, ExitStatus, PtySize, native_pty_system};
use tracing::{debug, info, warn};

use crate::catalog::CheckSpec;
use crate::monitor::{LivenessMonitor, MonitorState};

/// Poll interval for the exit status after the PTY has closed.
const EXIT_POLL: Duration = Duration::from_millis(50);

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The check closed its output and exited on its own.
    Exited { success: bool },
    /// The liveness monitor killed the check after a silent interval.
    Killed { silent_for: Duration },
}

/// Captured result of one launch.
#[derive(Debug, Clone)]
pub struct LaunchResult {
    /// Every byte the check wrote, unmodified.
    pub output: Vec<u8>,
    pub termination: Termination,
}

impl LaunchResult {
    /// Whether the process exited on its own (as opposed to being killed).
    pub fn exited(&self) -> bool {
        matches!(self.termination, Termination::Exited { .. })
    }

    /// Output decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Runs a check and reports its captured output.
///
/// The batch coordinator drives checks through this seam, so scripted
/// runners can stand in for real processes.
pub trait CheckRunner {
    fn run(&mut self, spec: &CheckSpec) -> Result<LaunchResult>;
}

/// Launch settings shared by every check in a batch.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub silence_timeout: Duration,
    /// Mirror check output to our stdout while capturing.
    pub echo: bool,
    pub pty_size: PtySize,
    /// Extra environment for every check (side-channel coordinates).
    pub env: Vec<(String, String)>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            silence_timeout: Duration::from_secs(60),
            echo: true,
            pty_size: PtySize {
                rows: 24,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            },
            env: vec![],
        }
    }
}

/// The production runner: real processes under a real PTY.
pub struct PtyLauncher {
    config: LaunchConfig,
}

impl PtyLauncher {
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }
}

impl CheckRunner for PtyLauncher {
    fn run(&mut self, spec: &CheckSpec) -> Result<LaunchResult> {
        launch(spec, &self.config)
    }
}

/// Run one check to completion or until it stalls.
pub fn launch(spec: &CheckSpec, config: &LaunchConfig) -> Result<LaunchResult> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(config.pty_size)
        .context("failed to open PTY")?;

    let mut cmd = CommandBuilder::new(&spec.program);
    for arg in &spec.args {
        cmd.arg(arg);
    }
    cmd.cwd(&spec.work_dir);
    for (key, val) in &config.env {
        cmd.env(key, val);
    }

    info!(
        check = %spec.id,
        program = %spec.program,
        timeout_secs = config.silence_timeout.as_secs_f64(),
        "launching check in PTY"
    );

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("failed to spawn check '{}'", spec.id))?;

    // Only the child holds the slave from here on; EOF on the master means
    // every writer is gone.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .context("failed to clone PTY reader")?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let pump = thread::spawn(move || pump_output(reader, tx));

    let mut monitor = LivenessMonitor::new(config.silence_timeout, Instant::now());
    let mut output = Vec::new();
    let mut stdout = std::io::stdout();

    loop {
        match rx.recv_timeout(monitor.remaining(Instant::now())) {
            Ok(chunk) => {
                monitor.on_output(chunk.len(), Instant::now());
                if config.echo {
                    let _ = stdout.write_all(&chunk);
                    let _ = stdout.flush();
                }
                output.extend_from_slice(&chunk);
            }
            Err(RecvTimeoutError::Timeout) => {
                if monitor.tick(Instant::now()).is_terminal() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = match monitor.state() {
        MonitorState::TimedOut { .. } => None,
        _ => await_exit(child.as_mut(), &mut monitor, &spec.id)?,
    };

    let Some(status) = status else {
        let silent_for = match monitor.state() {
            MonitorState::TimedOut { silent_for } => silent_for,
            _ => monitor.threshold(),
        };
        warn!(
            check = %spec.id,
            silent_secs = silent_for.as_secs(),
            bytes = monitor.bytes_seen(),
            "check produced no output within the inactivity window; killing"
        );
        terminate(child.as_mut(), &spec.id)?;
        // Closing the master unblocks the pump if anything still holds the slave.
        drop(pair.master);
        if pump.is_finished() {
            let _ = pump.join();
        }
        return Ok(LaunchResult {
            output,
            termination: Termination::Killed { silent_for },
        });
    };

    let _ = pump.join();
    info!(
        check = %spec.id,
        success = status.success(),
        bytes = output.len(),
        "check exited"
    );
    Ok(LaunchResult {
        output,
        termination: Termination::Exited {
            success: status.success(),
        },
    })
}

/// Wait for the check to exit after its output closed, still bounded by the
/// silence window. `None` means the window ran out first.
fn await_exit(
    child: &mut (dyn Child + Send + Sync),
    monitor: &mut LivenessMonitor,
    check_id: &str,
) -> Result<Option<ExitStatus>> {
    loop {
        let polled = child
            .try_wait()
            .with_context(|| format!("failed to poll check '{check_id}'"))?;
        if let Some(status) = polled {
            monitor.on_exit();
            return Ok(Some(status));
        }
        let now = Instant::now();
        if monitor.tick(now).is_terminal() {
            return Ok(None);
        }
        thread::sleep(monitor.remaining(now).min(EXIT_POLL));
    }
}

fn pump_output(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                // Linux reports EIO once the last slave descriptor closes.
                debug!("PTY read ended: {e}");
                break;
            }
        };
        if tx.send(buf[..n].to_vec()).is_err() {
            break;
        }
    }
}

/// Kill the check's whole process group, then reap it.
fn terminate(child: &mut (dyn Child + Send + Sync), check_id: &str) -> Result<()> {
    #[cfg(unix)]
    if let Some(pid) = child.process_id() {
        // The PTY spawn makes the check a session leader, so its pid is
        // also its process group id.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            debug!(
                check = check_id,
                error = %std::io::Error::last_os_error(),
                "killpg failed; falling back to direct kill"
            );
        }
    }
    if let Err(e) = child.kill() {
        debug!(check = check_id, error = %e, "kill after killpg reported an error");
    }
    child
        .wait()
        .with_context(|| format!("failed to reap killed check '{check_id}'"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shell_check(id: &str, script: &str) -> CheckSpec {
        CheckSpec {
            id: id.to_string(),
            description: format!("{id} check"),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            work_dir: std::env::temp_dir(),
            script: None,
        }
    }

    fn config(timeout: Duration) -> LaunchConfig {
        LaunchConfig {
            silence_timeout: timeout,
            echo: false,
            ..LaunchConfig::default()
        }
    }

    #[test]
    fn captures_output_of_exiting_check() {
        let spec = shell_check("pass", "printf 'Final Status: Pass\\n'");
        let result = launch(&spec, &config(Duration::from_secs(10))).unwrap();

        assert!(result.exited());
        assert_eq!(result.termination, Termination::Exited { success: true });
        assert!(result.text().contains("Final Status: Pass"));
    }

    #[test]
    fn escape_sequences_are_kept_verbatim() {
        let spec = shell_check("color", "printf '\\033[92mok\\033[0m\\n'");
        let result = launch(&spec, &config(Duration::from_secs(10))).unwrap();
        assert!(result.text().contains("\x1b[92mok\x1b[0m"));
    }

    #[test]
    fn stderr_shares_the_terminal() {
        let spec = shell_check("stderr", "echo to-stderr 1>&2");
        let result = launch(&spec, &config(Duration::from_secs(10))).unwrap();
        assert!(result.text().contains("to-stderr"));
    }

    #[test]
    fn child_sees_a_terminal() {
        let spec = shell_check("tty", "if [ -t 1 ]; then echo is-tty; else echo no-tty; fi");
        let result = launch(&spec, &config(Duration::from_secs(10))).unwrap();
        assert!(result.text().contains("is-tty"));
    }

    #[test]
    fn non_zero_exit_is_reported() {
        let spec = shell_check("exit3", "echo bye; exit 3");
        let result = launch(&spec, &config(Duration::from_secs(10))).unwrap();
        assert_eq!(result.termination, Termination::Exited { success: false });
    }

    #[test]
    fn silent_check_is_killed() {
        let spec = shell_check("hang", "sleep 30");
        let started = Instant::now();
        let result = launch(&spec, &config(Duration::from_millis(300))).unwrap();

        assert!(!result.exited());
        match result.termination {
            Termination::Killed { silent_for } => {
                assert!(silent_for >= Duration::from_millis(300));
            }
            other => panic!("expected Killed, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn check_that_closes_its_output_is_still_killed() {
        let spec = shell_check(
            "detached",
            "echo working; exec >/dev/null 2>&1 </dev/null; sleep 30",
        );
        let started = Instant::now();
        let result = launch(&spec, &config(Duration::from_millis(500))).unwrap();

        assert!(matches!(result.termination, Termination::Killed { .. }));
        assert!(result.text().contains("working"));
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "launch waited {:?} on a silent check",
            started.elapsed()
        );
    }

    #[test]
    fn partial_output_survives_a_kill() {
        let spec = shell_check("half", "echo started; sleep 30");
        let result = launch(&spec, &config(Duration::from_millis(400))).unwrap();
        assert!(!result.exited());
        assert!(result.text().contains("started"));
    }

    #[test]
    fn background_helpers_are_killed_with_the_check() {
        let spec = shell_check("helpers", "sleep 30 & sleep 30");
        let started = Instant::now();
        let result = launch(&spec, &config(Duration::from_millis(300))).unwrap();
        assert!(!result.exited());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn slow_but_steady_output_is_not_killed() {
        // Each gap is well under the window; the total runtime is well over it.
        let spec = shell_check(
            "steady",
            "for i in 1 2 3 4 5 6; do echo tick; sleep 0.2; done; echo done",
        );
        let result = launch(&spec, &config(Duration::from_millis(700))).unwrap();

        assert!(result.exited());
        let text = result.text();
        assert_eq!(text.matches("tick").count(), 6);
        assert!(text.contains("done"));
    }

    #[test]
    fn environment_is_passed_to_check() {
        let spec = shell_check("env", "echo session=$CHECKRUN_SESSION");
        let mut cfg = config(Duration::from_secs(10));
        cfg.env.push(("CHECKRUN_SESSION".into(), "audit".into()));
        let result = launch(&spec, &cfg).unwrap();
        assert!(result.text().contains("session=audit"));
    }

    #[test]
    fn missing_program_is_an_error() {
        let spec = CheckSpec {
            id: "ghost".to_string(),
            description: "ghost".to_string(),
            program: "/nonexistent/checkrun-ghost".to_string(),
            args: vec![],
            work_dir: PathBuf::from("/tmp"),
            script: None,
        };
        assert!(launch(&spec, &config(Duration::from_secs(1))).is_err());
    }

    #[test]
    fn pty_launcher_implements_runner() {
        let mut runner = PtyLauncher::new(config(Duration::from_secs(10)));
        let result = runner
            .run(&shell_check("runner", "echo via-runner"))
            .unwrap();
        assert!(result.text().contains("via-runner"));
    }
}
