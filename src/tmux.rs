//! tmux wrappers for the persistent side-channel session.
//!
//! The shared interactive shell lives in a detached tmux session so checks
//! can submit command lines to it with `send-keys` while it keeps its
//! authenticated state between checks.

use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

/// Run `tmux <args>`, failing with tmux's stderr on a non-zero exit.
fn tmux(args: &[&str], what: &str) -> Result<Output> {
    let output = Command::new("tmux")
        .args(args)
        .output()
        .with_context(|| format!("could not run tmux {what}"))?;
    if !output.status.success() {
        bail!(
            "tmux {what} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

/// Return the installed tmux version, or an install hint when it is missing.
pub fn check_tmux() -> Result<String> {
    let output = tmux(&["-V"], "-V").context(
        "tmux is required for the shared session; install it or pass --no-session",
    )?;
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!(%version, "using tmux");
    Ok(version)
}

/// Normalize a configured name into a valid tmux session target.
pub fn session_name(name: &str) -> String {
    // '.' and ':' are target separators to tmux.
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '-',
        })
        .collect()
}

pub fn session_exists(session: &str) -> bool {
    tmux(&["has-session", "-t", session], "has-session").is_ok()
}

/// Start `program args...` in a new detached session rooted at `work_dir`.
///
/// A leftover session of the same name is never reused: it may hold another
/// run's authenticated state.
pub fn create_session(session: &str, program: &str, args: &[String], work_dir: &str) -> Result<()> {
    if session_exists(session) {
        bail!(
            "tmux session '{session}' is still running from an earlier run; \
             remove it with `tmux kill-session -t {session}`"
        );
    }

    let mut argv = vec![
        "new-session", "-d", "-s", session, "-c", work_dir, "-x", "220", "-y", "50", program,
    ];
    argv.extend(args.iter().map(String::as_str));
    tmux(&argv, "new-session")?;

    info!(session, program, "started shared session");
    Ok(())
}

/// Type `keys` into the session literally, then press Enter if asked.
pub fn send_keys(target: &str, keys: &str, press_enter: bool) -> Result<()> {
    if !keys.is_empty() {
        // `-l` stops tmux from reading words like "Enter" as key names.
        tmux(&["send-keys", "-t", target, "-l", "--", keys], "send-keys")?;
    }
    if press_enter {
        tmux(&["send-keys", "-t", target, "C-m"], "send-keys C-m")?;
    }
    debug!(session = target, keys, "typed into session");
    Ok(())
}

/// Kill a session. A session that is already gone is not an error.
pub fn kill_session(session: &str) -> Result<()> {
    if session_exists(session) {
        tmux(&["kill-session", "-t", session], "kill-session")?;
        info!(session, "stopped shared session");
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn tmux_available() -> bool {
    tmux(&["-V"], "-V").is_ok()
}
