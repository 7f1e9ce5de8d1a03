//! File-based request/response over the persistent session.
//!
//! The session's stdout is not readable by a check, so a request names a
//! fresh scratch file, submits its command lines, and has the final line's
//! output redirected into that file. The client then polls for the file to
//! become non-empty, reads it, and deletes it.

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SideChannelSettings;
use crate::tmux;

/// Something that accepts command lines for the persistent session.
pub trait CommandSink {
    fn submit(&self, line: &str) -> Result<()>;
}

/// Submits lines to a named tmux session.
#[derive(Debug, Clone)]
pub struct TmuxSink {
    session: String,
}

impl TmuxSink {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
        }
    }
}

impl CommandSink for TmuxSink {
    fn submit(&self, line: &str) -> Result<()> {
        tmux::send_keys(&self.session, line, true)
    }
}

#[derive(Debug, Error)]
pub enum SideChannelError {
    #[error("no command to submit")]
    EmptyRequest,
    #[error("failed to submit command to the session: {detail}")]
    Send { detail: String },
    #[error("no output from the session after {attempts} polling attempts")]
    NoOutput { attempts: u32 },
    #[error("failed to read result file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Client side of the side-channel protocol.
pub struct SideChannel<S> {
    sink: S,
    poll_interval: Duration,
    max_attempts: u32,
    redirect_template: String,
    scratch_dir: PathBuf,
    pause: fn(Duration),
}

impl<S: CommandSink> SideChannel<S> {
    pub fn new(sink: S, settings: &SideChannelSettings) -> Self {
        Self {
            sink,
            poll_interval: settings.poll_interval(),
            max_attempts: settings.max_attempts,
            redirect_template: settings.redirect_template.clone(),
            scratch_dir: std::env::temp_dir(),
            pause: thread::sleep,
        }
    }

    /// Place scratch files somewhere other than the system temp dir.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Replace the wait between polls.
    #[cfg(test)]
    fn with_pause(mut self, pause: fn(Duration)) -> Self {
        self.pause = pause;
        self
    }

    /// Submit `commands` in order and return the final command's output,
    /// trimmed of surrounding whitespace.
    ///
    /// Every line but the last is submitted as-is; the last is wrapped with
    /// the redirect template.
    pub fn request(&self, commands: &[String]) -> Result<String, SideChannelError> {
        let Some((last, leading)) = commands.split_last() else {
            return Err(SideChannelError::EmptyRequest);
        };

        let path = self
            .scratch_dir
            .join(format!("checkrun-{}.txt", Uuid::new_v4()));

        for line in leading {
            self.submit(line)?;
        }
        self.submit(&self.redirected(last, &path))?;

        for attempt in 1..=self.max_attempts {
            (self.pause)(self.poll_interval);
            let ready = fs::metadata(&path).is_ok_and(|m| m.len() > 0);
            if !ready {
                debug!(attempt, path = %path.display(), "side-channel result not ready");
                continue;
            }

            let content = fs::read_to_string(&path).map_err(|source| SideChannelError::Io {
                path: path.clone(),
                source,
            })?;
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove side-channel file");
            }
            return Ok(content.trim().to_string());
        }

        let _ = fs::remove_file(&path);
        Err(SideChannelError::NoOutput {
            attempts: self.max_attempts,
        })
    }

    fn submit(&self, line: &str) -> Result<(), SideChannelError> {
        self.sink
            .submit(line)
            .map_err(|e| SideChannelError::Send {
                detail: format!("{e:#}"),
            })
    }

    fn redirected(&self, command: &str, path: &std::path::Path) -> String {
        self.redirect_template
            .replace("{command}", command)
            .replace("{path}", &path.display().to_string())
    }
}
