//! Per-run JSONL execution log.
//!
//! `checkrun run` appends one JSON object per line to
//! `.checkrun/logs/run-<stamp>.jsonl`. Lines carry an RFC 3339 `timestamp`,
//! an `event` tag and the event's fields under `data`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::trace;

#[derive(Serialize)]
struct Line<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a LogEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LogEvent {
    /// The shared session is up and the bootstrap lines were sent.
    SessionStarted { session: String, program: String },
    SessionStopped { session: String },
    /// Teardown failed; the run still reports its results.
    SessionStopFailed { session: String, reason: String },
    CheckStarted {
        check_id: String,
        program: String,
        attempt: u32,
    },
    CheckCompleted {
        check_id: String,
        verdict: String,
        attempt: u32,
        output_bytes: usize,
    },
    /// The check went silent and was killed.
    CheckStalled { check_id: String, silent_secs: u64 },
    /// Declared, but the script is absent so it never runs.
    CheckMissing { check_id: String, path: String },
    RetryPassStarted { check_ids: Vec<String> },
    ReportWritten { path: String },
    DumpWritten { path: String },
    SnapshotCaptured { check_id: String, path: String },
    SnapshotFailed { check_id: String, reason: String },
    RunCompleted { summary: String },
}

impl LogEvent {
    fn to_line(&self) -> Result<String> {
        let line = Line {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event: self,
        };
        serde_json::to_string(&line).context("could not encode execution log event")
    }
}

/// Append-only JSONL sink shared by the harness and the CLI pipeline.
pub struct ExecutionLog {
    out: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Open `path` for appending, creating missing parent directories.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("could not create {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("could not open execution log {}", path.display()))?;
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
            path: path.to_owned(),
        })
    }

    /// `root/.checkrun/logs/run-<stamp>.jsonl` for a run starting now.
    pub fn default_path(root: &Path) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let mut path = root.join(crate::config::CONFIG_DIR);
        path.push("logs");
        path.push(format!("run-{stamp}.jsonl"));
        path
    }

    /// Append `event` and flush so the file stays readable mid-run.
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let line = event.to_line()?;
        trace!(%line, "execution log");

        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(line.as_bytes())
            .and_then(|()| out.write_all(b"\n"))
            .and_then(|()| out.flush())
            .with_context(|| format!("could not append to {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
