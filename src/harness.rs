//! Batch coordinator: ordered pass plus one retry pass.
//!
//! Checks run one at a time in declaration order. Each run goes through the
//! launcher (with its liveness monitor), then the classifier, and lands in
//! the aggregate at its declared position. After the ordered pass every
//! `SKIPPED` check is run exactly once more; whatever that second run yields
//! is final.

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::aggregate::{AggregateReport, FrozenReport, RunRecord, Verdict};
use crate::catalog::CheckSpec;
use crate::classify::VerdictRules;
use crate::launcher::{CheckRunner, Termination};
use crate::log::{ExecutionLog, LogEvent};

/// Recorded output prefix for a check killed by the liveness monitor.
pub const STALL_MESSAGE: &str = "Check timed out due to no output.";

const BANNER_WIDTH: usize = 60;

/// Receives progress callbacks from the coordinator.
pub trait HarnessObserver {
    fn on_check_started(&mut self, _spec: &CheckSpec, _attempt: u32) {}
    fn on_check_stalled(&mut self, _spec: &CheckSpec, _silent_for: Duration) {}
    fn on_check_completed(&mut self, _record: &RunRecord) {}
    fn on_retry_pass(&mut self, _pending: &[CheckSpec]) {}
}

/// Observer that ignores everything.
pub struct NullObserver;

impl HarnessObserver for NullObserver {}

/// Forwards coordinator progress to the JSONL execution log.
pub struct LogObserver<'a> {
    log: &'a ExecutionLog,
}

impl<'a> LogObserver<'a> {
    pub fn new(log: &'a ExecutionLog) -> Self {
        Self { log }
    }

    fn write(&self, event: LogEvent) {
        if let Err(e) = self.log.log(event) {
            warn!(error = %e, "failed to write execution log entry");
        }
    }
}

impl HarnessObserver for LogObserver<'_> {
    fn on_check_started(&mut self, spec: &CheckSpec, attempt: u32) {
        self.write(LogEvent::CheckStarted {
            check_id: spec.id.clone(),
            program: spec.program.clone(),
            attempt,
        });
    }

    fn on_check_stalled(&mut self, spec: &CheckSpec, silent_for: Duration) {
        self.write(LogEvent::CheckStalled {
            check_id: spec.id.clone(),
            silent_secs: silent_for.as_secs(),
        });
    }

    fn on_check_completed(&mut self, record: &RunRecord) {
        self.write(LogEvent::CheckCompleted {
            check_id: record.check_id.clone(),
            verdict: record.verdict.to_string(),
            attempt: record.attempt,
            output_bytes: record.output.len(),
        });
    }

    fn on_retry_pass(&mut self, pending: &[CheckSpec]) {
        self.write(LogEvent::RetryPassStarted {
            check_ids: pending.iter().map(|s| s.id.clone()).collect(),
        });
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HarnessOptions {
    /// Run a second pass over `SKIPPED` checks.
    pub retry_stalled: bool,
    /// Print the description banner before each check.
    pub banner: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            retry_stalled: true,
            banner: true,
        }
    }
}

/// The operator-facing header printed before a check runs.
pub fn banner(description: &str) -> String {
    let rule = "*".repeat(BANNER_WIDTH);
    format!("\n{rule}\n{}\n{rule}\n", description.to_uppercase())
}

pub struct Harness<R> {
    runner: R,
    rules: VerdictRules,
    options: HarnessOptions,
}

impl<R: CheckRunner> Harness<R> {
    pub fn new(runner: R, options: HarnessOptions) -> Self {
        Self {
            runner,
            rules: VerdictRules::standard(),
            options,
        }
    }

    /// Run `specs` in order, retry stalled checks once, and return the
    /// frozen aggregate in declaration order.
    pub fn run_batch(
        &mut self,
        specs: Vec<CheckSpec>,
        observer: &mut dyn HarnessObserver,
    ) -> Result<FrozenReport> {
        let mut report = AggregateReport::new(specs)?;
        let ordered = report.specs().to_vec();

        for spec in &ordered {
            let record = self.run_one(spec, 1, observer);
            report.record(spec, record)?;
        }

        if self.options.retry_stalled {
            let pending = report.pending_retries();
            if !pending.is_empty() {
                info!(count = pending.len(), "retrying stalled checks");
                if self.options.banner {
                    println!("\nRetrying skipped checks...");
                }
                observer.on_retry_pass(&pending);
                for spec in &pending {
                    let record = self.run_one(spec, 2, observer);
                    report.record(spec, record)?;
                }
            }
        }

        report.freeze()
    }

    /// Run a single check once and classify the outcome.
    ///
    /// Never fails: a launch error becomes a `FAIL` record carrying the
    /// error text, and a stall becomes `SKIPPED`.
    pub fn run_one(
        &mut self,
        spec: &CheckSpec,
        attempt: u32,
        observer: &mut dyn HarnessObserver,
    ) -> RunRecord {
        if self.options.banner {
            println!("{}", banner(&spec.description));
        }
        observer.on_check_started(spec, attempt);

        let record = match self.runner.run(spec) {
            Err(e) => {
                warn!(check = %spec.id, error = %e, "check could not be run");
                RunRecord::new(spec, Verdict::Fail, format!("{e:#}"), attempt)
            }
            Ok(result) => match result.termination {
                Termination::Killed { silent_for } => {
                    observer.on_check_stalled(spec, silent_for);
                    let partial = result.text();
                    let output = if partial.is_empty() {
                        STALL_MESSAGE.to_string()
                    } else {
                        format!("{STALL_MESSAGE}\n{partial}")
                    };
                    RunRecord::new(spec, Verdict::Skipped, output, attempt)
                }
                Termination::Exited { .. } => {
                    let output = result.text();
                    let classification = self.rules.classify(&output);
                    RunRecord::new(spec, classification.verdict, output, attempt)
                }
            },
        };

        info!(
            check = %spec.id,
            verdict = %record.verdict,
            attempt,
            "check finished"
        );
        observer.on_check_completed(&record);
        record
    }
}
