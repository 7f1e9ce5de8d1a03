//! Result aggregation: one ordered record per declared check.
//!
//! Records are keyed by check identity and stored at the check's
//! declaration position, so the report order never depends on completion
//! order. A retry replaces the record at its position; it never appends.

use std::collections::HashMap;
use std::fmt;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::CheckSpec;

/// Outcome of one check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
    /// No automated determination; a human must inspect the referenced resource.
    Manual,
    /// Killed by the liveness monitor before completion.
    Skipped,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Manual => "MANUAL",
            Verdict::Skipped => "SKIPPED",
        }
    }

    /// Parse a verdict word, ignoring case.
    pub fn parse(word: &str) -> Option<Self> {
        match word.trim().to_ascii_lowercase().as_str() {
            "pass" => Some(Verdict::Pass),
            "fail" => Some(Verdict::Fail),
            "manual" => Some(Verdict::Manual),
            "skipped" => Some(Verdict::Skipped),
            _ => None,
        }
    }

    /// CSS class used by the report.
    pub fn css_class(self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Manual => "manual",
            Verdict::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of running one check once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Declaration position of the check; preserved across retries.
    pub sequence: usize,
    pub check_id: String,
    pub description: String,
    pub verdict: Verdict,
    /// Raw captured output, escape sequences included.
    pub output: String,
    pub completed_at: DateTime<Utc>,
    /// 1 for the ordered pass, 2 when the record came from the retry pass.
    pub attempt: u32,
}

impl RunRecord {
    pub fn new(spec: &CheckSpec, verdict: Verdict, output: String, attempt: u32) -> Self {
        Self {
            sequence: 0,
            check_id: spec.id.clone(),
            description: spec.description.clone(),
            verdict,
            output,
            completed_at: Utc::now(),
            attempt,
        }
    }
}

/// Ordered collection of run records, one slot per declared check.
#[derive(Debug, Clone)]
pub struct AggregateReport {
    specs: Vec<CheckSpec>,
    index: HashMap<String, usize>,
    records: Vec<Option<RunRecord>>,
}

impl AggregateReport {
    /// Create an empty report over the declared checks.
    ///
    /// Fails if two checks share an identifier.
    pub fn new(specs: Vec<CheckSpec>) -> Result<Self> {
        let mut index = HashMap::with_capacity(specs.len());
        for (position, spec) in specs.iter().enumerate() {
            if index.insert(spec.id.clone(), position).is_some() {
                bail!("duplicate check id '{}' in catalog", spec.id);
            }
        }
        let records = vec![None; specs.len()];
        Ok(Self {
            specs,
            index,
            records,
        })
    }

    pub fn specs(&self) -> &[CheckSpec] {
        &self.specs
    }

    /// Insert or replace the record for `spec` at its declaration position.
    pub fn record(&mut self, spec: &CheckSpec, mut record: RunRecord) -> Result<()> {
        let Some(&position) = self.index.get(&spec.id) else {
            bail!("check '{}' is not part of this run", spec.id);
        };
        record.sequence = position;
        self.records[position] = Some(record);
        Ok(())
    }

    pub fn get(&self, check_id: &str) -> Option<&RunRecord> {
        let position = *self.index.get(check_id)?;
        self.records[position].as_ref()
    }

    /// Checks whose current record is `SKIPPED`, in declaration order.
    pub fn pending_retries(&self) -> Vec<CheckSpec> {
        self.specs
            .iter()
            .zip(&self.records)
            .filter(|(_, record)| {
                record
                    .as_ref()
                    .is_some_and(|r| r.verdict == Verdict::Skipped)
            })
            .map(|(spec, _)| spec.clone())
            .collect()
    }

    /// Declared checks that have no record yet.
    pub fn missing(&self) -> Vec<&CheckSpec> {
        self.specs
            .iter()
            .zip(&self.records)
            .filter(|(_, record)| record.is_none())
            .map(|(spec, _)| spec)
            .collect()
    }

    /// Freeze into the final ordered record list.
    ///
    /// Fails unless every declared check has exactly one record.
    pub fn freeze(self) -> Result<FrozenReport> {
        let missing: Vec<String> = self.missing().iter().map(|s| s.id.clone()).collect();
        if !missing.is_empty() {
            bail!("no result recorded for: {}", missing.join(", "));
        }
        Ok(FrozenReport {
            records: self.records.into_iter().flatten().collect(),
        })
    }
}

/// Per-verdict counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub pass: usize,
    pub fail: usize,
    pub manual: usize,
    pub skipped: usize,
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pass, {} fail, {} manual, {} skipped",
            self.pass, self.fail, self.manual, self.skipped
        )
    }
}

/// The final, immutable aggregate in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct FrozenReport {
    records: Vec<RunRecord>,
}

impl FrozenReport {
    pub fn from_records(records: Vec<RunRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[RunRecord] {
        &self.records
    }

    pub fn tally(&self) -> Tally {
        let mut tally = Tally::default();
        for record in &self.records {
            match record.verdict {
                Verdict::Pass => tally.pass += 1,
                Verdict::Fail => tally.fail += 1,
                Verdict::Manual => tally.manual += 1,
                Verdict::Skipped => tally.skipped += 1,
            }
        }
        tally
    }
}
