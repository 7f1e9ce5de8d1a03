//! Failure snapshots: images of each FAIL section of the HTML report.
//!
//! The report focuses itself on a single section when loaded with that
//! section's anchor as the URL fragment (that section expanded, all others
//! hidden). The capturer loads the report once per failing check in a
//! headless browser, with the window sized to the section's laid-out
//! output, and saves it as a PNG named after the check's description.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::aggregate::{FrozenReport, RunRecord, Verdict};
use crate::classify::plain_text;
use crate::config::CaptureSettings;
use crate::report::{CAPTURE_LINE_PX, section_anchor};

// Focused-section layout: 15px monospace output (about 9.03px per cell),
// the summary row and paddings above and below it, and the side paddings.
const CELL_TENTHS_PX: u32 = 91;
const SECTION_CHROME_PX: u32 = 120;
const SIDE_GUTTER_PX: u32 = 64;
const MIN_HEIGHT_PX: u32 = 160;
const TAB_CELLS: usize = 8;

/// Browser window size for one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Renders a URL to an image file.
pub trait Browser {
    /// Fail early when the browser cannot run at all.
    fn check(&self) -> Result<()> {
        Ok(())
    }

    fn screenshot(&mut self, url: &str, viewport: Viewport, output: &Path) -> Result<()>;
}

/// Chromium (or Chrome) in headless screenshot mode.
#[derive(Debug, Clone)]
pub struct HeadlessChrome {
    program: String,
}

impl HeadlessChrome {
    pub fn new(settings: &CaptureSettings) -> Self {
        Self {
            program: settings.browser.clone(),
        }
    }

    fn args(&self, url: &str, viewport: Viewport, output: &Path) -> Vec<String> {
        vec![
            "--headless".to_string(),
            "--disable-gpu".to_string(),
            "--no-sandbox".to_string(),
            "--hide-scrollbars".to_string(),
            format!("--window-size={},{}", viewport.width, viewport.height),
            format!("--screenshot={}", output.display()),
            url.to_string(),
        ]
    }
}

impl Browser for HeadlessChrome {
    fn check(&self) -> Result<()> {
        let output = Command::new(&self.program)
            .arg("--version")
            .output()
            .with_context(|| format!("browser '{}' not found", self.program))?;
        if !output.status.success() {
            bail!(
                "browser '{}' --version failed: {}",
                self.program,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!(
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "browser found"
        );
        Ok(())
    }

    fn screenshot(&mut self, url: &str, viewport: Viewport, output: &Path) -> Result<()> {
        let result = Command::new(&self.program)
            .args(self.args(url, viewport, output))
            .output()
            .with_context(|| format!("failed to run browser '{}'", self.program))?;

        if !result.status.success() {
            bail!(
                "browser exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            );
        }
        if !output.is_file() {
            bail!("browser did not write {}", output.display());
        }
        Ok(())
    }
}

/// Window size that shows all of a focused section's output.
///
/// Rows are counted the way the report lays the output out: one per line,
/// plus one per wrap at the window width. The height is capped at
/// `max_height`.
pub fn section_viewport(output: &str, width: u32, max_height: u32) -> Viewport {
    let usable_px = width.saturating_sub(SIDE_GUTTER_PX);
    let columns = (usable_px.saturating_mul(10) / CELL_TENTHS_PX).max(1) as usize;
    let rows: usize = plain_text(output)
        .lines()
        .map(|line| {
            let cells: usize = line
                .chars()
                .map(|c| if c == '\t' { TAB_CELLS } else { 1 })
                .sum();
            cells.div_ceil(columns).max(1)
        })
        .sum::<usize>()
        .max(1);

    let rows = u32::try_from(rows).unwrap_or(u32::MAX);
    let height = rows
        .saturating_mul(CAPTURE_LINE_PX)
        .saturating_add(SECTION_CHROME_PX);
    Viewport {
        width,
        height: height.clamp(MIN_HEIGHT_PX, max_height.max(MIN_HEIGHT_PX)),
    }
}

fn record_viewport(record: &RunRecord, settings: &CaptureSettings) -> Viewport {
    let viewport = section_viewport(&record.output, settings.window_width, settings.max_height);
    if viewport.height == settings.max_height {
        warn!(
            check = %record.check_id,
            max_height = settings.max_height,
            "section output is taller than the capture window; snapshot may be cut off"
        );
    }
    viewport
}

/// File-system-safe image name derived from a description.
///
/// Every character that is not alphanumeric, `-`, `_` or a space becomes `_`.
pub fn snapshot_name(description: &str) -> String {
    description
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Outcome of one capture pass.
#[derive(Debug, Default)]
pub struct CaptureSummary {
    /// `(check_id, image path)` for each saved snapshot.
    pub captured: Vec<(String, PathBuf)>,
    /// `(check_id, error)` for each section that could not be captured.
    pub failed: Vec<(String, String)>,
}

/// Snapshot every `FAIL` section of the report at `html_path` into `out_dir`.
///
/// A failure for one section is recorded and the pass moves on; only an
/// unusable browser or output directory fails the whole call.
pub fn capture_failures(
    report: &FrozenReport,
    html_path: &Path,
    out_dir: &Path,
    settings: &CaptureSettings,
    browser: &mut dyn Browser,
) -> Result<CaptureSummary> {
    let mut summary = CaptureSummary::default();
    let failing: Vec<_> = report
        .records()
        .iter()
        .filter(|r| r.verdict == Verdict::Fail)
        .collect();
    if failing.is_empty() {
        return Ok(summary);
    }

    browser.check()?;
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let html_path = html_path
        .canonicalize()
        .with_context(|| format!("report not found: {}", html_path.display()))?;

    let mut used = HashSet::new();
    for record in failing {
        let path = out_dir.join(unique_file_name(&record.description, &mut used));
        let url = format!("file://{}#{}", html_path.display(), section_anchor(record));
        let viewport = record_viewport(record, settings);
        debug!(check = %record.check_id, height = viewport.height, "sized capture window");

        match browser.screenshot(&url, viewport, &path) {
            Ok(()) => {
                info!(check = %record.check_id, path = %path.display(), "snapshot saved");
                summary.captured.push((record.check_id.clone(), path));
            }
            Err(e) => {
                warn!(check = %record.check_id, error = %e, "failed to capture snapshot");
                summary.failed.push((record.check_id.clone(), format!("{e:#}")));
            }
        }
    }

    Ok(summary)
}

fn unique_file_name(description: &str, used: &mut HashSet<String>) -> String {
    let base = snapshot_name(description);
    let mut name = format!("{base}.png");
    let mut n = 2;
    while !used.insert(name.clone()) {
        name = format!("{base}-{n}.png");
        n += 1;
    }
    name
}
