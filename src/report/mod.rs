//! Report generation: the HTML document and the JSON dump.
//!
//! The HTML report has one collapsible section per check in declaration
//! order, titled with the description and verdict, with the captured output
//! rendered as colored markup. Each section carries an anchor so the
//! capturer can load the report focused on a single section. The JSON dump
//! holds the same records with the raw output.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregate::{FrozenReport, RunRecord, Tally};
use crate::classify::ansi_to_html;

const REPORT_TEMPLATE: &str = include_str!("report.html");

/// Prefix of every section anchor in the HTML report.
pub const ANCHOR_PREFIX: &str = "capture-";

/// Line height of section output when the report is focused on one section.
/// The capturer sizes its window from it.
pub const CAPTURE_LINE_PX: u32 = 18;

const REPORT_TITLE: &str = "Compliance check results";

/// File-name timestamp, e.g. `2026-10-17_09-30-00`.
pub fn file_stamp(at: DateTime<Local>) -> String {
    at.format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Anchor of a record's section in the HTML report.
pub fn section_anchor(record: &RunRecord) -> String {
    format!("{ANCHOR_PREFIX}{}", record.sequence)
}

#[derive(Debug, Serialize)]
struct SectionContext {
    anchor: String,
    description: String,
    verdict: String,
    css_class: &'static str,
    body_html: String,
}

impl SectionContext {
    fn from_record(record: &RunRecord) -> Self {
        Self {
            anchor: section_anchor(record),
            description: record.description.clone(),
            verdict: record.verdict.to_string(),
            css_class: record.verdict.css_class(),
            body_html: ansi_to_html(&record.output),
        }
    }
}

struct ReportEngine {
    env: Environment<'static>,
}

impl ReportEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        // The `.html` name turns on HTML auto-escaping for every field
        // except the pre-escaped body.
        env.add_template("report.html", REPORT_TEMPLATE)
            .context("report template is invalid")?;
        Ok(Self { env })
    }

    fn render(&self, report: &FrozenReport, generated_at: DateTime<Local>) -> Result<String> {
        let sections: Vec<SectionContext> = report
            .records()
            .iter()
            .map(SectionContext::from_record)
            .collect();
        let template = self.env.get_template("report.html")?;
        let rendered = template
            .render(context! {
                title => REPORT_TITLE,
                generated_at => generated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                tally => report.tally(),
                sections => sections,
                anchor_prefix => ANCHOR_PREFIX,
                capture_line_px => CAPTURE_LINE_PX,
            })
            .context("failed to render HTML report")?;
        Ok(rendered)
    }
}

/// Render the report document.
pub fn render_html(report: &FrozenReport, generated_at: DateTime<Local>) -> Result<String> {
    ReportEngine::new()?.render(report, generated_at)
}

/// Write `results_<stamp>.html` into `dir`, creating it if needed.
pub fn write_html(
    report: &FrozenReport,
    dir: &Path,
    generated_at: DateTime<Local>,
) -> Result<PathBuf> {
    let html = render_html(report, generated_at)?;
    let path = dir.join(format!("results_{}.html", file_stamp(generated_at)));
    write_file(&path, &html)?;
    info!(path = %path.display(), "HTML report written");
    Ok(path)
}

/// The structured dump of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDump {
    pub generated_at: DateTime<Utc>,
    pub tally: Tally,
    pub records: Vec<RunRecord>,
}

impl ResultDump {
    pub fn from_report(report: &FrozenReport, generated_at: DateTime<Utc>) -> Self {
        Self {
            generated_at,
            tally: report.tally(),
            records: report.records().to_vec(),
        }
    }

    pub fn into_report(self) -> FrozenReport {
        FrozenReport::from_records(self.records)
    }
}

/// Serialize the dump as pretty JSON with object keys sorted.
pub fn dump_json(dump: &ResultDump) -> Result<String> {
    // serde_json's default map is ordered, so a round trip through `Value`
    // sorts every object's keys.
    let value = serde_json::to_value(dump).context("failed to serialize result dump")?;
    serde_json::to_string_pretty(&value).context("failed to serialize result dump")
}

/// Write `results_<stamp>.json` into `dir`, creating it if needed.
pub fn write_dump(
    report: &FrozenReport,
    dir: &Path,
    generated_at: DateTime<Local>,
) -> Result<PathBuf> {
    let dump = ResultDump::from_report(report, generated_at.with_timezone(&Utc));
    let json = dump_json(&dump)?;
    let path = dir.join(format!("results_{}.json", file_stamp(generated_at)));
    write_file(&path, &json)?;
    info!(path = %path.display(), "result dump written");
    Ok(path)
}

/// Read a dump written by [`write_dump`].
pub fn load_dump(path: &Path) -> Result<ResultDump> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Verdict;
    use chrono::TimeZone;

    fn record(sequence: usize, id: &str, description: &str, verdict: Verdict, output: &str) -> RunRecord {
        RunRecord {
            sequence,
            check_id: id.to_string(),
            description: description.to_string(),
            verdict,
            output: output.to_string(),
            completed_at: Utc.with_ymd_and_hms(2026, 10, 17, 9, 30, 0).unwrap(),
            attempt: 1,
        }
    }

    fn sample() -> FrozenReport {
        FrozenReport::from_records(vec![
            record(0, "a.py", "1.1 Admin accounts", Verdict::Pass, "\x1b[92mFinal Status: Pass\x1b[0m\n"),
            record(1, "b.py", "1.2 <Guest> access", Verdict::Fail, "Final Status: Fail\n"),
            record(2, "c.py", "1.3 Portal review", Verdict::Manual, "Manual check required\n"),
            record(3, "d.py", "1.4 Slow one", Verdict::Skipped, "Check timed out due to no output."),
        ])
    }

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 17, 9, 30, 0).unwrap()
    }

    #[test]
    fn file_stamp_format() {
        assert_eq!(file_stamp(at()), "2026-10-17_09-30-00");
    }

    #[test]
    fn html_has_one_section_per_record_in_order() {
        let html = render_html(&sample(), at()).unwrap();
        assert_eq!(html.matches("<details").count(), 4);

        let a = html.find("1.1 Admin accounts").unwrap();
        let b = html.find("1.2 &lt;Guest&gt; access").unwrap();
        let c = html.find("1.3 Portal review").unwrap();
        let d = html.find("1.4 Slow one").unwrap();
        assert!(a < b && b < c && c < d);
    }

    #[test]
    fn html_sections_carry_verdict_classes_and_anchors() {
        let html = render_html(&sample(), at()).unwrap();
        assert!(html.contains(r#"<summary class="pass">"#));
        assert!(html.contains(r#"<summary class="fail">"#));
        assert!(html.contains(r#"<summary class="manual">"#));
        assert!(html.contains(r#"<summary class="skipped">"#));
        assert!(html.contains(r#"id="capture-1""#));
        assert!(html.contains(r#"data-verdict="FAIL""#));
    }

    #[test]
    fn sections_open_only_for_a_capture_fragment() {
        let html = render_html(&sample(), at()).unwrap();
        assert!(!html.contains("<details open"));

        let script = &html[html.find("<script>").unwrap()..];
        let guard = script.find(r#"indexOf("capture-") !== 0"#).unwrap();
        let opener = script.find(r#"setAttribute("open""#).unwrap();
        assert!(guard < opener, "sections are opened before the fragment check");
        assert_eq!(script.matches("setAttribute").count(), 1);
    }

    #[test]
    fn html_body_is_converted_output() {
        let html = render_html(&sample(), at()).unwrap();
        assert!(html.contains(r#"<span style="color:green;">Final Status: Pass</span>"#));
        assert!(!html.contains('\x1b'));
    }

    #[test]
    fn html_escapes_markup_in_output() {
        let report = FrozenReport::from_records(vec![record(
            0,
            "x.py",
            "x",
            Verdict::Fail,
            "<script>alert(1)</script>",
        )]);
        let html = render_html(&report, at()).unwrap();
        assert!(html.contains("&lt;script&gt;alert(1)&lt;&#x2f;script&gt;"));
        assert!(!html.contains("<script>alert(1)"));
    }

    #[test]
    fn html_shows_tally() {
        let html = render_html(&sample(), at()).unwrap();
        assert!(html.contains("1 pass"));
        assert!(html.contains("1 fail"));
        assert!(html.contains("1 skipped"));
    }

    #[test]
    fn write_html_uses_timestamped_name() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_html(&sample(), &tmp.path().join("out"), at()).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "results_2026-10-17_09-30-00.html"
        );
        assert!(fs::read_to_string(path).unwrap().contains("<details"));
    }

    #[test]
    fn dump_round_trips_records_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let report = sample();
        let path = write_dump(&report, tmp.path(), at()).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "results_2026-10-17_09-30-00.json"
        );

        let loaded = load_dump(&path).unwrap();
        assert_eq!(loaded.tally, report.tally());
        let back = loaded.into_report();
        let triples = |r: &FrozenReport| -> Vec<(String, Verdict, String)> {
            r.records()
                .iter()
                .map(|rec| (rec.check_id.clone(), rec.verdict, rec.output.clone()))
                .collect()
        };
        assert_eq!(triples(&back), triples(&report));
    }

    #[test]
    fn dump_keys_are_sorted() {
        let dump = ResultDump::from_report(&sample(), Utc::now());
        let json = dump_json(&dump).unwrap();
        let generated = json.find("\"generated_at\"").unwrap();
        let records = json.find("\"records\"").unwrap();
        let tally = json.find("\"tally\"").unwrap();
        assert!(generated < records && records < tally);

        let attempt = json.find("\"attempt\"").unwrap();
        let verdict = json.find("\"verdict\"").unwrap();
        assert!(attempt < verdict);
    }

    #[test]
    fn load_dump_reports_bad_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("broken.json");
        fs::write(&path, "{").unwrap();
        let err = load_dump(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }
}
