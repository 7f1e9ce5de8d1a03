use std::fmt::Display;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::aggregate::{FrozenReport, Tally};
use crate::capture::{self, HeadlessChrome};
use crate::catalog::{self, CheckSpec};
use crate::classify;
use crate::config::{CONFIG_DIR, ProjectConfig};
use crate::harness::{Harness, HarnessOptions, LogObserver};
use crate::launcher::{LaunchConfig, PtyLauncher};
use crate::log::{ExecutionLog, LogEvent};
use crate::report;
use crate::session::{SESSION_ENV, SessionHandle, SideChannel, TmuxSink};
use crate::tmux;

#[derive(Parser, Debug)]
#[command(
    name = "checkrun",
    about = "Run a battery of compliance checks under supervision and report the results",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the check battery and write the report
    Run {
        /// Run only this check (no shared session, no retry pass)
        #[arg(long)]
        check: Option<String>,

        /// Do not start the shared interactive session
        #[arg(long)]
        no_session: bool,

        /// Skip failure snapshots
        #[arg(long)]
        no_capture: bool,
    },

    /// List the checks in run order
    List,

    /// Show project configuration
    Config {
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Submit command lines to the shared session and print the last one's output
    SessionExec {
        /// Target session (defaults to $CHECKRUN_SESSION, then the configured name)
        #[arg(long)]
        session: Option<String>,

        /// Command lines, submitted in order
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        commands: Vec<String>,
    },

    /// Classify a captured output file and print its verdict
    Classify {
        /// File holding raw check output
        file: PathBuf,
    },
}

/// Tracing filter directive for a `-v` count.
pub fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "checkrun=info",
        1 => "checkrun=debug",
        _ => "checkrun=trace",
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub check: Option<String>,
    pub no_session: bool,
    pub no_capture: bool,
}

/// Artifacts of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    pub tally: Tally,
    pub html: PathBuf,
    pub dump: PathBuf,
    pub log: PathBuf,
}

/// Select the checks to run: the whole runnable catalog, or one check by id.
pub fn select_checks(
    resolution: catalog::Resolution,
    only: Option<&str>,
) -> Result<Vec<CheckSpec>> {
    let Some(id) = only else {
        return Ok(resolution.runnable);
    };
    if let Some(spec) = resolution.runnable.into_iter().find(|s| s.id == id) {
        return Ok(vec![spec]);
    }
    if resolution.missing.iter().any(|s| s.id == id) {
        bail!("check '{id}' not found on disk; provide a valid check name");
    }
    bail!("unknown check '{id}'; run `checkrun list` to see the catalog");
}

/// Run the battery end to end: session, ordered pass, retry pass, report,
/// snapshots, dump.
pub fn run_checks(config: &ProjectConfig, root: &Path, options: &RunOptions) -> Result<RunOutcome> {
    let log = ExecutionLog::new(&ExecutionLog::default_path(root))?;
    info!(path = %log.path().display(), "execution log");

    let resolution = catalog::resolve(&config.harness, &config.checks, root);
    if options.check.is_none() {
        for spec in &resolution.missing {
            let path = spec.script.as_deref().unwrap_or(Path::new(&spec.id));
            println!("Check {} not found. Skipping.", path.display());
            log_event(
                &log,
                LogEvent::CheckMissing {
                    check_id: spec.id.clone(),
                    path: path.display().to_string(),
                },
            );
        }
    }
    let specs = select_checks(resolution, options.check.as_deref())?;

    let single = options.check.is_some();
    let session = if config.session.enabled && !options.no_session && !single {
        println!("\nStarting shared session and authenticating...\n");
        let handle = SessionHandle::start(&config.session, root)?;
        install_interrupt_teardown(handle.name())?;
        log_event(
            &log,
            LogEvent::SessionStarted {
                session: handle.name().to_string(),
                program: config.session.program.clone(),
            },
        );
        Some(handle)
    } else {
        None
    };

    let mut launch = LaunchConfig {
        silence_timeout: config.harness.silence_timeout(),
        echo: config.harness.echo_output,
        ..LaunchConfig::default()
    };
    launch.pty_size.rows = config.harness.pty_rows;
    launch.pty_size.cols = config.harness.pty_cols;
    if let Some(handle) = &session {
        launch.env.extend(handle.env());
    }

    let mut harness = Harness::new(
        PtyLauncher::new(launch),
        HarnessOptions {
            retry_stalled: config.harness.retry_stalled && !single,
            banner: true,
        },
    );
    let frozen = harness.run_batch(specs, &mut LogObserver::new(&log))?;

    finish_run(config, root, options, &frozen, session, &log)
}

/// Tear the session down, then write every artifact of the run. A failed
/// teardown is logged and reported but never costs the results.
fn finish_run(
    config: &ProjectConfig,
    root: &Path,
    options: &RunOptions,
    frozen: &FrozenReport,
    session: Option<SessionHandle>,
    log: &ExecutionLog,
) -> Result<RunOutcome> {
    if let Some(handle) = session {
        stop_session(handle, log);
    }

    let generated_at = Local::now();
    let output_dir = root.join(&config.report.output_dir);
    let html = report::write_html(frozen, &output_dir, generated_at)?;
    println!("HTML report generated: {}", html.display());
    log_event(
        log,
        LogEvent::ReportWritten {
            path: html.display().to_string(),
        },
    );

    if config.capture.enabled && !options.no_capture {
        capture_snapshots(config, root, frozen, &html, log);
    }

    let dump = report::write_dump(frozen, &output_dir, generated_at)?;
    println!("Results written to {}", dump.display());
    log_event(
        log,
        LogEvent::DumpWritten {
            path: dump.display().to_string(),
        },
    );

    let tally = frozen.tally();
    println!("\n{tally}");
    log_event(
        log,
        LogEvent::RunCompleted {
            summary: tally.to_string(),
        },
    );

    Ok(RunOutcome {
        tally,
        html,
        dump,
        log: log.path().to_path_buf(),
    })
}

fn stop_session(handle: SessionHandle, log: &ExecutionLog) {
    let session = handle.name().to_string();
    match handle.stop() {
        Ok(()) => log_event(log, LogEvent::SessionStopped { session }),
        Err(e) => {
            warn!(session = %session, error = %format!("{e:#}"), "session teardown failed");
            println!("Warning: failed to stop session '{session}': {e:#}");
            log_event(
                log,
                LogEvent::SessionStopFailed {
                    session,
                    reason: format!("{e:#}"),
                },
            );
        }
    }
}

fn capture_snapshots(
    config: &ProjectConfig,
    root: &Path,
    frozen: &FrozenReport,
    html: &Path,
    log: &ExecutionLog,
) {
    let out_dir = root.join(&config.report.screenshot_dir);
    let mut browser = HeadlessChrome::new(&config.capture);
    match capture::capture_failures(frozen, html, &out_dir, &config.capture, &mut browser) {
        Ok(summary) => {
            for (check_id, path) in &summary.captured {
                log_event(
                    log,
                    LogEvent::SnapshotCaptured {
                        check_id: check_id.clone(),
                        path: path.display().to_string(),
                    },
                );
            }
            for (check_id, reason) in &summary.failed {
                println!("Failed to capture snapshot for {check_id}: {reason}");
                log_event(
                    log,
                    LogEvent::SnapshotFailed {
                        check_id: check_id.clone(),
                        reason: reason.clone(),
                    },
                );
            }
            println!("Snapshots captured: {}", summary.captured.len());
        }
        Err(e) => {
            warn!(error = %e, "failure snapshots skipped");
            println!("Snapshots skipped: {e:#}");
        }
    }
}

fn install_interrupt_teardown(session: &str) -> Result<()> {
    let session = session.to_string();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted; tearing down session '{session}'");
        let _ = tmux::kill_session(&session);
        std::process::exit(130);
    })
    .context("failed to install Ctrl-C handler")
}

fn log_event(log: &ExecutionLog, event: LogEvent) {
    if let Err(e) = log.log(event) {
        warn!(error = %e, "failed to write execution log entry");
    }
}

/// Human-readable catalog listing in run order.
pub fn render_catalog(resolution: &catalog::Resolution) -> String {
    let mut output = String::new();
    for spec in &resolution.declared {
        let missing = resolution.missing.iter().any(|m| m.id == spec.id);
        let mark = if missing { "missing" } else { "ok" };
        output.push_str(&format!("  [{mark:<7}] {}\n", spec.description));
        output.push_str(&format!("            {}\n", spec.id));
    }
    output.push_str(&format!(
        "\n{} runnable, {} missing\n",
        resolution.runnable.len(),
        resolution.missing.len()
    ));
    output
}

/// Submit `commands` through the side channel and return the trimmed output.
pub fn session_exec(
    config: &ProjectConfig,
    session: Option<String>,
    commands: &[String],
) -> Result<String> {
    let session = session
        .or_else(|| std::env::var(SESSION_ENV).ok())
        .unwrap_or_else(|| tmux::session_name(&config.session.name));
    if !tmux::session_exists(&session) {
        bail!("session '{session}' is not running; start a batch with `checkrun run`");
    }
    let channel = SideChannel::new(TmuxSink::new(&session), &config.side_channel);
    let output = channel
        .request(commands)
        .with_context(|| format!("side-channel request to '{session}' failed"))?;
    Ok(output)
}

/// Classify a captured output file.
pub fn classify_file(path: &Path) -> Result<classify::Classification> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(classify::classify_detailed(&String::from_utf8_lossy(&bytes)))
}

fn push_kv(output: &mut String, key: &str, value: impl Display) {
    output.push_str(&format!("  {key:<22} {value}\n"));
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| format!("(defaults; no {CONFIG_DIR}/config.toml found)"))
}

pub fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Harness\n");
    push_kv(
        &mut output,
        "silence_timeout",
        format!("{}s", config.harness.silence_timeout_secs),
    );
    push_kv(&mut output, "retry_stalled", config.harness.retry_stalled);
    push_kv(&mut output, "check_dir", &config.harness.check_dir);
    push_kv(&mut output, "interpreter", &config.harness.interpreter);
    push_kv(&mut output, "echo_output", config.harness.echo_output);
    push_kv(
        &mut output,
        "pty_size",
        format!("{}x{}", config.harness.pty_cols, config.harness.pty_rows),
    );
    output.push('\n');

    output.push_str("Session\n");
    push_kv(&mut output, "enabled", config.session.enabled);
    push_kv(&mut output, "name", &config.session.name);
    push_kv(&mut output, "program", &config.session.program);
    if config.session.bootstrap.is_empty() {
        push_kv(&mut output, "bootstrap", "(none)");
    } else {
        push_kv(&mut output, "bootstrap", config.session.bootstrap.join(", "));
    }
    output.push('\n');

    output.push_str("Side Channel\n");
    push_kv(
        &mut output,
        "poll_interval",
        format!("{}ms", config.side_channel.poll_interval_millis),
    );
    push_kv(&mut output, "max_attempts", config.side_channel.max_attempts);
    push_kv(
        &mut output,
        "redirect_template",
        &config.side_channel.redirect_template,
    );
    output.push('\n');

    output.push_str("Report\n");
    push_kv(&mut output, "output_dir", &config.report.output_dir);
    push_kv(&mut output, "screenshot_dir", &config.report.screenshot_dir);
    output.push('\n');

    output.push_str("Capture\n");
    push_kv(&mut output, "enabled", config.capture.enabled);
    push_kv(&mut output, "browser", &config.capture.browser);
    push_kv(&mut output, "window width", config.capture.window_width);
    push_kv(&mut output, "max height", config.capture.max_height);
    output.push('\n');

    output.push_str("Checks\n");
    if config.checks.is_empty() {
        push_kv(
            &mut output,
            "catalog",
            format!("built-in ({} checks)", catalog::BUILTIN_CHECKS.len()),
        );
    } else {
        push_kv(
            &mut output,
            "catalog",
            format!("configured ({} checks)", config.checks.len()),
        );
    }
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

pub fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    payload["source_path"] = serde_json::Value::String(config_source_label(config_path));
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{RunRecord, Verdict};
    use crate::catalog::CheckEntry;
    use crate::config::HarnessSettings;
    use crate::session::SessionBackend;
    use chrono::Utc;
    use std::fs;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn run_flags_parse() {
        let cli = parse(&["checkrun", "run", "--check", "4.1 Securetransfer.py", "--no-capture", "-vv"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Run {
                check,
                no_session,
                no_capture,
            } => {
                assert_eq!(check.as_deref(), Some("4.1 Securetransfer.py"));
                assert!(!no_session);
                assert!(no_capture);
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn session_exec_takes_every_line() {
        let cli = parse(&["checkrun", "session-exec", "$p = Get-X", "$p.State"]);
        match cli.command {
            Command::SessionExec { session, commands } => {
                assert!(session.is_none());
                assert_eq!(commands, vec!["$p = Get-X", "$p.State"]);
            }
            other => panic!("expected SessionExec, got {other:?}"),
        }
    }

    #[test]
    fn session_exec_requires_a_command() {
        assert!(Cli::try_parse_from(["checkrun", "session-exec"]).is_err());
    }

    #[test]
    fn log_filter_follows_verbosity() {
        assert_eq!(log_filter(0), "checkrun=info");
        assert_eq!(log_filter(1), "checkrun=debug");
        assert_eq!(log_filter(5), "checkrun=trace");
    }

    fn resolution(dir: &Path, present: &[&str], declared: &[&str]) -> catalog::Resolution {
        for name in present {
            fs::write(dir.join(name), "print('Final Status: Pass')\n").unwrap();
        }
        let settings = HarnessSettings {
            check_dir: dir.display().to_string(),
            ..HarnessSettings::default()
        };
        let entries: Vec<CheckEntry> = declared
            .iter()
            .map(|id| CheckEntry {
                id: id.to_string(),
                description: None,
                path: None,
                program: None,
                args: vec![],
            })
            .collect();
        catalog::resolve(&settings, &entries, Path::new("/"))
    }

    #[test]
    fn select_single_check() {
        let tmp = tempfile::tempdir().unwrap();
        let res = resolution(tmp.path(), &["a.py", "b.py"], &["a.py", "b.py"]);
        let picked = select_checks(res, Some("b.py")).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "b.py");
    }

    #[test]
    fn select_missing_check_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let res = resolution(tmp.path(), &["a.py"], &["a.py", "gone.py"]);
        let err = select_checks(res, Some("gone.py")).unwrap_err();
        assert!(err.to_string().contains("not found"));

        let res = resolution(tmp.path(), &["a.py"], &["a.py"]);
        let err = select_checks(res, Some("nope.py")).unwrap_err();
        assert!(err.to_string().contains("unknown check"));
    }

    #[test]
    fn select_all_returns_runnable_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let res = resolution(tmp.path(), &["b.py", "a.py"], &["b.py", "gone.py", "a.py"]);
        let ids: Vec<_> = select_checks(res, None)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["b.py", "a.py"]);
    }

    #[test]
    fn catalog_listing_marks_missing_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let res = resolution(tmp.path(), &["a.py"], &["a.py", "gone.py"]);
        let listing = render_catalog(&res);
        assert!(listing.contains("[ok     ] Running check: a.py"));
        assert!(listing.contains("[missing] Running check: gone.py"));
        assert!(listing.contains("1 runnable, 1 missing"));
    }

    #[test]
    fn classify_file_reads_raw_output() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.txt");
        fs::write(&path, b"\x1b[91mFinal Status: Fail\x1b[0m\n").unwrap();
        let result = classify_file(&path).unwrap();
        assert_eq!(result.verdict, Verdict::Fail);
        assert_eq!(result.matched_text.as_deref(), Some("Final Status: Fail"));
    }

    #[test]
    fn render_config_human_groups_sections() {
        let rendered = render_config_human(&ProjectConfig::default(), None);
        for section in ["Harness", "Session", "Side Channel", "Report", "Capture", "Checks"] {
            assert!(rendered.contains(section), "missing section {section}");
        }
        assert!(rendered.contains("60s"));
        assert!(rendered.contains("1000ms"));
        assert!(rendered.contains("built-in (101 checks)"));
        assert!(rendered.contains("(defaults; no .checkrun/config.toml found)"));
    }

    #[test]
    fn render_config_json_is_valid() {
        let json = render_config_json(&ProjectConfig::default(), None).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["harness"]["silence_timeout_secs"], 60);
        assert_eq!(value["side_channel"]["max_attempts"], 15);
        assert_eq!(value["session"]["program"], "pwsh");
        assert!(value["source_path"].as_str().unwrap().contains("defaults"));
    }

    #[test]
    fn single_check_run_writes_report_without_session() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let mut config = ProjectConfig::default();
        config.harness.echo_output = false;
        config.capture.enabled = false;
        config.checks = vec![CheckEntry {
            id: "inline".to_string(),
            description: Some("Inline rule".to_string()),
            path: None,
            program: Some("sh".to_string()),
            args: vec!["-c".to_string(), "echo 'Final Status: Pass'".to_string()],
        }];

        let outcome = run_checks(
            &config,
            root,
            &RunOptions {
                check: Some("inline".to_string()),
                ..RunOptions::default()
            },
        )
        .unwrap();

        assert_eq!(outcome.tally.pass, 1);
        assert!(outcome.html.is_file());
        let dump = report::load_dump(&outcome.dump).unwrap();
        assert_eq!(dump.records.len(), 1);
        assert_eq!(dump.records[0].verdict, Verdict::Pass);
        assert!(outcome.log.starts_with(root.join(CONFIG_DIR)));
        let log = fs::read_to_string(&outcome.log).unwrap();
        assert!(log.contains("\"report_written\""));
        assert!(!log.contains("\"session_started\""));
    }

    struct UnkillableSession;

    impl SessionBackend for UnkillableSession {
        fn create(&self, _name: &str, _program: &str, _work_dir: &Path) -> Result<()> {
            Ok(())
        }

        fn send_line(&self, _name: &str, _line: &str) -> Result<()> {
            Ok(())
        }

        fn destroy(&self, _name: &str) -> Result<()> {
            bail!("server not responding")
        }
    }

    #[test]
    fn failed_teardown_still_writes_results() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let mut config = ProjectConfig::default();
        config.capture.enabled = false;
        let session =
            SessionHandle::start_with(Box::new(UnkillableSession), &config.session, root).unwrap();
        let log = ExecutionLog::new(&root.join("run.jsonl")).unwrap();
        let frozen = FrozenReport::from_records(vec![RunRecord {
            sequence: 0,
            check_id: "a.py".to_string(),
            description: "Rule A".to_string(),
            verdict: Verdict::Fail,
            output: "Final Status: Fail".to_string(),
            completed_at: Utc::now(),
            attempt: 1,
        }]);

        let outcome =
            finish_run(&config, root, &RunOptions::default(), &frozen, Some(session), &log)
                .unwrap();

        assert!(outcome.html.is_file());
        let dump = report::load_dump(&outcome.dump).unwrap();
        assert_eq!(dump.records[0].check_id, "a.py");
        let entries = fs::read_to_string(log.path()).unwrap();
        assert!(entries.contains("\"session_stop_failed\""));
        assert!(entries.contains("server not responding"));
        assert!(!entries.contains("\"session_stopped\""));
        assert!(entries.contains("\"run_completed\""));
    }
}
