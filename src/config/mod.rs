use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::CheckEntry;

const CONFIG_FILENAME: &str = "config.toml";
pub const CONFIG_DIR: &str = ".checkrun";

fn default_silence_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_check_dir() -> String {
    ".".to_string()
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_pty_rows() -> u16 {
    24
}

fn default_pty_cols() -> u16 {
    120
}

fn default_session_name() -> String {
    "persistent_powershell".to_string()
}

fn default_session_program() -> String {
    "pwsh".to_string()
}

fn default_session_bootstrap() -> Vec<String> {
    vec![
        "Import-Module Microsoft.Graph.Identity.SignIns".to_string(),
        "Connect-MgGraph".to_string(),
    ]
}

fn default_poll_interval_millis() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    15
}

fn default_redirect_template() -> String {
    "{command} | Out-File -FilePath {path} -Append".to_string()
}

fn default_output_dir() -> String {
    ".".to_string()
}

fn default_screenshot_dir() -> String {
    "screenshots".to_string()
}

fn default_browser() -> String {
    "chromium".to_string()
}

fn default_window_width() -> u32 {
    1280
}

fn default_max_height() -> u32 {
    16384
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarnessSettings {
    /// Seconds without any output before a check is killed and skipped.
    #[serde(default = "default_silence_timeout_secs")]
    pub silence_timeout_secs: u64,
    /// Re-run stalled checks once after the ordered pass.
    #[serde(default = "default_true")]
    pub retry_stalled: bool,
    #[serde(default = "default_check_dir")]
    pub check_dir: String,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Mirror check output to the operator's terminal while capturing.
    #[serde(default = "default_true")]
    pub echo_output: bool,
    #[serde(default = "default_pty_rows")]
    pub pty_rows: u16,
    #[serde(default = "default_pty_cols")]
    pub pty_cols: u16,
}

impl HarnessSettings {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_timeout_secs)
    }
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            silence_timeout_secs: default_silence_timeout_secs(),
            retry_stalled: true,
            check_dir: default_check_dir(),
            interpreter: default_interpreter(),
            echo_output: true,
            pty_rows: default_pty_rows(),
            pty_cols: default_pty_cols(),
        }
    }
}

/// The persistent interactive session some checks talk to.
///
/// ```toml
/// [session]
/// name = "persistent_powershell"
/// program = "pwsh"
/// bootstrap = ["Import-Module Microsoft.Graph.Identity.SignIns", "Connect-MgGraph"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_session_name")]
    pub name: String,
    #[serde(default = "default_session_program")]
    pub program: String,
    /// Lines submitted once after the session starts (authentication).
    #[serde(default = "default_session_bootstrap")]
    pub bootstrap: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_session_name(),
            program: default_session_program(),
            bootstrap: default_session_bootstrap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SideChannelSettings {
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// How the final command is redirected into the result file.
    /// `{command}` and `{path}` are substituted.
    #[serde(default = "default_redirect_template")]
    pub redirect_template: String,
}

impl SideChannelSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }
}

impl Default for SideChannelSettings {
    fn default() -> Self {
        Self {
            poll_interval_millis: default_poll_interval_millis(),
            max_attempts: default_max_attempts(),
            redirect_template: default_redirect_template(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportSettings {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: String,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            screenshot_dir: default_screenshot_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_browser")]
    pub browser: String,
    #[serde(default = "default_window_width")]
    pub window_width: u32,
    /// Upper bound on a snapshot window; sections taller than this are cut.
    #[serde(default = "default_max_height")]
    pub max_height: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            browser: default_browser(),
            window_width: default_window_width(),
            max_height: default_max_height(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub harness: HarnessSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub side_channel: SideChannelSettings,
    #[serde(default)]
    pub report: ReportSettings,
    #[serde(default)]
    pub capture: CaptureSettings,
    /// Replaces the built-in catalog when non-empty.
    #[serde(default)]
    pub checks: Vec<CheckEntry>,
}

impl ProjectConfig {
    /// Load the nearest `.checkrun/config.toml` at or above `start`, along
    /// with the path it came from. No file means all defaults.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        let Some(path) = Self::find_config_file(start) else {
            return Ok((Self::default(), None));
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("could not read config {}", path.display()))?;
        let config = toml::from_str(&text)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok((config, Some(path)))
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILENAME))
            .find(|candidate| candidate.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ProjectConfig::default();
        assert_eq!(config.harness.silence_timeout_secs, 60);
        assert!(config.harness.retry_stalled);
        assert_eq!(config.harness.interpreter, "python3");
        assert_eq!(config.session.name, "persistent_powershell");
        assert_eq!(config.session.program, "pwsh");
        assert_eq!(config.session.bootstrap.len(), 2);
        assert_eq!(config.side_channel.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.side_channel.max_attempts, 15);
        assert_eq!(config.report.screenshot_dir, "screenshots");
        assert!(config.capture.enabled);
        assert!(config.checks.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[harness]
silence_timeout_secs = 30
retry_stalled = false
check_dir = "checks"
interpreter = "/usr/bin/python3.12"

[session]
name = "audit"
program = "bash"
bootstrap = []

[side_channel]
poll_interval_millis = 250
max_attempts = 4
redirect_template = "{command} > {path}"

[report]
output_dir = "out"

[capture]
enabled = false
browser = "google-chrome"

[[checks]]
id = "one.py"

[[checks]]
id = "two"
program = "/bin/true"
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.harness.silence_timeout(), Duration::from_secs(30));
        assert!(!config.harness.retry_stalled);
        assert_eq!(config.harness.check_dir, "checks");
        assert!(config.harness.echo_output);
        assert_eq!(config.session.name, "audit");
        assert!(config.session.bootstrap.is_empty());
        assert_eq!(config.side_channel.max_attempts, 4);
        assert_eq!(config.side_channel.redirect_template, "{command} > {path}");
        assert_eq!(config.report.output_dir, "out");
        assert_eq!(config.report.screenshot_dir, "screenshots");
        assert!(!config.capture.enabled);
        assert_eq!(config.capture.browser, "google-chrome");
        assert_eq!(config.checks.len(), 2);
        assert_eq!(config.checks[1].program.as_deref(), Some("/bin/true"));
    }

    #[test]
    fn load_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join(CONFIG_DIR);
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join(CONFIG_FILENAME),
            "[harness]\nsilence_timeout_secs = 5\n",
        )
        .unwrap();

        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert_eq!(config.harness.silence_timeout_secs, 5);
        assert!(path.is_some());
    }

    #[test]
    fn load_searches_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join(CONFIG_DIR);
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join(CONFIG_FILENAME), "[session]\nenabled = false\n").unwrap();
        let nested = tmp.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ProjectConfig::load(&nested).unwrap();
        assert!(!config.session.enabled);
        assert_eq!(path.unwrap(), config_dir.join(CONFIG_FILENAME));
    }

    #[test]
    fn missing_config_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert_eq!(config.harness.silence_timeout_secs, 60);
        assert!(path.is_none());
    }

    #[test]
    fn malformed_config_reports_path() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join(CONFIG_DIR);
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join(CONFIG_FILENAME), "[harness\n").unwrap();

        let err = ProjectConfig::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("invalid config"));
    }
}
