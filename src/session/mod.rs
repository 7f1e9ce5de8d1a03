//! Session supervisor: the one persistent interactive session of a run.
//!
//! Some checks need an authenticated shell that outlives any single check
//! process. The supervisor creates it once, submits the bootstrap
//! (authentication) lines once, and tears it down exactly once. Teardown is
//! tied to [`SessionHandle`]'s lifetime, so it also happens when a run
//! unwinds through an error.

pub mod side_channel;

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::SessionSettings;
use crate::tmux;

pub use side_channel::{CommandSink, SideChannel, SideChannelError, TmuxSink};

/// Environment variable carrying the session name to checks.
pub const SESSION_ENV: &str = "CHECKRUN_SESSION";

/// Process control for the persistent session.
pub trait SessionBackend: Send + Sync {
    fn create(&self, name: &str, program: &str, work_dir: &Path) -> Result<()>;
    fn send_line(&self, name: &str, line: &str) -> Result<()>;
    fn destroy(&self, name: &str) -> Result<()>;
}

/// Production backend: a detached tmux session.
#[derive(Debug, Default, Clone, Copy)]
pub struct TmuxBackend;

impl SessionBackend for TmuxBackend {
    fn create(&self, name: &str, program: &str, work_dir: &Path) -> Result<()> {
        tmux::check_tmux()?;
        tmux::create_session(name, program, &[], &work_dir.display().to_string())
    }

    fn send_line(&self, name: &str, line: &str) -> Result<()> {
        tmux::send_keys(name, line, true)
    }

    fn destroy(&self, name: &str) -> Result<()> {
        tmux::kill_session(name)
    }
}

/// The live persistent session. Dropping the handle tears the session down.
pub struct SessionHandle {
    name: String,
    alive: bool,
    backend: Box<dyn SessionBackend>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("name", &self.name)
            .field("alive", &self.alive)
            .finish()
    }
}

impl SessionHandle {
    /// Create the session on tmux and authenticate it.
    pub fn start(settings: &SessionSettings, work_dir: &Path) -> Result<Self> {
        Self::start_with(Box::new(TmuxBackend), settings, work_dir)
    }

    /// Create the session on `backend` and submit the bootstrap lines.
    ///
    /// If bootstrapping fails the half-started session is destroyed before
    /// the error is returned.
    pub fn start_with(
        backend: Box<dyn SessionBackend>,
        settings: &SessionSettings,
        work_dir: &Path,
    ) -> Result<Self> {
        let name = tmux::session_name(&settings.name);
        backend
            .create(&name, &settings.program, work_dir)
            .with_context(|| format!("failed to start persistent session '{name}'"))?;

        // From here on, Drop owns teardown.
        let handle = Self {
            name,
            alive: true,
            backend,
        };

        info!(session = %handle.name, "authenticating persistent session");
        for line in &settings.bootstrap {
            handle
                .backend
                .send_line(&handle.name, line)
                .with_context(|| {
                    format!("failed to bootstrap persistent session '{}'", handle.name)
                })?;
        }

        info!(session = %handle.name, program = %settings.program, "persistent session ready");
        Ok(handle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Environment entries that point checks at this session.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![(SESSION_ENV.to_string(), self.name.clone())]
    }

    /// Tear the session down, reporting any failure.
    pub fn stop(mut self) -> Result<()> {
        self.alive = false;
        self.backend
            .destroy(&self.name)
            .with_context(|| format!("failed to stop persistent session '{}'", self.name))?;
        info!(session = %self.name, "persistent session stopped");
        Ok(())
    }
}

impl CommandSink for SessionHandle {
    fn submit(&self, line: &str) -> Result<()> {
        self.backend.send_line(&self.name, line)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.alive {
            return;
        }
        self.alive = false;
        if let Err(e) = self.backend.destroy(&self.name) {
            warn!(session = %self.name, error = %e, "failed to tear down persistent session");
        } else {
            info!(session = %self.name, "persistent session torn down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeBackend {
        calls: Arc<Mutex<Vec<String>>>,
        fail_create: bool,
        fail_send: bool,
    }

    impl FakeBackend {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SessionBackend for FakeBackend {
        fn create(&self, name: &str, program: &str, _work_dir: &Path) -> Result<()> {
            if self.fail_create {
                anyhow::bail!("no tmux server");
            }
            self.calls.lock().unwrap().push(format!("create {name} {program}"));
            Ok(())
        }

        fn send_line(&self, name: &str, line: &str) -> Result<()> {
            if self.fail_send {
                anyhow::bail!("send failed");
            }
            self.calls.lock().unwrap().push(format!("send {name} {line}"));
            Ok(())
        }

        fn destroy(&self, name: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("destroy {name}"));
            Ok(())
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            enabled: true,
            name: "audit.session".to_string(),
            program: "pwsh".to_string(),
            bootstrap: vec!["Import-Module X".to_string(), "Connect-X".to_string()],
        }
    }

    #[test]
    fn start_creates_and_authenticates_once() {
        let backend = FakeBackend::default();
        let handle =
            SessionHandle::start_with(Box::new(backend.clone()), &settings(), Path::new("/tmp"))
                .unwrap();

        assert_eq!(handle.name(), "audit-session");
        assert!(handle.is_alive());
        assert_eq!(
            backend.calls(),
            vec![
                "create audit-session pwsh",
                "send audit-session Import-Module X",
                "send audit-session Connect-X",
            ]
        );
        handle.stop().unwrap();
        assert_eq!(backend.calls().last().unwrap(), "destroy audit-session");
    }

    #[test]
    fn stop_tears_down_exactly_once() {
        let backend = FakeBackend::default();
        let handle =
            SessionHandle::start_with(Box::new(backend.clone()), &settings(), Path::new("/tmp"))
                .unwrap();
        handle.stop().unwrap();

        let destroys = backend
            .calls()
            .iter()
            .filter(|c| c.starts_with("destroy"))
            .count();
        assert_eq!(destroys, 1);
    }

    #[test]
    fn drop_tears_down_on_error_paths() {
        let backend = FakeBackend::default();
        let run = || -> Result<()> {
            let _handle = SessionHandle::start_with(
                Box::new(backend.clone()),
                &settings(),
                Path::new("/tmp"),
            )?;
            anyhow::bail!("check batch blew up");
        };
        assert!(run().is_err());
        assert_eq!(backend.calls().last().unwrap(), "destroy audit-session");
    }

    #[test]
    fn create_failure_is_fatal_without_teardown() {
        let backend = FakeBackend {
            fail_create: true,
            ..FakeBackend::default()
        };
        let err = SessionHandle::start_with(Box::new(backend.clone()), &settings(), Path::new("/"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("no tmux server"));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn bootstrap_failure_destroys_half_started_session() {
        let backend = FakeBackend {
            fail_send: true,
            ..FakeBackend::default()
        };
        let err = SessionHandle::start_with(Box::new(backend.clone()), &settings(), Path::new("/"))
            .unwrap_err();
        assert!(err.to_string().contains("bootstrap"));
        assert_eq!(
            backend.calls(),
            vec!["create audit-session pwsh", "destroy audit-session"]
        );
    }

    #[test]
    fn env_points_checks_at_session() {
        let backend = FakeBackend::default();
        let handle =
            SessionHandle::start_with(Box::new(backend), &settings(), Path::new("/tmp")).unwrap();
        assert_eq!(
            handle.env(),
            vec![(SESSION_ENV.to_string(), "audit-session".to_string())]
        );
    }
}
