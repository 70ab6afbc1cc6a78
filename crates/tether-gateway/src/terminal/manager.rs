//! Terminal session manager.
//!
//! Owns the map of terminal sessions for one connection: creation up to a
//! cap, lookup, explicit close, and a background sweep that reaps sessions
//! idle past the timeout or whose child has exited.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use tether_core::constants::{CLEANUP_INTERVAL, MAX_TERMINALS, TERMINAL_IDLE_TIMEOUT};
use tether_core::error::{Error, Result};

use super::session::{TerminalConfig, TerminalSession};

/// Manager tuning knobs; defaults match the protocol constants.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum concurrent sessions.
    pub max_sessions: usize,
    /// Idle age at which a session is reaped.
    pub idle_timeout: Duration,
    /// Interval between sweeps.
    pub cleanup_interval: Duration,
    /// Shell for new terminals.
    pub shell: String,
    /// Environment (`NAME`, `VALUE`) pairs applied to every terminal.
    pub base_env: Vec<(String, String)>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: MAX_TERMINALS,
            idle_timeout: TERMINAL_IDLE_TIMEOUT,
            cleanup_interval: CLEANUP_INTERVAL,
            shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".into()),
            base_env: Vec::new(),
        }
    }
}

/// Set of terminal sessions with a cap and an idle reaper.
pub struct TerminalManager {
    config: ManagerConfig,
    sessions: Mutex<HashMap<String, Arc<TerminalSession>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TerminalManager {
    /// Create a manager. Call [`TerminalManager::start_sweeper`] to enable
    /// background reaping.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Create and start a terminal. Enforces the session cap before any
    /// process is spawned.
    pub fn create(
        &self,
        workdir: Option<String>,
        env: Vec<(String, String)>,
        rows: u16,
        cols: u16,
    ) -> Result<Arc<TerminalSession>> {
        let mut sessions = self.sessions.lock().unwrap();

        if sessions.len() >= self.config.max_sessions {
            return Err(Error::CapReached {
                max: self.config.max_sessions,
            });
        }

        let id = Uuid::new_v4().to_string();
        let mut merged_env = self.config.base_env.clone();
        merged_env.extend(env);

        let config = TerminalConfig {
            shell: self.config.shell.clone(),
            workdir: workdir.map(Into::into),
            env: merged_env,
            rows,
            cols,
            ..Default::default()
        };

        let mut session = TerminalSession::new(id.clone(), config);
        session.start()?;
        let session = Arc::new(session);
        sessions.insert(id.clone(), session.clone());

        info!(
            id = %id,
            total = sessions.len(),
            "terminal created"
        );

        Ok(session)
    }

    /// Look up a running session.
    pub fn get(&self, id: &str) -> Result<Arc<TerminalSession>> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if !session.is_running() {
            return Err(Error::NotRunning(id.to_string()));
        }
        Ok(session)
    }

    /// Remove and close a session.
    pub async fn close(&self, id: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions
                .remove(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?
        };

        session.close().await;
        info!(id = %id, "terminal removed");
        Ok(())
    }

    /// Ids of running sessions.
    pub fn list(&self) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.is_running())
            .map(|s| s.id().to_string())
            .collect()
    }

    /// Number of tracked sessions, running or not.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// True when no sessions are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One reap pass at `now`: removes sessions idle past the timeout and
    /// sessions whose child has exited. The manager lock is held across the
    /// scan; closing happens after the removals are decided.
    pub async fn sweep_once(&self, now: Instant) {
        let reaped: Vec<Arc<TerminalSession>> = {
            let mut sessions = self.sessions.lock().unwrap();
            let doomed: Vec<String> = sessions
                .values()
                .filter(|s| {
                    !s.is_running()
                        || now.saturating_duration_since(s.last_used())
                            > self.config.idle_timeout
                })
                .map(|s| s.id().to_string())
                .collect();

            doomed
                .iter()
                .filter_map(|id| sessions.remove(id))
                .collect()
        };

        if reaped.is_empty() {
            return;
        }

        for session in &reaped {
            debug!(id = %session.id(), "reaping terminal");
            session.close().await;
        }

        info!(reaped = reaped.len(), remaining = self.len(), "terminal sweep");
    }

    /// Spawn the periodic sweep task.
    pub fn start_sweeper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval = self.config.cleanup_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                manager.sweep_once(Instant::now()).await;
            }
        });
        *self.sweeper.lock().unwrap() = Some(task);
    }

    /// Close every session and stop the sweeper.
    pub async fn shutdown(&self) {
        if let Some(task) = self.sweeper.lock().unwrap().take() {
            task.abort();
        }

        let drained: Vec<Arc<TerminalSession>> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain().map(|(_, s)| s).collect()
        };

        for session in drained {
            session.close().await;
        }

        info!("terminal manager shut down");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager(max: usize) -> TerminalManager {
        TerminalManager::new(ManagerConfig {
            max_sessions: max,
            shell: "/bin/sh".into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn cap_is_enforced_before_spawn() {
        let manager = test_manager(2);

        let a = match manager.create(None, Vec::new(), 24, 80) {
            Ok(s) => s,
            Err(_) => {
                eprintln!("skipping: no pty available");
                return;
            }
        };
        let _b = manager.create(None, Vec::new(), 24, 80).unwrap();

        let err = manager.create(None, Vec::new(), 24, 80).unwrap_err();
        assert!(matches!(err, Error::CapReached { max: 2 }));

        // Closing one frees a slot.
        manager.close(a.id()).await.unwrap();
        assert!(manager.create(None, Vec::new(), 24, 80).is_ok());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn get_distinguishes_missing_from_dead() {
        let manager = test_manager(4);
        assert!(matches!(manager.get("nope"), Err(Error::NotFound(_))));

        let session = match manager.create(None, Vec::new(), 24, 80) {
            Ok(s) => s,
            Err(_) => {
                eprintln!("skipping: no pty available");
                return;
            }
        };
        let id = session.id().to_string();
        assert!(manager.get(&id).is_ok());

        session.close().await;
        assert!(matches!(manager.get(&id), Err(Error::NotRunning(_))));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_reaps_idle_and_dead_sessions() {
        let manager = test_manager(4);
        let session = match manager.create(None, Vec::new(), 24, 80) {
            Ok(s) => s,
            Err(_) => {
                eprintln!("skipping: no pty available");
                return;
            }
        };
        let id = session.id().to_string();

        // Fresh session survives a sweep at the current time.
        manager.sweep_once(Instant::now()).await;
        assert!(manager.get(&id).is_ok());

        // Well past the idle timeout it is reaped.
        let future = Instant::now() + TERMINAL_IDLE_TIMEOUT + Duration::from_secs(1);
        manager.sweep_once(future).await;
        assert!(matches!(manager.get(&id), Err(Error::NotFound(_))));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn list_reports_running_sessions() {
        let manager = test_manager(4);
        assert!(manager.list().is_empty());

        let session = match manager.create(None, Vec::new(), 24, 80) {
            Ok(s) => s,
            Err(_) => {
                eprintln!("skipping: no pty available");
                return;
            }
        };

        let listed = manager.list();
        assert_eq!(listed, vec![session.id().to_string()]);

        manager.shutdown().await;
        assert!(manager.list().is_empty());
    }
}
