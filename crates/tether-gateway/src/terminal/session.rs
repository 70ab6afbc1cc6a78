//! One PTY-backed shell session.
//!
//! Four tasks run per session: a read pump (PTY master to the output
//! channel), a write pump (input channel to the master), a resize pump, and
//! a child reaper. The state machine is `Init -> Running -> Closed`,
//! forward-only; the reaper flips to `Closed` on child exit regardless of
//! exit status (non-zero exit and signal-kill during shutdown are normal).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tether_core::constants::{
    DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_TERM, TERMINAL_CLOSE_GRACE, TERMINAL_WRITE_TIMEOUT,
};
use tether_core::error::{Error, Result};

use crate::pty::{self, Pty, PtyCommand};

const IO_BUFFER: usize = 256;
const READ_CHUNK: usize = 4096;

/// Session lifecycle states. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Init,
    Running,
    Closed,
}

impl TerminalState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TerminalState::Init,
            1 => TerminalState::Running,
            _ => TerminalState::Closed,
        }
    }
}

/// Per-terminal configuration.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Shell to spawn.
    pub shell: String,
    /// Working directory; inherited when `None`.
    pub workdir: Option<PathBuf>,
    /// Extra environment (`NAME`, `VALUE`) pairs.
    pub env: Vec<(String, String)>,
    /// Initial rows.
    pub rows: u16,
    /// Initial columns.
    pub cols: u16,
    /// Send timeout for input.
    pub write_timeout: Duration,
    /// SIGTERM-to-SIGKILL grace on close.
    pub close_grace: Duration,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".into(),
            workdir: None,
            env: Vec::new(),
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            write_timeout: TERMINAL_WRITE_TIMEOUT,
            close_grace: TERMINAL_CLOSE_GRACE,
        }
    }
}

/// A PTY pair plus one child shell, with bidirectional I/O pumps.
#[derive(Debug)]
pub struct TerminalSession {
    id: String,
    config: TerminalConfig,
    state: Arc<AtomicU8>,
    closing: AtomicBool,
    last_used: Arc<Mutex<Instant>>,
    dims: Mutex<(u16, u16)>,

    // Populated by start(). The pumps own the PTY; it closes when the last
    // of them exits.
    child_pid: Option<i32>,
    input_tx: Option<mpsc::Sender<Vec<u8>>>,
    resize_tx: Option<mpsc::Sender<(u16, u16)>>,
    output_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    exited_rx: Option<watch::Receiver<bool>>,
}

impl TerminalSession {
    /// Create a session in the `Init` state.
    pub fn new(id: String, config: TerminalConfig) -> Self {
        Self {
            id,
            dims: Mutex::new((config.rows, config.cols)),
            config,
            state: Arc::new(AtomicU8::new(0)),
            closing: AtomicBool::new(false),
            last_used: Arc::new(Mutex::new(Instant::now())),
            child_pid: None,
            input_tx: None,
            resize_tx: None,
            output_rx: Mutex::new(None),
            shutdown_tx: None,
            exited_rx: None,
        }
    }

    /// Open the PTY, spawn the shell, and launch the four pumps.
    ///
    /// Must be called from within a tokio runtime. Fails with `PtyAlloc` or
    /// `Spawn`; either leaves the session in `Init`.
    pub fn start(&mut self) -> Result<()> {
        if self.state() != TerminalState::Init {
            return Err(Error::Protocol {
                message: format!("terminal {} already started", self.id),
            });
        }

        let mut env = self.config.env.clone();
        env.push(("TERM".into(), DEFAULT_TERM.into()));
        env.push(("TETHER_TERMINAL_ID".into(), self.id.clone()));

        let cmd = PtyCommand {
            program: self.config.shell.clone(),
            args: Vec::new(),
            workdir: self.config.workdir.clone(),
            env,
            rows: self.config.rows,
            cols: self.config.cols,
            echo: true,
        };

        let (pty, slave) = Pty::open(cmd.rows, cmd.cols, cmd.echo)?;
        let mut child = Pty::spawn_child(&cmd, slave)?;
        let pty = Arc::new(pty);

        self.child_pid = child.id().map(|pid| pid as i32);

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(IO_BUFFER);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(IO_BUFFER);
        let (resize_tx, mut resize_rx) = mpsc::channel::<(u16, u16)>(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (exited_tx, exited_rx) = watch::channel(false);

        // Write pump: input channel -> master.
        let write_pty = pty.clone();
        let mut write_shutdown = shutdown_rx.clone();
        let write_id = self.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_shutdown.changed() => break,
                    data = input_rx.recv() => {
                        let Some(data) = data else { break };
                        if let Err(e) = write_pty.write(&data).await {
                            warn!(id = %write_id, error = %e, "terminal write pump stopping");
                            break;
                        }
                    }
                }
            }
        });

        // Read pump: master -> output channel. Updates last-used on output.
        let read_pty = pty.clone();
        let mut read_shutdown = shutdown_rx.clone();
        let read_id = self.id.clone();
        let read_last_used = self.last_used.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                tokio::select! {
                    _ = read_shutdown.changed() => break,
                    read = read_pty.read(&mut buf) => match read {
                        Ok(Some(n)) => {
                            *read_last_used.lock().unwrap() = Instant::now();
                            if output_tx.send(buf[..n].to_vec()).await.is_err() {
                                debug!(id = %read_id, "terminal output receiver gone");
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!(id = %read_id, "terminal pty EOF");
                            break;
                        }
                        Err(e) => {
                            warn!(id = %read_id, error = %e, "terminal read pump stopping");
                            break;
                        }
                    }
                }
            }
            // Dropping output_tx closes the stream for the consumer.
        });

        // Resize pump: resize channel -> TIOCSWINSZ.
        let resize_pty = pty.clone();
        let mut resize_shutdown = shutdown_rx.clone();
        let resize_id = self.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = resize_shutdown.changed() => break,
                    size = resize_rx.recv() => {
                        let Some((rows, cols)) = size else { break };
                        if let Err(e) = resize_pty.resize(rows, cols) {
                            warn!(id = %resize_id, error = %e, "terminal resize failed");
                        }
                    }
                }
            }
        });

        // Child reaper: flips Running -> Closed on exit, whatever the status.
        let reaper_state = self.state.clone();
        let reaper_id = self.id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    info!(id = %reaper_id, ?status, "terminal child exited");
                }
                Err(e) => {
                    warn!(id = %reaper_id, error = %e, "terminal child wait failed");
                }
            }
            reaper_state.store(2, Ordering::SeqCst);
            let _ = exited_tx.send(true);
        });

        self.input_tx = Some(input_tx);
        self.resize_tx = Some(resize_tx);
        *self.output_rx.lock().unwrap() = Some(output_rx);
        self.shutdown_tx = Some(shutdown_tx);
        self.exited_rx = Some(exited_rx);
        self.state.store(1, Ordering::SeqCst);

        info!(
            id = %self.id,
            shell = %self.config.shell,
            rows = self.config.rows,
            cols = self.config.cols,
            "terminal started"
        );

        Ok(())
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TerminalState {
        TerminalState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// True while the child is alive.
    pub fn is_running(&self) -> bool {
        self.state() == TerminalState::Running
    }

    /// Last input/output activity.
    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap()
    }

    /// Current (rows, cols).
    pub fn dims(&self) -> (u16, u16) {
        *self.dims.lock().unwrap()
    }

    /// Queue input bytes for the shell.
    ///
    /// Fails with `NotRunning` when the child is gone and `WriteTimeout`
    /// when the input channel stays full past the write timeout.
    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning(self.id.clone()));
        }
        let tx = self
            .input_tx
            .as_ref()
            .ok_or_else(|| Error::NotRunning(self.id.clone()))?;

        *self.last_used.lock().unwrap() = Instant::now();

        match tokio::time::timeout(self.config.write_timeout, tx.send(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::NotRunning(self.id.clone())),
            Err(_) => Err(Error::WriteTimeout),
        }
    }

    /// Take the output stream. Consume-or-lose: only the first caller gets
    /// the receiver.
    pub fn take_output(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output_rx.lock().unwrap().take()
    }

    /// Change the window size.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning(self.id.clone()));
        }
        let tx = self
            .resize_tx
            .as_ref()
            .ok_or_else(|| Error::NotRunning(self.id.clone()))?;

        *self.dims.lock().unwrap() = (rows, cols);

        // A full resize slot means an older resize is still queued; the
        // newest size wins, so dropping the stale one is fine.
        match tx.try_send((rows, cols)) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::NotRunning(self.id.clone())),
        }
    }

    /// Close the session: stop the pumps, terminate the child (SIGTERM, then
    /// SIGKILL after the grace period), release the PTY. Idempotent; always
    /// leaves the session `Closed`.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(tx) = &self.shutdown_tx {
            let _ = tx.send(true);
        }

        if self.state() == TerminalState::Running {
            if let Some(pid) = self.child_pid {
                pty::signal_pid(pid, Signal::SIGTERM);

                let mut exited = self.exited_rx.clone();
                let reaped = match exited.as_mut() {
                    Some(rx) => tokio::time::timeout(self.config.close_grace, rx.changed())
                        .await
                        .is_ok(),
                    None => false,
                };
                if !reaped {
                    warn!(id = %self.id, "terminal child survived grace period, killing");
                    pty::signal_pid(pid, Signal::SIGKILL);
                }
            }
        }

        self.state.store(2, Ordering::SeqCst);
        info!(id = %self.id, "terminal closed");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TerminalConfig {
        TerminalConfig {
            shell: "/bin/sh".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn state_machine_is_forward_only() {
        let mut session = TerminalSession::new("t-test".into(), test_config());
        assert_eq!(session.state(), TerminalState::Init);
        assert!(!session.is_running());

        if session.start().is_err() {
            eprintln!("skipping: no pty available");
            return;
        }
        assert_eq!(session.state(), TerminalState::Running);

        // Double start is rejected.
        assert!(session.start().is_err());

        session.close().await;
        assert_eq!(session.state(), TerminalState::Closed);

        // close is idempotent.
        session.close().await;
        assert_eq!(session.state(), TerminalState::Closed);
    }

    #[tokio::test]
    async fn write_to_unstarted_session_fails() {
        let session = TerminalSession::new("t-init".into(), test_config());
        assert!(matches!(
            session.write(b"ls\n".to_vec()).await,
            Err(Error::NotRunning(_))
        ));
        assert!(matches!(session.resize(30, 100), Err(Error::NotRunning(_))));
    }

    #[tokio::test]
    async fn echo_roundtrip() {
        let mut session = TerminalSession::new("t-echo".into(), test_config());
        if session.start().is_err() {
            eprintln!("skipping: no pty available");
            return;
        }

        let mut output = session.take_output().expect("first take gets the stream");
        assert!(session.take_output().is_none(), "stream is consume-or-lose");

        session.write(b"echo tether-ok\n".to_vec()).await.unwrap();

        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(500), output.recv()).await {
                Ok(Some(chunk)) => {
                    collected.extend_from_slice(&chunk);
                    if String::from_utf8_lossy(&collected).contains("tether-ok") {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }

        assert!(String::from_utf8_lossy(&collected).contains("tether-ok"));
        session.close().await;
    }

    #[tokio::test]
    async fn resize_updates_dims() {
        let mut session = TerminalSession::new("t-resize".into(), test_config());
        if session.start().is_err() {
            eprintln!("skipping: no pty available");
            return;
        }

        assert_eq!(session.dims(), (24, 80));
        session.resize(50, 132).unwrap();
        assert_eq!(session.dims(), (50, 132));

        session.close().await;
    }

    #[tokio::test]
    async fn reaper_marks_closed_when_shell_exits() {
        let mut session = TerminalSession::new("t-exit".into(), test_config());
        if session.start().is_err() {
            eprintln!("skipping: no pty available");
            return;
        }

        session.write(b"exit\n".to_vec()).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while session.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(session.state(), TerminalState::Closed);
        session.close().await;
    }
}
