//! Assistant child supervision.
//!
//! The adapter owns one assistant process attached to a PTY it allocates.
//! `initialize` is idempotent: it forks the child as session leader, starts
//! the output scanner and the child reaper, and blocks until the first
//! prompt (or fails with `InitTimeout`). Chat requests stream scanner
//! chunks until the next prompt; classified errors go through the recovery
//! hooks with a single write retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_core::constants::{
    ASSISTANT_ERROR_BUFFER, ASSISTANT_OUTPUT_BUFFER, DEFAULT_COLS, DEFAULT_ROWS,
    TERMINAL_CLOSE_GRACE,
};
use tether_core::error::{Error, Result};

use crate::chat::{
    classify, load_or_create, ChatHandler, ContextStore, ErrorKind, ErrorRecovery, FileRole,
    ProjectWatcher, RecoveryHooks, ReplyChunk, Role, SharedContext, WatcherConfig,
};
use crate::pty::{self, Pty, PtyCommand};

use super::config::AssistantConfig;
use super::scanner::{parse_actions, LineBuffer, OutputScanner, Scan};

const REPLY_BUFFER: usize = 10;

/// Channels out of the running child. Taken by the active chat turn,
/// replaced on restart.
struct Streams {
    output_rx: mpsc::Receiver<String>,
    prompt_rx: mpsc::Receiver<()>,
    error_rx: mpsc::Receiver<Error>,
}

/// Handles on the running child process.
#[derive(Default)]
struct ProcHandle {
    pty: Option<Arc<Pty>>,
    child_pid: Option<i32>,
    exited_rx: Option<watch::Receiver<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

struct AdapterInner {
    config: AssistantConfig,
    context: SharedContext,
    store: ContextStore,
    recovery: ErrorRecovery,
    watcher: std::sync::Mutex<Option<ProjectWatcher>>,
    initialized: AtomicBool,
    closed: AtomicBool,
    init_lock: Mutex<()>,
    // Serializes the format-then-write to the child's stdin.
    stdin_lock: Mutex<()>,
    // Serializes chat turns; the holder owns the stream receivers.
    chat_lock: Mutex<()>,
    proc: Mutex<ProcHandle>,
    streams: Mutex<Option<Streams>>,
}

/// Supervises the assistant child and answers chat requests.
#[derive(Clone)]
pub struct AssistantAdapter {
    inner: Arc<AdapterInner>,
}

impl AssistantAdapter {
    /// Create an adapter for a session. The child is not started until the
    /// first chat arrives. The file watcher starts immediately when enabled;
    /// if it cannot, the adapter continues without it.
    pub fn new(session_id: &str, config: AssistantConfig) -> Self {
        let store = ContextStore::new(&config.data_dir);
        let context = load_or_create(&store, session_id, &config.workdir);

        let watcher = if config.watch_files {
            match ProjectWatcher::start(&config.workdir, context.clone(), WatcherConfig::default())
            {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!(error = %e, "file watcher unavailable, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        Self {
            inner: Arc::new(AdapterInner {
                config,
                context,
                store,
                recovery: ErrorRecovery::default(),
                watcher: std::sync::Mutex::new(watcher),
                initialized: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                init_lock: Mutex::new(()),
                stdin_lock: Mutex::new(()),
                chat_lock: Mutex::new(()),
                proc: Mutex::new(ProcHandle::default()),
                streams: Mutex::new(None),
            }),
        }
    }

    /// Start the child and wait for its first prompt. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        self.inner.initialize().await
    }

    /// The conversation context handle.
    pub fn context(&self) -> &SharedContext {
        &self.inner.context
    }
}

#[async_trait]
impl ChatHandler for AssistantAdapter {
    async fn handle_chat(&self, role: &str, content: &str) -> Result<mpsc::Receiver<ReplyChunk>> {
        self.inner.initialize().await?;
        self.inner.context.add_message(Role::parse(role), content);

        let (reply_tx, reply_rx) = mpsc::channel(REPLY_BUFFER);
        let inner = self.inner.clone();
        let content = content.to_string();
        tokio::spawn(async move {
            inner.run_chat(content, reply_tx).await;
        });

        Ok(reply_rx)
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

impl AdapterInner {
    async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Assistant {
                message: "adapter is closed".into(),
            });
        }

        info!(
            program = %self.config.program,
            model = %self.config.model,
            workdir = %self.config.workdir.display(),
            "starting assistant"
        );

        let cmd = PtyCommand {
            program: self.config.program.clone(),
            args: self.config.args(),
            workdir: Some(self.config.workdir.clone()),
            env: self.config.env(),
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            // Echo off so the scanner never sees our own input reflected.
            echo: false,
        };

        let (pty, slave) = Pty::open(cmd.rows, cmd.cols, cmd.echo)?;
        let mut child = Pty::spawn_child(&cmd, slave)?;
        let pty = Arc::new(pty);
        let child_pid = child.id().map(|pid| pid as i32);

        let (output_tx, output_rx) = mpsc::channel::<String>(ASSISTANT_OUTPUT_BUFFER);
        let (prompt_tx, mut prompt_rx) = mpsc::channel::<()>(1);
        let (error_tx, mut error_rx) = mpsc::channel::<Error>(ASSISTANT_ERROR_BUFFER);
        let (exited_tx, exited_rx) = watch::channel(false);

        // Output scanner: bytes -> lines -> flushed chunks + prompt signals.
        let scan_pty = pty.clone();
        let scanner_task = tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            let mut scanner = OutputScanner::new();
            let mut buf = vec![0u8; 4096];
            loop {
                match scan_pty.read(&mut buf).await {
                    Ok(Some(n)) => {
                        for line in lines.push(&buf[..n]) {
                            debug!(line = %line, "assistant output");
                            match scanner.push_line(&line) {
                                Scan::Buffered => {}
                                Scan::Flush(chunk) => {
                                    if output_tx.send(chunk).await.is_err() {
                                        return;
                                    }
                                }
                                Scan::Prompt(flushed) => {
                                    if let Some(chunk) = flushed {
                                        if output_tx.send(chunk).await.is_err() {
                                            return;
                                        }
                                    }
                                    // At most one pending prompt signal.
                                    let _ = prompt_tx.try_send(());
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("assistant pty EOF");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "assistant output scanner stopping");
                        break;
                    }
                }
            }
        });

        // Child reaper: signal-kill is a normal shutdown, a non-zero exit is
        // a process error.
        let reap_errors = error_tx.clone();
        let reaper_task = tokio::spawn(async move {
            use std::os::unix::process::ExitStatusExt;
            match child.wait().await {
                Ok(status) => {
                    if status.success() || status.signal().is_some() {
                        debug!(?status, "assistant exited");
                    } else {
                        let _ = reap_errors
                            .send(Error::Assistant {
                                message: format!("assistant process exited: {}", status),
                            })
                            .await;
                    }
                }
                Err(e) => {
                    let _ = reap_errors
                        .send(Error::Assistant {
                            message: format!("assistant wait failed: {}", e),
                        })
                        .await;
                }
            }
            let _ = exited_tx.send(true);
        });

        {
            let mut proc = self.proc.lock().await;
            proc.pty = Some(pty);
            proc.child_pid = child_pid;
            proc.exited_rx = Some(exited_rx);
            proc.tasks = vec![scanner_task, reaper_task];
        }

        let outcome = tokio::select! {
            signal = prompt_rx.recv() => match signal {
                Some(()) => Ok(()),
                None => Err(Error::Assistant {
                    message: "assistant output closed before first prompt".into(),
                }),
            },
            err = error_rx.recv() => Err(err.unwrap_or(Error::Assistant {
                message: "assistant error channel closed".into(),
            })),
            _ = tokio::time::sleep(self.config.init_timeout) => Err(Error::InitTimeout),
        };

        match outcome {
            Ok(()) => {
                *self.streams.lock().await = Some(Streams {
                    output_rx,
                    prompt_rx,
                    error_rx,
                });
                self.initialized.store(true, Ordering::SeqCst);
                info!("assistant initialized");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "assistant initialization failed");
                self.teardown_process().await;
                Err(e)
            }
        }
    }

    /// One chat turn: write the message, stream chunks until the next
    /// prompt, persist the context. Turns are serialized by `chat_lock`.
    async fn run_chat(&self, content: String, reply_tx: mpsc::Sender<ReplyChunk>) {
        let _turn = self.chat_lock.lock().await;

        let Some(mut streams) = self.streams.lock().await.take() else {
            let _ = reply_tx
                .send(ReplyChunk::finished(ErrorKind::Process.user_message()))
                .await;
            return;
        };

        if let Err(e) = self.write_line(&content).await {
            let classified = classify(&e);
            let recovered = self.recovery.recover(&classified, self).await.is_ok();
            if recovered {
                if let Some(fresh) = self.streams.lock().await.take() {
                    streams = fresh;
                }
            }
            if !recovered || self.write_line(&content).await.is_err() {
                let _ = reply_tx
                    .send(ReplyChunk::finished(classified.user_message()))
                    .await;
                self.put_streams(streams).await;
                self.persist_context();
                return;
            }
        }

        let deadline = tokio::time::sleep(self.config.chat_timeout);
        tokio::pin!(deadline);

        let mut response = String::new();
        let mut files = Vec::new();
        let mut actions = Vec::new();
        let mut write_retried = false;

        loop {
            tokio::select! {
                // Biased: errors preempt, and pending output is streamed
                // before a prompt ends the turn, keeping chunks in scanner
                // order.
                biased;

                err = streams.error_rx.recv() => {
                    let err = err.unwrap_or(Error::Assistant {
                        message: "assistant error channel closed".into(),
                    });
                    let classified = classify(&err);

                    if !write_retried
                        && self.recovery.recover(&classified, self).await.is_ok()
                    {
                        write_retried = true;
                        if let Some(fresh) = self.streams.lock().await.take() {
                            streams = fresh;
                        }
                        if self.write_line(&content).await.is_ok() {
                            info!("recovered mid-chat, message re-sent");
                            continue;
                        }
                    }

                    let _ = reply_tx
                        .send(ReplyChunk::finished(classified.user_message()))
                        .await;
                    self.persist_context();
                    break;
                }
                chunk = streams.output_rx.recv() => {
                    let Some(chunk) = chunk else {
                        let _ = reply_tx
                            .send(ReplyChunk::finished(ErrorKind::Process.user_message()))
                            .await;
                        break;
                    };
                    response.push_str(&chunk);
                    let (f, a) = parse_actions(&chunk);
                    files.extend(f);
                    actions.extend(a);
                    if reply_tx.send(ReplyChunk::partial(chunk)).await.is_err() {
                        // The reply receiver is gone (client disconnected
                        // mid-chat). Keep consuming until the child reaches
                        // its prompt so no leftover output bleeds into the
                        // next turn.
                        debug!("reply receiver dropped, draining turn");
                        let completed = self
                            .drain_to_prompt(&mut streams, &mut response, &mut files, &mut actions)
                            .await;
                        if completed {
                            self.record_turn(&response, &files, &actions);
                        } else {
                            self.persist_context();
                        }
                        break;
                    }
                }
                _ = streams.prompt_rx.recv() => {
                    self.record_turn(&response, &files, &actions);
                    let _ = reply_tx.send(ReplyChunk::finished("")).await;
                    break;
                }
                _ = &mut deadline => {
                    let _ = reply_tx
                        .send(ReplyChunk::finished(ErrorKind::Timeout.user_message()))
                        .await;
                    break;
                }
            }
        }

        self.put_streams(streams).await;
    }

    /// Consume scanner output until the child reaches its next prompt,
    /// accumulating into the abandoned turn's response. Returns true when
    /// the prompt arrived; false when the stream ended or the deadline
    /// passed first.
    async fn drain_to_prompt(
        &self,
        streams: &mut Streams,
        response: &mut String,
        files: &mut Vec<String>,
        actions: &mut Vec<String>,
    ) -> bool {
        let deadline = tokio::time::sleep(self.config.chat_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                // Same bias as the main loop: leftovers first, prompt last.
                biased;

                chunk = streams.output_rx.recv() => {
                    let Some(chunk) = chunk else { return false };
                    let (f, a) = parse_actions(&chunk);
                    response.push_str(&chunk);
                    files.extend(f);
                    actions.extend(a);
                }
                _ = streams.prompt_rx.recv() => return true,
                _ = streams.error_rx.recv() => return false,
                _ = &mut deadline => return false,
            }
        }
    }

    /// Append a completed assistant turn to the context and persist it.
    fn record_turn(&self, response: &str, files: &[String], actions: &[String]) {
        if !response.is_empty() {
            self.context
                .add_assistant_response(response, files.to_vec(), actions.to_vec());
            for file in files {
                if let Err(e) = self.context.update_file(file, FileRole::Active) {
                    debug!(file = %file, error = %e, "file context update failed");
                }
            }
        }
        self.persist_context();
    }

    /// Write `<content>\n` to the child's stdin, serialized so concurrent
    /// writers cannot interleave.
    async fn write_line(&self, content: &str) -> Result<()> {
        let _guard = self.stdin_lock.lock().await;
        let pty = self.proc.lock().await.pty.clone().ok_or(Error::Assistant {
            message: "assistant not running".into(),
        })?;
        pty.write(format!("{}\n", content).as_bytes()).await
    }

    /// Return stream receivers unless a restart already installed fresh
    /// ones.
    async fn put_streams(&self, streams: Streams) {
        let mut slot = self.streams.lock().await;
        if slot.is_none() {
            *slot = Some(streams);
        }
    }

    fn persist_context(&self) {
        if let Err(e) = self.store.save(&self.context.snapshot()) {
            warn!(error = %e, "failed to persist conversation context");
        }
    }

    /// Stop the child (SIGTERM, grace, SIGKILL), abort the tasks, release
    /// the PTY, and clear the initialized flag.
    async fn teardown_process(&self) {
        let (pid, exited_rx, tasks, pty) = {
            let mut proc = self.proc.lock().await;
            (
                proc.child_pid.take(),
                proc.exited_rx.take(),
                std::mem::take(&mut proc.tasks),
                proc.pty.take(),
            )
        };

        if let Some(pid) = pid {
            pty::signal_pid(pid, Signal::SIGTERM);
            let reaped = match exited_rx {
                Some(mut rx) => tokio::time::timeout(TERMINAL_CLOSE_GRACE, rx.changed())
                    .await
                    .is_ok(),
                None => false,
            };
            if !reaped {
                warn!("assistant survived grace period, killing");
                pty::signal_pid(pid, Signal::SIGKILL);
            }
        }

        for task in tasks {
            task.abort();
        }
        drop(pty);

        *self.streams.lock().await = None;
        self.initialized.store(false, Ordering::SeqCst);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let watcher = self.watcher.lock().unwrap().take();
        if let Some(watcher) = watcher {
            watcher.close().await;
        }

        self.teardown_process().await;
        self.persist_context();
        info!("assistant adapter closed");
    }
}

#[async_trait]
impl RecoveryHooks for AdapterInner {
    async fn restart_process(&self) -> Result<()> {
        info!("restarting assistant process");
        self.teardown_process().await;
        self.initialize().await
    }

    async fn reset_connection(&self) -> Result<()> {
        // Reopening the PTY under a live child would leave it without a
        // controlling terminal; a full restart is the only sound reset.
        self.restart_process().await
    }

    async fn cleanup_resources(&self) -> Result<()> {
        self.persist_context();
        if let Some(streams) = self.streams.lock().await.as_mut() {
            while streams.output_rx.try_recv().is_ok() {}
            while streams.error_rx.try_recv().is_ok() {}
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
