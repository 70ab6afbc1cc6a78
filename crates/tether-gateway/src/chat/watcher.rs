//! Project file watcher.
//!
//! Bridges raw `notify` events into an async loop that debounces per path
//! (the latest event in a 500 ms window wins, firing at window end), filters
//! out noise (hidden files, build directories, temp/backup files, logs), and
//! maps each fired event to a context `update_file` call. Create/write
//! events auto-add their containing directory to the watch set, up to a
//! sanity cap.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_core::constants::{DEBOUNCE_WINDOW, FILE_EVENT_BUFFER, MAX_WATCHED_DIRS};
use tether_core::error::{Error, Result};

use super::context::{FileRole, SharedContext};

/// Directories commonly holding source files, watched up front when present.
const COMMON_DIRS: &[&str] = &[
    "src", "lib", "app", "components", "utils", "services", "internal", "pkg", "cmd", "api",
    "handlers", "models", "tests", "test", "__tests__", "spec", "docs", "scripts", "config",
];

/// Directories never worth watching.
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    ".svn",
    ".hg",
    "build",
    "dist",
    "target",
    "bin",
    "obj",
    ".next",
    ".nuxt",
    ".cache",
    "coverage",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    "vendor",
    ".vendor",
];

/// Filesystem operation, collapsed from notify's event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Create,
    Write,
    Remove,
    Rename,
    Other,
}

impl FileOp {
    fn from_kind(kind: &EventKind) -> Self {
        match kind {
            EventKind::Create(_) => FileOp::Create,
            EventKind::Modify(notify::event::ModifyKind::Name(_)) => FileOp::Rename,
            EventKind::Modify(_) => FileOp::Write,
            EventKind::Remove(_) => FileOp::Remove,
            _ => FileOp::Other,
        }
    }

    /// The context role this operation maps to.
    pub fn role(&self) -> FileRole {
        match self {
            FileOp::Create => FileRole::Created,
            FileOp::Write => FileRole::Active,
            FileOp::Remove => FileRole::Deleted,
            FileOp::Rename | FileOp::Other => FileRole::Modified,
        }
    }
}

/// A debounced event, path relative to the workdir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub op: FileOp,
}

/// Watcher tuning knobs.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub debounce: Duration,
    pub max_dirs: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: DEBOUNCE_WINDOW,
            max_dirs: MAX_WATCHED_DIRS,
        }
    }
}

/// True for paths the watcher should never report: hidden files (except
/// `.env` and `.gitignore`), build/cache directories, temp/backup/swap
/// files, and logs.
pub fn should_ignore(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();

    if name.starts_with('.') && name != ".env" && name != ".gitignore" {
        return true;
    }

    for component in path.components() {
        let part = component.as_os_str().to_string_lossy();
        if IGNORED_DIRS.contains(&part.as_ref()) {
            return true;
        }
    }

    if name.ends_with('~')
        || name.ends_with(".tmp")
        || name.ends_with(".temp")
        || name.ends_with(".swp")
        || name.ends_with(".swo")
        || name.starts_with('#')
    {
        return true;
    }

    name.ends_with(".log")
}

/// Per-path debounce state. The most recent op in a window wins; a window
/// restarts on every new event for its path.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    entries: HashMap<PathBuf, (Instant, FileOp)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    /// Record an event at `now`, restarting the path's window.
    pub fn push(&mut self, path: PathBuf, op: FileOp, now: Instant) {
        self.entries.insert(path, (now + self.window, op));
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|(due, _)| *due).min()
    }

    /// Drain every event whose window has elapsed at `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<FileEvent> {
        let due: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        due.into_iter()
            .filter_map(|path| {
                self.entries
                    .remove(&path)
                    .map(|(_, op)| FileEvent { path, op })
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Watches the project directory and feeds debounced events into the
/// conversation context.
pub struct ProjectWatcher {
    watcher: Arc<Mutex<RecommendedWatcher>>,
    events_rx: Mutex<Option<mpsc::Receiver<FileEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProjectWatcher {
    /// Start watching `workdir` and wiring debounced events into `context`.
    pub fn start(
        workdir: &Path,
        context: SharedContext,
        config: WatcherConfig,
    ) -> Result<Self> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<(PathBuf, FileOp)>(FILE_EVENT_BUFFER);

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(event) = res else { return };
            let op = FileOp::from_kind(&event.kind);
            for path in event.paths {
                // Raw events can arrive in bursts; drop on overflow, the
                // debouncer only cares about the most recent anyway.
                let _ = raw_tx.try_send((path, op));
            }
        })
        .map_err(|e| Error::Watch {
            message: format!("failed to create watcher: {}", e),
        })?;

        let watcher = Arc::new(Mutex::new(watcher));
        let mut watched: HashSet<PathBuf> = HashSet::new();

        // Initial watches: the workdir plus common source directories.
        add_watch(&watcher, &mut watched, workdir, config.max_dirs)?;
        for dir in COMMON_DIRS {
            let path = workdir.join(dir);
            if path.is_dir() {
                if let Err(e) = add_watch(&watcher, &mut watched, &path, config.max_dirs) {
                    warn!(dir = %path.display(), error = %e, "initial watch failed");
                }
            }
        }

        let (events_tx, events_rx) = mpsc::channel::<FileEvent>(FILE_EVENT_BUFFER);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(workdir = %workdir.display(), "file watcher started");

        let workdir = workdir.to_path_buf();
        let loop_watcher = watcher.clone();
        let debounce = config.debounce;
        let max_dirs = config.max_dirs;

        let task = tokio::spawn(async move {
            let mut debouncer = Debouncer::new(debounce);
            loop {
                let deadline = debouncer.next_deadline();
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    raw = raw_rx.recv() => {
                        let Some((path, op)) = raw else { break };
                        if should_ignore(&path) {
                            continue;
                        }
                        let Ok(rel) = path.strip_prefix(&workdir) else {
                            continue;
                        };
                        debouncer.push(rel.to_path_buf(), op, Instant::now());
                    }
                    _ = sleep_until_opt(deadline) => {
                        for event in debouncer.take_due(Instant::now()) {
                            handle_event(
                                &event,
                                &workdir,
                                &context,
                                &loop_watcher,
                                &mut watched,
                                max_dirs,
                            );
                            if events_tx.try_send(event).is_err() {
                                warn!("file event channel full, dropping event");
                            }
                        }
                    }
                }
            }
            debug!("file watcher loop ended");
        });

        Ok(Self {
            watcher,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Take the debounced event stream. Consume-or-lose.
    pub fn take_events(&self) -> Option<mpsc::Receiver<FileEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Explicitly watch the directory containing `path`.
    pub fn watch_file_dir(&self, workdir: &Path, path: &Path) -> Result<()> {
        let dir = workdir.join(path);
        let dir = dir.parent().unwrap_or(&dir);
        self.watcher
            .lock()
            .unwrap()
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Watch {
                message: format!("failed to watch {}: {}", dir.display(), e),
            })
    }

    /// Stop the watcher. Idempotent.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        info!("file watcher closed");
    }
}

fn handle_event(
    event: &FileEvent,
    workdir: &Path,
    context: &SharedContext,
    watcher: &Arc<Mutex<RecommendedWatcher>>,
    watched: &mut HashSet<PathBuf>,
    max_dirs: usize,
) {
    debug!(path = %event.path.display(), op = ?event.op, "file event");

    // New or rewritten files pull their directory into the watch set.
    if matches!(event.op, FileOp::Create | FileOp::Write) {
        let full = workdir.join(&event.path);
        if let Some(dir) = full.parent() {
            if let Err(e) = add_watch(watcher, watched, dir, max_dirs) {
                debug!(dir = %dir.display(), error = %e, "auto-watch failed");
            }
        }
    }

    let path_str = event.path.to_string_lossy();
    if let Err(e) = context.update_file(&path_str, event.op.role()) {
        debug!(path = %path_str, error = %e, "file context update failed");
    }
}

fn add_watch(
    watcher: &Arc<Mutex<RecommendedWatcher>>,
    watched: &mut HashSet<PathBuf>,
    dir: &Path,
    max_dirs: usize,
) -> Result<()> {
    if watched.contains(dir) {
        return Ok(());
    }
    if watched.len() >= max_dirs {
        return Err(Error::Watch {
            message: format!("watch cap reached ({})", max_dirs),
        });
    }

    watcher
        .lock()
        .unwrap()
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| Error::Watch {
            message: format!("failed to watch {}: {}", dir.display(), e),
        })?;

    watched.insert(dir.to_path_buf());
    debug!(dir = %dir.display(), "directory watched");
    Ok(())
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Tests
// =============================================================================
