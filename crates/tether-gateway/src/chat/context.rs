//! Conversation context: per-session record of AI interaction.
//!
//! Tracks the ordered message log, the file-role map, and token usage.
//! Snapshots are persisted as JSON to `<data-dir>/<session-id>.json`
//! atomically (write to a temp file, then rename) on every response
//! completion and on shutdown.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tether_core::error::{Error, Result};
use tether_core::protocol::message::now_ms;

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Parse a wire role string; anything unrecognized is treated as user.
    pub fn parse(s: &str) -> Self {
        match s {
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::User,
        }
    }
}

/// How a file participates in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRole {
    Active,
    Readonly,
    Created,
    Deleted,
    Modified,
}

/// One entry in the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub id: String,
    pub timestamp_ms: u64,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
}

/// Tracked state of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub role: FileRole,
    pub size: u64,
    pub modified_secs: u64,
    pub checksum: String,
}

/// Accumulated model usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub request_count: u64,
}

/// The full per-session record. Serializable as the on-disk snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub session_id: String,
    pub workdir: PathBuf,
    pub start_time_ms: u64,
    pub last_activity_ms: u64,
    pub messages: Vec<ContextMessage>,
    pub files: BTreeMap<String, FileRecord>,
    pub token_usage: TokenUsage,
}

impl ConversationContext {
    pub fn new(session_id: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        let now = now_ms();
        Self {
            session_id: session_id.into(),
            workdir: workdir.into(),
            start_time_ms: now,
            last_activity_ms: now,
            messages: Vec::new(),
            files: BTreeMap::new(),
            token_usage: TokenUsage::default(),
        }
    }
}

/// Mutex-protected handle to a conversation context; every mutation goes
/// through here.
#[derive(Clone)]
pub struct SharedContext {
    inner: Arc<Mutex<ConversationContext>>,
}

impl SharedContext {
    pub fn new(session_id: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self::from_context(ConversationContext::new(session_id, workdir))
    }

    pub fn from_context(ctx: ConversationContext) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ctx)),
        }
    }

    /// Append a message to the log.
    pub fn add_message(&self, role: Role, content: &str) {
        let mut ctx = self.inner.lock().unwrap();
        ctx.messages.push(ContextMessage {
            id: Uuid::new_v4().to_string(),
            timestamp_ms: now_ms(),
            role,
            content: content.to_string(),
            files: Vec::new(),
            actions: Vec::new(),
        });
        ctx.last_activity_ms = now_ms();
        debug!(
            session_id = %ctx.session_id,
            ?role,
            total = ctx.messages.len(),
            "message added to context"
        );
    }

    /// Append an assistant response with the files it touched and the
    /// actions it took.
    pub fn add_assistant_response(&self, content: &str, files: Vec<String>, actions: Vec<String>) {
        let mut ctx = self.inner.lock().unwrap();
        ctx.messages.push(ContextMessage {
            id: Uuid::new_v4().to_string(),
            timestamp_ms: now_ms(),
            role: Role::Assistant,
            content: content.to_string(),
            files,
            actions,
        });
        ctx.last_activity_ms = now_ms();
    }

    /// Record a file's role. `Deleted` only marks the entry; other roles
    /// stat the file under the workdir and refresh size, mtime, and the
    /// `size-mtime` fingerprint.
    pub fn update_file(&self, path: &str, role: FileRole) -> Result<()> {
        let mut ctx = self.inner.lock().unwrap();

        if role == FileRole::Deleted {
            if let Some(record) = ctx.files.get_mut(path) {
                record.role = FileRole::Deleted;
            }
            ctx.last_activity_ms = now_ms();
            return Ok(());
        }

        let full = ctx.workdir.join(path);
        let meta = std::fs::metadata(&full).map_err(|e| Error::Io(e))?;
        let modified_secs = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        ctx.files.insert(
            path.to_string(),
            FileRecord {
                role,
                size: meta.len(),
                modified_secs,
                checksum: fingerprint(meta.len(), modified_secs),
            },
        );
        ctx.last_activity_ms = now_ms();

        debug!(path, ?role, "file context updated");
        Ok(())
    }

    /// Accumulate token usage.
    pub fn update_token_usage(&self, prompt: u64, completion: u64, total: u64) {
        let mut ctx = self.inner.lock().unwrap();
        ctx.token_usage.prompt_tokens += prompt;
        ctx.token_usage.completion_tokens += completion;
        ctx.token_usage.total_tokens += total;
        ctx.token_usage.request_count += 1;
        ctx.last_activity_ms = now_ms();
    }

    /// Refresh the activity timestamp.
    pub fn touch(&self) {
        self.inner.lock().unwrap().last_activity_ms = now_ms();
    }

    /// The most recent `n` messages.
    pub fn recent_messages(&self, n: usize) -> Vec<ContextMessage> {
        let ctx = self.inner.lock().unwrap();
        let skip = ctx.messages.len().saturating_sub(n);
        ctx.messages[skip..].to_vec()
    }

    /// Paths currently active or created in the conversation.
    pub fn active_files(&self) -> Vec<String> {
        let ctx = self.inner.lock().unwrap();
        ctx.files
            .iter()
            .filter(|(_, r)| matches!(r.role, FileRole::Active | FileRole::Created))
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Clone the full context for persistence.
    pub fn snapshot(&self) -> ConversationContext {
        self.inner.lock().unwrap().clone()
    }

    pub fn session_id(&self) -> String {
        self.inner.lock().unwrap().session_id.clone()
    }
}

/// `size-mtime` fingerprint; cheap change detection, not a cryptographic
/// hash.
fn fingerprint(size: u64, modified_secs: u64) -> String {
    format!("{}-{}", size, modified_secs)
}

/// Owns the data directory where conversation snapshots live.
#[derive(Debug, Clone)]
pub struct ContextStore {
    data_dir: PathBuf,
}

impl ContextStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Snapshot path for a session.
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", session_id))
    }

    /// Persist a snapshot atomically.
    pub fn save(&self, ctx: &ConversationContext) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;

        let path = self.path_for(&ctx.session_id);
        let tmp = self.data_dir.join(format!(".{}.tmp", ctx.session_id));

        let data = serde_json::to_vec_pretty(ctx).map_err(|e| Error::Codec {
            message: format!("context serialization failed: {}", e),
        })?;
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;

        debug!(session_id = %ctx.session_id, path = %path.display(), "context saved");
        Ok(())
    }

    /// Load a snapshot if one exists.
    pub fn load(&self, session_id: &str) -> Result<Option<ConversationContext>> {
        let path = self.path_for(session_id);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };

        let ctx: ConversationContext = serde_json::from_slice(&data).map_err(|e| Error::Codec {
            message: format!("context deserialization failed: {}", e),
        })?;

        info!(
            session_id,
            messages = ctx.messages.len(),
            "context loaded from disk"
        );
        Ok(Some(ctx))
    }

    /// Remove snapshots older than `max_age`. Returns how many were removed.
    pub fn sweep_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = SystemTime::now() - max_age;
        let mut removed = 0;

        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::Io(e)),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if modified < cutoff {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove old snapshot");
                } else {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

/// Get an existing context from disk or create a fresh one.
pub fn load_or_create(
    store: &ContextStore,
    session_id: &str,
    workdir: impl Into<PathBuf>,
) -> SharedContext {
    match store.load(session_id) {
        Ok(Some(ctx)) => SharedContext::from_context(ctx),
        Ok(None) => SharedContext::new(session_id, workdir),
        Err(e) => {
            warn!(session_id, error = %e, "snapshot unreadable, starting fresh");
            SharedContext::new(session_id, workdir)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_accumulate_in_order() {
        let ctx = SharedContext::new("s1", "/tmp");
        ctx.add_message(Role::User, "first");
        ctx.add_assistant_response("second", vec!["a.rs".into()], vec!["edit:a.rs".into()]);

        let recent = ctx.recent_messages(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].role, Role::User);
        assert_eq!(recent[1].role, Role::Assistant);
        assert_eq!(recent[1].files, vec!["a.rs"]);
    }

    #[test]
    fn recent_messages_honors_the_limit() {
        let ctx = SharedContext::new("s1", "/tmp");
        for i in 0..5 {
            ctx.add_message(Role::User, &format!("msg {}", i));
        }

        let recent = ctx.recent_messages(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "msg 3");
        assert_eq!(recent[1].content, "msg 4");
    }

    #[test]
    fn update_file_stats_and_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.rs"), b"fn main() {}").unwrap();

        let ctx = SharedContext::new("s1", dir.path());
        ctx.update_file("main.rs", FileRole::Active).unwrap();

        let snapshot = ctx.snapshot();
        let record = snapshot.files.get("main.rs").unwrap();
        assert_eq!(record.role, FileRole::Active);
        assert_eq!(record.size, 12);
        assert_eq!(
            record.checksum,
            format!("{}-{}", record.size, record.modified_secs)
        );
    }

    #[test]
    fn deleted_marks_without_statting() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gone.rs"), b"x").unwrap();

        let ctx = SharedContext::new("s1", dir.path());
        ctx.update_file("gone.rs", FileRole::Created).unwrap();
        std::fs::remove_file(dir.path().join("gone.rs")).unwrap();

        // No stat happens for deletions, so this succeeds.
        ctx.update_file("gone.rs", FileRole::Deleted).unwrap();
        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.files.get("gone.rs").unwrap().role, FileRole::Deleted);

        // Deleting an untracked path is also fine.
        ctx.update_file("never-seen.rs", FileRole::Deleted).unwrap();
    }

    #[test]
    fn active_files_excludes_readonly_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.rs", "b.rs", "c.rs"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let ctx = SharedContext::new("s1", dir.path());
        ctx.update_file("a.rs", FileRole::Active).unwrap();
        ctx.update_file("b.rs", FileRole::Readonly).unwrap();
        ctx.update_file("c.rs", FileRole::Created).unwrap();

        let mut active = ctx.active_files();
        active.sort();
        assert_eq!(active, vec!["a.rs", "c.rs"]);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContextStore::new(dir.path());

        let ctx = SharedContext::new("s-roundtrip", "/work");
        ctx.add_message(Role::User, "hello");
        ctx.update_token_usage(10, 20, 30);

        store.save(&ctx.snapshot()).unwrap();
        let loaded = store.load("s-roundtrip").unwrap().unwrap();
        assert_eq!(loaded, ctx.snapshot());

        assert!(store.load("missing").unwrap().is_none());
    }

    #[test]
    fn save_is_atomic_on_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContextStore::new(dir.path());

        let ctx = SharedContext::new("s-atomic", "/work");
        store.save(&ctx.snapshot()).unwrap();
        ctx.add_message(Role::User, "again");
        store.save(&ctx.snapshot()).unwrap();

        // No temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn sweep_removes_only_old_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContextStore::new(dir.path());

        let ctx = SharedContext::new("s-fresh", "/work");
        store.save(&ctx.snapshot()).unwrap();

        // Nothing young enough gets swept.
        assert_eq!(store.sweep_older_than(Duration::from_secs(3600)).unwrap(), 0);
        // Everything older than zero seconds is fair game.
        assert_eq!(store.sweep_older_than(Duration::ZERO).unwrap(), 1);
        assert!(store.load("s-fresh").unwrap().is_none());
    }

    #[test]
    fn load_or_create_falls_back_to_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContextStore::new(dir.path());

        let ctx = load_or_create(&store, "s-new", "/work");
        assert_eq!(ctx.session_id(), "s-new");
        assert!(ctx.recent_messages(10).is_empty());

        ctx.add_message(Role::User, "persist me");
        store.save(&ctx.snapshot()).unwrap();

        let again = load_or_create(&store, "s-new", "/work");
        assert_eq!(again.recent_messages(10).len(), 1);
    }
}
