//! # Stage: Version Control Gateway
//!
//! ## Responsibility
//! The boundary between the pipeline and the shared, mutable file store.
//! Every write and delete is a compare-and-swap on a [`RevisionToken`]; there
//! is no blind overwrite in the API.
//!
//! ## Guarantees
//! - `write(path, content, None)` succeeds only if `path` does not exist.
//! - `write(path, content, Some(t))` / `delete(path, t)` succeed only if the
//!   current revision of `path` is exactly `t`.
//! - Revision tokens are content hashes (SHA-1, hex), so two reads of the
//!   same bytes always agree.
//!
//! ## NOT Responsible For
//! - Deciding what to write (see `ledger`).
//! - Undoing writes (see `rollback`).
//!
//! Two implementations ship with the crate: [`InMemoryGateway`] for tests and
//! fault injection, and [`FsGateway`] for a local directory tree.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

// ---------------------------------------------------------------------------
// RevisionToken / FileSnapshot
// ---------------------------------------------------------------------------

/// Opaque revision identifier for a single path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionToken(String);

impl RevisionToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Content-hash token used by the shipped gateways.
    pub fn of_content(content: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(content.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RevisionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form is enough to tell revisions apart in logs.
        let short = self.0.get(..12).unwrap_or(&self.0);
        write!(f, "{}", short)
    }
}

/// Current content and revision of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    pub content: String,
    pub revision: RevisionToken,
}

impl FileSnapshot {
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let revision = RevisionToken::of_content(&content);
        Self { content, revision }
    }
}

fn describe(token: Option<&RevisionToken>) -> String {
    match token {
        Some(t) => t.to_string(),
        None => "absent".to_string(),
    }
}

// ---------------------------------------------------------------------------
// GatewayError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The path's current revision is not the one the caller expected.
    #[error("revision conflict on {path}: expected {expected}, found {actual}")]
    Conflict {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("path not found: {0}")]
    NotFound(String),

    /// The store refused or could not serve the request.
    #[error("gateway unavailable for {path}: {reason}")]
    Unavailable { path: String, reason: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl GatewayError {
    fn conflict(path: &str, expected: Option<&RevisionToken>, actual: Option<&RevisionToken>) -> Self {
        GatewayError::Conflict {
            path: path.to_string(),
            expected: describe(expected),
            actual: describe(actual),
        }
    }
}

// ---------------------------------------------------------------------------
// VersionControlGateway trait
// ---------------------------------------------------------------------------

/// Compare-and-swap access to a versioned file store.
///
/// Implementations must be safe to call concurrently from many tasks.
pub trait VersionControlGateway: Send + Sync {
    /// Current content and revision, or `None` if the path does not exist.
    fn read(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<Option<FileSnapshot>, GatewayError>> + Send;

    /// Write `content` if the current revision equals `expected`
    /// (`None` = the path must not exist).  Returns the new revision.
    fn write(
        &self,
        path: &str,
        content: &str,
        expected: Option<&RevisionToken>,
    ) -> impl Future<Output = Result<RevisionToken, GatewayError>> + Send;

    /// Delete the path if its current revision equals `expected`.
    fn delete(
        &self,
        path: &str,
        expected: &RevisionToken,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;
}

// ---------------------------------------------------------------------------
// InMemoryGateway
// ---------------------------------------------------------------------------

/// Callback invoked with the path just before each write or delete.
pub type WriteHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    files: HashMap<String, String>,
    failing: HashSet<String>,
    writes: usize,
}

/// A gateway backed by a `HashMap`, with fault injection for tests.
///
/// Clones share the same underlying store.
#[derive(Clone, Default)]
pub struct InMemoryGateway {
    state: Arc<Mutex<MemoryState>>,
    write_delay: Option<Duration>,
    hook: Option<WriteHook>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file without any revision check.  Test setup only; the trait
    /// API never exposes this.
    pub fn seed(&self, path: &str, content: &str) -> RevisionToken {
        if let Ok(mut s) = self.state.lock() {
            s.files.insert(path.to_string(), content.to_string());
        }
        RevisionToken::of_content(content)
    }

    /// Builder-style seed.
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.seed(path, content);
        self
    }

    /// Every subsequent write or delete of `path` fails with `Unavailable`.
    pub fn fail_writes_on(&self, path: &str) {
        if let Ok(mut s) = self.state.lock() {
            s.failing.insert(path.to_string());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.failing.clear();
        }
    }

    /// Sleep this long before each write or delete.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn with_write_hook(mut self, hook: WriteHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Current content of `path`, bypassing the async API.
    pub fn content(&self, path: &str) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.files.get(path).cloned())
    }

    /// Number of successful writes and deletes so far.
    pub fn write_count(&self) -> usize {
        self.state.lock().map(|s| s.writes).unwrap_or(0)
    }

    fn lock(&self, path: &str) -> Result<std::sync::MutexGuard<'_, MemoryState>, GatewayError> {
        self.state.lock().map_err(|_| GatewayError::Unavailable {
            path: path.to_string(),
            reason: "store mutex poisoned".into(),
        })
    }

    async fn before_mutation(&self, path: &str) -> Result<(), GatewayError> {
        if let Some(hook) = &self.hook {
            hook(path);
        }
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        let s = self.lock(path)?;
        if s.failing.contains(path) {
            return Err(GatewayError::Unavailable {
                path: path.to_string(),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }
}

impl VersionControlGateway for InMemoryGateway {
    async fn read(&self, path: &str) -> Result<Option<FileSnapshot>, GatewayError> {
        let s = self.lock(path)?;
        Ok(s.files.get(path).map(|c| FileSnapshot::new(c.clone())))
    }

    async fn write(
        &self,
        path: &str,
        content: &str,
        expected: Option<&RevisionToken>,
    ) -> Result<RevisionToken, GatewayError> {
        self.before_mutation(path).await?;
        let mut s = self.lock(path)?;
        let actual = s.files.get(path).map(|c| RevisionToken::of_content(c));
        if actual.as_ref() != expected {
            return Err(GatewayError::conflict(path, expected, actual.as_ref()));
        }
        s.files.insert(path.to_string(), content.to_string());
        s.writes += 1;
        Ok(RevisionToken::of_content(content))
    }

    async fn delete(&self, path: &str, expected: &RevisionToken) -> Result<(), GatewayError> {
        self.before_mutation(path).await?;
        let mut s = self.lock(path)?;
        let actual = match s.files.get(path) {
            Some(c) => RevisionToken::of_content(c),
            None => return Err(GatewayError::NotFound(path.to_string())),
        };
        if &actual != expected {
            return Err(GatewayError::conflict(path, Some(expected), Some(&actual)));
        }
        s.files.remove(path);
        s.writes += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FsGateway
// ---------------------------------------------------------------------------

/// Lock file taken around every compare-and-swap, relative to the root.
pub const TREE_LOCK_FILE: &str = ".autopatch-cas.lock";

/// A lock file older than this is left over from a dead process.
const STALE_LOCK_AFTER: Duration = Duration::from_secs(60);
const LOCK_POLL: Duration = Duration::from_millis(10);

/// Held while a compare-and-swap runs; removes the lock file on drop.
struct TreeLock {
    path: PathBuf,
}

impl Drop for TreeLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A gateway over a directory on the local filesystem.
///
/// Compare-and-swap is serialised inside the process by an async mutex and
/// across processes by an exclusive lock file ([`TREE_LOCK_FILE`]) in the
/// root.  Only cooperating writers are covered: an editor saving into the
/// tree does not take the lock, and is caught by the token check instead.
pub struct FsGateway {
    root: PathBuf,
    cas: tokio::sync::Mutex<()>,
    lock_wait: Duration,
}

impl FsGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), cas: tokio::sync::Mutex::new(()), lock_wait: Duration::from_secs(5) }
    }

    /// How long to wait for another process's tree lock before giving up.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn lock_tree(&self, path: &str) -> Result<TreeLock, GatewayError> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| Self::io(path, e))?;
        let lock_path = self.root.join(TREE_LOCK_FILE);
        let give_up = tokio::time::Instant::now() + self.lock_wait;
        loop {
            let attempt = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await;
            match attempt {
                Ok(mut file) => {
                    use tokio::io::AsyncWriteExt;
                    let _ = file.write_all(std::process::id().to_string().as_bytes()).await;
                    return Ok(TreeLock { path: lock_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&lock_path).await {
                        tracing::warn!(target: "autopatch::gateway", lock = %lock_path.display(), "breaking stale tree lock");
                        let _ = tokio::fs::remove_file(&lock_path).await;
                        continue;
                    }
                    if tokio::time::Instant::now() >= give_up {
                        return Err(GatewayError::Unavailable {
                            path: path.to_string(),
                            reason: format!("tree lock {} held by another process", lock_path.display()),
                        });
                    }
                    tokio::time::sleep(LOCK_POLL).await;
                }
                Err(e) => return Err(Self::io(path, e)),
            }
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, GatewayError> {
        let normalized = crate::self_modify::proposal::normalize_path(path).map_err(|reason| {
            GatewayError::Unavailable { path: path.to_string(), reason }
        })?;
        Ok(self.root.join(normalized))
    }

    fn io(path: &str, source: std::io::Error) -> GatewayError {
        GatewayError::Io { path: path.to_string(), source }
    }

    async fn read_raw(&self, path: &str) -> Result<Option<String>, GatewayError> {
        let full = self.resolve(path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io(path, e)),
        }
    }
}

impl VersionControlGateway for FsGateway {
    async fn read(&self, path: &str) -> Result<Option<FileSnapshot>, GatewayError> {
        Ok(self.read_raw(path).await?.map(FileSnapshot::new))
    }

    async fn write(
        &self,
        path: &str,
        content: &str,
        expected: Option<&RevisionToken>,
    ) -> Result<RevisionToken, GatewayError> {
        let _cas = self.cas.lock().await;
        let _tree = self.lock_tree(path).await?;
        let actual = self.read_raw(path).await?.map(|c| RevisionToken::of_content(&c));
        if actual.as_ref() != expected {
            return Err(GatewayError::conflict(path, expected, actual.as_ref()));
        }

        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| Self::io(path, e))?;
        }
        let tmp = full.with_extension(format!("autopatch-{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, content.as_bytes()).await.map_err(|e| Self::io(path, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &full).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Self::io(path, e));
        }
        tracing::debug!(target: "autopatch::gateway", path = %path, "file written");
        Ok(RevisionToken::of_content(content))
    }

    async fn delete(&self, path: &str, expected: &RevisionToken) -> Result<(), GatewayError> {
        let _cas = self.cas.lock().await;
        let _tree = self.lock_tree(path).await?;
        let actual = match self.read_raw(path).await? {
            Some(c) => RevisionToken::of_content(&c),
            None => return Err(GatewayError::NotFound(path.to_string())),
        };
        if &actual != expected {
            return Err(GatewayError::conflict(path, Some(expected), Some(&actual)));
        }
        let full = self.resolve(path)?;
        tokio::fs::remove_file(&full).await.map_err(|e| Self::io(path, e))?;
        tracing::debug!(target: "autopatch::gateway", path = %path, "file deleted");
        Ok(())
    }
}

async fn lock_is_stale(lock_path: &Path) -> bool {
    match tokio::fs::metadata(lock_path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified.elapsed().map_or(false, |age| age > STALE_LOCK_AFTER),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
