//! Exclusive path locks for `apply()` and `rollback()`.
//!
//! Acquisition is all-or-nothing and never waits: if any requested path is
//! already held, nothing is taken and the caller gets the first contended
//! path back.  Locks are released when the [`PathLockGuard`] drops.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Set of paths currently held by in-flight applies and rollbacks.
#[derive(Debug, Clone, Default)]
pub struct PathLockTable {
    held: Arc<Mutex<HashSet<String>>>,
}

/// Why a lock could not be taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Another holder owns this path.
    Contended(String),
    Poisoned,
}

impl PathLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire<I, S>(&self, paths: I) -> Result<PathLockGuard, LockError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wanted: Vec<String> = paths.into_iter().map(Into::into).collect();
        let mut held = self.held.lock().map_err(|_| LockError::Poisoned)?;
        if let Some(busy) = wanted.iter().find(|p| held.contains(*p)) {
            return Err(LockError::Contended(busy.clone()));
        }
        let mut taken = Vec::with_capacity(wanted.len());
        for p in wanted {
            if held.insert(p.clone()) {
                taken.push(p);
            }
        }
        Ok(PathLockGuard { held: Arc::clone(&self.held), paths: taken })
    }

    pub fn is_held(&self, path: &str) -> bool {
        self.held.lock().map(|h| h.contains(path)).unwrap_or(false)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().map(|h| h.len()).unwrap_or(0)
    }
}

/// Releases its paths on drop.
#[derive(Debug)]
pub struct PathLockGuard {
    held: Arc<Mutex<HashSet<String>>>,
    paths: Vec<String>,
}

impl PathLockGuard {
    pub fn paths(&self) -> &[String] {
        &self.paths
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        // Release even if another holder panicked while holding the table.
        let mut held = match self.held.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        for p in &self.paths {
            held.remove(p);
        }
    }
}
