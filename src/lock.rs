//! Per-state-key advisory locks.
//!
//! Two operations on the same state key must never run at once, whether they
//! come from two workers of one run or from two envie processes. Each
//! acquisition first claims the key inside the process and then takes an
//! exclusive `fs2` lock on `<state_dir>/locks/<key>.lock`.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use fs2::FileExt;
use log::debug;

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Registry of held state-key locks
#[derive(Debug, Default)]
pub struct StateLocks {
    /// Directory for lock files; in-process locking only when `None`
    dir: Option<PathBuf>,
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Held lock on one state key, released on drop
#[derive(Debug)]
pub struct StateLockGuard<'a> {
    locks: &'a StateLocks,
    key: String,
    file: Option<File>,
}

impl StateLocks {
    /// Locks backed by files under `state_dir/locks`
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(state_dir.into().join("locks")),
            ..Self::default()
        }
    }

    /// Locks that only serialize workers of this process
    pub fn in_process() -> Self {
        Self::default()
    }

    /// Block until `state_key` is free, then hold it.
    ///
    /// Gives up with [`Error::Cancelled`] when `cancel` fires while waiting.
    pub fn acquire(
        &self,
        state_key: &str,
        cancel: &CancellationToken,
    ) -> Result<StateLockGuard<'_>> {
        self.claim(state_key, cancel)?;
        let mut guard = StateLockGuard {
            locks: self,
            key: state_key.to_string(),
            file: None,
        };

        if let Some(dir) = &self.dir {
            fs::create_dir_all(dir)?;
            let file = File::create(dir.join(lock_file_name(state_key)))?;
            while file.try_lock_exclusive().is_err() {
                cancel.check(&format!("waiting for state lock on {}", state_key))?;
                debug!("State key {} is locked by another process, waiting", state_key);
                std::thread::sleep(POLL_INTERVAL);
            }
            guard.file = Some(file);
        }

        Ok(guard)
    }

    fn claim(&self, state_key: &str, cancel: &CancellationToken) -> Result<()> {
        let mut held = self.held.lock().map_err(|_| poisoned())?;
        while held.contains(state_key) {
            cancel.check(&format!("waiting for state lock on {}", state_key))?;
            held = self
                .released
                .wait_timeout(held, POLL_INTERVAL)
                .map_err(|_| poisoned())?
                .0;
        }
        held.insert(state_key.to_string());
        Ok(())
    }
}

impl Drop for StateLockGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
        if let Ok(mut held) = self.locks.held.lock() {
            held.remove(&self.key);
        }
        self.locks.released.notify_all();
    }
}

fn poisoned() -> Error {
    Error::LockPoisoned {
        context: "state key locks".to_string(),
    }
}

fn lock_file_name(state_key: &str) -> String {
    let sanitized: String = state_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    format!("{}.lock", sanitized)
}
