//! # State Ledger
//!
//! The ledger is the only durable store envie owns. It records, per
//! `(scope, service)`, what was applied, where its state lives and how it
//! relates to other nodes, so that `env list` and `destroy` never need to
//! re-read service declarations.
//!
//! A scope is either a merge request or the shared stable scope. Merge request
//! scopes may also hold *binding* entries of kind `stable`: they record that
//! the merge request referenced a stable environment, and are never destroyed
//! by a merge-request-scoped teardown.
//!
//! ## Stores
//!
//! - [`FileLedger`]: a JSON document on disk. Every read-modify-write holds an
//!   exclusive `fs2` lock on a sibling `.lock` file and replaces the document
//!   through an atomic rename, so concurrent node workers and concurrent envie
//!   processes upsert without clobbering each other.
//! - [`MemoryLedger`]: an in-process map with the same semantics.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::config::{EnvironmentKind, MergeRequestId};
use crate::error::{Error, Result};

const LEDGER_VERSION: u32 = 1;

/// Ownership scope of a ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scope {
    /// Long-lived environments shared by every merge request
    Stable,
    MergeRequest(MergeRequestId),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Stable => f.write_str("stable"),
            Scope::MergeRequest(id) => write!(f, "mr:{}", id),
        }
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_string()
    }
}

impl TryFrom<String> for Scope {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        if value == "stable" {
            return Ok(Scope::Stable);
        }
        match value.strip_prefix("mr:") {
            Some(id) => Ok(Scope::MergeRequest(MergeRequestId::new(id)?)),
            None => Err(Error::config(format!("invalid ledger scope '{}'", value))),
        }
    }
}

/// Unique key of a ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    pub scope: Scope,
    pub service: String,
}

impl LedgerKey {
    pub fn new(scope: Scope, service: impl Into<String>) -> Self {
        Self {
            scope,
            service: service.into(),
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.service)
    }
}

/// Lifecycle status of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Pending,
    Applied,
    Failed,
    Destroyed,
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LedgerStatus::Pending => "pending",
            LedgerStatus::Applied => "applied",
            LedgerStatus::Failed => "failed",
            LedgerStatus::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Persisted record of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub scope: Scope,
    pub service_name: String,
    pub kind: EnvironmentKind,
    pub state_key: String,
    /// Service directory the engine ran in, so teardown needs no declarations
    #[serde(default)]
    pub directory: PathBuf,
    #[serde(default)]
    pub resource_ids: Vec<String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Dependencies that were part of the same scope when applied
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: LedgerStatus,
    /// Last failure message, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LedgerEntry {
    /// A fresh `pending` entry
    pub fn pending(
        scope: Scope,
        service_name: impl Into<String>,
        kind: EnvironmentKind,
        state_key: impl Into<String>,
        dependencies: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            scope,
            service_name: service_name.into(),
            kind,
            state_key: state_key.into(),
            directory: PathBuf::new(),
            resource_ids: Vec::new(),
            outputs: BTreeMap::new(),
            dependencies,
            created_at: now,
            updated_at: now,
            status: LedgerStatus::Pending,
            message: None,
        }
    }

    pub fn in_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(self.scope.clone(), self.service_name.clone())
    }

    pub fn with_status(mut self, status: LedgerStatus) -> Self {
        self.status = status;
        self.updated_at = Utc::now();
        self
    }
}

/// Storage interface of the ledger.
///
/// Implementations must make `record` an atomic upsert keyed by
/// `(scope, service)`.
pub trait LedgerStore: Send + Sync {
    /// Insert or replace an entry. The original `created_at` is kept when the
    /// key already exists.
    fn record(&self, entry: LedgerEntry) -> Result<()>;

    /// Change the status of an existing entry.
    fn update(&self, key: &LedgerKey, status: LedgerStatus) -> Result<()>;

    fn get(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>>;

    /// Entries of one scope, or of every scope, sorted by key.
    fn list(&self, scope: Option<&Scope>) -> Result<Vec<LedgerEntry>>;

    /// Remove an entry. Returns whether it existed.
    fn remove(&self, key: &LedgerKey) -> Result<bool>;

    /// Human-readable location, for messages
    fn describe(&self) -> String;
}

type EntryMap = BTreeMap<LedgerKey, LedgerEntry>;

fn upsert(entries: &mut EntryMap, mut entry: LedgerEntry) {
    let key = entry.key();
    if let Some(existing) = entries.get(&key) {
        entry.created_at = existing.created_at;
    }
    entries.insert(key, entry);
}

fn set_status(entries: &mut EntryMap, key: &LedgerKey, status: LedgerStatus) -> bool {
    match entries.get_mut(key) {
        Some(entry) => {
            entry.status = status;
            entry.updated_at = Utc::now();
            true
        }
        None => false,
    }
}

fn select(entries: &EntryMap, scope: Option<&Scope>) -> Vec<LedgerEntry> {
    entries
        .values()
        .filter(|entry| scope.is_none_or(|s| &entry.scope == s))
        .cloned()
        .collect()
}

/// In-process ledger
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    entries: Arc<Mutex<EntryMap>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, EntryMap>> {
        self.entries.lock().map_err(|_| Error::LockPoisoned {
            context: "memory ledger".to_string(),
        })
    }
}

impl LedgerStore for MemoryLedger {
    fn record(&self, entry: LedgerEntry) -> Result<()> {
        let mut entries = self.lock()?;
        upsert(&mut entries, entry);
        Ok(())
    }

    fn update(&self, key: &LedgerKey, status: LedgerStatus) -> Result<()> {
        let mut entries = self.lock()?;
        if set_status(&mut entries, key, status) {
            Ok(())
        } else {
            Err(Error::ledger("memory", format!("no entry for {}", key)))
        }
    }

    fn get(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn list(&self, scope: Option<&Scope>) -> Result<Vec<LedgerEntry>> {
        let entries = self.lock()?;
        Ok(select(&entries, scope))
    }

    fn remove(&self, key: &LedgerKey) -> Result<bool> {
        Ok(self.lock()?.remove(key).is_some())
    }

    fn describe(&self) -> String {
        "in-memory ledger".to_string()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerDocument {
    version: u32,
    #[serde(default)]
    entries: Vec<LedgerEntry>,
}

/// JSON ledger on disk, guarded by an exclusive file lock
#[derive(Debug, Clone)]
pub struct FileLedger {
    path: PathBuf,
}

impl FileLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn err(&self, message: impl ToString) -> Error {
        Error::ledger(self.path.display().to_string(), message)
    }

    /// Run `f` over the entry map while holding the ledger lock. The document
    /// is rewritten only when `f` reports a change.
    fn with_entries<T>(&self, f: impl FnOnce(&mut EntryMap) -> (T, bool)) -> Result<T> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| self.err(e))?;

        let lock_file = fs::File::create(self.lock_path()).map_err(|e| self.err(e))?;
        lock_file.lock_exclusive().map_err(|e| self.err(e))?;

        let result = self.load().and_then(|mut entries| {
            let (value, dirty) = f(&mut entries);
            if dirty {
                self.save(parent, &entries)?;
            }
            Ok(value)
        });

        let _ = lock_file.unlock();
        result
    }

    /// Read-only access. A ledger that was never written reads as empty and
    /// nothing is created on disk.
    fn read<T>(&self, f: impl FnOnce(&EntryMap) -> T) -> Result<T> {
        if !self.path.exists() {
            return Ok(f(&EntryMap::new()));
        }
        self.with_entries(|entries| (f(entries), false))
    }

    fn load(&self) -> Result<EntryMap> {
        if !self.path.exists() {
            return Ok(EntryMap::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| self.err(e))?;
        if content.trim().is_empty() {
            return Ok(EntryMap::new());
        }
        let document: LedgerDocument = serde_json::from_str(&content)
            .map_err(|e| self.err(format!("corrupted ledger: {}", e)))?;
        if document.version > LEDGER_VERSION {
            return Err(self.err(format!(
                "ledger version {} is newer than supported version {}",
                document.version, LEDGER_VERSION
            )));
        }
        Ok(document
            .entries
            .into_iter()
            .map(|entry| (entry.key(), entry))
            .collect())
    }

    fn save(&self, dir: &Path, entries: &EntryMap) -> Result<()> {
        let document = LedgerDocument {
            version: LEDGER_VERSION,
            entries: entries.values().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&document)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.err(e))?;
        temp.write_all(content.as_bytes()).map_err(|e| self.err(e))?;
        temp.as_file().sync_all().map_err(|e| self.err(e))?;
        temp.persist(&self.path).map_err(|e| self.err(e.error))?;
        Ok(())
    }
}

impl LedgerStore for FileLedger {
    fn record(&self, entry: LedgerEntry) -> Result<()> {
        self.with_entries(|entries| {
            upsert(entries, entry);
            ((), true)
        })
    }

    fn update(&self, key: &LedgerKey, status: LedgerStatus) -> Result<()> {
        let found = self.with_entries(|entries| {
            let found = set_status(entries, key, status);
            (found, found)
        })?;
        if found {
            Ok(())
        } else {
            Err(self.err(format!("no entry for {}", key)))
        }
    }

    fn get(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        self.read(|entries| entries.get(key).cloned())
    }

    fn list(&self, scope: Option<&Scope>) -> Result<Vec<LedgerEntry>> {
        self.read(|entries| select(entries, scope))
    }

    fn remove(&self, key: &LedgerKey) -> Result<bool> {
        self.with_entries(|entries| {
            let removed = entries.remove(key).is_some();
            (removed, removed)
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
