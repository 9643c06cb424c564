//! The resource state store.
//!
//! Every mutation follows the same path: take the store mutex, change the
//! in-memory [`Database`], bump its serial and replace the state file, all
//! before the mutex is released. A successful return therefore means the
//! change is on disk.
//!
//! The apply engine drives a resource through two recorded phases:
//!
//! ```text
//! record_pre_create / record_pre_update   intent, before the remote call
//! <remote create or update>               outside of the store
//! finalize / save_typed_state             confirmation, after success
//! ```
//!
//! An entry whose intent was never confirmed is *unreconciled*; see
//! [`ResourceEntry::is_unreconciled`].

use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    codec,
    database::{Database, ResourceEntry, ResourceKey},
    error::{Error, Result},
    lock::StateLock,
};

/// Identifies a version of a state file, for detecting foreign writes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Revision {
    lineage: String,
    serial: u64,
}
impl Revision {
    fn of(db: &Database) -> Self {
        Revision {
            lineage: db.lineage.clone(),
            serial: db.serial,
        }
    }
}
impl Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lineage {} serial {}", self.lineage, self.serial)
    }
}

fn describe(revision: &Option<Revision>) -> String {
    match revision {
        Some(r) => r.to_string(),
        None => "no state file".to_owned(),
    }
}

struct Inner {
    db: Database,
    /// The revision this store last read or wrote, `None` if there was no file.
    on_disk: Option<Revision>,
    lock: StateLock,
    /// Highest timestamp issued so far; timestamps never go backwards.
    last_timestamp: i64,
}
impl Inner {
    fn next_timestamp(&mut self, at_least: i64) -> i64 {
        // timestamp_nanos_opt is None only after the year 2262
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let ts = now.max(self.last_timestamp).max(at_least);
        self.last_timestamp = ts;
        ts
    }

    /// Write the database, which the caller has just mutated.
    fn persist(&mut self, path: &Path) -> Result<()> {
        let Inner {
            db, on_disk, lock, ..
        } = self;
        db.serial += 1;
        lock.with_write_lock(|| {
            let found = codec::load(path)?.map(|db| Revision::of(&db));
            if found != *on_disk {
                tracing::error!(
                    path = %path.display(),
                    expected = %describe(on_disk),
                    found = %describe(&found),
                    "Detected concurrent writing to the state file"
                );
                return Err(Error::ConcurrentModification {
                    path: path.to_owned(),
                    expected: describe(on_disk),
                    found: describe(&found),
                });
            }
            codec::save(path, db)?;
            *on_disk = Some(Revision::of(db));
            tracing::debug!(path = %path.display(), serial = db.serial, "Wrote state file");
            Ok(())
        })
    }
}

/// The state of all resources of one deployment, backed by a state file.
///
/// A `StateStore` is owned by the apply engine for the duration of a run and
/// shared by reference (or `Arc`) with whatever applies the individual
/// resources. All methods take `&self`; they serialize on an internal mutex.
///
/// Only one process may write a given state file at a time. Writes from
/// another process are detected and refused, see
/// [`Error::ConcurrentModification`].
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl StateStore {
    /// Open the state file at `path`, or start a new state with a fresh
    /// lineage if it does not exist. A new state is written on its first
    /// mutation.
    pub fn open(path: impl Into<PathBuf>) -> Result<StateStore> {
        let path = path.into();
        let (db, on_disk) = match codec::load(&path)? {
            Some(db) => {
                tracing::debug!(
                    path = %path.display(),
                    lineage = %db.lineage,
                    serial = db.serial,
                    "Loaded state file"
                );
                let revision = Revision::of(&db);
                (db, Some(revision))
            }
            None => {
                let db = Database::new();
                tracing::info!(
                    path = %path.display(),
                    lineage = %db.lineage,
                    "No state file found, starting a new state"
                );
                (db, None)
            }
        };
        let last_timestamp = db
            .iter()
            .map(|(_, e)| e.pre_timestamp.max(e.post_timestamp))
            .max()
            .unwrap_or(0);
        let lock = StateLock::new(&path);
        Ok(StateStore {
            path,
            inner: Mutex::new(Inner {
                db,
                on_disk,
                lock,
                last_timestamp,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every mutation is a single assignment into the database, so a
        // panicking holder cannot leave it half-updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lineage(&self) -> String {
        self.lock().db.lineage.clone()
    }

    pub fn serial(&self) -> u64 {
        self.lock().db.serial
    }

    /// Fail if this state does not descend from the state with lineage
    /// `expected`, e.g. because the file was deleted and recreated.
    pub fn check_lineage(&self, expected: &str) -> Result<()> {
        let inner = self.lock();
        if inner.db.lineage != expected {
            return Err(Error::LineageMismatch {
                expected: expected.to_owned(),
                found: inner.db.lineage.clone(),
            });
        }
        Ok(())
    }

    /// The last known entry of a resource, if any.
    pub fn get(&self, section: &str, name: &str) -> Option<ResourceEntry> {
        self.lock().db.get(section, name).cloned()
    }

    /// The remote identifier of a resource, or an empty string if it was not
    /// created yet.
    pub fn get_remote_id(&self, section: &str, name: &str) -> String {
        self.lock()
            .db
            .get(section, name)
            .map(|e| e.remote_id.clone())
            .unwrap_or_default()
    }

    /// Decode the saved state of a resource into `T`.
    ///
    /// Returns `Ok(None)` when the resource is unknown or no state was saved
    /// for it, and [`Error::Decode`] when the saved state does not fit `T`,
    /// including when it has fields `T` does not declare.
    pub fn get_typed_state<T>(&self, section: &str, name: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let inner = self.lock();
        let Some(state) = inner.db.get(section, name).and_then(|e| e.state.as_ref()) else {
            return Ok(None);
        };
        codec::decode_typed(state)
            .map(Some)
            .map_err(|source| Error::Decode {
                key: ResourceKey::new(section, name),
                source,
            })
    }

    /// Record the intent to create a resource. Call right before the remote
    /// create. Any previous entry is replaced.
    pub fn record_pre_create(&self, section: &str, name: &str, config: &str) -> Result<()> {
        let _span =
            tracing::debug_span!("record_pre_create", section = section, name = name).entered();
        let mut inner = self.lock();
        if let Some(previous) = inner.db.get(section, name) {
            if !previous.remote_id.is_empty() {
                tracing::warn!(
                    remote_id = %previous.remote_id,
                    "Recording creation of a resource that already has a remote id"
                );
            }
        }
        let pre_timestamp = inner.next_timestamp(0);
        inner.db.insert(
            section,
            name,
            ResourceEntry {
                config: Some(config.to_owned()),
                pre_timestamp,
                ..Default::default()
            },
        );
        inner.persist(&self.path)
    }

    /// Record the intent to update a resource. Call right before the remote
    /// update. The remote id and saved state are kept.
    ///
    /// If the resource is unknown, a fresh entry is recorded as by
    /// [`StateStore::record_pre_create`].
    pub fn record_pre_update(&self, section: &str, name: &str, config: &str) -> Result<()> {
        let _span =
            tracing::debug_span!("record_pre_update", section = section, name = name).entered();
        let mut inner = self.lock();
        let pre_timestamp = inner.next_timestamp(0);
        match inner.db.get_mut(section, name) {
            Some(entry) => {
                entry.config = Some(config.to_owned());
                entry.pre_timestamp = pre_timestamp;
                entry.post_timestamp = 0;
            }
            None => {
                tracing::warn!("Recording update of a resource without state; treating it as new");
                inner.db.insert(
                    section,
                    name,
                    ResourceEntry {
                        config: Some(config.to_owned()),
                        pre_timestamp,
                        ..Default::default()
                    },
                );
            }
        }
        inner.persist(&self.path)
    }

    /// Confirm that the remote create or update announced by the last
    /// `record_pre_*` call succeeded.
    ///
    /// Fails with [`Error::ProtocolViolation`], without changing anything,
    /// if no pre-write was recorded for the resource.
    pub fn finalize(&self, section: &str, name: &str, remote_id: &str) -> Result<()> {
        let _span = tracing::debug_span!("finalize", section = section, name = name).entered();
        self.finalize_with(section, name, remote_id, None)
    }

    /// Like [`StateStore::finalize`], additionally saving `state` as the
    /// remote-observed attributes of the resource.
    pub fn save_typed_state<T: Serialize>(
        &self,
        section: &str,
        name: &str,
        remote_id: &str,
        state: &T,
    ) -> Result<()> {
        let _span =
            tracing::debug_span!("save_typed_state", section = section, name = name).entered();
        let state = serde_json::to_value(state).map_err(Error::Serialize)?;
        self.finalize_with(section, name, remote_id, Some(state))
    }

    fn finalize_with(
        &self,
        section: &str,
        name: &str,
        remote_id: &str,
        state: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let pre_timestamp = match inner.db.get(section, name) {
            Some(entry) if entry.has_pre_write() => entry.pre_timestamp,
            _ => {
                return Err(Error::ProtocolViolation {
                    key: ResourceKey::new(section, name),
                })
            }
        };
        let post_timestamp = inner.next_timestamp(pre_timestamp);
        if let Some(entry) = inner.db.get_mut(section, name) {
            entry.remote_id = remote_id.to_owned();
            entry.post_timestamp = post_timestamp;
            if state.is_some() {
                entry.state = state;
            }
        }
        inner.persist(&self.path)
    }

    /// Remove a resource, typically after it was deleted remotely. Returns the
    /// removed entry; nothing is written if the resource was unknown.
    pub fn forget(&self, section: &str, name: &str) -> Result<Option<ResourceEntry>> {
        let _span = tracing::debug_span!("forget", section = section, name = name).entered();
        let mut inner = self.lock();
        let Some(entry) = inner.db.remove(section, name) else {
            return Ok(None);
        };
        inner.persist(&self.path)?;
        Ok(Some(entry))
    }

    /// All entries, ordered by key.
    pub fn entries(&self) -> Vec<(ResourceKey, ResourceEntry)> {
        self.lock()
            .db
            .iter()
            .map(|(key, entry)| (key, entry.clone()))
            .collect()
    }

    /// Resources whose last recorded intent was never confirmed. Their remote
    /// state must be looked up before they are applied again.
    pub fn unreconciled(&self) -> Vec<ResourceKey> {
        self.lock()
            .db
            .iter()
            .filter(|(_, entry)| entry.is_unreconciled())
            .map(|(key, _)| key)
            .collect()
    }

    /// A copy of the whole in-memory database.
    pub fn snapshot(&self) -> Database {
        self.lock().db.clone()
    }
}
