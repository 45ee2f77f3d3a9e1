//! Durable session and device identity.
//!
//! The [`SessionStore`] persists one [`SessionRecord`] and one device id in a [`KeyValueStorage`]
//! that may be shared with other processes (or browser-tab equivalents). Concurrent writers are
//! reconciled with [`SessionRecord::merge`]: the record with the later `last_active_at` wins.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;
use crate::state::SimulatorStatus;

/// Storage key of the serialized [`SessionRecord`].
pub const SESSION_KEY: &str = "trading_gateway.session";
/// Storage key of the device id.
pub const DEVICE_ID_KEY: &str = "trading_gateway.device_id";

/// Inactivity window after which a session record is discarded.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(8 * 60 * 60);

/// String key-value storage shared by every client on the same profile.
pub trait KeyValueStorage: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local storage. Share one instance through an [`Arc`] to emulate several clients.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// Storage backed by one JSON object file.
///
/// The file is re-read on every access so that writes from other processes are observed, and
/// replaced atomically (temp file + rename) on every write.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStorage {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Result<HashMap<String, String>> {
        match fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(HashMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn modify<F: FnOnce(&mut HashMap<String, String>)>(&self, f: F) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut entries = self.read_all()?;
        f(&mut entries);

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.modify(|entries| {
            entries.insert(key.to_owned(), value.to_owned());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.modify(|entries| {
            entries.remove(key);
        })
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub device_id: String,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub reconnect_attempts: u32,
    #[serde(default)]
    pub simulator_id: Option<String>,
    #[serde(default)]
    pub simulator_status: SimulatorStatus,
}

impl SessionRecord {
    #[must_use]
    pub fn new<S: Into<String>, D: Into<String>>(session_id: S, device_id: D) -> Self {
        Self {
            session_id: session_id.into(),
            device_id: device_id.into(),
            last_active_at: Utc::now(),
            reconnect_attempts: 0,
            simulator_id: None,
            simulator_status: SimulatorStatus::default(),
        }
    }

    /// Reconciles `self` (about to be written) with what another writer persisted.
    ///
    /// The later `last_active_at` wins; on a tie `self` is kept.
    #[must_use]
    pub fn merge(self, persisted: Option<SessionRecord>) -> SessionRecord {
        match persisted {
            Some(persisted) if persisted.last_active_at > self.last_active_at => persisted,
            _ => self,
        }
    }

    #[must_use]
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        now.signed_duration_since(self.last_active_at) > ttl
    }
}

/// Owner of the persisted session identity. One instance per client.
pub struct SessionStore {
    storage: Arc<dyn KeyValueStorage>,
    ttl: Duration,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    #[must_use]
    pub fn new(storage: Arc<dyn KeyValueStorage>, ttl: Duration) -> Self {
        Self {
            storage,
            ttl,
            lock: Mutex::new(()),
        }
    }

    /// The persisted record, if one exists and has not expired. Expired or unreadable records are
    /// removed.
    pub fn current(&self) -> Result<Option<SessionRecord>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.load()
    }

    /// Persists a fresh record for `session_id`, bound to this profile's device id.
    pub fn begin(&self, session_id: &str) -> Result<SessionRecord> {
        let device_id = self.device_id()?;
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let record = SessionRecord::new(session_id, device_id).merge(self.load()?);
        self.store(&record)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(session_id = %record.session_id, "session recorded");

        Ok(record)
    }

    /// The stable device id, created on first use. It survives session expiry and [`Self::clear`].
    pub fn device_id(&self) -> Result<String> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(device_id) = self.storage.get(DEVICE_ID_KEY)?
            && !device_id.is_empty()
        {
            return Ok(device_id);
        }

        let device_id = Uuid::new_v4().to_string();
        self.storage.set(DEVICE_ID_KEY, &device_id)?;
        Ok(device_id)
    }

    /// Replaces the device id after the gateway invalidated it, and drops the session bound to it.
    pub fn regenerate_device_id(&self) -> Result<String> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let device_id = Uuid::new_v4().to_string();
        self.storage.set(DEVICE_ID_KEY, &device_id)?;
        self.storage.remove(SESSION_KEY)?;

        #[cfg(feature = "tracing")]
        tracing::debug!("device id regenerated");

        Ok(device_id)
    }

    /// Marks the session as active now.
    pub fn record_activity(&self) -> Result<Option<SessionRecord>> {
        self.modify(|record| record.last_active_at = Utc::now())
    }

    /// Returns the new count, or 0 when there is no session.
    pub fn increment_reconnect_attempts(&self) -> Result<u32> {
        let record = self.modify(|record| {
            record.reconnect_attempts = record.reconnect_attempts.saturating_add(1);
        })?;
        Ok(record.map_or(0, |record| record.reconnect_attempts))
    }

    pub fn reset_reconnect_attempts(&self) -> Result<()> {
        self.modify(|record| record.reconnect_attempts = 0)?;
        Ok(())
    }

    pub fn update_simulator(
        &self,
        simulator_id: Option<String>,
        status: SimulatorStatus,
    ) -> Result<Option<SessionRecord>> {
        self.modify(|record| {
            if simulator_id.is_some() {
                record.simulator_id = simulator_id;
            }
            record.simulator_status = status;
        })
    }

    /// Forgets the session. The device id is kept.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.storage.remove(SESSION_KEY)
    }

    fn modify<F: FnOnce(&mut SessionRecord)>(&self, f: F) -> Result<Option<SessionRecord>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(mut record) = self.load()? else {
            return Ok(None);
        };
        f(&mut record);
        self.store(&record)?;
        Ok(Some(record))
    }

    fn load(&self) -> Result<Option<SessionRecord>> {
        let Some(raw) = self.storage.get(SESSION_KEY)? else {
            return Ok(None);
        };

        let record = match serde_json::from_str::<SessionRecord>(&raw) {
            Ok(record) => record,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "discarding unreadable session record");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                self.storage.remove(SESSION_KEY)?;
                return Ok(None);
            }
        };

        if record.is_expired(self.ttl, Utc::now()) {
            #[cfg(feature = "tracing")]
            tracing::debug!(session_id = %record.session_id, "session record expired");
            self.storage.remove(SESSION_KEY)?;
            return Ok(None);
        }

        Ok(Some(record))
    }

    fn store(&self, record: &SessionRecord) -> Result<()> {
        self.storage
            .set(SESSION_KEY, &serde_json::to_string(record)?)
    }
}
