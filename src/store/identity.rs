//! Identity & key store
//!
//! Single source of truth for which identities exist, their session keys and their
//! authentication and liveness flags. Shared by every connection handler behind an
//! `Arc`.
//!
//! Two locks are involved:
//! - a `std::sync::Mutex` over the in-memory tables, held only for the few
//!   instructions that mutate or copy them and never across an `.await`
//! - a `tokio::sync::Mutex` that serializes mutations together with their file write,
//!   so snapshots reach disk in the order the mutations happened
//!
//! Every mutation is written to disk before the call returns. A failed write is
//! logged and counted; the in-memory update stands and the caller still gets `Ok`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{RegistrationPolicy, StoreConfig};
use crate::error::{ChannelError, Result};
use crate::protocol::message::DeviceInfo;
use crate::utils::crypto::generate_session_key;
use crate::utils::metrics::Metrics;

/// One registered endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    /// Short display code, e.g. "007"
    pub code: String,
    #[serde(default)]
    pub device: Option<DeviceInfo>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub online: bool,
    /// Unix milliseconds
    #[serde(default)]
    pub last_seen: Option<u64>,
}

impl IdentityRecord {
    fn new(id: String, code: String, device: Option<DeviceInfo>) -> Self {
        Self {
            id,
            code,
            device,
            key: None,
            authenticated: false,
            online: false,
            last_seen: None,
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<String, IdentityRecord>,
    by_hardware: HashMap<String, String>,
    next_code: u32,
}

impl Tables {
    fn from_records(records: BTreeMap<String, IdentityRecord>) -> Self {
        let mut tables = Tables {
            next_code: 1,
            ..Default::default()
        };
        for (id, mut record) in records {
            // nothing is connected right after startup
            record.online = false;
            if let Some(device) = &record.device {
                tables
                    .by_hardware
                    .insert(device.hardware_id.clone(), id.clone());
            }
            if let Ok(code) = record.code.parse::<u32>() {
                tables.next_code = tables.next_code.max(code + 1);
            }
            tables.records.insert(id, record);
        }
        tables
    }

    fn mint(&mut self, id: String, device: Option<DeviceInfo>) -> IdentityRecord {
        let code = format!("{:03}", self.next_code);
        self.next_code += 1;
        if let Some(device) = &device {
            self.by_hardware
                .insert(device.hardware_id.clone(), id.clone());
        }
        let record = IdentityRecord::new(id.clone(), code, device);
        self.records.insert(id, record.clone());
        record
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut IdentityRecord> {
        self.records.get_mut(id).ok_or(ChannelError::NotRegistered)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let ordered: BTreeMap<&String, &IdentityRecord> = self.records.iter().collect();
        Ok(serde_json::to_vec_pretty(&ordered)?)
    }
}

/// Concurrent, file-backed identity table
#[derive(Debug)]
pub struct IdentityStore {
    path: Option<PathBuf>,
    tables: Mutex<Tables>,
    write_lock: tokio::sync::Mutex<()>,
    metrics: Arc<Metrics>,
}

impl IdentityStore {
    /// Store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tables: Mutex::new(Tables {
                next_code: 1,
                ..Default::default()
            }),
            write_lock: tokio::sync::Mutex::new(()),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Load every identity from `path`. A missing file yields an empty store.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records: BTreeMap<String, IdentityRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ChannelError::Persistence(format!("Corrupt identity file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(ChannelError::Persistence(format!(
                    "Failed to read identity file {}: {e}",
                    path.display()
                )))
            }
        };

        info!(path = %path.display(), identities = records.len(), "Identity store loaded");
        Ok(Self {
            path: Some(path),
            tables: Mutex::new(Tables::from_records(records)),
            write_lock: tokio::sync::Mutex::new(()),
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Open the store described by the configuration
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        match &config.path {
            Some(path) => Self::load(path).await,
            None => Ok(Self::in_memory()),
        }
    }

    /// Report persistence failures to a shared collector
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        // Tables are only mutated through closures that cannot leave them half-written
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` under the table lock, then write the resulting snapshot.
    async fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let _write = self.write_lock.lock().await;

        let (out, snapshot) = {
            let mut tables = self.tables();
            let out = f(&mut tables)?;
            let snapshot = match self.path {
                Some(_) => Some(tables.serialize()?),
                None => None,
            };
            (out, snapshot)
        };

        if let Some(snapshot) = snapshot {
            if let Err(e) = self.write_snapshot(&snapshot).await {
                warn!(error = %e, "Identity store write failed; change kept in memory only");
                self.metrics.persistence_error();
            }
        }
        Ok(out)
    }

    async fn write_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, snapshot)
            .await
            .map_err(|e| ChannelError::Persistence(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| ChannelError::Persistence(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), bytes = snapshot.len(), "Identity store flushed");
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Option<IdentityRecord> {
        self.tables().records.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tables().records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tables().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every record, ordered by display code
    pub fn list(&self) -> Vec<IdentityRecord> {
        let mut all: Vec<IdentityRecord> = self.tables().records.values().cloned().collect();
        all.sort_by(|a, b| a.code.cmp(&b.code));
        all
    }

    /// Identities that are authenticated and currently connected
    pub fn online_authenticated(&self) -> Vec<String> {
        self.tables()
            .records
            .values()
            .filter(|r| r.online && r.authenticated)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Register a device.
    ///
    /// Under [`RegistrationPolicy::ReuseExisting`] a known hardware id gets its old
    /// identity back with the key cleared, so the next `Hello` issues a fresh one.
    pub async fn register(
        &self,
        device: DeviceInfo,
        policy: RegistrationPolicy,
    ) -> Result<IdentityRecord> {
        let record = self
            .mutate(move |t| {
                let existing = match policy {
                    RegistrationPolicy::ReuseExisting => {
                        t.by_hardware.get(&device.hardware_id).cloned()
                    }
                    RegistrationPolicy::AlwaysMint => None,
                };
                match existing.and_then(|id| t.records.get_mut(&id)) {
                    Some(record) => {
                        record.key = None;
                        record.authenticated = false;
                        record.device = Some(device);
                        Ok(record.clone())
                    }
                    None => Ok(t.mint(Uuid::new_v4().to_string(), Some(device))),
                }
            })
            .await?;
        info!(identity = %record.id, code = %record.code, "Identity registered");
        Ok(record)
    }

    /// Create a record for a caller-chosen id if it does not exist yet
    pub async fn ensure_identity(&self, id: &str) -> Result<IdentityRecord> {
        let id = id.to_string();
        self.mutate(move |t| match t.records.get(&id) {
            Some(record) => Ok(record.clone()),
            None => Ok(t.mint(id, None)),
        })
        .await
    }

    /// Store `key` for `id` and reset its authenticated flag
    pub async fn upsert_key(&self, id: &str, key: &str) -> Result<()> {
        let key = key.to_string();
        self.mutate(|t| {
            let record = t.get_mut(id)?;
            record.key = Some(key);
            record.authenticated = false;
            Ok(())
        })
        .await
    }

    /// Issue a session key if `id` has none. Returns the new key, or None when a
    /// key already exists.
    pub async fn issue_key_if_absent(&self, id: &str) -> Result<Option<String>> {
        let fresh = generate_session_key()?;
        self.mutate(move |t| {
            let record = t.get_mut(id)?;
            if record.key.is_some() {
                return Ok(None);
            }
            record.key = Some(fresh.clone());
            record.authenticated = false;
            Ok(Some(fresh))
        })
        .await
    }

    /// Forget the key of `id`
    pub async fn clear_key(&self, id: &str) -> Result<()> {
        self.mutate(|t| {
            let record = t.get_mut(id)?;
            record.key = None;
            record.authenticated = false;
            Ok(())
        })
        .await
    }

    /// Compare a presented key with the stored one
    pub fn verify_key(&self, id: &str, key: &str) -> Result<bool> {
        let tables = self.tables();
        let record = tables.records.get(id).ok_or(ChannelError::NotRegistered)?;
        Ok(record.key.as_deref() == Some(key))
    }

    pub async fn mark_authenticated(&self, id: &str) -> Result<()> {
        self.mutate(|t| {
            t.get_mut(id)?.authenticated = true;
            Ok(())
        })
        .await
    }

    /// Record liveness. `timestamp` is unix milliseconds.
    pub async fn mark_online(&self, id: &str, online: bool, timestamp: u64) -> Result<()> {
        self.mutate(|t| {
            let record = t.get_mut(id)?;
            record.online = online;
            record.last_seen = Some(timestamp);
            Ok(())
        })
        .await
    }

    /// Write the current tables to disk regardless of pending changes
    pub async fn flush(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let snapshot = match self.path {
            Some(_) => self.tables().serialize()?,
            None => return Ok(()),
        };
        self.write_snapshot(&snapshot).await
    }
}
