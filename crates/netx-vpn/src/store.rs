//! Session persistence
//!
//! The keypair, the current gateway and lease, and the two user intent
//! flags survive restarts. [`JsonFileStore`] keeps them in one JSON file,
//! [`MemoryStore`] keeps them in memory.

use crate::config::{Gateway, Lease};
use crate::keys::DeviceKeypair;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// What is persisted between runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    #[serde(default)]
    pub keypair: Option<DeviceKeypair>,
    #[serde(default)]
    pub gateway: Option<Gateway>,
    #[serde(default)]
    pub lease: Option<Lease>,
    /// User wants the tunnel running
    #[serde(default)]
    pub tunnel_enabled: bool,
    /// User wants traffic routed through a gateway
    #[serde(default)]
    pub vpn_enabled: bool,
}

/// Session persistence errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Storage for [`PersistedSession`]
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<PersistedSession, StoreError>;

    /// Read-modify-write under the store's own lock
    fn update(&self, change: &mut dyn FnMut(&mut PersistedSession)) -> Result<(), StoreError>;

    /// Ask for an off-device copy of the session (new keys were generated)
    fn request_backup(&self);
}

/// Session kept in a JSON file
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where [`SessionStore::request_backup`] copies the session
    pub fn backup_path(&self) -> PathBuf {
        self.path.with_extension("json.bak")
    }

    fn read(&self) -> Result<PersistedSession, StoreError> {
        if !self.path.exists() {
            debug!("No session file at {}", self.path.display());
            return Ok(PersistedSession::default());
        }

        let content =
            std::fs::read_to_string(&self.path).map_err(|e| StoreError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| StoreError::Parse(e.to_string()))
    }

    fn write(&self, session: &PersistedSession) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }

        let content =
            serde_json::to_string_pretty(session).map_err(|e| StoreError::Parse(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|e| StoreError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io(e.to_string()))
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStore for JsonFileStore {
    fn load(&self) -> Result<PersistedSession, StoreError> {
        let _guard = self.guard();
        self.read()
    }

    fn update(&self, change: &mut dyn FnMut(&mut PersistedSession)) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut session = self.read()?;
        change(&mut session);
        self.write(&session)
    }

    fn request_backup(&self) {
        let _guard = self.guard();
        if !self.path.exists() {
            return;
        }
        match std::fs::copy(&self.path, self.backup_path()) {
            Ok(_) => info!("Session backed up to {}", self.backup_path().display()),
            Err(e) => warn!("Session backup failed: {}", e),
        }
    }
}

/// Session kept in memory
#[derive(Default)]
pub struct MemoryStore {
    session: Mutex<PersistedSession>,
    backups: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: PersistedSession) -> Self {
        Self {
            session: Mutex::new(session),
            backups: AtomicUsize::new(0),
        }
    }

    /// Number of backup requests received
    pub fn backup_requests(&self) -> usize {
        self.backups.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> PersistedSession {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, PersistedSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStore for MemoryStore {
    fn load(&self) -> Result<PersistedSession, StoreError> {
        Ok(self.snapshot())
    }

    fn update(&self, change: &mut dyn FnMut(&mut PersistedSession)) -> Result<(), StoreError> {
        change(&mut self.lock());
        Ok(())
    }

    fn request_backup(&self) {
        self.backups.fetch_add(1, Ordering::SeqCst);
    }
}
