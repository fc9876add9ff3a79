//! Client registry
//!
//! Maps client IDs to tunnel sessions. Two layers with different lifetimes:
//!
//! - The **live session map** is process-local and is the only source of
//!   truth for liveness. Exactly one entry per Active session.
//! - The **persisted entry** (`{client id → locator, resume key}`) lives in
//!   a pluggable key-value store and outlives individual sessions so a
//!   client can reconnect under its issued identity. It is a discovery
//!   hint, never a liveness guarantee; resolvers re-verify against the live
//!   map before trusting it.

use crate::session::SessionHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Opaque, URL-safe client identifier issued by the relay
pub type ClientId = String;

/// How long persisted entries live without a refresh. Garbage collection
/// for relays that died without cleanup, not a liveness signal.
pub const ENTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Client already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Client not found")]
    NotFound,

    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt registry entry: {0}")]
    Corrupt(String),
}

/// Key-value persistence seam. Satisfiable by any store with set/get/delete
/// and expiry; an in-memory implementation ships for single-process relays.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<(), RegistryError>;
    async fn get(&self, key: &str) -> Result<Option<String>, RegistryError>;
    async fn del(&self, key: &str) -> Result<(), RegistryError>;
}

/// In-memory key-value store with lazy TTL expiry
pub struct MemoryStore {
    entries: RwLock<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), RegistryError> {
        let deadline = ttl.map(|d| Instant::now() + d);
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RegistryError> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<(), RegistryError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Persisted registry record for one issued identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Where the owning relay can be reached (hint for distributed routers)
    pub locator: String,
    /// Credential a reconnecting client must present to reuse the ID
    pub resume_key: String,
}

/// Generate a fresh client ID: 16 bytes from the OS CSPRNG, URL-safe
/// base64. Never client-supplied.
pub fn generate_client_id() -> ClientId {
    use base64::Engine;
    let mut bytes = [0u8; 16];
    fill_random(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a resume key: 32 random bytes, URL-safe base64
pub fn generate_resume_key() -> String {
    use base64::Engine;
    let mut bytes = [0u8; 32];
    fill_random(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn fill_random(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("system RNG failure");
}

/// The registry composed over a pluggable store
pub struct ClientRegistry {
    store: Arc<dyn KvStore>,
    sessions: RwLock<HashMap<ClientId, SessionHandle>>,
    locator: String,
}

impl ClientRegistry {
    pub fn new(store: Arc<dyn KvStore>, locator: String) -> Self {
        Self {
            store,
            sessions: RwLock::new(HashMap::new()),
            locator,
        }
    }

    /// Register a specific ID. Fails with AlreadyRegistered if the ID has a
    /// live session or a persisted entry.
    pub async fn register(&self, id: &str, resume_key: &str) -> Result<(), RegistryError> {
        if self.sessions.read().await.contains_key(id) {
            return Err(RegistryError::AlreadyRegistered(id.to_string()));
        }
        if self.store.get(id).await?.is_some() {
            return Err(RegistryError::AlreadyRegistered(id.to_string()));
        }
        let entry = RegistryEntry {
            locator: self.locator.clone(),
            resume_key: resume_key.to_string(),
        };
        let value = serde_json::to_string(&entry)
            .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
        self.store.set(id, &value, Some(ENTRY_TTL)).await
    }

    /// Issue a fresh identity, regenerating on the (vanishingly rare)
    /// collision with an existing entry.
    pub async fn register_new(&self) -> Result<(ClientId, String), RegistryError> {
        loop {
            let id = generate_client_id();
            let resume_key = generate_resume_key();
            match self.register(&id, &resume_key).await {
                Ok(()) => return Ok((id, resume_key)),
                Err(RegistryError::AlreadyRegistered(_)) => {
                    debug!("Client ID collision, regenerating");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Verify a reconnect credential and refresh the entry's TTL.
    pub async fn verify_resume(&self, id: &str, resume_key: &str) -> Result<(), RegistryError> {
        let raw = self.store.get(id).await?.ok_or(RegistryError::NotFound)?;
        let entry: RegistryEntry =
            serde_json::from_str(&raw).map_err(|e| RegistryError::Corrupt(e.to_string()))?;
        if entry.resume_key != resume_key {
            return Err(RegistryError::NotFound);
        }
        let refreshed = RegistryEntry {
            locator: self.locator.clone(),
            resume_key: resume_key.to_string(),
        };
        let value = serde_json::to_string(&refreshed)
            .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
        self.store.set(id, &value, Some(ENTRY_TTL)).await
    }

    /// Insert the live session for an ID. Enforces the invariant that at
    /// most one Active session exists per ID at any instant.
    pub async fn insert_session(&self, handle: SessionHandle) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let id = handle.id().to_string();
        if let Some(existing) = sessions.get(&id) {
            if existing.is_active() {
                return Err(RegistryError::AlreadyRegistered(id));
            }
        }
        sessions.insert(id, handle);
        Ok(())
    }

    /// Resolve an ID to its live session. Dead or unknown sessions resolve
    /// to None; callers treat both as not found.
    pub async fn resolve(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove and return the live session for an ID (reconnect eviction).
    pub async fn take_session(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.write().await.remove(id)
    }

    /// Remove the live session entry, but only if it still belongs to the
    /// given session incarnation. A session closing late must not evict the
    /// replacement that took over its ID.
    pub async fn unregister(&self, id: &str, serial: u64) {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(id) {
            if existing.serial() == serial {
                sessions.remove(id);
                debug!(client_id = %id, "Session unregistered");
            }
        }
    }

    /// Look up the persisted entry for an ID (discovery hint)
    pub async fn entry(&self, id: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        match self.store.get(id).await? {
            Some(raw) => {
                let entry = serde_json::from_str(&raw)
                    .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Drop a persisted entry (rollback for failed registrations)
    pub async fn remove_entry(&self, id: &str) -> Result<(), RegistryError> {
        self.store.del(id).await
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
