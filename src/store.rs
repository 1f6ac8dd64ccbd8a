//! Server record store
//!
//! The proxies only read records; creating and editing them belongs to the
//! management API. A record is visible only to the owner it belongs to.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::{OwnerId, ServerId};

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Duplicate server id {0}")]
    DuplicateId(ServerId),
}

/// How a stored server authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Password,
    Key,
}

fn default_port() -> u16 {
    22
}

/// A saved remote host
///
/// Secrets are stored as vault blobs encrypted under the owner's key.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: ServerId,
    pub owner_id: OwnerId,
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(alias = "authType")]
    pub auth_kind: AuthKind,
    #[serde(default)]
    pub password_encrypted: Option<String>,
    #[serde(default)]
    pub private_key_encrypted: Option<String>,
}

impl std::fmt::Debug for ServerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRecord")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_kind", &self.auth_kind)
            .field("has_password", &self.password_encrypted.is_some())
            .field("has_private_key", &self.private_key_encrypted.is_some())
            .finish()
    }
}

/// Lookup of server records by id and owner
#[async_trait]
pub trait ServerStore: Send + Sync {
    /// The record, if it exists and belongs to `owner`
    async fn find_server(
        &self,
        owner: OwnerId,
        id: ServerId,
    ) -> Result<Option<ServerRecord>, StoreError>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryServerStore {
    servers: DashMap<ServerId, ServerRecord>,
}

impl MemoryServerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<ServerRecord>) -> Result<Self, StoreError> {
        let store = Self::new();
        for record in records {
            let id = record.id;
            if store.servers.insert(id, record).is_some() {
                return Err(StoreError::DuplicateId(id));
            }
        }
        Ok(store)
    }

    /// Insert or replace a record
    pub fn insert(&self, record: ServerRecord) {
        self.servers.insert(record.id, record);
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[async_trait]
impl ServerStore for MemoryServerStore {
    async fn find_server(
        &self,
        owner: OwnerId,
        id: ServerId,
    ) -> Result<Option<ServerRecord>, StoreError> {
        Ok(self
            .servers
            .get(&id)
            .filter(|record| record.owner_id == owner)
            .map(|record| record.clone()))
    }
}

/// Store loaded from a JSON array of records
#[derive(Debug)]
pub struct JsonServerStore {
    path: PathBuf,
    inner: MemoryServerStore,
}

impl JsonServerStore {
    /// Load records from `path`
    ///
    /// A missing file is an empty store. A malformed file is an error.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = match fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str::<Vec<ServerRecord>>(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StoreError::Io(e)),
        };

        info!("Loaded {} server records from {:?}", records.len(), path);

        Ok(Self {
            inner: MemoryServerStore::from_records(records)?,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl ServerStore for JsonServerStore {
    async fn find_server(
        &self,
        owner: OwnerId,
        id: ServerId,
    ) -> Result<Option<ServerRecord>, StoreError> {
        self.inner.find_server(owner, id).await
    }
}
