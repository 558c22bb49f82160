//! Credential store contract
//!
//! The gateway persists OAuth tokens and DCR client registrations through a
//! `CredentialStore`. Two key namespaces are in use:
//!
//! - `{auth_endpoint}/{provider}` - OAuth token sets
//! - `https://{server}.mcp-dcr` - DCR client registrations
//!
//! Secret payloads are base64-encoded JSON blobs; `encode_blob` and
//! `decode_blob` are the only supported way in and out.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::CoreError;

/// Persistent store for named secrets.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn add(&self, key: &str, username: &str, secret: &[u8]) -> Result<(), CoreError>;
    async fn get(&self, key: &str) -> Result<Option<(String, Vec<u8>)>, CoreError>;
    async fn delete(&self, key: &str) -> Result<(), CoreError>;
    async fn list(&self) -> Result<HashMap<String, String>, CoreError>;
}

/// Serialize a value into the base64-JSON blob format.
pub fn encode_blob<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    let json = serde_json::to_vec(value)?;
    Ok(BASE64.encode(json).into_bytes())
}

/// Deserialize a value from the base64-JSON blob format.
pub fn decode_blob<T: DeserializeOwned>(blob: &[u8]) -> Result<T, CoreError> {
    let raw = Zeroizing::new(
        BASE64
            .decode(blob)
            .map_err(|e| CoreError::Credential(format!("invalid base64 blob: {e}")))?,
    );
    Ok(serde_json::from_slice(&raw)?)
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, (String, Vec<u8>)>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn add(&self, key: &str, username: &str, secret: &[u8]) -> Result<(), CoreError> {
        self.entries
            .write()
            .insert(key.to_string(), (username.to_string(), secret.to_vec()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<(String, Vec<u8>)>, CoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<HashMap<String, String>, CoreError> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(k, (u, _))| (k.clone(), u.clone()))
            .collect())
    }
}

/// Stored shape for one keychain entry.
#[derive(Serialize, Deserialize)]
struct KeyringRecord {
    username: String,
    blob: String,
}

/// OS-keychain-backed store.
///
/// The keychain has no enumeration API, so an index record under
/// `INDEX_ACCOUNT` tracks known keys for `list`.
pub struct KeyringCredentialStore {
    service: String,
}

const INDEX_ACCOUNT: &str = "__index__";

impl KeyringCredentialStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, account: &str) -> Result<keyring::Entry, CoreError> {
        keyring::Entry::new(&self.service, account)
            .map_err(|e| CoreError::Credential(format!("keychain entry: {e}")))
    }

    fn read_index(&self) -> Result<HashMap<String, String>, CoreError> {
        match self.entry(INDEX_ACCOUNT)?.get_password() {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(keyring::Error::NoEntry) => Ok(HashMap::new()),
            Err(e) => Err(CoreError::Credential(format!("keychain read: {e}"))),
        }
    }

    fn write_index(&self, index: &HashMap<String, String>) -> Result<(), CoreError> {
        self.entry(INDEX_ACCOUNT)?
            .set_password(&serde_json::to_string(index)?)
            .map_err(|e| CoreError::Credential(format!("keychain write: {e}")))
    }
}

#[async_trait]
impl CredentialStore for KeyringCredentialStore {
    async fn add(&self, key: &str, username: &str, secret: &[u8]) -> Result<(), CoreError> {
        let record = KeyringRecord {
            username: username.to_string(),
            blob: String::from_utf8_lossy(secret).into_owned(),
        };
        let this = self.clone_for_blocking();
        let key = key.to_string();
        let username = username.to_string();
        tokio::task::spawn_blocking(move || {
            this.entry(&key)?
                .set_password(&serde_json::to_string(&record)?)
                .map_err(|e| CoreError::Credential(format!("keychain write: {e}")))?;
            let mut index = this.read_index()?;
            index.insert(key.clone(), username);
            this.write_index(&index)?;
            debug!(key = %key, "[Credentials] Stored secret");
            Ok(())
        })
        .await
        .map_err(|e| CoreError::Credential(format!("keychain task: {e}")))?
    }

    async fn get(&self, key: &str) -> Result<Option<(String, Vec<u8>)>, CoreError> {
        let this = self.clone_for_blocking();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || match this.entry(&key)?.get_password() {
            Ok(raw) => {
                let record: KeyringRecord = serde_json::from_str(&raw)?;
                Ok(Some((record.username, record.blob.into_bytes())))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CoreError::Credential(format!("keychain read: {e}"))),
        })
        .await
        .map_err(|e| CoreError::Credential(format!("keychain task: {e}")))?
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        let this = self.clone_for_blocking();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            match this.entry(&key)?.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => return Err(CoreError::Credential(format!("keychain delete: {e}"))),
            }
            let mut index = this.read_index()?;
            if index.remove(&key).is_some() {
                this.write_index(&index)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| CoreError::Credential(format!("keychain task: {e}")))?
    }

    async fn list(&self) -> Result<HashMap<String, String>, CoreError> {
        let this = self.clone_for_blocking();
        tokio::task::spawn_blocking(move || this.read_index())
            .await
            .map_err(|e| CoreError::Credential(format!("keychain task: {e}")))?
    }
}

impl KeyringCredentialStore {
    fn clone_for_blocking(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}
