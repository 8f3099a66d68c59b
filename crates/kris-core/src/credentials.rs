//! User credentials kept in the OS secret store.
//!
//! Everything is stored as one JSON blob so the login, the API key and the
//! current access token always move together.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use keyring::Entry;
use serde::{Deserialize, Serialize};

use crate::error::{KrisError, Result};
use crate::redact::REDACTED;

pub const SERVICE_NAME: &str = "kris";
pub const CREDENTIALS_KEY: &str = "data";

/// Opaque named-secret storage.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Store backed by the platform keychain (Keychain, Credential Manager or
/// Secret Service).
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Ok(Entry::new(&self.service, key)?)
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => {
                tracing::debug!(service = %self.service, key, "no entry in secret store");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?.set_password(value)?;
        Ok(())
    }
}

/// Process-local store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredentials {
    pub email: String,
    pub password: String,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl UserCredentials {
    pub fn new(email: String, password: String, api_key: String) -> Self {
        Self {
            email,
            password,
            api_key,
            access_token: None,
        }
    }

    pub fn load(store: &dyn CredentialStore) -> Result<Option<Self>> {
        store
            .get(CREDENTIALS_KEY)?
            .map(|blob| serde_json::from_str(&blob).map_err(KrisError::from))
            .transpose()
    }

    /// Like [`Self::load`], but missing credentials are an error.
    pub fn require(store: &dyn CredentialStore) -> Result<Self> {
        Self::load(store)?.ok_or(KrisError::NotAuthorized)
    }

    pub fn save(&self, store: &dyn CredentialStore) -> Result<()> {
        store.set(CREDENTIALS_KEY, &serde_json::to_string(self)?)
    }
}

impl fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredentials")
            .field("email", &REDACTED)
            .field("password", &REDACTED)
            .field("api_key", &REDACTED)
            .field("access_token", &self.access_token.as_ref().map(|_| REDACTED))
            .finish()
    }
}
