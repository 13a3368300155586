//! Credential storage keyed by `(service, account)`.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretStoreError {
    #[error("secret not found")]
    NotFound,
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret store backend failure: {0}")]
    Backend(String),
    #[error("secret payload is not valid json: {0}")]
    Encoding(String),
}

/// Keyed secret storage (service, account) → secret string.
pub trait SecretStore: Send + Sync {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError>;

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError>;

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError>;
}

impl<S: SecretStore + ?Sized> SecretStore for Arc<S> {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError> {
        (**self).set_secret(service, account, secret)
    }

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError> {
        (**self).get_secret(service, account)
    }

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        (**self).delete_secret(service, account)
    }
}

/// Process-local store; secrets are gone when the process exits.
#[derive(Clone, Default)]
pub struct InMemorySecretStore {
    entries: Arc<RwLock<HashMap<SecretKey, String>>>,
}

type SecretKey = (String, String);

fn secret_key(service: &str, account: &str) -> SecretKey {
    (service.to_owned(), account.to_owned())
}

impl InMemorySecretStore {
    /// Number of stored secrets across all services.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SecretKey, String>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SecretKey, String>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SecretStore for InMemorySecretStore {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError> {
        self.write()
            .insert(secret_key(service, account), secret.to_owned());
        Ok(())
    }

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError> {
        self.read()
            .get(&secret_key(service, account))
            .cloned()
            .ok_or(SecretStoreError::NotFound)
    }

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        self.write()
            .remove(&secret_key(service, account))
            .map(drop)
            .ok_or(SecretStoreError::NotFound)
    }
}

/// Platform credential vault (Keychain, Secret Service, Credential Manager).
#[cfg(feature = "os-keyring")]
#[derive(Default, Clone, Copy)]
pub struct OsKeyringSecretStore;

#[cfg(feature = "os-keyring")]
impl OsKeyringSecretStore {
    fn entry(service: &str, account: &str) -> Result<keyring::Entry, SecretStoreError> {
        keyring::Entry::new(service, account).map_err(map_keyring_error)
    }
}

#[cfg(feature = "os-keyring")]
fn map_keyring_error(err: keyring::Error) -> SecretStoreError {
    match err {
        keyring::Error::NoEntry => SecretStoreError::NotFound,
        keyring::Error::NoStorageAccess(inner) | keyring::Error::PlatformFailure(inner) => {
            SecretStoreError::Unavailable(inner.to_string())
        }
        other => SecretStoreError::Backend(other.to_string()),
    }
}

#[cfg(feature = "os-keyring")]
impl SecretStore for OsKeyringSecretStore {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError> {
        Self::entry(service, account)?
            .set_password(secret)
            .map_err(map_keyring_error)
    }

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError> {
        Self::entry(service, account)?
            .get_password()
            .map_err(map_keyring_error)
    }

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        Self::entry(service, account)?
            .delete_credential()
            .map_err(map_keyring_error)
    }
}

/// Secret store bound to one service name, with JSON record helpers.
#[derive(Clone)]
pub struct ScopedSecretStore<S: SecretStore> {
    inner: S,
    service: String,
}

impl<S: SecretStore> ScopedSecretStore<S> {
    pub fn new(inner: S, service: impl Into<String>) -> Self {
        Self {
            inner,
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn set(&self, account: &str, secret: &str) -> Result<(), SecretStoreError> {
        self.inner.set_secret(&self.service, account, secret)
    }

    pub fn get(&self, account: &str) -> Result<String, SecretStoreError> {
        self.inner.get_secret(&self.service, account)
    }

    pub fn delete(&self, account: &str) -> Result<(), SecretStoreError> {
        self.inner.delete_secret(&self.service, account)
    }

    /// Store a record as JSON.
    pub fn set_json<T: Serialize>(&self, account: &str, value: &T) -> Result<(), SecretStoreError> {
        let encoded = serde_json::to_string(value)
            .map_err(|err| SecretStoreError::Encoding(err.to_string()))?;
        self.set(account, &encoded)
    }

    /// Load a JSON record; a missing record is `Ok(None)`.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        account: &str,
    ) -> Result<Option<T>, SecretStoreError> {
        let raw = match self.get(account) {
            Ok(raw) => raw,
            Err(SecretStoreError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| SecretStoreError::Encoding(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Bundle {
        token: String,
        expires_at_ms: Option<u64>,
    }

    #[test]
    fn scoped_store_isolates_services() {
        let base = InMemorySecretStore::default();
        let a = ScopedSecretStore::new(base.clone(), "pikachat-a");
        let b = ScopedSecretStore::new(base.clone(), "pikachat-b");

        a.set("credentials", "one").expect("set a");
        b.set("credentials", "two").expect("set b");

        assert_eq!(a.get("credentials").expect("get a"), "one");
        assert_eq!(b.get("credentials").expect("get b"), "two");
        assert_eq!(base.len(), 2);
    }

    #[test]
    fn json_records_round_trip_and_missing_is_none() {
        let store = ScopedSecretStore::new(InMemorySecretStore::default(), "pikachat");
        let missing: Option<Bundle> = store.get_json("credentials").expect("lookup should work");
        assert_eq!(missing, None);

        let bundle = Bundle {
            token: "syt_abc".into(),
            expires_at_ms: Some(42),
        };
        store.set_json("credentials", &bundle).expect("set should work");
        let loaded: Option<Bundle> = store.get_json("credentials").expect("get should work");
        assert_eq!(loaded, Some(bundle));

        store.delete("credentials").expect("delete should work");
        assert_eq!(store.get("credentials"), Err(SecretStoreError::NotFound));
        assert_eq!(store.delete("credentials"), Err(SecretStoreError::NotFound));
    }

    #[test]
    fn corrupt_json_is_an_encoding_error() {
        let store = ScopedSecretStore::new(InMemorySecretStore::default(), "pikachat");
        store.set("credentials", "{not json").expect("set should work");
        let err = store
            .get_json::<Bundle>("credentials")
            .expect_err("corrupt payload must fail");
        assert!(matches!(err, SecretStoreError::Encoding(_)));
    }

    #[derive(Default)]
    struct FailingStore;

    impl SecretStore for FailingStore {
        fn set_secret(
            &self,
            _service: &str,
            _account: &str,
            _secret: &str,
        ) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::Unavailable("mock outage".to_owned()))
        }

        fn get_secret(&self, _service: &str, _account: &str) -> Result<String, SecretStoreError> {
            Err(SecretStoreError::Unavailable("mock outage".to_owned()))
        }

        fn delete_secret(&self, _service: &str, _account: &str) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::Unavailable("mock outage".to_owned()))
        }
    }

    #[test]
    fn outage_propagates_through_json_helpers() {
        let scoped = ScopedSecretStore::new(FailingStore, "pikachat");
        let err = scoped
            .get_json::<Bundle>("credentials")
            .expect_err("get must fail");
        assert_eq!(err, SecretStoreError::Unavailable("mock outage".to_owned()));
    }
}
