//! Local persistence seams: secret storage for credentials and the durable
//! key-value tier behind the message cache.

pub mod kv;
pub mod secret;

pub use kv::{
    DurableRecord, DurableStore, InMemoryDurableStore, KvStoreError, RecordKey,
    SqliteDurableStore,
};
#[cfg(feature = "os-keyring")]
pub use secret::OsKeyringSecretStore;
pub use secret::{InMemorySecretStore, ScopedSecretStore, SecretStore, SecretStoreError};
