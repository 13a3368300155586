//! UI-facing facade over the sync runtime.

use std::{path::Path, sync::Arc};

use backend_core::{
    BackendError, BackendErrorCategory, Clock, CredentialBundle, EventStream, LoadOptions,
    Message, OutgoingContent, RoomMembership, RoomSummary, SubscribeOptions, SyncEventBus,
    SyncLifecycleState, SystemClock,
};
use backend_platform::{
    DurableStore, InMemoryDurableStore, KvStoreError, SecretStore, SqliteDurableStore,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    cache::TieredCache,
    config::{ConfigError, SyncConfig},
    coordinator::{CoordinatorRegistry, SyncCoordinator},
    governor::{ConnectionGovernor, CredentialStore, Endpoint},
    loader::MultiStrategyMessageLoader,
    transport::Transport,
};

/// Failures while assembling a [`SyncClient`].
#[derive(Debug, Error)]
pub enum SyncSetupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("durable cache unavailable: {0}")]
    Store(#[from] KvStoreError),
    #[error("credential restore failed: {0}")]
    Credentials(#[source] BackendError),
}

/// Assembles the runtime services around one transport.
pub struct SyncClientBuilder {
    transport: Arc<dyn Transport>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    durable: Option<Arc<dyn DurableStore>>,
    credential_store: Option<CredentialStore>,
    registry: Option<CoordinatorRegistry>,
    events: SyncEventBus,
}

impl SyncClientBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: SyncConfig::default(),
            clock: Arc::new(SystemClock),
            durable: None,
            credential_store: None,
            registry: None,
            events: SyncEventBus::default(),
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Open the SQLite durable tier at the configured per-account path.
    pub fn sqlite_cache(self, homeserver: &str, user_id: &str) -> Result<Self, SyncSetupError> {
        let path = self.config.durable_cache_path(homeserver, user_id);
        self.sqlite_cache_at(&path)
    }

    pub fn sqlite_cache_at(self, path: &Path) -> Result<Self, SyncSetupError> {
        let store = SqliteDurableStore::open(path)?;
        info!(path = %path.display(), "opened durable cache");
        Ok(self.durable_store(Arc::new(store)))
    }

    /// Persist credentials through `store` under the homeserver's account.
    pub fn secret_store(mut self, store: Arc<dyn SecretStore>, homeserver: &str) -> Self {
        self.credential_store = Some(CredentialStore::new(store, homeserver));
        self
    }

    /// Share loop ownership with other clients in the process.
    pub fn registry(mut self, registry: CoordinatorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn events(mut self, events: SyncEventBus) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> SyncClient {
        let SyncConfig {
            coordinator,
            loader,
            governor,
            ..
        } = self.config;
        let durable = self
            .durable
            .unwrap_or_else(|| Arc::new(InMemoryDurableStore::default()));
        let cache = Arc::new(TieredCache::new(durable, Arc::clone(&self.clock)));
        let governor = ConnectionGovernor::new(
            self.transport,
            governor,
            Arc::clone(&self.clock),
            self.events.clone(),
            self.credential_store,
        );
        let loader = MultiStrategyMessageLoader::new(governor.clone(), cache, self.clock, loader);
        let coordinator = SyncCoordinator::new(
            loader.clone(),
            self.events.clone(),
            coordinator,
            self.registry.unwrap_or_default(),
        );
        SyncClient {
            coordinator,
            loader,
            governor,
            events: self.events,
        }
    }
}

/// The surface the UI layer talks to.
///
/// Reads never fail: transient trouble shows up as empty or stale results
/// plus `SyncError` events. Only sending returns an error.
#[derive(Clone)]
pub struct SyncClient {
    coordinator: SyncCoordinator,
    loader: MultiStrategyMessageLoader,
    governor: ConnectionGovernor,
    events: SyncEventBus,
}

impl SyncClient {
    pub fn builder(transport: Arc<dyn Transport>) -> SyncClientBuilder {
        SyncClientBuilder::new(transport)
    }

    pub fn events(&self) -> EventStream {
        self.events.subscribe()
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn loader(&self) -> &MultiStrategyMessageLoader {
        &self.loader
    }

    pub fn governor(&self) -> &ConnectionGovernor {
        &self.governor
    }

    pub fn state(&self) -> SyncLifecycleState {
        self.coordinator.state()
    }

    pub fn set_credentials(&self, bundle: CredentialBundle) {
        self.governor.set_credentials(bundle);
    }

    /// Install persisted credentials. Returns whether a bundle was found.
    pub fn restore_credentials(&self) -> Result<bool, SyncSetupError> {
        self.governor
            .restore_credentials()
            .map_err(SyncSetupError::Credentials)
    }

    pub fn subscribe(&self, room_id: &str, options: SubscribeOptions) {
        self.coordinator.subscribe(room_id, options);
    }

    pub fn unsubscribe(&self, room_id: &str) {
        self.coordinator.unsubscribe(room_id);
    }

    pub async fn load_messages(&self, room_id: &str, options: LoadOptions) -> Vec<Message> {
        let messages = self.loader.load(room_id, options).await;
        self.coordinator.publish_timeline(room_id, messages.clone());
        messages
    }

    pub async fn load_older(&self, room_id: &str, limit: usize) -> Vec<Message> {
        let messages = self.loader.load_older(room_id, limit).await;
        self.coordinator.publish_timeline(room_id, messages.clone());
        messages
    }

    pub async fn room_summary(&self, room_id: &str) -> Option<RoomSummary> {
        self.loader.room_summary(room_id).await
    }

    pub async fn membership(&self, room_id: &str) -> RoomMembership {
        self.loader.membership(room_id).await
    }

    /// Send a message and return the server-assigned event id.
    ///
    /// Each call uses a fresh transaction id.
    pub async fn send_message(
        &self,
        room_id: &str,
        content: OutgoingContent,
    ) -> Result<String, BackendError> {
        let credentials = self.governor.ensure_valid().await;
        if credentials.access_token().is_none() {
            return Err(BackendError::new(
                BackendErrorCategory::Auth,
                "credential_missing",
                "no credentials installed",
            ));
        }

        let txn_id = Uuid::new_v4().to_string();
        let transport = self.governor.transport();
        match self
            .governor
            .call(Endpoint::Send, transport.send(room_id, &content, &txn_id))
            .await
        {
            Ok(event_id) => {
                info!(room_id = %room_id, event_id = %event_id, txn_id = %txn_id, "message sent");
                self.coordinator.sync_now();
                Ok(event_id)
            }
            Err(err) => {
                warn!(room_id = %room_id, txn_id = %txn_id, code = %err.code, "send failed");
                Err(err)
            }
        }
    }

    pub fn sync_now(&self) {
        self.coordinator.sync_now();
    }

    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }
}
