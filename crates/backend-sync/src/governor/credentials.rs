use std::sync::Arc;

use backend_core::{BackendError, BackendErrorCategory, CredentialBundle, SyncEvent};
use backend_platform::{ScopedSecretStore, SecretStore, SecretStoreError};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{ConnectionGovernor, Endpoint, lock};

const SECRET_SERVICE: &str = "dev.thesamecat.pikachat";

/// Outcome of [`ConnectionGovernor::ensure_valid`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialStatus {
    /// Token is outside the guard window.
    Valid { access_token: String },
    /// A refresh completed for this call.
    Refreshed { access_token: String },
    /// Refresh was not possible now; use the existing token as-is.
    Stale { access_token: String, expired: bool },
    /// No credential installed.
    Missing,
}

impl CredentialStatus {
    pub fn access_token(&self) -> Option<&str> {
        match self {
            Self::Valid { access_token }
            | Self::Refreshed { access_token }
            | Self::Stale { access_token, .. } => Some(access_token),
            Self::Missing => None,
        }
    }

    /// Whether a sync cycle should run with this credential.
    pub fn can_sync(&self) -> bool {
        match self {
            Self::Valid { .. } | Self::Refreshed { .. } => true,
            Self::Stale { expired, .. } => !expired,
            Self::Missing => false,
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct CredentialState {
    bundle: Option<CredentialBundle>,
    /// The server rejected the current token.
    rejected: bool,
    /// A refresh was requested regardless of expiry.
    refresh_requested: bool,
    consecutive_failures: u32,
    last_attempt: Option<Instant>,
    paused_until: Option<Instant>,
    expiry_notified: bool,
}

impl CredentialState {
    pub(super) fn clear_rejection(&mut self) {
        self.rejected = false;
    }

    pub(super) fn request_refresh(&mut self) {
        self.refresh_requested = true;
    }

    fn is_expired(&self, bundle: &CredentialBundle, now_ms: u64) -> bool {
        self.rejected || bundle.expires_at_ms.is_some_and(|at| now_ms >= at)
    }

    fn stale(&self, bundle: &CredentialBundle, now_ms: u64) -> CredentialStatus {
        CredentialStatus::Stale {
            access_token: bundle.access_token.clone(),
            expired: self.is_expired(bundle, now_ms),
        }
    }
}

/// Credential bundle persisted through the secret store.
pub struct CredentialStore {
    store: ScopedSecretStore<Arc<dyn SecretStore>>,
    account: String,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn SecretStore>, homeserver: &str) -> Self {
        Self {
            store: ScopedSecretStore::new(store, SECRET_SERVICE),
            account: format!("credentials:{homeserver}"),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn load(&self) -> Result<Option<CredentialBundle>, BackendError> {
        self.store
            .get_json(&self.account)
            .map_err(|err| map_secret_store_error("load", &self.account, err))
    }

    pub fn save(&self, bundle: &CredentialBundle) -> Result<(), BackendError> {
        self.store
            .set_json(&self.account, bundle)
            .map_err(|err| map_secret_store_error("save", &self.account, err))
    }

    pub fn clear(&self) -> Result<(), BackendError> {
        match self.store.delete(&self.account) {
            Ok(()) | Err(SecretStoreError::NotFound) => Ok(()),
            Err(err) => Err(map_secret_store_error("clear", &self.account, err)),
        }
    }
}

impl ConnectionGovernor {
    /// Install a credential bundle and persist it.
    pub fn set_credentials(&self, bundle: CredentialBundle) {
        self.inner.transport.set_access_token(&bundle.access_token);
        self.persist(&bundle);
        let mut state = lock(&self.inner.credentials);
        *state = CredentialState {
            bundle: Some(bundle),
            ..CredentialState::default()
        };
    }

    /// Load the persisted bundle, if any. Returns whether one was installed.
    pub fn restore_credentials(&self) -> Result<bool, BackendError> {
        let Some(store) = &self.inner.credential_store else {
            return Ok(false);
        };
        let Some(bundle) = store.load()? else {
            return Ok(false);
        };
        info!(user_id = %bundle.user_id, "restored persisted credentials");
        self.inner.transport.set_access_token(&bundle.access_token);
        lock(&self.inner.credentials).bundle = Some(bundle);
        Ok(true)
    }

    pub fn credentials(&self) -> Option<CredentialBundle> {
        lock(&self.inner.credentials).bundle.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        lock(&self.inner.credentials)
            .bundle
            .as_ref()
            .map(|b| b.user_id.clone())
    }

    /// Make sure the token is usable, refreshing it when it expires within
    /// the guard window.
    ///
    /// At most one refresh runs at a time; concurrent callers share its
    /// outcome. During the refresh cooldown or the pause after repeated
    /// failures the existing token is returned as [`CredentialStatus::Stale`].
    pub async fn ensure_valid(&self) -> CredentialStatus {
        let now_ms = self.inner.clock.now_ms();
        let guard_ms = self.inner.config.token_guard.as_millis() as u64;
        {
            let state = lock(&self.inner.credentials);
            let Some(bundle) = &state.bundle else {
                return CredentialStatus::Missing;
            };
            let expiring = bundle
                .expires_at_ms
                .is_some_and(|at| now_ms.saturating_add(guard_ms) >= at);
            if !expiring && !state.rejected && !state.refresh_requested {
                return CredentialStatus::Valid {
                    access_token: bundle.access_token.clone(),
                };
            }
        }

        let governor = self.clone();
        self.inner
            .refresh_flight
            .run((), move || async move { governor.run_refresh().await })
            .await
    }

    async fn run_refresh(&self) -> CredentialStatus {
        let now = Instant::now();
        let now_ms = self.inner.clock.now_ms();
        let refresh_token = {
            let mut state = lock(&self.inner.credentials);
            let Some(bundle) = state.bundle.clone() else {
                return CredentialStatus::Missing;
            };
            state.refresh_requested = false;

            if state.paused_until.is_some_and(|until| until > now) {
                return state.stale(&bundle, now_ms);
            }
            let cooldown = self.inner.config.refresh_cooldown;
            if state
                .last_attempt
                .is_some_and(|at| now.duration_since(at) < cooldown)
            {
                return state.stale(&bundle, now_ms);
            }
            let Some(refresh_token) = bundle.refresh_token.clone() else {
                let status = state.stale(&bundle, now_ms);
                if state.is_expired(&bundle, now_ms) && !state.expiry_notified {
                    state.expiry_notified = true;
                    drop(state);
                    warn!(user_id = %bundle.user_id, "token expired and cannot be refreshed");
                    self.inner.events.emit(SyncEvent::CredentialExpired {
                        user_id: Some(bundle.user_id.clone()),
                        error_code: "credential_unrefreshable".to_owned(),
                    });
                }
                return status;
            };
            state.last_attempt = Some(now);
            refresh_token
        };

        let result = self
            .call(
                Endpoint::Refresh,
                self.inner.transport.refresh_token(&refresh_token),
            )
            .await;

        match result {
            Ok(tokens) => {
                let updated = {
                    let mut state = lock(&self.inner.credentials);
                    let Some(bundle) = state.bundle.as_mut() else {
                        return CredentialStatus::Missing;
                    };
                    bundle.access_token = tokens.access_token.clone();
                    if let Some(rotated) = tokens.refresh_token {
                        bundle.refresh_token = Some(rotated);
                    }
                    bundle.expires_at_ms = tokens
                        .expires_in_ms
                        .map(|ms| self.inner.clock.now_ms().saturating_add(ms));
                    let updated = bundle.clone();
                    state.rejected = false;
                    state.consecutive_failures = 0;
                    state.paused_until = None;
                    state.expiry_notified = false;
                    updated
                };
                self.inner.transport.set_access_token(&updated.access_token);
                self.persist(&updated);
                info!(user_id = %updated.user_id, "access token refreshed");
                CredentialStatus::Refreshed {
                    access_token: updated.access_token,
                }
            }
            Err(err) if err.is_synthesized() => {
                debug!(code = %err.code, "credential refresh deferred by local throttle");
                let state = lock(&self.inner.credentials);
                match state.bundle.as_ref() {
                    Some(bundle) => state.stale(bundle, now_ms),
                    None => CredentialStatus::Missing,
                }
            }
            Err(err) => {
                let (status, exhausted, user_id) = {
                    let mut state = lock(&self.inner.credentials);
                    state.consecutive_failures += 1;
                    let exhausted =
                        state.consecutive_failures >= self.inner.config.refresh_max_attempts;
                    if exhausted {
                        state.consecutive_failures = 0;
                        state.paused_until = Some(now + self.inner.config.refresh_pause);
                    }
                    let Some(bundle) = state.bundle.clone() else {
                        return CredentialStatus::Missing;
                    };
                    (state.stale(&bundle, now_ms), exhausted, bundle.user_id)
                };

                if exhausted {
                    error!(
                        %user_id,
                        code = %err.code,
                        pause_ms = self.inner.config.refresh_pause.as_millis() as u64,
                        "credential refresh exhausted"
                    );
                    self.inner.events.emit(SyncEvent::CredentialExpired {
                        user_id: Some(user_id),
                        error_code: "credential_refresh_exhausted".to_owned(),
                    });
                } else {
                    warn!(%user_id, code = %err.code, "credential refresh failed");
                }
                status
            }
        }
    }

    pub(super) fn mark_rejected(&self) {
        lock(&self.inner.credentials).rejected = true;
    }

    fn persist(&self, bundle: &CredentialBundle) {
        if let Some(store) = &self.inner.credential_store
            && let Err(err) = store.save(bundle)
        {
            warn!(account = %store.account(), error = %err, "failed to persist credentials");
        }
    }
}

fn map_secret_store_error(operation: &str, account: &str, err: SecretStoreError) -> BackendError {
    match err {
        SecretStoreError::NotFound => BackendError::new(
            BackendErrorCategory::Config,
            "credential_missing",
            format!("credentials missing for '{account}' during {operation}"),
        ),
        SecretStoreError::Unavailable(message) => BackendError::new(
            BackendErrorCategory::Storage,
            "storage_error",
            format!("secret store unavailable during {operation}: {message}"),
        ),
        SecretStoreError::Backend(message) | SecretStoreError::Encoding(message) => {
            BackendError::new(
                BackendErrorCategory::Storage,
                "storage_error",
                format!("secret store error during {operation}: {message}"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use crate::transport::Transport;

    use backend_core::{ManualClock, SyncEventBus};
    use backend_platform::InMemorySecretStore;
    use futures_util::future::join_all;

    use super::*;
    use crate::{
        config::GovernorConfig,
        governor::tests::{bundle, governor_with},
        transport::mock::{MockCallKind, MockTransport},
    };

    fn refresh_failure() -> BackendError {
        BackendError::new(BackendErrorCategory::Network, "matrix_http_error", "refresh down")
    }

    #[tokio::test(start_paused = true)]
    async fn token_outside_guard_window_is_valid_without_refresh() {
        let mock = Arc::new(MockTransport::new("@me:example.org"));
        let clock = ManualClock::new(1_000_000);
        let governor = governor_with(Arc::clone(&mock), GovernorConfig::default(), clock);
        governor.set_credentials(bundle(Some(1_000_000 + 600_000)));

        let status = governor.ensure_valid().await;
        assert_eq!(
            status,
            CredentialStatus::Valid {
                access_token: "old-token".into()
            }
        );
        assert_eq!(mock.count(MockCallKind::Refresh), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_refresh() {
        let mock = Arc::new(MockTransport::new("@me:example.org"));
        mock.set_latency(Duration::from_millis(200));
        let clock = ManualClock::new(1_000_000);
        let governor = governor_with(Arc::clone(&mock), GovernorConfig::default(), clock);
        governor.set_credentials(bundle(Some(1_000_000 + 10_000)));

        let statuses = join_all((0..5).map(|_| governor.ensure_valid())).await;

        assert_eq!(mock.count(MockCallKind::Refresh), 1);
        for status in statuses {
            assert_eq!(status.access_token(), Some("refreshed-token-1"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failures_respect_cooldown_then_pause_and_notify() {
        let mock = Arc::new(MockTransport::new("@me:example.org"));
        for _ in 0..3 {
            mock.fail_next(MockCallKind::Refresh, refresh_failure());
        }
        let clock = ManualClock::new(1_000_000);
        let events = SyncEventBus::default();
        let mut stream = events.subscribe();
        let governor = ConnectionGovernor::new(
            Arc::clone(&mock) as Arc<dyn crate::transport::Transport>,
            GovernorConfig::default(),
            Arc::new(clock),
            events,
            None,
        );
        governor.set_credentials(bundle(Some(1_000_000 + 10_000)));

        let first = governor.ensure_valid().await;
        assert!(matches!(first, CredentialStatus::Stale { expired: false, .. }));
        assert!(first.can_sync());

        let within_cooldown = governor.ensure_valid().await;
        assert!(matches!(within_cooldown, CredentialStatus::Stale { .. }));
        assert_eq!(mock.count(MockCallKind::Refresh), 1);

        for _ in 0..2 {
            tokio::time::advance(Duration::from_secs(5)).await;
            governor.ensure_valid().await;
        }
        assert_eq!(mock.count(MockCallKind::Refresh), 3);
        let event = stream.recv().await.expect("exhaustion should be announced");
        assert_eq!(
            event,
            SyncEvent::CredentialExpired {
                user_id: Some("@me:example.org".into()),
                error_code: "credential_refresh_exhausted".into(),
            }
        );

        tokio::time::advance(Duration::from_secs(60)).await;
        governor.ensure_valid().await;
        assert_eq!(mock.count(MockCallKind::Refresh), 3, "pause must hold");

        tokio::time::advance(Duration::from_secs(300)).await;
        let recovered = governor.ensure_valid().await;
        assert_eq!(recovered.access_token(), Some("refreshed-token-1"));
        assert_eq!(mock.count(MockCallKind::Refresh), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn locally_throttled_refreshes_do_not_exhaust_credentials() {
        let mock = Arc::new(MockTransport::new("@me:example.org"));
        mock.fail_next(
            MockCallKind::SyncLive,
            BackendError::new(
                BackendErrorCategory::RateLimited,
                "matrix_http_error",
                "M_LIMIT_EXCEEDED",
            )
            .with_retry_after(Duration::from_secs(60)),
        );
        let events = SyncEventBus::default();
        let mut stream = events.subscribe();
        let governor = ConnectionGovernor::new(
            Arc::clone(&mock) as Arc<dyn crate::transport::Transport>,
            GovernorConfig::default(),
            Arc::new(ManualClock::new(1_000_000)),
            events,
            None,
        );
        governor.set_credentials(bundle(Some(1_000_000 + 10_000)));
        governor
            .call(Endpoint::Sync, mock.sync_live(None, Duration::from_secs(1)))
            .await
            .expect_err("server throttle should start a global cooldown");

        for _ in 0..4 {
            let status = governor.ensure_valid().await;
            assert!(matches!(status, CredentialStatus::Stale { expired: false, .. }));
            tokio::time::advance(Duration::from_secs(6)).await;
        }
        assert_eq!(mock.count(MockCallKind::Refresh), 0);
        assert!(stream.try_recv().is_err(), "no expiry should be announced");

        tokio::time::advance(Duration::from_secs(60)).await;
        let status = governor.ensure_valid().await;
        assert_eq!(status.access_token(), Some("refreshed-token-1"));
        assert_eq!(mock.count(MockCallKind::Refresh), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_token_without_refresh_token_cannot_sync() {
        let mock = Arc::new(MockTransport::new("@me:example.org"));
        let governor =
            governor_with(Arc::clone(&mock), GovernorConfig::default(), ManualClock::new(0));
        governor.set_credentials(CredentialBundle {
            refresh_token: None,
            ..bundle(None)
        });
        governor.mark_rejected();

        let status = governor.ensure_valid().await;
        assert!(!status.can_sync());
        assert_eq!(mock.count(MockCallKind::Refresh), 0);

        governor.note_inbound();
        assert!(governor.ensure_valid().await.can_sync());
    }

    #[tokio::test]
    async fn credentials_round_trip_through_secret_store() {
        let secrets: Arc<dyn SecretStore> = Arc::new(InMemorySecretStore::default());
        let store = CredentialStore::new(Arc::clone(&secrets), "https://matrix.example.org");
        assert_eq!(store.account(), "credentials:https://matrix.example.org");
        assert_eq!(store.load().expect("load should work"), None);

        let mock = Arc::new(MockTransport::new("@me:example.org"));
        let governor = ConnectionGovernor::new(
            Arc::clone(&mock) as Arc<dyn crate::transport::Transport>,
            GovernorConfig::default(),
            Arc::new(ManualClock::new(0)),
            SyncEventBus::default(),
            Some(store),
        );
        governor.set_credentials(bundle(None));

        let reopened = CredentialStore::new(secrets, "https://matrix.example.org");
        let restored = reopened.load().expect("load should work");
        assert_eq!(restored, Some(bundle(None)));
        reopened.clear().expect("clear should work");
        reopened.clear().expect("clearing twice should be fine");
    }
}
