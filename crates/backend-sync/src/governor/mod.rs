//! Transport health: credential validity, heartbeat probing and rate limits.

mod credentials;
mod rate_limit;

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use backend_core::{BackendError, BackendErrorCategory, Clock, SyncEventBus};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use credentials::{CredentialStatus, CredentialStore};
pub use rate_limit::{Endpoint, RateLimiter};

use crate::{config::GovernorConfig, single_flight::SingleFlight, transport::Transport};

use self::credentials::CredentialState;

/// Result of a heartbeat check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Inbound activity is recent enough.
    Skipped,
    /// The probe succeeded.
    Alive,
    /// The probe failed and a credential refresh brought the session back.
    Recovered,
    /// The probe failed and the refresh did not help.
    Dead,
}

struct GovernorInner {
    transport: Arc<dyn Transport>,
    config: GovernorConfig,
    clock: Arc<dyn Clock>,
    events: SyncEventBus,
    limiter: Mutex<RateLimiter>,
    credentials: Mutex<CredentialState>,
    refresh_flight: SingleFlight<(), CredentialStatus>,
    credential_store: Option<CredentialStore>,
    last_inbound: Mutex<Instant>,
}

/// Guards every backend request.
///
/// Cheap to clone; clones share credential and rate-limit state.
#[derive(Clone)]
pub struct ConnectionGovernor {
    inner: Arc<GovernorInner>,
}

impl ConnectionGovernor {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: GovernorConfig,
        clock: Arc<dyn Clock>,
        events: SyncEventBus,
        credential_store: Option<CredentialStore>,
    ) -> Self {
        let limiter = RateLimiter::new(
            config.rate_window,
            config.rate_threshold,
            config.rate_cooldown,
            config.server_cooldown,
            config.max_server_cooldown,
        );
        Self {
            inner: Arc::new(GovernorInner {
                transport,
                config,
                clock,
                events,
                limiter: Mutex::new(limiter),
                credentials: Mutex::new(CredentialState::default()),
                refresh_flight: SingleFlight::default(),
                credential_store,
                last_inbound: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.inner.config
    }

    /// Run one backend request under rate-limit and timeout governance.
    ///
    /// `request` is only polled when the limiter admits it, so a throttled
    /// call never reaches the network.
    pub async fn call<T, Fut>(&self, endpoint: Endpoint, request: Fut) -> Result<T, BackendError>
    where
        Fut: Future<Output = Result<T, BackendError>>,
    {
        if let Err(err) = lock(&self.inner.limiter).check(endpoint, Instant::now()) {
            debug!(
                %endpoint,
                code = %err.code,
                retry_after_ms = ?err.retry_after_ms,
                "request short-circuited"
            );
            return Err(err);
        }

        let ceiling = self.ceiling(endpoint);
        let mut result = match tokio::time::timeout(ceiling, request).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::timeout(endpoint.as_str(), ceiling)),
        };
        if let Err(err) = &mut result
            && !err.is_synthesized()
            && let Some(hint_ms) = err.retry_after_ms
        {
            let max_ms = self.inner.config.max_server_cooldown.as_millis() as u64;
            err.retry_after_ms = Some(hint_ms.min(max_ms));
        }

        match &result {
            Ok(_) => self.note_inbound(),
            Err(err)
                if err.category == BackendErrorCategory::RateLimited && !err.is_synthesized() =>
            {
                let cooldown = lock(&self.inner.limiter).record_server_throttle(
                    endpoint,
                    err.retry_after_ms.map(Duration::from_millis),
                    Instant::now(),
                );
                warn!(
                    %endpoint,
                    cooldown_ms = cooldown.as_millis() as u64,
                    global = endpoint.is_critical(),
                    "server throttled request"
                );
            }
            Err(err)
                if err.category == BackendErrorCategory::Auth && endpoint != Endpoint::Refresh =>
            {
                warn!(%endpoint, "access token rejected");
                self.mark_rejected();
            }
            Err(_) => {}
        }
        result
    }

    /// Whether a request to `endpoint` would currently be short-circuited.
    pub fn is_throttled(&self, endpoint: Endpoint) -> bool {
        let now = Instant::now();
        let limiter = lock(&self.inner.limiter);
        limiter.global_remaining(now).is_some()
            || limiter.endpoint_remaining(endpoint, now).is_some()
    }

    /// Record inbound traffic from the backend.
    pub fn note_inbound(&self) {
        *lock(&self.inner.last_inbound) = Instant::now();
        lock(&self.inner.credentials).clear_rejection();
    }

    /// Probe the backend when it has been silent for the heartbeat interval.
    pub async fn heartbeat(&self) -> HeartbeatOutcome {
        let idle = lock(&self.inner.last_inbound).elapsed();
        if idle < self.inner.config.heartbeat_idle {
            return HeartbeatOutcome::Skipped;
        }

        debug!(idle_ms = idle.as_millis() as u64, "probing idle connection");
        let probe = self
            .call(Endpoint::WhoAmI, self.inner.transport.whoami())
            .await;
        match probe {
            Ok(_) => HeartbeatOutcome::Alive,
            Err(err) => {
                warn!(code = %err.code, "heartbeat probe failed; refreshing credentials");
                lock(&self.inner.credentials).request_refresh();
                match self.ensure_valid().await {
                    CredentialStatus::Refreshed { .. } => {
                        info!("session recovered after failed heartbeat");
                        HeartbeatOutcome::Recovered
                    }
                    _ => HeartbeatOutcome::Dead,
                }
            }
        }
    }

    fn ceiling(&self, endpoint: Endpoint) -> Duration {
        if endpoint.is_probe() {
            self.inner.config.probe_timeout
        } else {
            self.inner.config.bulk_timeout
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
