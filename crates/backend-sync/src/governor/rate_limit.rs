use std::{
    collections::{HashMap, VecDeque},
    fmt,
    time::Duration,
};

use backend_core::BackendError;
use tokio::time::Instant;

/// Governed backend endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    WhoAmI,
    Refresh,
    Messages,
    Sync,
    Event,
    RoomState,
    Join,
    Send,
}

impl Endpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WhoAmI => "whoami",
            Self::Refresh => "refresh",
            Self::Messages => "messages",
            Self::Sync => "sync",
            Self::Event => "event",
            Self::RoomState => "room_state",
            Self::Join => "join",
            Self::Send => "send",
        }
    }

    /// Server throttling of a critical endpoint cools down the whole transport.
    pub fn is_critical(self) -> bool {
        matches!(self, Self::Messages | Self::Sync | Self::Send)
    }

    /// Liveness probes get the short ceiling.
    pub fn is_probe(self) -> bool {
        matches!(self, Self::WhoAmI)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct RateLimitRecord {
    recent: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

/// Per-endpoint sliding window with cooldowns, plus a transport-wide cooldown.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    threshold: usize,
    cooldown: Duration,
    server_cooldown: Duration,
    max_server_cooldown: Duration,
    records: HashMap<Endpoint, RateLimitRecord>,
    global_cooldown_until: Option<Instant>,
}

impl RateLimiter {
    pub fn new(
        window: Duration,
        threshold: u32,
        cooldown: Duration,
        server_cooldown: Duration,
        max_server_cooldown: Duration,
    ) -> Self {
        Self {
            window,
            threshold: threshold.max(1) as usize,
            cooldown,
            server_cooldown,
            max_server_cooldown: max_server_cooldown.max(server_cooldown),
            records: HashMap::new(),
            global_cooldown_until: None,
        }
    }

    /// Admit one request or return the synthesized throttled result.
    ///
    /// Admitted requests count toward the window; rejected ones do not.
    pub fn check(&mut self, endpoint: Endpoint, now: Instant) -> Result<(), BackendError> {
        if let Some(remaining) = self.global_remaining(now) {
            return Err(BackendError::global_cooldown(endpoint.as_str(), remaining));
        }

        let record = self.records.entry(endpoint).or_default();
        if let Some(until) = record.cooldown_until {
            if until > now {
                return Err(BackendError::throttled_locally(endpoint.as_str(), until - now));
            }
            record.cooldown_until = None;
        }

        while record
            .recent
            .front()
            .is_some_and(|at| now.duration_since(*at) >= self.window)
        {
            record.recent.pop_front();
        }

        if record.recent.len() >= self.threshold {
            record.cooldown_until = Some(now + self.cooldown);
            record.recent.clear();
            return Err(BackendError::throttled_locally(endpoint.as_str(), self.cooldown));
        }

        record.recent.push_back(now);
        Ok(())
    }

    /// Bound a server retry hint to the configured ceiling.
    pub fn clamp_hint(&self, hint: Duration) -> Duration {
        hint.min(self.max_server_cooldown)
    }

    /// Apply a server-signaled throttle. Returns the cooldown applied.
    pub fn record_server_throttle(
        &mut self,
        endpoint: Endpoint,
        retry_after: Option<Duration>,
        now: Instant,
    ) -> Duration {
        let cooldown = retry_after.map_or(self.server_cooldown, |hint| self.clamp_hint(hint));
        let until = now + cooldown;
        let record = self.records.entry(endpoint).or_default();
        record.cooldown_until = Some(record.cooldown_until.map_or(until, |cur| cur.max(until)));
        if endpoint.is_critical() {
            self.global_cooldown_until =
                Some(self.global_cooldown_until.map_or(until, |cur| cur.max(until)));
        }
        cooldown
    }

    pub fn global_remaining(&self, now: Instant) -> Option<Duration> {
        self.global_cooldown_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    pub fn endpoint_remaining(&self, endpoint: Endpoint, now: Instant) -> Option<Duration> {
        self.records
            .get(&endpoint)
            .and_then(|r| r.cooldown_until)
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}
