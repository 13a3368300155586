//! Timeline sync runtime.
//!
//! Keeps subscribed conversations current against a remote chat backend:
//! a single background loop ([`SyncCoordinator`]) drives a multi-strategy
//! loader ([`MultiStrategyMessageLoader`]) that reads through a two-tier
//! cache ([`TieredCache`]), and every network call passes through the
//! [`ConnectionGovernor`] for credential checks, heartbeat probing and rate
//! limiting. [`SyncClient`] wires them together for the UI layer.

/// Memory plus durable read-through cache.
pub mod cache;
/// UI-facing facade and builder.
pub mod client;
/// Runtime configuration and defaults.
pub mod config;
/// Background sync loop and loop ownership.
pub mod coordinator;
/// Credential, heartbeat and rate-limit governance.
pub mod governor;
/// Matrix client-server API transport.
pub mod http;
/// Multi-strategy history loading.
pub mod loader;
/// Request deduplication by key.
pub mod single_flight;
/// Backend boundary and test double.
pub mod transport;

pub use cache::{CacheEntry, EntityType, SweepReport, TieredCache};
pub use client::{SyncClient, SyncClientBuilder, SyncSetupError};
pub use config::{ConfigError, CoordinatorConfig, GovernorConfig, LoaderConfig, SyncConfig};
pub use coordinator::{CoordinatorRegistry, LoopLease, SyncCoordinator};
pub use governor::{
    ConnectionGovernor, CredentialStatus, CredentialStore, Endpoint, HeartbeatOutcome,
    RateLimiter,
};
pub use http::MatrixHttpTransport;
pub use loader::{LoadReport, LoadSource, MultiStrategyMessageLoader};
pub use single_flight::SingleFlight;
pub use transport::{
    Direction, HistoryPage, InviteUpdate, LiveBatch, LiveRoomUpdate, RefreshedToken, Transport,
    WhoAmI,
};
