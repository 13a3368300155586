//! Backend boundary consumed by the sync runtime.

use std::time::Duration;

use async_trait::async_trait;
use backend_core::{BackendError, OutgoingContent, RoomSummary};
use serde_json::Value;

pub mod mock;

/// Pagination direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Backward,
    Forward,
}

impl Direction {
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Backward => "b",
            Self::Forward => "f",
        }
    }
}

/// One page of room history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    /// Raw events in the order the server returned them.
    pub events: Vec<Value>,
    /// Cursor for the next page in the same direction; `None` at the start of history.
    pub next_token: Option<String>,
}

/// Timeline delta for one joined room.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveRoomUpdate {
    pub room_id: String,
    pub events: Vec<Value>,
    /// Cursor to paginate backward from the start of `events`.
    pub prev_batch: Option<String>,
    /// The server dropped events between this batch and the previous one.
    pub limited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteUpdate {
    pub room_id: String,
    pub inviter: Option<String>,
}

/// Result of one live-channel poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveBatch {
    pub next_batch: String,
    pub joined: Vec<LiveRoomUpdate>,
    pub invites: Vec<InviteUpdate>,
    pub left: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoAmI {
    pub user_id: String,
    pub device_id: Option<String>,
}

/// Tokens returned by a successful refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Servers may rotate the refresh token.
    pub refresh_token: Option<String>,
    pub expires_in_ms: Option<u64>,
}

/// Remote chat backend.
///
/// Every method maps one request. Failures are already classified into
/// [`BackendError`] categories; rate-limit envelopes carry `retry_after_ms`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Replace the bearer token used by subsequent requests.
    fn set_access_token(&self, access_token: &str);

    async fn whoami(&self) -> Result<WhoAmI, BackendError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshedToken, BackendError>;

    async fn messages(
        &self,
        room_id: &str,
        from: Option<&str>,
        direction: Direction,
        limit: u16,
    ) -> Result<HistoryPage, BackendError>;

    async fn sync_live(
        &self,
        since: Option<&str>,
        timeout: Duration,
    ) -> Result<LiveBatch, BackendError>;

    async fn event(&self, room_id: &str, event_id: &str) -> Result<Value, BackendError>;

    /// Room metadata including the local user's membership.
    async fn room_summary(&self, room_id: &str) -> Result<RoomSummary, BackendError>;

    async fn join(&self, room_id: &str) -> Result<(), BackendError>;

    /// Send a message; returns the event id assigned by the server.
    async fn send(
        &self,
        room_id: &str,
        content: &OutgoingContent,
        txn_id: &str,
    ) -> Result<String, BackendError>;
}
