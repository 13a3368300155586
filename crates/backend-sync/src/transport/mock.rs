//! Scripted in-process transport.
//!
//! Used by tests to assert exactly which requests reached the "network", and
//! by the smoke binary for offline runs.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use backend_core::{
    BackendError, BackendErrorCategory, OutgoingContent, RoomMembership, RoomSummary,
};
use serde_json::{Value, json};

use super::{
    Direction, HistoryPage, InviteUpdate, LiveBatch, LiveRoomUpdate, RefreshedToken, Transport,
    WhoAmI,
};

/// Request kinds recorded by [`MockTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCallKind {
    WhoAmI,
    Refresh,
    Messages,
    SyncLive,
    Event,
    RoomSummary,
    Join,
    Send,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub kind: MockCallKind,
    pub room_id: Option<String>,
}

#[derive(Debug, Clone)]
struct MockRoom {
    summary: RoomSummary,
    /// Oldest first.
    history: Vec<Value>,
    /// Events reachable by id only.
    detached: HashMap<String, Value>,
}

#[derive(Debug, Default)]
struct MockState {
    rooms: HashMap<String, MockRoom>,
    live: VecDeque<LiveBatch>,
    failures: HashMap<MockCallKind, VecDeque<BackendError>>,
    refresh_results: VecDeque<RefreshedToken>,
    calls: Vec<MockCall>,
    access_token: Option<String>,
    latency: Duration,
    refresh_counter: u32,
    send_counter: u32,
    sync_counter: u32,
}

pub struct MockTransport {
    user_id: String,
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Builder form of [`MockTransport::add_room`].
    pub fn with_room(self, summary: RoomSummary, history: Vec<Value>) -> Self {
        self.add_room(summary, history);
        self
    }

    /// Register a room with its full history, oldest first.
    pub fn add_room(&self, summary: RoomSummary, history: Vec<Value>) {
        self.with_state(|state| {
            state.rooms.insert(
                summary.room_id.clone(),
                MockRoom {
                    summary,
                    history,
                    detached: HashMap::new(),
                },
            );
        });
    }

    /// Make an event fetchable by id without it appearing in paginated history.
    pub fn add_detached_event(&self, room_id: &str, event: Value) {
        let Some(event_id) = event_id_of(&event) else {
            return;
        };
        self.with_state(|state| {
            if let Some(room) = state.rooms.get_mut(room_id) {
                room.detached.insert(event_id, event);
            }
        });
    }

    pub fn set_membership(&self, room_id: &str, membership: RoomMembership) {
        self.with_state(|state| {
            if let Some(room) = state.rooms.get_mut(room_id) {
                room.summary.membership = membership;
            }
        });
    }

    /// Delay every request by `latency` before it resolves.
    pub fn set_latency(&self, latency: Duration) {
        self.with_state(|state| state.latency = latency);
    }

    /// Fail the next request of `kind` with `error`.
    pub fn fail_next(&self, kind: MockCallKind, error: BackendError) {
        self.with_state(|state| state.failures.entry(kind).or_default().push_back(error));
    }

    pub fn queue_refresh(&self, token: RefreshedToken) {
        self.with_state(|state| state.refresh_results.push_back(token));
    }

    pub fn queue_live(&self, batch: LiveBatch) {
        self.with_state(|state| state.live.push_back(batch));
    }

    /// Append events to a room's history and deliver them on the next live poll.
    pub fn push_live_events(&self, room_id: &str, events: Vec<Value>) {
        self.with_state(|state| {
            if let Some(room) = state.rooms.get_mut(room_id) {
                room.history.extend(events.iter().cloned());
            }
            state.sync_counter += 1;
            let batch = LiveBatch {
                next_batch: format!("s{}", state.sync_counter),
                joined: vec![LiveRoomUpdate {
                    room_id: room_id.to_owned(),
                    events,
                    prev_batch: None,
                    limited: false,
                }],
                ..LiveBatch::default()
            };
            state.live.push_back(batch);
        });
    }

    pub fn push_invite(&self, room_id: &str, inviter: Option<&str>) {
        self.with_state(|state| {
            state.sync_counter += 1;
            state.live.push_back(LiveBatch {
                next_batch: format!("s{}", state.sync_counter),
                invites: vec![InviteUpdate {
                    room_id: room_id.to_owned(),
                    inviter: inviter.map(ToOwned::to_owned),
                }],
                ..LiveBatch::default()
            });
        });
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.with_state(|state| state.calls.clone())
    }

    pub fn count(&self, kind: MockCallKind) -> usize {
        self.with_state(|state| state.calls.iter().filter(|c| c.kind == kind).count())
    }

    pub fn count_for_room(&self, kind: MockCallKind, room_id: &str) -> usize {
        self.with_state(|state| {
            state
                .calls
                .iter()
                .filter(|c| c.kind == kind && c.room_id.as_deref() == Some(room_id))
                .count()
        })
    }

    pub fn total_calls(&self) -> usize {
        self.with_state(|state| state.calls.len())
    }

    pub fn clear_calls(&self) {
        self.with_state(|state| state.calls.clear());
    }

    /// Bearer token most recently installed by the governor.
    pub fn access_token(&self) -> Option<String> {
        self.with_state(|state| state.access_token.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Record the call, then apply latency and scripted failures.
    async fn begin(&self, kind: MockCallKind, room_id: Option<&str>) -> Result<(), BackendError> {
        let (latency, failure) = self.with_state(|state| {
            state.calls.push(MockCall {
                kind,
                room_id: room_id.map(ToOwned::to_owned),
            });
            let failure = state.failures.get_mut(&kind).and_then(VecDeque::pop_front);
            (state.latency, failure)
        });
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn set_access_token(&self, access_token: &str) {
        self.with_state(|state| state.access_token = Some(access_token.to_owned()));
    }

    async fn whoami(&self) -> Result<WhoAmI, BackendError> {
        self.begin(MockCallKind::WhoAmI, None).await?;
        Ok(WhoAmI {
            user_id: self.user_id.clone(),
            device_id: Some("MOCKDEVICE".to_owned()),
        })
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<RefreshedToken, BackendError> {
        self.begin(MockCallKind::Refresh, None).await?;
        Ok(self.with_state(|state| {
            state.refresh_counter += 1;
            state
                .refresh_results
                .pop_front()
                .unwrap_or_else(|| RefreshedToken {
                    access_token: format!("refreshed-token-{}", state.refresh_counter),
                    refresh_token: None,
                    expires_in_ms: Some(3_600_000),
                })
        }))
    }

    async fn messages(
        &self,
        room_id: &str,
        from: Option<&str>,
        direction: Direction,
        limit: u16,
    ) -> Result<HistoryPage, BackendError> {
        self.begin(MockCallKind::Messages, Some(room_id)).await?;
        self.with_state(|state| {
            let room = joined_room(state, room_id)?;
            let len = room.history.len();
            let position = match from {
                Some(token) => parse_position(token)?.min(len),
                None if direction == Direction::Backward => len,
                None => 0,
            };
            let limit = usize::from(limit.max(1));
            Ok(match direction {
                Direction::Backward => {
                    let start = position.saturating_sub(limit);
                    HistoryPage {
                        events: room.history[start..position].iter().rev().cloned().collect(),
                        next_token: (start > 0).then(|| format!("pos:{start}")),
                    }
                }
                Direction::Forward => {
                    let end = (position + limit).min(len);
                    HistoryPage {
                        events: room.history[position..end].to_vec(),
                        next_token: (end < len).then(|| format!("pos:{end}")),
                    }
                }
            })
        })
    }

    async fn sync_live(
        &self,
        _since: Option<&str>,
        _timeout: Duration,
    ) -> Result<LiveBatch, BackendError> {
        self.begin(MockCallKind::SyncLive, None).await?;
        Ok(self.with_state(|state| match state.live.pop_front() {
            Some(batch) => batch,
            None => {
                state.sync_counter += 1;
                LiveBatch {
                    next_batch: format!("s{}", state.sync_counter),
                    ..LiveBatch::default()
                }
            }
        }))
    }

    async fn event(&self, room_id: &str, event_id: &str) -> Result<Value, BackendError> {
        self.begin(MockCallKind::Event, Some(room_id)).await?;
        self.with_state(|state| {
            let room = joined_room(state, room_id)?;
            room.history
                .iter()
                .find(|e| event_id_of(e).as_deref() == Some(event_id))
                .or_else(|| room.detached.get(event_id))
                .cloned()
                .ok_or_else(|| {
                    BackendError::new(
                        BackendErrorCategory::Config,
                        "matrix_http_error",
                        format!("M_NOT_FOUND: event {event_id} not found"),
                    )
                })
        })
    }

    async fn room_summary(&self, room_id: &str) -> Result<RoomSummary, BackendError> {
        self.begin(MockCallKind::RoomSummary, Some(room_id)).await?;
        self.with_state(|state| {
            state
                .rooms
                .get(room_id)
                .map(|room| room.summary.clone())
                .ok_or_else(|| forbidden(room_id))
        })
    }

    async fn join(&self, room_id: &str) -> Result<(), BackendError> {
        self.begin(MockCallKind::Join, Some(room_id)).await?;
        self.with_state(|state| match state.rooms.get_mut(room_id) {
            Some(room) if room.summary.membership != RoomMembership::Banned => {
                room.summary.membership = RoomMembership::Joined;
                Ok(())
            }
            _ => Err(forbidden(room_id)),
        })
    }

    async fn send(
        &self,
        room_id: &str,
        content: &OutgoingContent,
        _txn_id: &str,
    ) -> Result<String, BackendError> {
        self.begin(MockCallKind::Send, Some(room_id)).await?;
        let user_id = self.user_id.clone();
        self.with_state(|state| {
            state.send_counter += 1;
            let event_id = format!("$sent-{}", state.send_counter);
            let room = state
                .rooms
                .get_mut(room_id)
                .filter(|room| room.summary.membership == RoomMembership::Joined)
                .ok_or_else(|| forbidden(room_id))?;
            let ts = room
                .history
                .last()
                .and_then(|e| e.get("origin_server_ts"))
                .and_then(Value::as_u64)
                .unwrap_or(0)
                + 1;
            room.history.push(json!({
                "event_id": event_id,
                "sender": user_id,
                "type": "m.room.message",
                "origin_server_ts": ts,
                "content": { "msgtype": content.msgtype.as_wire(), "body": content.body },
            }));
            Ok(event_id)
        })
    }
}

/// Build an `m.room.message` text event.
pub fn text_event(event_id: &str, sender: &str, ts: u64, body: &str) -> Value {
    json!({
        "event_id": event_id,
        "sender": sender,
        "type": "m.room.message",
        "origin_server_ts": ts,
        "content": { "msgtype": "m.text", "body": body },
    })
}

/// Build an `m.reaction` annotation event.
pub fn reaction_event(event_id: &str, sender: &str, ts: u64, target: &str, key: &str) -> Value {
    json!({
        "event_id": event_id,
        "sender": sender,
        "type": "m.reaction",
        "origin_server_ts": ts,
        "content": {
            "m.relates_to": { "rel_type": "m.annotation", "event_id": target, "key": key }
        },
    })
}

fn event_id_of(event: &Value) -> Option<String> {
    event
        .get("event_id")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

fn joined_room<'a>(state: &'a MockState, room_id: &str) -> Result<&'a MockRoom, BackendError> {
    state
        .rooms
        .get(room_id)
        .filter(|room| room.summary.membership == RoomMembership::Joined)
        .ok_or_else(|| forbidden(room_id))
}

fn forbidden(room_id: &str) -> BackendError {
    BackendError::new(
        BackendErrorCategory::Forbidden,
        "matrix_http_error",
        format!("M_FORBIDDEN: not a member of {room_id}"),
    )
}

fn parse_position(token: &str) -> Result<usize, BackendError> {
    token
        .strip_prefix("pos:")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| {
            BackendError::new(
                BackendErrorCategory::Config,
                "matrix_http_error",
                format!("M_INVALID_PARAM: bad pagination token {token}"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(n: u64) -> Vec<Value> {
        (1..=n)
            .map(|i| text_event(&format!("$e{i}"), "@bob:example.org", i * 100, "hi"))
            .collect()
    }

    #[tokio::test]
    async fn paginates_backward_newest_first() {
        let mock = MockTransport::new("@me:example.org").with_room(
            RoomSummary::new("!r:example.org", RoomMembership::Joined),
            history(5),
        );

        let page = mock
            .messages("!r:example.org", None, Direction::Backward, 3)
            .await
            .expect("first page should load");
        let ids: Vec<_> = page.events.iter().filter_map(event_id_of).collect();
        assert_eq!(ids, vec!["$e5", "$e4", "$e3"]);
        assert_eq!(page.next_token.as_deref(), Some("pos:2"));

        let page = mock
            .messages("!r:example.org", page.next_token.as_deref(), Direction::Backward, 3)
            .await
            .expect("second page should load");
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.next_token, None);
        assert_eq!(mock.count(MockCallKind::Messages), 2);
    }

    #[tokio::test]
    async fn scripted_failures_apply_once() {
        let mock = MockTransport::new("@me:example.org");
        mock.fail_next(
            MockCallKind::WhoAmI,
            BackendError::new(BackendErrorCategory::Network, "down", "down"),
        );
        mock.whoami().await.expect_err("first probe should fail");
        mock.whoami().await.expect("second probe should pass");
        assert_eq!(mock.count(MockCallKind::WhoAmI), 2);
    }

    #[tokio::test]
    async fn invited_room_rejects_pagination() {
        let mock = MockTransport::new("@me:example.org").with_room(
            RoomSummary::new("!inv:example.org", RoomMembership::Invited),
            history(2),
        );
        let err = mock
            .messages("!inv:example.org", None, Direction::Backward, 10)
            .await
            .expect_err("pagination should be forbidden");
        assert_eq!(err.category, BackendErrorCategory::Forbidden);

        mock.join("!inv:example.org").await.expect("join should work");
        mock.messages("!inv:example.org", None, Direction::Backward, 10)
            .await
            .expect("pagination should work after join");
    }

    #[tokio::test]
    async fn sent_messages_join_history() {
        let mock = MockTransport::new("@me:example.org").with_room(
            RoomSummary::new("!r:example.org", RoomMembership::Joined),
            history(1),
        );
        let id = mock
            .send("!r:example.org", &OutgoingContent::text("yo"), "txn1")
            .await
            .expect("send should work");
        let event = mock.event("!r:example.org", &id).await.expect("event should exist");
        assert_eq!(event["origin_server_ts"], 101);
    }
}
