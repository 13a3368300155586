//! Matrix client-server API transport over `reqwest`.

use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use async_trait::async_trait;
use backend_core::{
    BackendError, BackendErrorCategory, OutgoingContent, RoomMembership, RoomSummary,
    classify_http_status,
};
use reqwest::{Client, Method, RequestBuilder, Response, Url, header::RETRY_AFTER};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::debug;

use crate::transport::{
    Direction, HistoryPage, InviteUpdate, LiveBatch, LiveRoomUpdate, RefreshedToken, Transport,
    WhoAmI,
};

const CLIENT_API_PREFIX: [&str; 3] = ["_matrix", "client", "v3"];

/// Matrix homeserver transport.
pub struct MatrixHttpTransport {
    http: Client,
    base: Url,
    access_token: RwLock<Option<String>>,
    user_id: RwLock<Option<String>>,
}

impl MatrixHttpTransport {
    pub fn new(homeserver_url: &str) -> Result<Self, BackendError> {
        let base = Url::parse(homeserver_url).map_err(|err| {
            BackendError::new(
                BackendErrorCategory::Config,
                "invalid_homeserver_url",
                format!("invalid homeserver URL '{homeserver_url}': {err}"),
            )
        })?;
        if base.cannot_be_a_base() {
            return Err(BackendError::new(
                BackendErrorCategory::Config,
                "invalid_homeserver_url",
                format!("homeserver URL '{homeserver_url}' cannot carry a path"),
            ));
        }
        let http = Client::builder().build().map_err(|err| {
            BackendError::new(
                BackendErrorCategory::Config,
                "http_client_build_failed",
                err.to_string(),
            )
        })?;
        Ok(Self {
            http,
            base,
            access_token: RwLock::new(None),
            user_id: RwLock::new(None),
        })
    }

    /// Own user id, used to read membership out of room state.
    pub fn with_user_id(self, user_id: impl Into<String>) -> Self {
        *write(&self.user_id) = Some(user_id.into());
        self
    }

    pub fn homeserver(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                BackendError::new(
                    BackendErrorCategory::Config,
                    "invalid_homeserver_url",
                    "homeserver URL cannot carry a path",
                )
            })?;
            path.pop_if_empty();
            path.extend(CLIENT_API_PREFIX);
            path.extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match read(&self.access_token).as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = builder.send().await.map_err(map_reqwest_error)?;
        let response = check_status(response).await?;
        response.json::<T>().await.map_err(|err| {
            BackendError::new(
                BackendErrorCategory::Serialization,
                "matrix_http_error",
                format!("unexpected response body: {err}"),
            )
        })
    }
}

#[async_trait]
impl Transport for MatrixHttpTransport {
    fn set_access_token(&self, access_token: &str) {
        *write(&self.access_token) = Some(access_token.to_owned());
    }

    async fn whoami(&self) -> Result<WhoAmI, BackendError> {
        let url = self.endpoint(&["account", "whoami"])?;
        let body: WhoAmIResponse = self.execute(self.request(Method::GET, url)).await?;
        *write(&self.user_id) = Some(body.user_id.clone());
        Ok(WhoAmI {
            user_id: body.user_id,
            device_id: body.device_id,
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshedToken, BackendError> {
        let url = self.endpoint(&["refresh"])?;
        let builder = self
            .http
            .post(url)
            .json(&json!({ "refresh_token": refresh_token }));
        let body: RefreshResponse = self.execute(builder).await?;
        Ok(RefreshedToken {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_in_ms: body.expires_in_ms,
        })
    }

    async fn messages(
        &self,
        room_id: &str,
        from: Option<&str>,
        direction: Direction,
        limit: u16,
    ) -> Result<HistoryPage, BackendError> {
        let mut url = self.endpoint(&["rooms", room_id, "messages"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("dir", direction.as_wire());
            query.append_pair("limit", &limit.to_string());
            if let Some(from) = from {
                query.append_pair("from", from);
            }
        }
        let body: MessagesResponse = self.execute(self.request(Method::GET, url)).await?;
        debug!(room_id = %room_id, count = body.chunk.len(), "fetched history page");
        Ok(history_page(body))
    }

    async fn sync_live(
        &self,
        since: Option<&str>,
        timeout: Duration,
    ) -> Result<LiveBatch, BackendError> {
        let mut url = self.endpoint(&["sync"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", &timeout.as_millis().to_string());
            if let Some(since) = since {
                query.append_pair("since", since);
            }
        }
        let body: SyncResponse = self.execute(self.request(Method::GET, url)).await?;
        Ok(live_batch(body))
    }

    async fn event(&self, room_id: &str, event_id: &str) -> Result<Value, BackendError> {
        let url = self.endpoint(&["rooms", room_id, "event", event_id])?;
        self.execute(self.request(Method::GET, url)).await
    }

    async fn room_summary(&self, room_id: &str) -> Result<RoomSummary, BackendError> {
        let url = self.endpoint(&["rooms", room_id, "state"])?;
        let state: Vec<Value> = self.execute(self.request(Method::GET, url)).await?;
        let user_id = read(&self.user_id).clone();
        Ok(summary_from_state(room_id, &state, user_id.as_deref()))
    }

    async fn join(&self, room_id: &str) -> Result<(), BackendError> {
        let url = self.endpoint(&["join", room_id])?;
        let _: Value = self
            .execute(self.request(Method::POST, url).json(&json!({})))
            .await?;
        Ok(())
    }

    async fn send(
        &self,
        room_id: &str,
        content: &OutgoingContent,
        txn_id: &str,
    ) -> Result<String, BackendError> {
        let url = self.endpoint(&["rooms", room_id, "send", "m.room.message", txn_id])?;
        let body = json!({ "msgtype": content.msgtype.as_wire(), "body": content.body });
        let response: SendResponse = self
            .execute(self.request(Method::PUT, url).json(&body))
            .await?;
        Ok(response.event_id)
    }
}

#[derive(Debug, Deserialize)]
struct WhoAmIResponse {
    user_id: String,
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    chunk: Vec<Value>,
    #[serde(default)]
    end: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    event_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Debug, Default, Deserialize)]
struct SyncRooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
    #[serde(default)]
    invite: HashMap<String, InvitedRoom>,
    #[serde(default)]
    leave: HashMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    timeline: SyncTimeline,
}

#[derive(Debug, Default, Deserialize)]
struct SyncTimeline {
    #[serde(default)]
    events: Vec<Value>,
    #[serde(default)]
    prev_batch: Option<String>,
    #[serde(default)]
    limited: bool,
}

#[derive(Debug, Default, Deserialize)]
struct InvitedRoom {
    #[serde(default)]
    invite_state: InviteState,
}

#[derive(Debug, Default, Deserialize)]
struct InviteState {
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errcode: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

fn history_page(body: MessagesResponse) -> HistoryPage {
    // An empty chunk with an end token still means the start of history.
    let next_token = if body.chunk.is_empty() { None } else { body.end };
    HistoryPage {
        events: body.chunk,
        next_token,
    }
}

fn live_batch(body: SyncResponse) -> LiveBatch {
    let mut joined: Vec<LiveRoomUpdate> = body
        .rooms
        .join
        .into_iter()
        .map(|(room_id, room)| LiveRoomUpdate {
            room_id,
            events: room.timeline.events,
            prev_batch: room.timeline.prev_batch,
            limited: room.timeline.limited,
        })
        .collect();
    joined.sort_by(|a, b| a.room_id.cmp(&b.room_id));

    let mut invites: Vec<InviteUpdate> = body
        .rooms
        .invite
        .into_iter()
        .map(|(room_id, room)| InviteUpdate {
            inviter: inviter_of(&room.invite_state.events),
            room_id,
        })
        .collect();
    invites.sort_by(|a, b| a.room_id.cmp(&b.room_id));

    let mut left: Vec<String> = body.rooms.leave.into_keys().collect();
    left.sort();

    LiveBatch {
        next_batch: body.next_batch,
        joined,
        invites,
        left,
    }
}

fn inviter_of(invite_state: &[Value]) -> Option<String> {
    invite_state
        .iter()
        .find(|event| {
            str_at(event, &["type"]) == Some("m.room.member")
                && str_at(event, &["content", "membership"]) == Some("invite")
        })
        .and_then(|event| str_at(event, &["sender"]))
        .map(ToOwned::to_owned)
}

fn summary_from_state(room_id: &str, state: &[Value], user_id: Option<&str>) -> RoomSummary {
    let mut summary = RoomSummary::new(room_id, RoomMembership::Unknown);
    for event in state {
        match str_at(event, &["type"]) {
            Some("m.room.name") => {
                summary.name = str_at(event, &["content", "name"]).map(ToOwned::to_owned);
            }
            Some("m.room.topic") => {
                summary.topic = str_at(event, &["content", "topic"]).map(ToOwned::to_owned);
            }
            Some("m.room.member")
                if user_id.is_some() && str_at(event, &["state_key"]) == user_id =>
            {
                if let Some(membership) = str_at(event, &["content", "membership"]) {
                    summary.membership = RoomMembership::from_wire(membership);
                }
                summary.is_direct = event
                    .pointer("/content/is_direct")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
            }
            _ => {}
        }
    }
    if summary.membership == RoomMembership::Unknown && user_id.is_none() {
        // Full state is only readable by members.
        summary.membership = RoomMembership::Joined;
    }
    summary
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |current, key| current.get(*key))
        .and_then(Value::as_str)
}

async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after_header = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1_000));
    let body = response.text().await.unwrap_or_default();
    Err(map_error_response(status.as_u16(), retry_after_header, &body))
}

fn map_error_response(status: u16, retry_after_header_ms: Option<u64>, body: &str) -> BackendError {
    let envelope: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    let errcode = envelope.errcode.unwrap_or_else(|| format!("HTTP_{status}"));
    let category = if errcode == "M_LIMIT_EXCEEDED" {
        BackendErrorCategory::RateLimited
    } else {
        classify_http_status(status)
    };
    let message = match envelope.error {
        Some(error) => format!("{errcode}: {error}"),
        None => errcode,
    };
    let mut mapped = BackendError::new(category, "matrix_http_error", message);
    if let Some(retry_after) = envelope.retry_after_ms.or(retry_after_header_ms) {
        mapped = mapped.with_retry_after(Duration::from_millis(retry_after));
    }
    mapped
}

fn map_reqwest_error(err: reqwest::Error) -> BackendError {
    let category = match err.status() {
        Some(status) => classify_http_status(status.as_u16()),
        None if err.is_builder() => BackendErrorCategory::Config,
        None => BackendErrorCategory::Network,
    };
    BackendError::new(category, "matrix_http_error", err.to_string())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::*;

    #[test]
    fn builds_percent_encoded_endpoint_paths() {
        let transport = MatrixHttpTransport::new("https://matrix.example.org/")
            .expect("homeserver URL should parse");
        let url = transport
            .endpoint(&["rooms", "!abc:example.org", "event", "$ev/1"])
            .expect("endpoint should build");
        assert_eq!(
            url.as_str(),
            "https://matrix.example.org/_matrix/client/v3/rooms/!abc:example.org/event/$ev%2F1"
        );
    }

    #[test]
    fn rejects_unusable_homeserver_urls() {
        let err = MatrixHttpTransport::new("not a url").err().expect("URL should be rejected");
        assert_eq!(err.code, "invalid_homeserver_url");
        let err = MatrixHttpTransport::new("mailto:admin@example.org")
            .err()
            .expect("non-hierarchical URL should be rejected");
        assert_eq!(err.category, BackendErrorCategory::Config);
    }

    #[test]
    fn limit_exceeded_maps_to_rate_limited_with_hint() {
        let err = map_error_response(
            429,
            None,
            r#"{"errcode":"M_LIMIT_EXCEEDED","error":"Too many requests","retry_after_ms":2500}"#,
        );
        assert_eq!(err.category, BackendErrorCategory::RateLimited);
        assert_eq!(err.code, "matrix_http_error");
        assert_eq!(err.retry_after_ms, Some(2_500));
        assert!(err.message.starts_with("M_LIMIT_EXCEEDED"));
    }

    #[test]
    fn retry_after_header_is_used_when_body_has_no_hint() {
        let err = map_error_response(429, Some(3_000), "");
        assert_eq!(err.category, BackendErrorCategory::RateLimited);
        assert_eq!(err.retry_after_ms, Some(3_000));
        assert_eq!(err.message, "HTTP_429");
    }

    #[test]
    fn status_drives_category_for_other_errors() {
        let err =
            map_error_response(401, None, r#"{"errcode":"M_UNKNOWN_TOKEN","error":"expired"}"#);
        assert_eq!(err.category, BackendErrorCategory::Auth);
        let err = map_error_response(403, None, r#"{"errcode":"M_FORBIDDEN"}"#);
        assert_eq!(err.category, BackendErrorCategory::Forbidden);
        let err = map_error_response(502, None, "<html>bad gateway</html>");
        assert_eq!(err.category, BackendErrorCategory::Network);
    }

    #[test]
    fn history_page_without_events_ends_pagination() {
        let page = history_page(MessagesResponse {
            chunk: Vec::new(),
            end: Some("t9".into()),
        });
        assert!(page.next_token.is_none());

        let page = history_page(MessagesResponse {
            chunk: vec![json!({"event_id": "$a"})],
            end: Some("t10".into()),
        });
        assert_eq!(page.next_token.as_deref(), Some("t10"));
    }

    #[test]
    fn parses_sync_response_sections() {
        let body: SyncResponse = serde_json::from_value(json!({
            "next_batch": "s72",
            "rooms": {
                "join": {
                    "!b:example.org": {
                        "timeline": {
                            "events": [{"event_id": "$1", "type": "m.room.message"}],
                            "prev_batch": "p1",
                            "limited": true
                        }
                    },
                    "!a:example.org": {}
                },
                "invite": {
                    "!c:example.org": {
                        "invite_state": {
                            "events": [
                                {"type": "m.room.name", "content": {"name": "Party"}},
                                {
                                    "type": "m.room.member",
                                    "sender": "@alice:example.org",
                                    "state_key": "@me:example.org",
                                    "content": {"membership": "invite"}
                                }
                            ]
                        }
                    }
                },
                "leave": { "!d:example.org": {} }
            }
        }))
        .expect("sync body should parse");

        let batch = live_batch(body);
        assert_eq!(batch.next_batch, "s72");
        assert_eq!(batch.joined.len(), 2);
        assert_eq!(batch.joined[0].room_id, "!a:example.org");
        assert!(batch.joined[0].events.is_empty());
        assert!(batch.joined[1].limited);
        assert_eq!(batch.joined[1].prev_batch.as_deref(), Some("p1"));
        assert_eq!(
            batch.invites,
            vec![InviteUpdate {
                room_id: "!c:example.org".into(),
                inviter: Some("@alice:example.org".into()),
            }]
        );
        assert_eq!(batch.left, vec!["!d:example.org".to_owned()]);
    }

    #[test]
    fn room_state_yields_summary_and_membership() {
        let state = vec![
            json!({"type": "m.room.name", "state_key": "", "content": {"name": "Lobby"}}),
            json!({"type": "m.room.topic", "state_key": "", "content": {"topic": "chat"}}),
            json!({"type": "m.room.member", "state_key": "@other:example.org",
                   "content": {"membership": "join"}}),
            json!({"type": "m.room.member", "state_key": "@me:example.org",
                   "content": {"membership": "leave"}}),
        ];
        let summary = summary_from_state("!r:example.org", &state, Some("@me:example.org"));
        assert_eq!(summary.name.as_deref(), Some("Lobby"));
        assert_eq!(summary.topic.as_deref(), Some("chat"));
        assert_eq!(summary.membership, RoomMembership::Left);

        let anonymous = summary_from_state("!r:example.org", &state, None);
        assert_eq!(anonymous.membership, RoomMembership::Joined);
    }

    #[tokio::test]
    #[ignore = "requires PIKACHAT_HOMESERVER and PIKACHAT_ACCESS_TOKEN"]
    async fn whoami_against_live_homeserver() {
        let homeserver =
            env::var("PIKACHAT_HOMESERVER").expect("PIKACHAT_HOMESERVER should be set");
        let token = env::var("PIKACHAT_ACCESS_TOKEN").expect("PIKACHAT_ACCESS_TOKEN should be set");
        let transport = MatrixHttpTransport::new(&homeserver).expect("homeserver URL should parse");
        transport.set_access_token(&token);
        let whoami = transport.whoami().await.expect("whoami should succeed");
        assert!(whoami.user_id.starts_with('@'));
    }
}
