use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Lifecycle of the process-wide sync loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SyncLifecycleState {
    /// No subscriber has asked for sync yet.
    Idle,
    /// A subscriber arrived and the loop is being (re)started.
    Starting,
    /// A sync cycle is currently running.
    Syncing,
    /// Last cycle succeeded; the next one is scheduled after the idle interval.
    Scheduled,
    /// Last cycle failed; the next one is scheduled after a backoff delay.
    RetryBackoff,
    /// Loop was torn down, either explicitly or because nobody is subscribed.
    Stopped,
}

/// Membership of the local user in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum RoomMembership {
    Joined,
    Invited,
    Left,
    Banned,
    /// Membership has not been observed yet.
    #[default]
    Unknown,
}

impl RoomMembership {
    /// Parse a Matrix `membership` string.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "join" => Self::Joined,
            "invite" => Self::Invited,
            "leave" => Self::Left,
            "ban" => Self::Banned,
            _ => Self::Unknown,
        }
    }

    /// Whether history pagination is allowed for this membership.
    ///
    /// Unknown membership is attempted; the backend decides.
    pub fn can_paginate(self) -> bool {
        matches!(self, Self::Joined | Self::Unknown)
    }
}

/// Matrix message type used when sending room messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum MessageType {
    /// Standard text message (`m.text`).
    #[default]
    Text,
    /// Notice message (`m.notice`), usually non-intrusive/system-like.
    Notice,
    /// Emote message (`m.emote`).
    Emote,
}

impl MessageType {
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Text => "m.text",
            Self::Notice => "m.notice",
            Self::Emote => "m.emote",
        }
    }
}

/// Display classification of a canonical message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Notice,
    Emote,
    Image,
    File,
    Audio,
    Video,
    Sticker,
    Encrypted,
    Membership,
    RoomName,
    RoomTopic,
    /// The event could not be decoded; body is a generic placeholder.
    Placeholder,
}

impl MessageKind {
    /// Whether messages of this kind reference downloadable media.
    pub fn carries_media(self) -> bool {
        matches!(
            self,
            Self::Image | Self::File | Self::Audio | Self::Video | Self::Sticker
        )
    }
}

/// Media reference carried by image/file/audio/video/sticker messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRef {
    /// `mxc://` content URI.
    pub uri: String,
    /// MIME type when advertised by the sender.
    pub mimetype: Option<String>,
    /// Size in bytes when advertised by the sender.
    pub size: Option<u64>,
}

/// One annotation of a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reaction {
    /// Reaction key, usually an emoji.
    pub key: String,
    pub sender_id: String,
    pub timestamp_ms: u64,
}

/// Canonical, deduplicated timeline message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Backend event id; stable across loads of the same event.
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_display_name: Option<String>,
    /// Display-ready body, synthesized for non-text kinds.
    pub body: String,
    pub kind: MessageKind,
    /// Origin server timestamp in milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    pub is_from_self: bool,
    /// Weak link to the replied-to event; lookup only.
    pub reply_to_id: Option<String>,
    /// Reactions, unique per `(key, sender_id)`, kept sorted.
    pub reactions: Vec<Reaction>,
    pub media: Option<MediaRef>,
    /// Decoded wire event kept for re-derivation. Never persisted.
    #[serde(skip)]
    pub raw_payload: Option<Arc<serde_json::Value>>,
}

impl Message {
    /// Ordering key used by every timeline.
    pub fn sort_key(&self) -> (u64, &str) {
        (self.timestamp_ms, self.id.as_str())
    }

    /// Add a reaction unless the same sender already reacted with the same key.
    ///
    /// Returns `true` when the reaction set changed.
    pub fn add_reaction(&mut self, reaction: Reaction) -> bool {
        let duplicate = self
            .reactions
            .iter()
            .any(|r| r.key == reaction.key && r.sender_id == reaction.sender_id);
        if duplicate {
            return false;
        }
        let idx = self.reactions.partition_point(|r| r < &reaction);
        self.reactions.insert(idx, reaction);
        true
    }

    /// Copy without the raw payload, suitable for durable storage.
    pub fn without_raw(&self) -> Self {
        Self {
            raw_payload: None,
            ..self.clone()
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.room_id == other.room_id
            && self.sender_id == other.sender_id
            && self.sender_display_name == other.sender_display_name
            && self.body == other.body
            && self.kind == other.kind
            && self.timestamp_ms == other.timestamp_ms
            && self.is_from_self == other.is_from_self
            && self.reply_to_id == other.reply_to_id
            && self.reactions == other.reactions
            && self.media == other.media
    }
}

/// Lightweight conversation metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomSummary {
    pub room_id: String,
    /// Best-effort display name for the room.
    pub name: Option<String>,
    pub topic: Option<String>,
    pub membership: RoomMembership,
    /// Whether the room is considered a direct message room.
    pub is_direct: bool,
}

impl RoomSummary {
    pub fn new(room_id: impl Into<String>, membership: RoomMembership) -> Self {
        Self {
            room_id: room_id.into(),
            name: None,
            topic: None,
            membership,
            is_direct: false,
        }
    }
}

/// Cached record for a media reference seen in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRecord {
    pub uri: String,
    /// Event that referenced the media.
    pub event_id: String,
    pub mimetype: Option<String>,
    pub size: Option<u64>,
}

/// Options accepted by message loads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadOptions {
    /// Fill target; strategies stop once this many messages are known.
    pub limit: usize,
    /// Bypass the cache read and rebuild the cached timeline.
    pub force_refresh: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            limit: 50,
            force_refresh: false,
        }
    }
}

/// Options accepted by `subscribe`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Make this conversation the prioritized one.
    pub prioritize: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { prioritize: true }
    }
}

/// Outgoing message content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingContent {
    pub body: String,
    pub msgtype: MessageType,
}

impl OutgoingContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            msgtype: MessageType::Text,
        }
    }
}

/// Persisted credential record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialBundle {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user_id: String,
    pub device_id: String,
    /// Access token expiry in milliseconds since Unix epoch, if it expires.
    pub expires_at_ms: Option<u64>,
}

/// Sync loop status updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncStatus {
    /// Whether the sync loop is currently running.
    pub running: bool,
    /// Delay until the next scheduled cycle.
    pub lag_hint_ms: Option<u64>,
}

/// Notifications pushed to the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SyncEvent {
    /// Coordinator lifecycle transition.
    StateChanged { state: SyncLifecycleState },
    /// Sync loop status update.
    SyncStatus(SyncStatus),
    Subscribed { room_id: String },
    Unsubscribed { room_id: String },
    /// Full sorted timeline for a conversation after a merge.
    TimelineUpdated {
        room_id: String,
        messages: Vec<Message>,
    },
    /// Non-fatal failure while syncing; `room_id` is `None` for loop-wide errors.
    SyncError {
        room_id: Option<String>,
        error: BackendError,
    },
    RoomInvite {
        room_id: String,
        inviter: Option<String>,
    },
    /// Refresh attempts are exhausted; the user must re-authenticate.
    CredentialExpired {
        user_id: Option<String>,
        error_code: String,
    },
}
