//! Wire event → canonical [`Message`] mapping.
//!
//! Raw events are decoded once into typed envelopes. An event whose envelope
//! cannot be decoded is not displayable; an event of a displayable type whose
//! content cannot be decoded becomes a placeholder message.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::types::{MediaRef, Message, MessageKind, Reaction};

/// Result of normalizing one wire event.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Message(Message),
    /// Annotation to merge into the target message.
    Reaction { target_id: String, reaction: Reaction },
    /// Dropped: not displayable or malformed.
    Hidden(HiddenReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenReason {
    /// Event type outside the allow-list.
    NotDisplayable,
    /// Envelope could not be decoded.
    Malformed,
    /// Edit of another message.
    Replacement,
}

/// Normalized output of a batch of wire events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub messages: Vec<Message>,
    pub reactions: Vec<(String, Reaction)>,
    pub hidden: usize,
    pub malformed: usize,
}

impl NormalizedBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.reactions.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct WireEnvelope {
    #[serde(alias = "eventId")]
    event_id: String,
    #[serde(alias = "senderId")]
    sender: String,
    #[serde(rename = "type", alias = "eventType")]
    event_type: String,
    #[serde(default, alias = "ts", alias = "timestamp")]
    origin_server_ts: u64,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    state_key: Option<String>,
    #[serde(default, alias = "senderName")]
    sender_display_name: Option<String>,
    // Flat legacy shape carries body/msgtype next to the envelope.
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    msgtype: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageContent {
    #[serde(default)]
    msgtype: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    info: Option<MediaInfo>,
    #[serde(default, rename = "m.relates_to")]
    relates_to: Option<RelatesTo>,
    #[serde(default, rename = "m.new_content")]
    new_content: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct MediaInfo {
    #[serde(default)]
    mimetype: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RelatesTo {
    #[serde(default)]
    rel_type: Option<String>,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default, rename = "m.in_reply_to")]
    in_reply_to: Option<InReplyTo>,
}

#[derive(Debug, Deserialize)]
struct InReplyTo {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct MemberContent {
    membership: String,
    #[serde(default)]
    displayname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NameContent {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TopicContent {
    #[serde(default)]
    topic: Option<String>,
}

/// Pure mapping from wire events to canonical records.
#[derive(Debug, Clone, Default)]
pub struct EventNormalizer {
    own_user_id: Option<String>,
}

impl EventNormalizer {
    pub fn new(own_user_id: Option<String>) -> Self {
        Self { own_user_id }
    }

    pub fn own_user_id(&self) -> Option<&str> {
        self.own_user_id.as_deref()
    }

    /// Normalize a batch, skipping hidden and malformed events.
    pub fn normalize_batch(&self, room_id: &str, events: &[Value]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for raw in events {
            match self.normalize(room_id, raw) {
                Normalized::Message(message) => batch.messages.push(message),
                Normalized::Reaction {
                    target_id,
                    reaction,
                } => batch.reactions.push((target_id, reaction)),
                Normalized::Hidden(HiddenReason::Malformed) => batch.malformed += 1,
                Normalized::Hidden(_) => batch.hidden += 1,
            }
        }
        batch
    }

    pub fn normalize(&self, room_id: &str, raw: &Value) -> Normalized {
        let envelope = match WireEnvelope::deserialize(raw) {
            Ok(envelope) => envelope,
            Err(_) => return Normalized::Hidden(HiddenReason::Malformed),
        };

        let content = if envelope.content.is_null() {
            flat_content(&envelope)
        } else {
            envelope.content.clone()
        };

        let base = Message {
            id: envelope.event_id.clone(),
            room_id: room_id.to_owned(),
            sender_id: envelope.sender.clone(),
            sender_display_name: envelope.sender_display_name.clone(),
            body: String::new(),
            kind: MessageKind::Placeholder,
            timestamp_ms: envelope.origin_server_ts,
            is_from_self: self.own_user_id.as_deref() == Some(envelope.sender.as_str()),
            reply_to_id: None,
            reactions: Vec::new(),
            media: None,
            raw_payload: Some(Arc::new(raw.clone())),
        };

        let decoded = match envelope.event_type.as_str() {
            "m.room.message" => decode_room_message(base.clone(), &content),
            "m.sticker" => decode_sticker(base.clone(), &content),
            "m.room.encrypted" => Some(Normalized::Message(Message {
                body: "Encrypted message".to_owned(),
                kind: MessageKind::Encrypted,
                ..base.clone()
            })),
            "m.reaction" => return decode_reaction(&envelope, &content),
            "m.room.member" => decode_membership(base.clone(), &envelope, &content),
            "m.room.name" => decode_room_name(base.clone(), &content),
            "m.room.topic" => decode_room_topic(base.clone(), &content),
            _ => return Normalized::Hidden(HiddenReason::NotDisplayable),
        };

        decoded.unwrap_or_else(|| {
            Normalized::Message(Message {
                body: "Unsupported message".to_owned(),
                ..base
            })
        })
    }
}

fn flat_content(envelope: &WireEnvelope) -> Value {
    let mut content = serde_json::Map::new();
    if let Some(body) = &envelope.body {
        content.insert("body".to_owned(), Value::String(body.clone()));
    }
    if let Some(msgtype) = &envelope.msgtype {
        content.insert("msgtype".to_owned(), Value::String(msgtype.clone()));
    }
    Value::Object(content)
}

fn decode_room_message(base: Message, content: &Value) -> Option<Normalized> {
    let content = MessageContent::deserialize(content).ok()?;

    if content.new_content.is_some()
        || content
            .relates_to
            .as_ref()
            .and_then(|rel| rel.rel_type.as_deref())
            == Some("m.replace")
    {
        return Some(Normalized::Hidden(HiddenReason::Replacement));
    }

    let (kind, fallback) = match content.msgtype.as_deref() {
        Some("m.notice") => (MessageKind::Notice, "Notice"),
        Some("m.emote") => (MessageKind::Emote, "Emote"),
        Some("m.image") => (MessageKind::Image, "Image"),
        Some("m.file") => (MessageKind::File, "File"),
        Some("m.audio") => (MessageKind::Audio, "Audio"),
        Some("m.video") => (MessageKind::Video, "Video"),
        _ => (MessageKind::Text, "Message"),
    };

    let media = if kind.carries_media() {
        media_ref(content.url.as_deref(), content.info.as_ref())
    } else {
        None
    };
    let reply_to_id = content
        .relates_to
        .and_then(|rel| rel.in_reply_to)
        .map(|reply| reply.event_id);

    Some(Normalized::Message(Message {
        body: non_empty(content.body).unwrap_or_else(|| fallback.to_owned()),
        kind,
        reply_to_id,
        media,
        ..base
    }))
}

fn decode_sticker(base: Message, content: &Value) -> Option<Normalized> {
    let content = MessageContent::deserialize(content).ok()?;
    let media = media_ref(content.url.as_deref(), content.info.as_ref());
    Some(Normalized::Message(Message {
        body: non_empty(content.body).unwrap_or_else(|| "Sticker".to_owned()),
        kind: MessageKind::Sticker,
        media,
        ..base
    }))
}

fn decode_reaction(envelope: &WireEnvelope, content: &Value) -> Normalized {
    let Some(relation) = MessageContent::deserialize(content)
        .ok()
        .and_then(|content| content.relates_to)
    else {
        return Normalized::Hidden(HiddenReason::Malformed);
    };
    if relation.rel_type.as_deref() != Some("m.annotation") {
        return Normalized::Hidden(HiddenReason::NotDisplayable);
    }
    let (Some(target_id), Some(key)) = (relation.event_id, relation.key) else {
        return Normalized::Hidden(HiddenReason::Malformed);
    };

    Normalized::Reaction {
        target_id,
        reaction: Reaction {
            key,
            sender_id: envelope.sender.clone(),
            timestamp_ms: envelope.origin_server_ts,
        },
    }
}

fn decode_membership(
    base: Message,
    envelope: &WireEnvelope,
    content: &Value,
) -> Option<Normalized> {
    let content = MemberContent::deserialize(content).ok()?;
    let target = envelope
        .state_key
        .clone()
        .unwrap_or_else(|| envelope.sender.clone());
    let target_name = content.displayname.clone().unwrap_or_else(|| target.clone());
    let sender_name = base
        .sender_display_name
        .clone()
        .unwrap_or_else(|| base.sender_id.clone());

    let body = match content.membership.as_str() {
        "join" => format!("{target_name} joined the room"),
        "leave" if target == envelope.sender => format!("{target_name} left the room"),
        "leave" => format!("{sender_name} removed {target_name}"),
        "invite" => format!("{sender_name} invited {target_name}"),
        _ => return Some(Normalized::Hidden(HiddenReason::NotDisplayable)),
    };

    Some(Normalized::Message(Message {
        body,
        kind: MessageKind::Membership,
        ..base
    }))
}

fn decode_room_name(base: Message, content: &Value) -> Option<Normalized> {
    let content = NameContent::deserialize(content).ok()?;
    let body = match non_empty(content.name) {
        Some(name) => format!("Room name changed to {name}"),
        None => "Room name removed".to_owned(),
    };
    Some(Normalized::Message(Message {
        body,
        kind: MessageKind::RoomName,
        ..base
    }))
}

fn decode_room_topic(base: Message, content: &Value) -> Option<Normalized> {
    let content = TopicContent::deserialize(content).ok()?;
    let body = match non_empty(content.topic) {
        Some(topic) => format!("Topic changed to {topic}"),
        None => "Topic removed".to_owned(),
    };
    Some(Normalized::Message(Message {
        body,
        kind: MessageKind::RoomTopic,
        ..base
    }))
}

fn media_ref(url: Option<&str>, info: Option<&MediaInfo>) -> Option<MediaRef> {
    let uri = url.filter(|url| !url.is_empty())?;
    Some(MediaRef {
        uri: uri.to_owned(),
        mimetype: info.and_then(|info| info.mimetype.clone()),
        size: info.and_then(|info| info.size),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
