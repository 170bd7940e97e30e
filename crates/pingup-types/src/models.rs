use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// A registered user profile. Created by the (external) registration flow;
/// this core only reads profiles and mutates the follow graph and the
/// push-delivery token.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub uid: String,
    pub name: String,
    pub username: String,
    #[serde(default)]
    pub email: String,
    /// uid -> true markers, mirroring the membership-index layout.
    #[serde(default)]
    pub following: BTreeMap<String, bool>,
    #[serde(default)]
    pub followers: BTreeMap<String, bool>,
    /// Opaque push-delivery token. Absent until the (external) permission
    /// flow registers one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_token: Option<String>,
}

/// Message content. Exactly one kind per message; media kinds carry an
/// opaque payload reference (the core never interprets it).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Payload {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        image_data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Voice {
        voice_data: String,
    },
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Payload::Text { text: text.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text { .. } => "text",
            Payload::Image { .. } => "image",
            Payload::Voice { .. } => "voice",
        }
    }

    /// Short human-readable form used for inbox previews and notification
    /// bodies when the payload is not plain text.
    pub fn preview(&self) -> String {
        match self {
            Payload::Text { text } => text.clone(),
            Payload::Image { .. } => "[Image]".to_string(),
            Payload::Voice { .. } => "[Voice Message]".to_string(),
        }
    }
}

/// One entry in a conversation's message log.
///
/// Immutable after append except for `reactions` (last-write-wins per uid),
/// `read_by` (set-once per uid) and `deleted` (soft delete marker).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub id: String,
    pub sender_id: String,
    #[serde(flatten)]
    pub payload: Payload,
    /// Sender-supplied wall clock, milliseconds. Display order is
    /// `(timestamp, id)` ascending; senders' clocks may disagree.
    pub timestamp: i64,
    /// uid -> emoji, at most one reaction per uid.
    #[serde(default)]
    pub reactions: HashMap<String, String>,
    /// uid -> first-read timestamp, never overwritten once set.
    #[serde(default)]
    pub read_by: HashMap<String, i64>,
    #[serde(default)]
    pub deleted: bool,
}

/// Denormalized copy of a conversation's newest message, kept for fast
/// inbox rendering. A derived projection, recomputed on every append —
/// never the source of truth for ordering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub sender_id: String,
    pub preview: String,
    pub timestamp: i64,
}

impl LastMessage {
    pub fn of(message: &Message) -> Self {
        Self {
            sender_id: message.sender_id.clone(),
            preview: message.payload.preview(),
            timestamp: message.timestamp,
        }
    }
}

/// A user's presence snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub online: bool,
    pub last_seen: Option<i64>,
}

/// An edge-triggered presence change, emitted only when the online flag
/// actually flips (never re-fired on snapshot redelivery).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceTransition {
    pub uid: String,
    pub online: bool,
    pub at: i64,
}

/// One row of a user's inbox: the other participant plus the conversation's
/// last-activity summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub other: User,
    pub preview: Option<String>,
    pub timestamp: Option<i64>,
}
