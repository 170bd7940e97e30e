use serde::{Deserialize, Serialize};

use crate::models::{ConversationSummary, Message};

/// Commands sent FROM client TO server over the gateway WebSocket.
///
/// The session's own uid is bound at connect time; conversation-scoped
/// commands apply to the currently opened conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Select (and lazily create) the conversation with another user.
    /// Replaces any previously opened conversation's subscriptions.
    Open { other_uid: String },

    /// Send a plain text message to the open conversation.
    SendText { text: String },

    /// Send an image payload reference.
    SendImage {
        data: String,
        #[serde(default)]
        name: Option<String>,
    },

    /// Send a voice clip payload reference.
    SendVoice { data: String },

    /// Keystroke signal; keeps the typing flag alive for another window.
    Typing,

    /// Set (last-write-wins) this user's reaction on a message.
    React { message_id: String, emoji: String },

    /// Record a first-read receipt for a message.
    MarkRead { message_id: String },

    /// Soft-delete one of this user's own messages.
    Delete { message_id: String },

    /// Follow or unfollow another user.
    ToggleFollow { other_uid: String },
}

/// Events sent FROM server TO client over the gateway WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Connection accepted; presence is armed.
    Ready { uid: String },

    /// Full recency-ordered inbox, re-emitted on every change.
    Inbox {
        conversations: Vec<ConversationSummary>,
    },

    /// Full ordered visible message log of the open conversation,
    /// re-emitted on every change.
    Conversation {
        conversation_id: String,
        messages: Vec<Message>,
    },

    /// The open conversation's peer started or stopped typing.
    Typing {
        conversation_id: String,
        typing: bool,
    },

    /// Presence snapshot of the open conversation's peer.
    Presence {
        uid: String,
        online: bool,
        last_seen: Option<i64>,
    },

    /// Edge-triggered "user came online / went offline" alert.
    PresenceAlert { uid: String, online: bool },

    /// Follow toggled; reports the new state.
    FollowState { other_uid: String, following: bool },

    /// A command failed. The client keeps its input intact and may retry.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format() {
        let cmd: GatewayCommand =
            serde_json::from_str(r#"{"type":"Open","data":{"other_uid":"u2"}}"#).unwrap();
        match cmd {
            GatewayCommand::Open { other_uid } => assert_eq!(other_uid, "u2"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn event_wire_format() {
        let event = GatewayEvent::PresenceAlert {
            uid: "u1".into(),
            online: true,
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "PresenceAlert");
        assert_eq!(v["data"]["online"], true);
    }
}
