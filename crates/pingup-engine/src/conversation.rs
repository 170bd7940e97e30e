//! Per-conversation message log: append, ordered read, point mutations.
//!
//! Appends write the message and the denormalized lastMessage summary in
//! one atomic update. Ordering is resolved at read time by `(timestamp,
//! id)` ascending; no global order is assumed at append time, so
//! concurrent appends from both peers are safe.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use pingup_store::{Store, Subscription};
use pingup_types::models::{LastMessage, Message, Payload};
use pingup_types::now_ms;

use crate::error::EngineError;
use crate::push_id::PushIdGenerator;

/// Transient store failures on append retry this many times before the
/// error surfaces to the sender.
const APPEND_ATTEMPTS: u32 = 3;
const APPEND_BACKOFF: Duration = Duration::from_millis(100);

/// Canonical id for the unordered pair: both peers compute the same id
/// independently, so exactly one conversation exists per pair.
pub fn conversation_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}_{hi}")
}

/// The non-`uid` participant encoded in a conversation id, or `None` when
/// `uid` is not a participant.
pub fn other_participant<'a>(conversation_id: &'a str, uid: &str) -> Option<&'a str> {
    conversation_id
        .strip_prefix(uid)
        .and_then(|rest| rest.strip_prefix('_'))
        .or_else(|| {
            conversation_id
                .strip_suffix(uid)
                .and_then(|rest| rest.strip_suffix('_'))
        })
        .filter(|other| !other.is_empty())
}

pub fn messages_path(conversation_id: &str) -> String {
    format!("chats/{conversation_id}/messages")
}

pub fn message_path(conversation_id: &str, message_id: &str) -> String {
    format!("chats/{conversation_id}/messages/{message_id}")
}

pub fn last_message_path(conversation_id: &str) -> String {
    format!("chats/{conversation_id}/lastMessage")
}

/// The display view: soft-deleted entries removed. The raw log (callers
/// like read-receipt scanning need deleted entries too) stays untouched.
pub fn visible_messages(all: &[Message]) -> Vec<Message> {
    all.iter().filter(|m| !m.deleted).cloned().collect()
}

pub struct ConversationStore {
    store: Store,
    ids: PushIdGenerator,
}

impl ConversationStore {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            ids: PushIdGenerator::new(),
        }
    }

    /// Append a message stamped with the current wall clock.
    pub async fn append(
        &self,
        conversation_id: &str,
        sender_id: &str,
        payload: Payload,
    ) -> Result<Message, EngineError> {
        self.append_at(conversation_id, sender_id, payload, None).await
    }

    /// Append with a sender-supplied timestamp (milliseconds); `None`
    /// stamps the current time.
    pub async fn append_at(
        &self,
        conversation_id: &str,
        sender_id: &str,
        payload: Payload,
        timestamp: Option<i64>,
    ) -> Result<Message, EngineError> {
        let payload = normalize_payload(payload)?;
        let timestamp = timestamp.unwrap_or_else(now_ms);
        let id = self.ids.next_id(now_ms());
        let message = Message {
            id: id.clone(),
            sender_id: sender_id.to_string(),
            payload,
            timestamp,
            reactions: HashMap::new(),
            read_by: HashMap::new(),
            deleted: false,
        };

        let updates = vec![
            (
                message_path(conversation_id, &id),
                serde_json::to_value(&message)?,
            ),
            (
                last_message_path(conversation_id),
                serde_json::to_value(LastMessage::of(&message))?,
            ),
        ];

        let mut delay = APPEND_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.store.update(updates.clone()) {
                Ok(()) => break,
                Err(e) if attempt < APPEND_ATTEMPTS => {
                    warn!(conversation_id, attempt, "append failed, retrying: {e}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        debug!(conversation_id, message_id = %id, "message appended");
        Ok(message)
    }

    /// Current raw log, ordered `(timestamp, id)` ascending, soft-deleted
    /// entries included.
    pub fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, EngineError> {
        Ok(parse_messages(
            self.store.read(&messages_path(conversation_id))?,
        ))
    }

    /// Ordered raw stream: the full current list on subscribe, then on
    /// every change. Restartable — re-subscribing replays current state.
    pub fn subscribe(&self, conversation_id: &str) -> Result<MessageStream, EngineError> {
        Ok(MessageStream {
            sub: self.store.subscribe(&messages_path(conversation_id))?,
        })
    }

    /// Last-write-wins reaction for `uid`. A missing message is a no-op
    /// (concurrent deletion is possible).
    pub fn react(
        &self,
        conversation_id: &str,
        message_id: &str,
        uid: &str,
        emoji: &str,
    ) -> Result<(), EngineError> {
        let base = message_path(conversation_id, message_id);
        if self.store.read(&base)?.is_null() {
            debug!(conversation_id, message_id, "react on missing message ignored");
            return Ok(());
        }
        self.store.write(&format!("{base}/reactions/{uid}"), json!(emoji))?;
        Ok(())
    }

    /// Set-once read receipt; the first-read timestamp is never
    /// overwritten. Returns whether a receipt was recorded.
    pub fn mark_read(
        &self,
        conversation_id: &str,
        message_id: &str,
        uid: &str,
    ) -> Result<bool, EngineError> {
        let base = message_path(conversation_id, message_id);
        if self.store.read(&base)?.is_null() {
            debug!(conversation_id, message_id, "mark_read on missing message ignored");
            return Ok(false);
        }
        Ok(self
            .store
            .write_if_absent(&format!("{base}/readBy/{uid}"), json!(now_ms()))?)
    }

    /// Soft delete: the entry disappears from the visible view but stays
    /// in the raw log. Only the sender may delete; a missing message is a
    /// no-op.
    pub fn soft_delete(
        &self,
        conversation_id: &str,
        message_id: &str,
        requester_uid: &str,
    ) -> Result<(), EngineError> {
        let base = message_path(conversation_id, message_id);
        let raw = self.store.read(&base)?;
        if raw.is_null() {
            debug!(conversation_id, message_id, "soft_delete on missing message ignored");
            return Ok(());
        }
        let message: Message = serde_json::from_value(raw)?;
        if message.sender_id != requester_uid {
            return Err(EngineError::Unauthorized(format!(
                "{requester_uid} is not the sender of {message_id}"
            )));
        }
        self.store.write(&format!("{base}/deleted"), json!(true))?;
        Ok(())
    }
}

pub struct MessageStream {
    sub: Subscription,
}

impl MessageStream {
    pub async fn recv(&mut self) -> Option<Vec<Message>> {
        Some(parse_messages(self.sub.recv().await?))
    }
}

fn parse_messages(value: Value) -> Vec<Message> {
    let Value::Object(map) = value else {
        return Vec::new();
    };
    let mut messages: Vec<Message> = map
        .into_iter()
        .filter_map(|(id, raw)| match serde_json::from_value::<Message>(raw) {
            Ok(mut message) => {
                message.id = id;
                Some(message)
            }
            Err(e) => {
                warn!(message_id = %id, "skipping undecodable message: {e}");
                None
            }
        })
        .collect();
    messages.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.id.cmp(&b.id))
    });
    messages
}

fn normalize_payload(payload: Payload) -> Result<Payload, EngineError> {
    match payload {
        Payload::Text { text } => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Err(EngineError::InvalidPayload("empty text"));
            }
            Ok(Payload::Text {
                text: trimmed.to_string(),
            })
        }
        Payload::Image { image_data, .. } if image_data.is_empty() => {
            Err(EngineError::InvalidPayload("empty image payload"))
        }
        Payload::Voice { voice_data } if voice_data.is_empty() => {
            Err(EngineError::InvalidPayload("empty voice payload"))
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Store, ConversationStore) {
        let store = Store::open_in_memory().unwrap();
        (store.clone(), ConversationStore::new(store))
    }

    #[test]
    fn conversation_id_is_symmetric() {
        assert_eq!(conversation_id("u1", "u2"), conversation_id("u2", "u1"));
        assert_eq!(conversation_id("u1", "u2"), "u1_u2");
        assert_eq!(conversation_id("b", "a"), "a_b");
    }

    #[test]
    fn other_participant_handles_underscored_uids() {
        assert_eq!(other_participant("u1_u2", "u1"), Some("u2"));
        assert_eq!(other_participant("u1_u2", "u2"), Some("u1"));
        assert_eq!(other_participant("a_b_c", "a"), Some("b_c"));
        assert_eq!(other_participant("a_b_c", "b_c"), Some("a"));
        assert_eq!(other_participant("u1_u2", "u3"), None);
    }

    #[tokio::test]
    async fn ordered_by_timestamp_then_id() {
        let (_, conv) = setup();
        let cid = conversation_id("u1", "u2");
        conv.append_at(&cid, "u1", Payload::text("third"), Some(300))
            .await
            .unwrap();
        conv.append_at(&cid, "u2", Payload::text("first"), Some(100))
            .await
            .unwrap();
        conv.append_at(&cid, "u1", Payload::text("second"), Some(200))
            .await
            .unwrap();

        let texts: Vec<String> = conv
            .messages(&cid)
            .unwrap()
            .into_iter()
            .map(|m| m.payload.preview())
            .collect();
        assert_eq!(texts, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn equal_timestamps_tie_break_on_id() {
        let (_, conv) = setup();
        let cid = conversation_id("u1", "u2");
        let a = conv
            .append_at(&cid, "u1", Payload::text("a"), Some(500))
            .await
            .unwrap();
        let b = conv
            .append_at(&cid, "u2", Payload::text("b"), Some(500))
            .await
            .unwrap();
        assert!(a.id < b.id);
        let ids: Vec<String> = conv
            .messages(&cid)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, [a.id, b.id]);
    }

    #[tokio::test]
    async fn append_rejects_blank_text() {
        let (store, conv) = setup();
        let cid = conversation_id("u1", "u2");
        let err = conv.append(&cid, "u1", Payload::text("   ")).await;
        assert!(matches!(err, Err(EngineError::InvalidPayload(_))));
        // Nothing written, including the lastMessage summary
        assert!(store.read(&last_message_path(&cid)).unwrap().is_null());
    }

    #[tokio::test]
    async fn append_updates_last_message_summary() {
        let (store, conv) = setup();
        let cid = conversation_id("u1", "u2");
        conv.append(&cid, "u1", Payload::text("hi")).await.unwrap();
        conv.append(
            &cid,
            "u2",
            Payload::Image {
                image_data: "ref:1".into(),
                image_name: None,
            },
        )
        .await
        .unwrap();

        let last = store.read(&last_message_path(&cid)).unwrap();
        assert_eq!(last["preview"], "[Image]");
        assert_eq!(last["senderId"], "u2");
    }

    #[tokio::test]
    async fn reactions_are_last_write_wins_per_uid() {
        let (_, conv) = setup();
        let cid = conversation_id("u1", "u2");
        let msg = conv.append(&cid, "u1", Payload::text("hi")).await.unwrap();

        conv.react(&cid, &msg.id, "u2", "❤️").unwrap();
        conv.react(&cid, &msg.id, "u2", "👍").unwrap();
        conv.react(&cid, &msg.id, "u1", "😂").unwrap();

        let stored = &conv.messages(&cid).unwrap()[0];
        assert_eq!(stored.reactions["u2"], "👍");
        assert_eq!(stored.reactions["u1"], "😂");
    }

    #[tokio::test]
    async fn react_on_missing_message_is_noop() {
        let (store, conv) = setup();
        let cid = conversation_id("u1", "u2");
        conv.react(&cid, "nope", "u2", "👍").unwrap();
        assert!(store.read(&messages_path(&cid)).unwrap().is_null());
    }

    #[tokio::test]
    async fn mark_read_preserves_first_read_time() {
        let (_, conv) = setup();
        let cid = conversation_id("u1", "u2");
        let msg = conv.append(&cid, "u1", Payload::text("hi")).await.unwrap();

        assert!(conv.mark_read(&cid, &msg.id, "u2").unwrap());
        let first = conv.messages(&cid).unwrap()[0].read_by["u2"];
        assert!(!conv.mark_read(&cid, &msg.id, "u2").unwrap());
        assert_eq!(conv.messages(&cid).unwrap()[0].read_by["u2"], first);
    }

    #[tokio::test]
    async fn soft_delete_hides_but_retains() {
        let (_, conv) = setup();
        let cid = conversation_id("u1", "u2");
        let msg = conv.append(&cid, "u1", Payload::text("oops")).await.unwrap();
        conv.append(&cid, "u2", Payload::text("keep")).await.unwrap();

        conv.soft_delete(&cid, &msg.id, "u1").unwrap();

        let raw = conv.messages(&cid).unwrap();
        assert_eq!(raw.len(), 2);
        assert!(raw.iter().any(|m| m.id == msg.id && m.deleted));

        let visible = visible_messages(&raw);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].payload.preview(), "keep");
    }

    #[tokio::test]
    async fn soft_delete_rejects_non_sender() {
        let (_, conv) = setup();
        let cid = conversation_id("u1", "u2");
        let msg = conv.append(&cid, "u1", Payload::text("mine")).await.unwrap();
        assert!(matches!(
            conv.soft_delete(&cid, &msg.id, "u2"),
            Err(EngineError::Unauthorized(_))
        ));
        assert!(!conv.messages(&cid).unwrap()[0].deleted);
    }

    #[tokio::test]
    async fn stream_replays_then_follows() {
        let (_, conv) = setup();
        let cid = conversation_id("u1", "u2");
        conv.append(&cid, "u1", Payload::text("hi")).await.unwrap();

        let mut stream = conv.subscribe(&cid).unwrap();
        assert_eq!(stream.recv().await.unwrap().len(), 1);

        conv.append(&cid, "u2", Payload::text("hello")).await.unwrap();
        let latest = stream.recv().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[1].payload.preview(), "hello");
    }
}
