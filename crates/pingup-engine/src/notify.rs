//! Out-of-band push dispatch for recipients not actively viewing the
//! conversation.
//!
//! Strictly a best-effort side channel: by the time dispatch runs the
//! append already succeeded, so transport failures (and absent delivery
//! addresses) are logged and swallowed, never rolled back or surfaced.

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use pingup_store::Store;
use pingup_types::models::{Message, Payload};

use crate::error::EngineError;

fn token_path(uid: &str) -> String {
    format!("users/{uid}/notifyToken")
}

#[derive(Debug, Error)]
#[error("push transport: {0}")]
pub struct TransportError(pub String);

/// External push-transport collaborator. Implementations deliver one
/// notification event to one opaque address; failure is non-fatal.
pub trait PushTransport: Send + Sync {
    fn send(
        &self,
        address: &str,
        notification: &Notification,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A notification event: title, body, and the routing metadata a client
/// needs to open the right conversation.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub chat_id: String,
    pub sender_id: String,
    pub message_type: String,
}

impl Notification {
    pub fn for_message(conversation_id: &str, message: &Message, sender_name: &str) -> Self {
        let body = match &message.payload {
            Payload::Text { text } => text.clone(),
            Payload::Image { .. } => "📷 Image".to_string(),
            Payload::Voice { .. } => "🎵 Voice message".to_string(),
        };
        Self {
            title: format!("New message from {sender_name}"),
            body,
            chat_id: conversation_id.to_string(),
            sender_id: message.sender_id.clone(),
            message_type: message.payload.kind().to_string(),
        }
    }
}

pub struct NotificationDispatcher<T: PushTransport> {
    store: Store,
    transport: T,
}

impl<T: PushTransport> NotificationDispatcher<T> {
    pub fn new(store: Store, transport: T) -> Self {
        Self { store, transport }
    }

    /// Persist a delivery address. Written by the (external)
    /// registration/permission flow.
    pub fn set_token(&self, uid: &str, token: &str) -> Result<(), EngineError> {
        self.store.write(&token_path(uid), json!(token))?;
        Ok(())
    }

    pub fn token(&self, uid: &str) -> Result<Option<String>, EngineError> {
        Ok(self
            .store
            .read(&token_path(uid))?
            .as_str()
            .map(str::to_string))
    }

    /// Decide and perform dispatch for a freshly appended message. An
    /// unregistered recipient simply receives no push; never an error.
    pub async fn on_message_appended(
        &self,
        conversation_id: &str,
        message: &Message,
        recipient_uid: &str,
        sender_name: &str,
    ) {
        let token = match self.token(recipient_uid) {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!(recipient_uid, "no delivery address on file, skipping push");
                return;
            }
            Err(e) => {
                warn!(recipient_uid, "token lookup failed, skipping push: {e}");
                return;
            }
        };
        let notification = Notification::for_message(conversation_id, message, sender_name);
        if let Err(e) = self.transport.send(&token, &notification).await {
            warn!(recipient_uid, "push delivery failed (message already durable): {e}");
        }
    }
}

/// ntfy-style HTTP push: POST to `<base>/<address>` with the body as the
/// notification text and metadata in headers.
pub struct NtfyTransport {
    client: reqwest::Client,
    base_url: String,
}

impl NtfyTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl PushTransport for NtfyTransport {
    async fn send(&self, address: &str, notification: &Notification) -> Result<(), TransportError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), address);
        let response = self
            .client
            .post(&url)
            .header("Title", notification.title.as_str())
            .header("Priority", "default")
            .header("Tags", "speech_balloon")
            .header("X-Chat-Id", notification.chat_id.as_str())
            .header("X-Sender-Id", notification.sender_id.as_str())
            .header("X-Message-Type", notification.message_type.as_str())
            .body(notification.body.clone())
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError(format!("status {}", response.status())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<(String, Notification)>>>,
        fail: bool,
    }

    impl PushTransport for RecordingTransport {
        async fn send(
            &self,
            address: &str,
            notification: &Notification,
        ) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError("unreachable".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((address.to_string(), notification.clone()));
            Ok(())
        }
    }

    fn message(payload: Payload) -> Message {
        Message {
            id: "m1".into(),
            sender_id: "u1".into(),
            payload,
            timestamp: 1,
            reactions: HashMap::new(),
            read_by: HashMap::new(),
            deleted: false,
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_recipient() {
        let store = Store::open_in_memory().unwrap();
        let transport = RecordingTransport::default();
        let dispatcher = NotificationDispatcher::new(store, transport.clone());
        dispatcher.set_token("u2", "tok-u2").unwrap();

        let msg = message(Payload::text("hi"));
        dispatcher.on_message_appended("u1_u2", &msg, "u2", "Alice").await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (address, note) = &sent[0];
        assert_eq!(address, "tok-u2");
        assert_eq!(note.title, "New message from Alice");
        assert_eq!(note.body, "hi");
        assert_eq!(note.message_type, "text");
        assert_eq!(note.chat_id, "u1_u2");
    }

    #[tokio::test]
    async fn missing_token_is_a_silent_noop() {
        let store = Store::open_in_memory().unwrap();
        let transport = RecordingTransport::default();
        let dispatcher = NotificationDispatcher::new(store, transport.clone());

        let msg = message(Payload::text("hi"));
        dispatcher.on_message_appended("u1_u2", &msg, "u2", "Alice").await;
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_swallowed() {
        let store = Store::open_in_memory().unwrap();
        let transport = RecordingTransport {
            fail: true,
            ..Default::default()
        };
        let dispatcher = NotificationDispatcher::new(store, transport);
        dispatcher.set_token("u2", "tok").unwrap();
        // Must not panic or surface the failure
        dispatcher
            .on_message_appended("u1_u2", &message(Payload::text("hi")), "u2", "Alice")
            .await;
    }

    #[test]
    fn media_bodies_use_placeholders() {
        let img = Notification::for_message(
            "c",
            &message(Payload::Image {
                image_data: "r".into(),
                image_name: None,
            }),
            "A",
        );
        assert_eq!(img.body, "📷 Image");
        assert_eq!(img.message_type, "image");

        let voice = Notification::for_message(
            "c",
            &message(Payload::Voice {
                voice_data: "r".into(),
            }),
            "A",
        );
        assert_eq!(voice.body, "🎵 Voice message");
        assert_eq!(voice.message_type, "voice");
    }
}
