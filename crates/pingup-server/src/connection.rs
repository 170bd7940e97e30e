//! One WebSocket connection = one live chat session.
//!
//! Presence goes online (with armed disconnect writes) when the socket is
//! accepted and converges to offline however the socket ends. Opening a
//! conversation tears down the previous conversation's subscriptions
//! before establishing new ones, so a switch never leaves duplicate
//! listeners firing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pingup_engine::conversation::visible_messages;
use pingup_engine::error::EngineError;
use pingup_types::events::{GatewayCommand, GatewayEvent};
use pingup_types::models::Payload;

use crate::AppState;

/// Server pings every 15 seconds; two missed pongs (~30s) drop the
/// connection and let the armed presence writes fire.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Characters of a rejected frame to echo into the log.
const FRAME_LOG_LIMIT: usize = 200;

/// Cut a client frame for logging on a char boundary; frames are
/// client-supplied and may be multibyte anywhere.
fn truncate_frame(text: &str) -> &str {
    match text.char_indices().nth(FRAME_LOG_LIMIT) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub async fn handle_connection(socket: WebSocket, state: AppState, uid: String) {
    let (mut sender, mut receiver) = socket.split();

    let session = match state.presence.go_online(&uid) {
        Ok(session) => session,
        Err(e) => {
            warn!(uid, "failed to go online, closing socket: {e}");
            return;
        }
    };
    info!(uid, "connected to gateway");

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<GatewayEvent>();
    let _ = event_tx.send(GatewayEvent::Ready { uid: uid.clone() });

    // Connection-scoped inbox forwarder
    let inbox_task = {
        let mut stream = match state.inbox.subscribe(&uid) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(uid, "inbox subscription failed: {e}");
                return;
            }
        };
        let tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(conversations) = stream.recv().await {
                if tx.send(GatewayEvent::Inbox { conversations }).is_err() {
                    break;
                }
            }
        })
    };

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward events to the client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("undeliverable event: {e}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("heartbeat timeout, dropping connection");
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client
    let state_recv = state.clone();
    let uid_recv = uid.clone();
    let tx_recv = event_tx.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut open: Option<OpenConversation> = None;
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(command) => {
                        handle_command(&state_recv, &uid_recv, command, &mut open, &tx_recv).await;
                    }
                    Err(e) => {
                        warn!(
                            uid = uid_recv,
                            "bad command: {e} -- raw: {}",
                            truncate_frame(&text)
                        );
                        let _ = tx_recv.send(GatewayEvent::Error {
                            message: format!("bad command: {e}"),
                        });
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        if let Some(open) = open.take() {
            open.close(&state_recv, &uid_recv);
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    inbox_task.abort();

    if let Err(e) = session.go_offline() {
        // The armed disconnect writes still converge presence
        warn!(uid, "graceful offline failed: {e}");
    }
    info!(uid, "disconnected from gateway");
}

/// Subscriptions scoped to the currently opened conversation. Replaced
/// wholesale on every `Open`; closing aborts every forwarder first.
struct OpenConversation {
    conversation_id: String,
    other_uid: String,
    tasks: Vec<JoinHandle<()>>,
}

impl OpenConversation {
    fn close(self, state: &AppState, uid: &str) {
        for task in &self.tasks {
            task.abort();
        }
        if let Err(e) = state.typing.clear(&self.conversation_id, uid) {
            debug!("typing clear on close failed: {e}");
        }
    }
}

async fn handle_command(
    state: &AppState,
    uid: &str,
    command: GatewayCommand,
    open: &mut Option<OpenConversation>,
    tx: &mpsc::UnboundedSender<GatewayEvent>,
) {
    match command {
        GatewayCommand::Open { other_uid } => {
            // Cancel the previous conversation's subscriptions first to
            // avoid duplicate-fire on the switch.
            if let Some(previous) = open.take() {
                previous.close(state, uid);
            }
            match open_conversation(state, uid, &other_uid, tx) {
                Ok(opened) => *open = Some(opened),
                Err(e) => {
                    warn!(uid, other_uid, "open failed: {e}");
                    send_error(tx, format!("open failed: {e}"));
                }
            }
        }

        GatewayCommand::SendText { text } => {
            send_payload(state, uid, open, Payload::Text { text }, tx).await;
        }
        GatewayCommand::SendImage { data, name } => {
            send_payload(
                state,
                uid,
                open,
                Payload::Image {
                    image_data: data,
                    image_name: name,
                },
                tx,
            )
            .await;
        }
        GatewayCommand::SendVoice { data } => {
            send_payload(state, uid, open, Payload::Voice { voice_data: data }, tx).await;
        }

        GatewayCommand::Typing => {
            if let Some(open) = open {
                // Ephemeral signal: failures degrade, never surface
                if let Err(e) = state.typing.set_typing(&open.conversation_id, uid) {
                    debug!("typing write failed: {e}");
                }
            }
        }

        GatewayCommand::React { message_id, emoji } => {
            let Some(open) = open else {
                return send_error(tx, "no open conversation".into());
            };
            if let Err(e) = state
                .conversations
                .react(&open.conversation_id, &message_id, uid, &emoji)
            {
                send_error(tx, format!("reaction failed: {e}"));
            }
        }

        GatewayCommand::MarkRead { message_id } => {
            let Some(open) = open else {
                return send_error(tx, "no open conversation".into());
            };
            if let Err(e) = state
                .conversations
                .mark_read(&open.conversation_id, &message_id, uid)
            {
                send_error(tx, format!("read receipt failed: {e}"));
            }
        }

        GatewayCommand::Delete { message_id } => {
            let Some(open) = open else {
                return send_error(tx, "no open conversation".into());
            };
            if let Err(e) = state
                .conversations
                .soft_delete(&open.conversation_id, &message_id, uid)
            {
                send_error(tx, format!("delete failed: {e}"));
            }
        }

        GatewayCommand::ToggleFollow { other_uid } => {
            match state.users.toggle_follow(uid, &other_uid) {
                Ok(following) => {
                    let _ = tx.send(GatewayEvent::FollowState {
                        other_uid,
                        following,
                    });
                }
                Err(e) => send_error(tx, format!("follow toggle failed: {e}")),
            }
        }
    }
}

fn open_conversation(
    state: &AppState,
    uid: &str,
    other_uid: &str,
    tx: &mpsc::UnboundedSender<GatewayEvent>,
) -> Result<OpenConversation, EngineError> {
    let conversation_id = state.inbox.register_conversation(uid, other_uid)?;
    let mut tasks = Vec::new();

    let mut messages = state.conversations.subscribe(&conversation_id)?;
    {
        let tx = tx.clone();
        let conversation_id = conversation_id.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(all) = messages.recv().await {
                let event = GatewayEvent::Conversation {
                    conversation_id: conversation_id.clone(),
                    messages: visible_messages(&all),
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        }));
    }

    let mut typing = state.typing.subscribe(&conversation_id, other_uid)?;
    {
        let tx = tx.clone();
        let conversation_id = conversation_id.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(flag) = typing.recv().await {
                let event = GatewayEvent::Typing {
                    conversation_id: conversation_id.clone(),
                    typing: flag,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        }));
    }

    let mut presence = state.presence.subscribe(other_uid)?;
    {
        let tx = tx.clone();
        let other = other_uid.to_string();
        tasks.push(tokio::spawn(async move {
            while let Some(snapshot) = presence.recv().await {
                let event = GatewayEvent::Presence {
                    uid: other.clone(),
                    online: snapshot.online,
                    last_seen: snapshot.last_seen,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        }));
    }

    let mut transitions = state.presence.watch_transitions(other_uid)?;
    {
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(transition) = transitions.recv().await {
                let event = GatewayEvent::PresenceAlert {
                    uid: transition.uid,
                    online: transition.online,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        }));
    }

    debug!(uid, other_uid, conversation_id, "conversation opened");
    Ok(OpenConversation {
        conversation_id,
        other_uid: other_uid.to_string(),
        tasks,
    })
}

async fn send_payload(
    state: &AppState,
    uid: &str,
    open: &Option<OpenConversation>,
    payload: Payload,
    tx: &mpsc::UnboundedSender<GatewayEvent>,
) {
    let Some(open) = open else {
        return send_error(tx, "no open conversation".into());
    };
    match state
        .conversations
        .append(&open.conversation_id, uid, payload)
        .await
    {
        Ok(message) => {
            let sender_name = state
                .users
                .user(uid)
                .ok()
                .flatten()
                .map(|u| u.name)
                .unwrap_or_else(|| uid.to_string());
            state
                .dispatcher
                .on_message_appended(&open.conversation_id, &message, &open.other_uid, &sender_name)
                .await;
        }
        // The client keeps its input and may retry
        Err(e) => {
            warn!(uid, "send failed: {e}");
            send_error(tx, format!("send failed: {e}"));
        }
    }
}

fn send_error(tx: &mpsc::UnboundedSender<GatewayEvent>, message: String) {
    let _ = tx.send(GatewayEvent::Error { message });
}
