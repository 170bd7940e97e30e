//! Presence & message synchronization engine for pairwise chat.
//!
//! Five components over the realtime store: the presence tracker
//! (online/offline/last-seen with disconnect convergence), the
//! conversation store (ordered message log with reactions, read receipts
//! and soft delete), the inbox aggregator (per-user recency-ordered
//! conversation list), the typing signal (debounced ephemeral flag) and
//! the notification dispatcher (best-effort push to inactive recipients).

pub mod conversation;
pub mod error;
pub mod inbox;
pub mod notify;
pub mod presence;
pub mod push_id;
pub mod typing;
pub mod users;

pub use conversation::{ConversationStore, conversation_id, other_participant, visible_messages};
pub use error::EngineError;
pub use inbox::InboxAggregator;
pub use notify::{Notification, NotificationDispatcher, NtfyTransport, PushTransport};
pub use presence::PresenceTracker;
pub use typing::TypingSignal;
pub use users::UserDirectory;
