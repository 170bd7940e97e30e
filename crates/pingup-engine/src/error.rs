use pingup_store::StoreError;
use thiserror::Error;

/// Engine error taxonomy.
///
/// Durability-affecting failures (append, reaction, read receipt) surface
/// to the caller so a retry can be offered; presence broadcasts and push
/// notifications never propagate here — those side channels log and
/// continue.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed message content. Rejected locally, nothing written.
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),

    /// Mutation the policy does not allow for this caller (e.g.
    /// soft-deleting another sender's message).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}
