pub mod events;
pub mod models;

/// Milliseconds since the Unix epoch. All timestamps in the data model
/// (message timestamps, last-seen, read receipts) use this representation.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
