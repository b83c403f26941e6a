use thiserror::Error;

/// Failure taxonomy for the engine. Nothing here crosses an event-handler
/// boundary as a panic; every handler converts failures into one of these
/// and the engine surfaces them as categorized error events.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient channel trouble (subscribe, publish, presence track).
    /// Recovered by the reconnect-and-resync loop; surfaced only as a
    /// non-blocking connecting indicator plus a diagnostic event.
    #[error("channel failure: {0}")]
    Channel(String),

    /// The durable write for an outbound message failed. Surfaced
    /// per-message as the `Error` delivery state; recoverable only by an
    /// explicit user retry or delete.
    #[error("persistence failed for message {message_id}: {source}")]
    Persistence {
        message_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// An inbound event that cannot be applied (missing id, unusable
    /// shape). Dropped, never fatal.
    #[error("malformed inbound event: {0}")]
    MalformedEvent(String),

    /// The authoritative fetch failed. Conversation-level: existing
    /// messages are kept and presence keeps functioning.
    #[error("authoritative fetch failed: {source}")]
    SnapshotFetch {
        #[source]
        source: anyhow::Error,
    },
}

impl SyncError {
    /// Stable machine-readable tag embedded in error events so callers
    /// can classify without matching on message text.
    pub fn category(&self) -> &'static str {
        match self {
            SyncError::Channel(_) => "channel",
            SyncError::Persistence { .. } => "persistence",
            SyncError::MalformedEvent(_) => "malformed_event",
            SyncError::SnapshotFetch { .. } => "snapshot_fetch",
        }
    }
}
