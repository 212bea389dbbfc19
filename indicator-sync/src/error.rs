use thiserror::Error;

use crate::pipeline::ContextToken;
use crate::IndicatorId;

/// Per-indicator or per-message failures. None of them is fatal: the caller
/// logs, skips the offending input and keeps prior state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("malformed payload for {id}: {reason}")]
    MalformedPayload { id: IndicatorId, reason: String },
    #[error("unknown indicator kind {kind:?} for {id}")]
    UnknownIndicatorKind { id: IndicatorId, kind: String },
    #[error("stale context write: expected {expected}, received {received}")]
    StaleContextWrite {
        expected: ContextToken,
        received: String,
    },
    #[error("unknown indicator {0}")]
    UnknownIndicator(IndicatorId),
    #[error("indicator {0} already exists")]
    DuplicateIndicator(IndicatorId),
    #[error("stale indicator handle")]
    StaleHandle,
}

impl SyncError {
    pub fn malformed(id: &IndicatorId, reason: impl Into<String>) -> Self {
        SyncError::MalformedPayload {
            id: id.clone(),
            reason: reason.into(),
        }
    }
}
