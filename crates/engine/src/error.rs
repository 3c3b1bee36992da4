use ballotdesk_core::{CoreError, effects::EffectKind, ids::*};
use ballotdesk_storage::StorageError;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("row not found: {0}")]
    RowNotFound(RowId),

    #[error("comment not found: {0}")]
    CommentNotFound(CommentId),

    #[error("field is read-only: {0}")]
    ReadOnlyField(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown mutation: {0}")]
    UnknownMutation(MutationId),

    #[error("no rows selected")]
    NoSelection,

    #[error("{} failed and was rolled back: {source}", .kind.as_str())]
    MutationFailed {
        kind: EffectKind,
        #[source]
        source: TransportError,
    },

    #[error("invalid config: {0}")]
    Config(String),
}
