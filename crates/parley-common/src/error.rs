//! Errors raised while parsing or mutating shared call types.

use thiserror::Error;

use crate::call::{CallId, CallStatus};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid call id {value:?}: {source}")]
    InvalidCallId {
        value: String,
        #[source]
        source: uuid::Error,
    },

    #[error("unknown media kind {0:?}")]
    UnknownMediaKind(String),

    #[error("unknown call status {0:?}")]
    UnknownStatus(String),

    /// The status table does not allow `from -> to`.
    #[error("call {id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        id: CallId,
        from: CallStatus,
        to: CallStatus,
    },

    /// A gateway frame that is not valid JSON for its type.
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
}
