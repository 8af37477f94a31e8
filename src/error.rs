use thiserror::Error;

use crate::protocol::NetworkId;
use crate::world::EntityId;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("buffer overflow: needed {needed} bits, {remaining} remaining")]
    BufferOverflow { needed: usize, remaining: usize },

    #[error("truncated message: reader exhausted mid-field")]
    TruncatedMessage,

    #[error("not authoritative: network ids are assigned by the server")]
    NotAuthoritative,

    #[error("entity {0} is already registered")]
    DuplicateEntity(EntityId),

    #[error("network id {0} is already registered")]
    DuplicateId(NetworkId),

    #[error("component type id {0} is already registered")]
    DuplicateTypeId(u16),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, SyncError>;
