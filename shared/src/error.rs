use crate::PeerId;
use thiserror::Error;

/// Wire-level violations. Every one of these means "drop the packet and keep
/// going"; none of them is fatal to a connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("packet too short: needed {needed} bytes, {remaining} remaining")]
    OutOfBounds { needed: usize, remaining: usize },
    #[error("string is missing its NUL terminator")]
    MissingTerminator,
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown command byte {0}")]
    UnknownCommand(u8),
    #[error("unknown system message kind {0}")]
    UnknownSystemMessage(u32),
    #[error("unsupported variant type tag {0}")]
    UnsupportedVariant(i32),
    #[error("{0} arguments do not fit the one-byte argument count")]
    TooManyArguments(usize),
    #[error("argument type mismatch: expected tag {expected}, found {found}")]
    ArgumentType { expected: i32, found: i32 },
    #[error("literal path offset {offset} outside payload of {len} bytes")]
    InvalidPathOffset { offset: usize, len: usize },
    #[error("peer {0} has no path cache")]
    UnknownPeerCache(PeerId),
    #[error("peer {peer} never announced cache id {id}")]
    UnknownCacheId { peer: PeerId, id: u32 },
    #[error("no node at path {0:?}")]
    NodeNotFound(String),
    #[error("confirmation for untracked path {0:?}")]
    UntrackedPath(String),
    #[error("peer {peer} confirmed {path:?} without being offered it")]
    UnexpectedConfirmation { path: String, peer: PeerId },
    #[error("peer {actual} claimed to be peer {claimed}")]
    SourceMismatch { claimed: PeerId, actual: PeerId },
}
