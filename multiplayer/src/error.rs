use shared::ProtocolError;
use thiserror::Error;

/// Failure of a single packet, call or connection.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Malformed or inconsistent packet. The packet is dropped.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    /// The node exists but has neither a native nor a dynamic procedure of
    /// that name.
    #[error("unknown procedure {name:?} on {path}")]
    UnknownProcedure { path: String, name: String },
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    /// A procedure body reported failure.
    #[error("procedure failed: {0}")]
    Procedure(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RpcError {
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, RpcError::Protocol(_))
    }
}

impl From<bincode::Error> for RpcError {
    fn from(err: bincode::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}
