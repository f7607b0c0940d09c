use serde::{Deserialize, Serialize};

/// Transport-level UDP datagram exchanged by the bundled host.
///
/// Application bytes ride inside [`Datagram::Payload`] untouched; everything
/// else is connection bookkeeping.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Datagram {
    Connect { unique_id: u32 },
    Accepted { peer_id: u32 },
    Refused { reason: String },
    Heartbeat,
    Disconnect,
    Payload {
        channel: u8,
        reliable: bool,
        data: Vec<u8>,
    },
}

impl Datagram {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
