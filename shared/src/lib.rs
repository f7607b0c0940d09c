//! Wire-level types shared by every peer: identifiers, command bytes,
//! routing targets, the binary codec and packet framing.

pub mod datagram;
pub mod error;
pub mod marshal;
pub mod packet;
pub mod stream_reader;
pub mod variant;

pub use datagram::Datagram;
pub use error::ProtocolError;
pub use packet::{NodeAddress, PacketHeader};
pub use stream_reader::StreamReader;
pub use variant::{Variant, VariantType};

/// Transport-assigned peer identifier.
pub type PeerId = u32;

pub const INVALID_PEER_ID: PeerId = 0;
pub const SERVER_PEER_ID: PeerId = 1;

/// Transport channels. Channel 0 carries peer gossip and path-cache
/// handshakes; the others carry application packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    Config = 0,
    Reliable = 1,
    Unreliable = 2,
}

pub const CHANNEL_COUNT: u8 = 3;

impl Channel {
    pub fn for_reliability(reliable: bool) -> Self {
        if reliable {
            Channel::Reliable
        } else {
            Channel::Unreliable
        }
    }
}

impl From<Channel> for u8 {
    fn from(channel: Channel) -> u8 {
        channel as u8
    }
}

impl TryFrom<u8> for Channel {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Channel::Config),
            1 => Ok(Channel::Reliable),
            2 => Ok(Channel::Unreliable),
            other => Err(other),
        }
    }
}

/// First byte of every command payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    RemoteCall = 0,
    RemoteSet = 1,
    SimplifyPath = 2,
    ConfirmPath = 3,
    Raw = 4,
}

impl From<Command> for u8 {
    fn from(command: Command) -> u8 {
        command as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::RemoteCall),
            1 => Ok(Command::RemoteSet),
            2 => Ok(Command::SimplifyPath),
            3 => Ok(Command::ConfirmPath),
            4 => Ok(Command::Raw),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Leading `u32` of a config-channel frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SystemMessage {
    AddPeer = 0,
    RemovePeer = 1,
    PathCache = 2,
}

impl From<SystemMessage> for u32 {
    fn from(kind: SystemMessage) -> u32 {
        kind as u32
    }
}

impl TryFrom<u32> for SystemMessage {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SystemMessage::AddPeer),
            1 => Ok(SystemMessage::RemovePeer),
            2 => Ok(SystemMessage::PathCache),
            other => Err(ProtocolError::UnknownSystemMessage(other)),
        }
    }
}

/// Signed delivery selector carried in every application packet.
///
/// - `0`: every peer, including the server
/// - `1`: the server only
/// - `n > 1`: peer `n` only
/// - `n < 0`: every peer except `-n` (and except the sender); the server
///   itself only receives it when `n == -1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingTarget(pub i32);

impl RoutingTarget {
    pub const BROADCAST: RoutingTarget = RoutingTarget(0);
    pub const SERVER: RoutingTarget = RoutingTarget(1);

    pub fn peer(id: PeerId) -> Self {
        RoutingTarget(id as i32)
    }

    pub fn all_except(id: PeerId) -> Self {
        RoutingTarget(-(id as i32))
    }

    /// The peer a negative target leaves out.
    pub fn excluded(self) -> Option<PeerId> {
        (self.0 < 0).then(|| self.0.unsigned_abs())
    }

    /// The single peer a positive target names.
    pub fn unicast(self) -> Option<PeerId> {
        (self.0 > 0).then_some(self.0 as PeerId)
    }

    /// Whether `peer` ends up receiving a packet sent with this target.
    ///
    /// Matches the relay's delivery rule: a negative target reaches the
    /// server only when it is `-1`, and reaches every other peer unless it
    /// names that peer.
    pub fn admits(self, peer: PeerId) -> bool {
        match self.0 {
            0 => true,
            t if t > 0 => peer == t as PeerId,
            t if peer == SERVER_PEER_ID => t == -1,
            t => peer != t.unsigned_abs(),
        }
    }
}

impl From<i32> for RoutingTarget {
    fn from(v: i32) -> Self {
        RoutingTarget(v)
    }
}
