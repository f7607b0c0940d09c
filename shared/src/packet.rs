//! Framing for application packets, command payloads and control frames.
//!
//! Application packet: `[u32 source][i32 target][command payload]`.
//! Command payload: `[u8 command][...]`, see [`Command`].
//! Control frame (config channel): `[u32 kind][...]`, see [`SystemMessage`].

use crate::error::ProtocolError;
use crate::marshal;
use crate::{Command, PeerId, RoutingTarget, SystemMessage};

/// Size of the `[source][target]` prefix on every application packet.
pub const HEADER_SIZE: usize = 8;

/// Command byte plus the addressed-target field.
pub const CALL_HEADER_SIZE: usize = 5;

/// High bit of the addressed-target field: the rest is a byte offset to a
/// literal path rather than a cache id.
pub const LITERAL_PATH_FLAG: u32 = 0x8000_0000;

/// Largest cache id that fits beside [`LITERAL_PATH_FLAG`].
pub const MAX_CACHE_ID: u32 = !LITERAL_PATH_FLAG;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub source: PeerId,
    pub target: RoutingTarget,
}

impl PacketHeader {
    pub fn new(source: PeerId, target: RoutingTarget) -> Self {
        Self { source, target }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) {
        marshal::encode_u32(self.source, buffer);
        marshal::encode_i32(self.target.0, buffer);
    }

    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        let (source, data) = marshal::decode_u32(data)?;
        let (target, data) = marshal::decode_i32(data)?;
        Ok((Self::new(source, RoutingTarget(target)), data))
    }

    /// Prepends this header to a command payload.
    pub fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len());
        self.encode(&mut packet);
        packet.extend_from_slice(payload);
        packet
    }
}

/// How a call names its target node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAddress {
    /// Id the receiver learned through a SimplifyPath handshake.
    Cached(u32),
    /// Full path, appended to the end of the payload.
    Literal(String),
}

impl NodeAddress {
    /// Interprets an addressed-target field against the command payload it
    /// came from (offsets count from the command byte).
    ///
    /// For a literal address the path offset is also returned: it marks where
    /// the argument block ends.
    pub fn from_field(field: u32, payload: &[u8]) -> Result<(Self, Option<usize>), ProtocolError> {
        if field & LITERAL_PATH_FLAG == 0 {
            return Ok((NodeAddress::Cached(field), None));
        }

        let offset = (field & MAX_CACHE_ID) as usize;
        if offset < CALL_HEADER_SIZE || offset >= payload.len() {
            return Err(ProtocolError::InvalidPathOffset {
                offset,
                len: payload.len(),
            });
        }
        let (path, _) = marshal::decode_cstring(&payload[offset..])?;
        Ok((NodeAddress::Literal(path), Some(offset)))
    }
}

/// A decoded RemoteCall / RemoteSet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPacket<'a> {
    pub command: Command,
    pub address: NodeAddress,
    pub name: String,
    pub args: &'a [u8],
}

/// Builds a RemoteCall or RemoteSet payload. `args` is an already encoded
/// argument block.
pub fn encode_call(command: Command, address: &NodeAddress, name: &str, args: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(CALL_HEADER_SIZE + name.len() + 1 + args.len());
    marshal::encode_u8(command.into(), &mut payload);
    marshal::encode_u32(0, &mut payload);
    marshal::encode_cstring(name, &mut payload);
    payload.extend_from_slice(args);

    let field = match address {
        NodeAddress::Cached(id) => *id,
        NodeAddress::Literal(path) => {
            let offset = payload.len() as u32;
            marshal::encode_cstring(path, &mut payload);
            offset | LITERAL_PATH_FLAG
        }
    };
    payload[1..CALL_HEADER_SIZE].copy_from_slice(&field.to_le_bytes());
    payload
}

pub fn decode_call(payload: &[u8]) -> Result<CallPacket<'_>, ProtocolError> {
    if payload.len() < CALL_HEADER_SIZE {
        return Err(ProtocolError::OutOfBounds {
            needed: CALL_HEADER_SIZE,
            remaining: payload.len(),
        });
    }
    let (byte, rest) = marshal::decode_u8(payload)?;
    let command = Command::try_from(byte)?;
    let (field, rest) = marshal::decode_u32(rest)?;
    let (address, path_offset) = NodeAddress::from_field(field, payload)?;
    let (name, rest) = marshal::decode_cstring(rest)?;

    let args_start = payload.len() - rest.len();
    let args_end = match path_offset {
        Some(offset) if offset >= args_start => offset,
        Some(offset) => {
            return Err(ProtocolError::InvalidPathOffset {
                offset,
                len: payload.len(),
            })
        }
        None => payload.len(),
    };

    Ok(CallPacket {
        command,
        address,
        name,
        args: &payload[args_start..args_end],
    })
}

pub fn encode_simplify_path(id: u32, path: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(CALL_HEADER_SIZE + path.len() + 1);
    marshal::encode_u8(Command::SimplifyPath.into(), &mut payload);
    marshal::encode_u32(id, &mut payload);
    marshal::encode_cstring(path, &mut payload);
    payload
}

/// Decodes the fields after the SimplifyPath command byte.
pub fn decode_simplify_path(data: &[u8]) -> Result<(u32, String), ProtocolError> {
    let (id, data) = marshal::decode_u32(data)?;
    let (path, _) = marshal::decode_cstring(data)?;
    Ok((id, path))
}

pub fn encode_confirm_path(path: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(path.len() + 2);
    marshal::encode_u8(Command::ConfirmPath.into(), &mut payload);
    marshal::encode_cstring(path, &mut payload);
    payload
}

/// Decodes the fields after the ConfirmPath command byte.
pub fn decode_confirm_path(data: &[u8]) -> Result<String, ProtocolError> {
    let (path, _) = marshal::decode_cstring(data)?;
    Ok(path)
}

pub fn encode_raw(data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(data.len() + 1);
    marshal::encode_u8(Command::Raw.into(), &mut payload);
    payload.extend_from_slice(data);
    payload
}

/// A decoded config-channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage<'a> {
    AddPeer(PeerId),
    RemovePeer(PeerId),
    /// SimplifyPath / ConfirmPath command wrapped with its routing header.
    PathCache {
        header: PacketHeader,
        payload: &'a [u8],
    },
}

pub fn encode_peer_notice(kind: SystemMessage, peer: PeerId) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    marshal::encode_u32(kind.into(), &mut frame);
    marshal::encode_u32(peer, &mut frame);
    frame
}

pub fn encode_path_control(header: PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + HEADER_SIZE + payload.len());
    marshal::encode_u32(SystemMessage::PathCache.into(), &mut frame);
    header.encode(&mut frame);
    frame.extend_from_slice(payload);
    frame
}

pub fn decode_control(data: &[u8]) -> Result<ControlMessage<'_>, ProtocolError> {
    let (kind, rest) = marshal::decode_u32(data)?;
    match SystemMessage::try_from(kind)? {
        SystemMessage::AddPeer => {
            let (peer, _) = marshal::decode_u32(rest)?;
            Ok(ControlMessage::AddPeer(peer))
        }
        SystemMessage::RemovePeer => {
            let (peer, _) = marshal::decode_u32(rest)?;
            Ok(ControlMessage::RemovePeer(peer))
        }
        SystemMessage::PathCache => {
            let (header, payload) = PacketHeader::decode(rest)?;
            Ok(ControlMessage::PathCache { header, payload })
        }
    }
}
