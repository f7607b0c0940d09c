//! Tagged primitive arguments for dynamically dispatched procedures.
//!
//! Each argument is `[i32 type tag][value]`. Only the atomic types can be
//! carried; the remaining tags exist so foreign peers' packets are reported
//! as unsupported rather than unknown.

use crate::error::ProtocolError;
use crate::marshal;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum VariantType {
    Nil = 0,
    Bool,
    Int,
    Real,
    String,
    Vector2,
    Rect2,
    Vector3,
    Transform2D,
    Plane,
    Quat,
    Aabb,
    Basis,
    Transform,
    Color,
    NodePath,
    Rid,
    Object,
    Dictionary,
    Array,
    PoolByteArray,
    PoolIntArray,
    PoolRealArray,
    PoolStringArray,
    PoolVector2Array,
    PoolVector3Array,
    PoolColorArray,
}

impl VariantType {
    const ALL: [VariantType; 27] = [
        VariantType::Nil,
        VariantType::Bool,
        VariantType::Int,
        VariantType::Real,
        VariantType::String,
        VariantType::Vector2,
        VariantType::Rect2,
        VariantType::Vector3,
        VariantType::Transform2D,
        VariantType::Plane,
        VariantType::Quat,
        VariantType::Aabb,
        VariantType::Basis,
        VariantType::Transform,
        VariantType::Color,
        VariantType::NodePath,
        VariantType::Rid,
        VariantType::Object,
        VariantType::Dictionary,
        VariantType::Array,
        VariantType::PoolByteArray,
        VariantType::PoolIntArray,
        VariantType::PoolRealArray,
        VariantType::PoolStringArray,
        VariantType::PoolVector2Array,
        VariantType::PoolVector3Array,
        VariantType::PoolColorArray,
    ];

    pub fn tag(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for VariantType {
    type Error = ProtocolError;

    fn try_from(tag: i32) -> Result<Self, Self::Error> {
        usize::try_from(tag)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or(ProtocolError::UnsupportedVariant(tag))
    }
}

/// A decoded argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Nil,
    Bool(bool),
    Int(i32),
    Real(f32),
    String(String),
}

impl Variant {
    pub fn variant_type(&self) -> VariantType {
        match self {
            Variant::Nil => VariantType::Nil,
            Variant::Bool(_) => VariantType::Bool,
            Variant::Int(_) => VariantType::Int,
            Variant::Real(_) => VariantType::Real,
            Variant::String(_) => VariantType::String,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Variant::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f32> {
        match self {
            Variant::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) {
        marshal::encode_i32(self.variant_type().tag(), buffer);
        match self {
            Variant::Nil => {}
            Variant::Bool(v) => marshal::encode_bool(*v, buffer),
            Variant::Int(v) => marshal::encode_i32(*v, buffer),
            Variant::Real(v) => marshal::encode_f32(*v, buffer),
            Variant::String(v) => marshal::encode_string(v, buffer),
        }
    }

    pub fn decode(data: &[u8]) -> Result<(Variant, &[u8]), ProtocolError> {
        let (tag, data) = marshal::decode_i32(data)?;
        match VariantType::try_from(tag)? {
            VariantType::Nil => Ok((Variant::Nil, data)),
            VariantType::Bool => {
                let (v, rest) = marshal::decode_bool(data)?;
                Ok((Variant::Bool(v), rest))
            }
            VariantType::Int => {
                let (v, rest) = marshal::decode_i32(data)?;
                Ok((Variant::Int(v), rest))
            }
            VariantType::Real => {
                let (v, rest) = marshal::decode_f32(data)?;
                Ok((Variant::Real(v), rest))
            }
            VariantType::String => {
                let (v, rest) = marshal::decode_string(data)?;
                Ok((Variant::String(v), rest))
            }
            _ => Err(ProtocolError::UnsupportedVariant(tag)),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Nil => write!(f, "null"),
            Variant::Bool(v) => write!(f, "{}", v),
            Variant::Int(v) => write!(f, "{}", v),
            Variant::Real(v) => write!(f, "{}", v),
            Variant::String(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Variant::Bool(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Variant::Int(v)
    }
}

impl From<f32> for Variant {
    fn from(v: f32) -> Self {
        Variant::Real(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::String(v.to_owned())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::String(v)
    }
}

/// Most arguments a single call can carry.
pub const MAX_ARGUMENTS: usize = u8::MAX as usize;

/// Encodes an argument list: a single count byte followed by each tagged
/// argument.
///
/// # Errors
/// `TooManyArguments` when the list is longer than [`MAX_ARGUMENTS`]; nothing
/// is written in that case.
pub fn encode_arguments(args: &[Variant], buffer: &mut Vec<u8>) -> Result<(), ProtocolError> {
    let count = u8::try_from(args.len()).map_err(|_| ProtocolError::TooManyArguments(args.len()))?;
    marshal::encode_u8(count, buffer);
    for arg in args {
        arg.encode(buffer);
    }
    Ok(())
}

pub fn decode_arguments(data: &[u8]) -> Result<Vec<Variant>, ProtocolError> {
    let (count, mut data) = marshal::decode_u8(data)?;
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (arg, rest) = Variant::decode(data)?;
        args.push(arg);
        data = rest;
    }
    Ok(args)
}
