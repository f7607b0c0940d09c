use crate::error::ProtocolError;
use crate::marshal;
use crate::variant::{Variant, VariantType};

/// Sequential reader handed to native procedures so they can pull their own
/// arguments off the packet.
///
/// The argument block starts with a count byte. Native procedures know their
/// own arity, so the count is skipped; each typed read still checks the tag
/// in front of the value.
#[derive(Debug)]
pub struct StreamReader<'a> {
    buffer: &'a [u8],
}

impl<'a> StreamReader<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, ProtocolError> {
        let (_count, buffer) = marshal::decode_u8(data)?;
        Ok(Self { buffer })
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len()
    }

    fn expect_tag(&mut self, expected: VariantType) -> Result<(), ProtocolError> {
        let (found, rest) = marshal::decode_i32(self.buffer)?;
        if found != expected.tag() {
            return Err(ProtocolError::ArgumentType {
                expected: expected.tag(),
                found,
            });
        }
        self.buffer = rest;
        Ok(())
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        self.expect_tag(VariantType::Int)?;
        let (v, rest) = marshal::decode_i32(self.buffer)?;
        self.buffer = rest;
        Ok(v)
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        self.expect_tag(VariantType::Bool)?;
        let (v, rest) = marshal::decode_bool(self.buffer)?;
        self.buffer = rest;
        Ok(v)
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        self.expect_tag(VariantType::Real)?;
        let (v, rest) = marshal::decode_f32(self.buffer)?;
        self.buffer = rest;
        Ok(v)
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        self.expect_tag(VariantType::String)?;
        let (v, rest) = marshal::decode_string(self.buffer)?;
        self.buffer = rest;
        Ok(v)
    }

    /// Reads whatever tagged value comes next.
    pub fn read_variant(&mut self) -> Result<Variant, ProtocolError> {
        let (v, rest) = Variant::decode(self.buffer)?;
        self.buffer = rest;
        Ok(v)
    }
}
