//! Little-endian wire primitives.
//!
//! Decoders take a byte slice and hand back the decoded value together with
//! the unread remainder, so callers can chain them with `?`. Encoders append
//! to a caller-owned buffer. Nothing in here keeps state.

use crate::error::ProtocolError;

type Decoded<'a, T> = Result<(T, &'a [u8]), ProtocolError>;

fn take(data: &[u8], n: usize) -> Decoded<'_, &[u8]> {
    if data.len() < n {
        return Err(ProtocolError::OutOfBounds {
            needed: n,
            remaining: data.len(),
        });
    }
    Ok(data.split_at(n))
}

fn take_array<const N: usize>(data: &[u8]) -> Decoded<'_, [u8; N]> {
    let (head, rest) = take(data, N)?;
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(head);
    Ok((bytes, rest))
}

pub fn decode_u8(data: &[u8]) -> Decoded<'_, u8> {
    let ([b], rest) = take_array::<1>(data)?;
    Ok((b, rest))
}

pub fn decode_i8(data: &[u8]) -> Decoded<'_, i8> {
    let (b, rest) = decode_u8(data)?;
    Ok((b as i8, rest))
}

pub fn decode_u16(data: &[u8]) -> Decoded<'_, u16> {
    let (bytes, rest) = take_array(data)?;
    Ok((u16::from_le_bytes(bytes), rest))
}

pub fn decode_i16(data: &[u8]) -> Decoded<'_, i16> {
    let (bytes, rest) = take_array(data)?;
    Ok((i16::from_le_bytes(bytes), rest))
}

pub fn decode_u32(data: &[u8]) -> Decoded<'_, u32> {
    let (bytes, rest) = take_array(data)?;
    Ok((u32::from_le_bytes(bytes), rest))
}

pub fn decode_i32(data: &[u8]) -> Decoded<'_, i32> {
    let (bytes, rest) = take_array(data)?;
    Ok((i32::from_le_bytes(bytes), rest))
}

pub fn decode_u64(data: &[u8]) -> Decoded<'_, u64> {
    let (bytes, rest) = take_array(data)?;
    Ok((u64::from_le_bytes(bytes), rest))
}

pub fn decode_i64(data: &[u8]) -> Decoded<'_, i64> {
    let (bytes, rest) = take_array(data)?;
    Ok((i64::from_le_bytes(bytes), rest))
}

/// Booleans travel as a full 32-bit integer; only `1` reads as true.
pub fn decode_bool(data: &[u8]) -> Decoded<'_, bool> {
    let (v, rest) = decode_i32(data)?;
    Ok((v == 1, rest))
}

pub fn decode_f32(data: &[u8]) -> Decoded<'_, f32> {
    let (bits, rest) = decode_u32(data)?;
    Ok((f32::from_bits(bits), rest))
}

pub fn decode_f64(data: &[u8]) -> Decoded<'_, f64> {
    let (bits, rest) = decode_u64(data)?;
    Ok((f64::from_bits(bits), rest))
}

pub fn decode_bytes(data: &[u8], n: usize) -> Decoded<'_, &[u8]> {
    take(data, n)
}

/// Reads a NUL-terminated UTF-8 string and consumes the terminator.
pub fn decode_cstring(data: &[u8]) -> Decoded<'_, String> {
    let end = data
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::MissingTerminator)?;
    let text = std::str::from_utf8(&data[..end]).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok((text.to_owned(), &data[end + 1..]))
}

/// Reads a `u32` length, that many bytes of UTF-8, then the zero padding up
/// to the next 4-byte boundary.
pub fn decode_string(data: &[u8]) -> Decoded<'_, String> {
    let (len, rest) = decode_u32(data)?;
    let len = len as usize;
    let (raw, rest) = take(rest, len)?;
    let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)?;
    let (_, rest) = take(rest, padding(len))?;
    Ok((text.to_owned(), rest))
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

pub fn encode_u8(v: u8, buffer: &mut Vec<u8>) {
    buffer.push(v);
}

pub fn encode_i8(v: i8, buffer: &mut Vec<u8>) {
    buffer.push(v as u8);
}

pub fn encode_u16(v: u16, buffer: &mut Vec<u8>) {
    buffer.extend_from_slice(&v.to_le_bytes());
}

pub fn encode_i16(v: i16, buffer: &mut Vec<u8>) {
    buffer.extend_from_slice(&v.to_le_bytes());
}

pub fn encode_u32(v: u32, buffer: &mut Vec<u8>) {
    buffer.extend_from_slice(&v.to_le_bytes());
}

pub fn encode_i32(v: i32, buffer: &mut Vec<u8>) {
    buffer.extend_from_slice(&v.to_le_bytes());
}

pub fn encode_u64(v: u64, buffer: &mut Vec<u8>) {
    buffer.extend_from_slice(&v.to_le_bytes());
}

pub fn encode_i64(v: i64, buffer: &mut Vec<u8>) {
    buffer.extend_from_slice(&v.to_le_bytes());
}

pub fn encode_bool(v: bool, buffer: &mut Vec<u8>) {
    encode_i32(i32::from(v), buffer);
}

pub fn encode_f32(v: f32, buffer: &mut Vec<u8>) {
    encode_u32(v.to_bits(), buffer);
}

pub fn encode_f64(v: f64, buffer: &mut Vec<u8>) {
    encode_u64(v.to_bits(), buffer);
}

pub fn encode_cstring(s: &str, buffer: &mut Vec<u8>) {
    buffer.extend_from_slice(s.as_bytes());
    buffer.push(0);
}

pub fn encode_string(s: &str, buffer: &mut Vec<u8>) {
    encode_u32(s.len() as u32, buffer);
    buffer.extend_from_slice(s.as_bytes());
    buffer.resize(buffer.len() + padding(s.len()), 0);
}
