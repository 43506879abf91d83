//! Little-endian primitive codec used by every record and message.

use crate::math::{Vec3d, Vec3f, Vec3i};
use crate::voxel::CodecError;
use cgmath::Vector3;
use thiserror::Error;

/// Cap applied to URLs, names and other short strings.
pub const MAX_STRING_LEN: usize = 10_000;
/// Cap applied to script and content bodies.
pub const MAX_CONTENT_LEN: usize = 1_000_000;
/// Cap on the compressed voxel payload of a single object.
pub const MAX_COMPRESSED_VOXEL_BYTES: usize = 1_000_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("field `{field}` declares {len} bytes, limit is {max}")]
    OversizedField {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("stream truncated at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("unsupported version {found}, supported up to {max}")]
    UnsupportedVersion { found: u32, max: u32 },
    #[error("unknown message type {0}")]
    UnknownMessageType(u32),
    #[error("bad hello magic {0}")]
    BadHello(u32),
    #[error("invalid object type tag {0}")]
    InvalidObjectType(u32),
    #[error("field `{0}` is not valid utf-8")]
    InvalidUtf8(&'static str),
    #[error("voxel payload: {0}")]
    Codec(#[from] CodecError),
}

impl ProtocolError {
    pub fn is_truncation(&self) -> bool {
        matches!(self, ProtocolError::Truncated { .. })
    }
}

#[derive(Debug, Default, Clone)]
pub struct OutStream {
    buf: Vec<u8>,
}

impl OutStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_vec3d(&mut self, v: Vec3d) {
        self.write_f64(v.x);
        self.write_f64(v.y);
        self.write_f64(v.z);
    }

    pub fn write_vec3f(&mut self, v: Vec3f) {
        self.write_f32(v.x);
        self.write_f32(v.y);
        self.write_f32(v.z);
    }

    pub fn write_vec3i(&mut self, v: Vec3i) {
        self.write_i32(v.x);
        self.write_i32(v.y);
        self.write_i32(v.z);
    }

    /// Writes a `u32` byte length followed by the utf-8 bytes.
    pub fn write_string(&mut self, value: &str) {
        self.write_bytes_len_first(value.as_bytes());
    }

    pub fn write_bytes_len_first(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_data(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Overwrites a previously written `u32`, used to backfill length prefixes.
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Bounds-checked reader over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct InStream<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> InStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn end_of_stream(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.take_array::<4>()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.take_array::<4>()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.take_array::<8>()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_le_bytes(self.take_array::<4>()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_le_bytes(self.take_array::<8>()?))
    }

    pub fn read_vec3d(&mut self) -> Result<Vec3d, ProtocolError> {
        Ok(Vector3::new(self.read_f64()?, self.read_f64()?, self.read_f64()?))
    }

    pub fn read_vec3f(&mut self) -> Result<Vec3f, ProtocolError> {
        Ok(Vector3::new(self.read_f32()?, self.read_f32()?, self.read_f32()?))
    }

    pub fn read_vec3i(&mut self) -> Result<Vec3i, ProtocolError> {
        Ok(Vector3::new(self.read_i32()?, self.read_i32()?, self.read_i32()?))
    }

    /// Reads a length-prefixed byte string. The declared length is checked
    /// against `max_len` and against the remaining input before anything is copied.
    pub fn read_bytes_len_first(
        &mut self,
        field: &'static str,
        max_len: usize,
    ) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_u32()? as usize;
        if len > max_len {
            return Err(ProtocolError::OversizedField {
                field,
                len,
                max: max_len,
            });
        }
        self.take(len)
    }

    pub fn read_string(
        &mut self,
        field: &'static str,
        max_len: usize,
    ) -> Result<String, ProtocolError> {
        let bytes = self.read_bytes_len_first(field, max_len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8(field))
    }

    pub fn read_data(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        self.take(len)
    }

    /// Consumes and returns everything left in the stream.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_little_endian() {
        let mut out = OutStream::new();
        out.write_u32(0x0102_0304);
        assert_eq!(out.as_bytes(), &[4, 3, 2, 1]);
    }

    #[test]
    fn mixed_fields_read_back_in_order() {
        let mut out = OutStream::new();
        out.write_u64(77);
        out.write_string("teapot.obj");
        out.write_vec3d(Vector3::new(1.5, -2.0, 3.25));
        out.write_f32(0.5);

        let bytes = out.into_bytes();
        let mut input = InStream::new(&bytes);
        assert_eq!(input.read_u64().unwrap(), 77);
        assert_eq!(input.read_string("model_url", MAX_STRING_LEN).unwrap(), "teapot.obj");
        assert_eq!(input.read_vec3d().unwrap(), Vector3::new(1.5, -2.0, 3.25));
        assert_eq!(input.read_f32().unwrap(), 0.5);
        assert!(input.end_of_stream());
    }

    #[test]
    fn underrun_reports_truncation() {
        let bytes = [1u8, 2, 3];
        let mut input = InStream::new(&bytes);
        let err = input.read_u32().expect_err("three bytes cannot hold a u32");
        assert_eq!(
            err,
            ProtocolError::Truncated {
                offset: 0,
                needed: 4,
                available: 3
            }
        );
    }

    #[test]
    fn oversized_string_rejected_before_reading_body() {
        let mut out = OutStream::new();
        out.write_u32(50_000);
        let bytes = out.into_bytes();
        let mut input = InStream::new(&bytes);
        let err = input
            .read_string("model_url", MAX_STRING_LEN)
            .expect_err("length above cap");
        assert!(matches!(
            err,
            ProtocolError::OversizedField {
                field: "model_url",
                len: 50_000,
                max: MAX_STRING_LEN
            }
        ));
    }

    #[test]
    fn declared_length_beyond_input_is_truncation() {
        let mut out = OutStream::new();
        out.write_u32(8);
        out.write_data(b"abc");
        let bytes = out.into_bytes();
        let mut input = InStream::new(&bytes);
        let err = input.read_string("name", MAX_STRING_LEN).unwrap_err();
        assert!(err.is_truncation());
    }

    #[test]
    fn invalid_utf8_is_reported_with_field_name() {
        let mut out = OutStream::new();
        out.write_bytes_len_first(&[0xff, 0xfe]);
        let bytes = out.into_bytes();
        let mut input = InStream::new(&bytes);
        assert_eq!(
            input.read_string("creator_name", MAX_STRING_LEN),
            Err(ProtocolError::InvalidUtf8("creator_name"))
        );
    }

    #[test]
    fn patch_u32_backfills_length() {
        let mut out = OutStream::new();
        let at = out.len();
        out.write_u32(0);
        out.write_data(&[9, 9]);
        out.patch_u32(at, 2);
        let bytes = out.into_bytes();
        let mut input = InStream::new(&bytes);
        assert_eq!(input.read_u32().unwrap(), 2);
    }
}
