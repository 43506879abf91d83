//! Voxel group compression.
//!
//! Voxels are bucketed by material with a stable counting sort, then written
//! as an `i32` array:
//!
//! ```text
//! [num_buckets, (count, dx, dy, dz * count) * num_buckets]
//! ```
//!
//! Positions are deltas from the previous voxel. The reference starts at the
//! origin and carries across bucket boundaries. The array is zstd compressed.

use crate::math::Vec3i;
use cgmath::Vector3;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use thiserror::Error;

pub const DEFAULT_MAX_VOXELS: usize = 64_000_000;
pub const DEFAULT_MAX_MATERIALS: usize = 65_536;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("corrupt voxel frame: {0}")]
    CorruptFrame(String),
    #[error("voxel count {count} exceeds limit {max}")]
    TooManyVoxels { count: usize, max: usize },
    /// Long tails are counted up to 64 KiB plus one byte.
    #[error("{0} unexpected trailing bytes after voxel data")]
    UnexpectedTrailingData(usize),
    #[error("material index {index} out of range (limit {max})")]
    MaterialIndexOutOfRange { index: u32, max: usize },
    #[error("compression failed: {0}")]
    Compression(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Voxel {
    pub pos: Vec3i,
    pub mat_index: u32,
}

impl Voxel {
    pub fn new(x: i32, y: i32, z: i32, mat_index: u32) -> Self {
        Self {
            pos: Vector3::new(x, y, z),
            mat_index,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoxelGroup {
    pub voxels: Vec<Voxel>,
}

impl VoxelGroup {
    pub fn new(voxels: Vec<Voxel>) -> Self {
        Self { voxels }
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    /// Stable regrouping by material, the order `decode(encode(g))` produces.
    pub fn sorted_by_material(&self) -> VoxelGroup {
        let mut voxels = self.voxels.clone();
        voxels.sort_by_key(|voxel| voxel.mat_index);
        VoxelGroup { voxels }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoxelLimits {
    pub max_voxels: usize,
    pub max_materials: usize,
}

impl Default for VoxelLimits {
    fn default() -> Self {
        Self {
            max_voxels: DEFAULT_MAX_VOXELS,
            max_materials: DEFAULT_MAX_MATERIALS,
        }
    }
}

impl VoxelLimits {
    /// Largest decompressed frame these limits allow, in bytes.
    fn max_frame_bytes(&self) -> u64 {
        let words = 1u64
            .saturating_add(self.max_materials as u64)
            .saturating_add((self.max_voxels as u64).saturating_mul(3));
        words.saturating_mul(4)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VoxelCodec {
    limits: VoxelLimits,
}

impl VoxelCodec {
    pub fn new(limits: VoxelLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> VoxelLimits {
        self.limits
    }

    pub fn encode(&self, group: &VoxelGroup) -> Result<Vec<u8>, CodecError> {
        if group.is_empty() {
            return Ok(Vec::new());
        }

        let mut num_buckets = 0usize;
        for voxel in &group.voxels {
            let index = voxel.mat_index as usize;
            if index >= self.limits.max_materials {
                return Err(CodecError::MaterialIndexOutOfRange {
                    index: voxel.mat_index,
                    max: self.limits.max_materials,
                });
            }
            num_buckets = num_buckets.max(index + 1);
        }

        let mut counts = vec![0usize; num_buckets];
        for voxel in &group.voxels {
            counts[voxel.mat_index as usize] += 1;
        }

        let mut offsets = vec![0usize; num_buckets];
        let mut running = 0usize;
        for (offset, count) in offsets.iter_mut().zip(&counts) {
            *offset = running;
            running += count;
        }

        let mut sorted = vec![Vector3::new(0i32, 0, 0); group.len()];
        for voxel in &group.voxels {
            let slot = &mut offsets[voxel.mat_index as usize];
            sorted[*slot] = voxel.pos;
            *slot += 1;
        }

        let mut words: Vec<i32> = Vec::with_capacity(1 + num_buckets + 3 * group.len());
        words.push(num_buckets as i32);
        let mut reference = Vector3::new(0i32, 0, 0);
        let mut cursor = 0usize;
        for count in counts {
            words.push(count as i32);
            for pos in &sorted[cursor..cursor + count] {
                words.push(pos.x.wrapping_sub(reference.x));
                words.push(pos.y.wrapping_sub(reference.y));
                words.push(pos.z.wrapping_sub(reference.z));
                reference = *pos;
            }
            cursor += count;
        }

        let mut raw = Vec::with_capacity(words.len() * 4);
        for word in words {
            raw.extend_from_slice(&word.to_le_bytes());
        }

        zstd::bulk::compress(&raw, zstd::DEFAULT_COMPRESSION_LEVEL)
            .map_err(|err| CodecError::Compression(err.to_string()))
    }

    /// Streams the frame out of the decompressor a word at a time, so memory
    /// grows with the voxels actually present rather than the declared counts.
    pub fn decode(&self, bytes: &[u8]) -> Result<VoxelGroup, CodecError> {
        if bytes.is_empty() {
            return Ok(VoxelGroup::default());
        }

        let decoder = zstd::stream::read::Decoder::new(bytes)
            .map_err(|err| CodecError::CorruptFrame(err.to_string()))?;
        let mut reader = WordReader::new(decoder);
        let num_buckets = reader.next_word()? as u32 as usize;
        if num_buckets > self.limits.max_materials {
            return Err(CodecError::CorruptFrame(format!(
                "bucket count {num_buckets} exceeds {}",
                self.limits.max_materials
            )));
        }

        let mut voxels = Vec::new();
        let mut total = 0usize;
        let mut reference = Vector3::new(0i32, 0, 0);
        for mat_index in 0..num_buckets {
            let count = reader.next_word()? as u32 as usize;
            total = total.saturating_add(count);
            if total > self.limits.max_voxels {
                return Err(CodecError::TooManyVoxels {
                    count: total,
                    max: self.limits.max_voxels,
                });
            }
            voxels.reserve(count.min(RESERVE_STEP));
            for _ in 0..count {
                let dx = reader.next_word()?;
                let dy = reader.next_word()?;
                let dz = reader.next_word()?;
                reference = Vector3::new(
                    reference.x.wrapping_add(dx),
                    reference.y.wrapping_add(dy),
                    reference.z.wrapping_add(dz),
                );
                voxels.push(Voxel {
                    pos: reference,
                    mat_index: mat_index as u32,
                });
            }
        }

        let cap = self.limits.max_frame_bytes();
        let budget = cap.saturating_sub(reader.bytes_read());
        let trailing = reader.skip_remaining(budget.min(TRAILING_SCAN_BYTES).saturating_add(1))?;
        if trailing > budget {
            return Err(CodecError::CorruptFrame(format!(
                "decompressed size exceeds {cap} bytes"
            )));
        }
        if trailing > 0 {
            return Err(CodecError::UnexpectedTrailingData(trailing as usize));
        }

        Ok(VoxelGroup { voxels })
    }
}

/// Upper bound on a single up-front reservation while decoding.
const RESERVE_STEP: usize = 1 << 16;

/// Trailing bytes counted before giving up; larger tails report this many plus one.
const TRAILING_SCAN_BYTES: u64 = 64 * 1024;

struct WordReader<R> {
    inner: R,
    bytes_read: u64,
}

impl<R: Read> WordReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_read: 0,
        }
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn next_word(&mut self) -> Result<i32, CodecError> {
        let mut word = [0u8; 4];
        self.inner.read_exact(&mut word).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => CodecError::CorruptFrame("frame ended mid-record".to_string()),
            _ => CodecError::CorruptFrame(err.to_string()),
        })?;
        self.bytes_read += 4;
        Ok(i32::from_le_bytes(word))
    }

    /// Reads and discards up to `limit` bytes. Returns how many there were.
    fn skip_remaining(&mut self, limit: u64) -> Result<u64, CodecError> {
        io::copy(&mut self.inner.by_ref().take(limit), &mut io::sink())
            .map_err(|err| CodecError::CorruptFrame(err.to_string()))
    }
}

/// Compresses with default limits.
pub fn compress_voxels(group: &VoxelGroup) -> Result<Vec<u8>, CodecError> {
    VoxelCodec::default().encode(group)
}

/// Decompresses with default limits.
pub fn decompress_voxels(bytes: &[u8]) -> Result<VoxelGroup, CodecError> {
    VoxelCodec::default().decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn words_to_frame(words: &[i32]) -> Vec<u8> {
        let mut raw = Vec::new();
        for word in words {
            raw.extend_from_slice(&word.to_le_bytes());
        }
        zstd::bulk::compress(&raw, zstd::DEFAULT_COMPRESSION_LEVEL).unwrap()
    }

    #[test]
    fn empty_group_encodes_to_empty_bytes() {
        let codec = VoxelCodec::default();
        let bytes = codec.encode(&VoxelGroup::default()).unwrap();
        assert!(bytes.is_empty());
        assert!(codec.decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn decode_regroups_by_material() {
        let group = VoxelGroup::new(vec![
            Voxel::new(1, 2, 3, 2),
            Voxel::new(-4, 0, 9, 0),
            Voxel::new(5, 5, 5, 2),
            Voxel::new(0, 0, 0, 0),
        ]);
        let codec = VoxelCodec::default();
        let decoded = codec.decode(&codec.encode(&group).unwrap()).unwrap();
        assert_eq!(
            decoded.voxels,
            vec![
                Voxel::new(-4, 0, 9, 0),
                Voxel::new(0, 0, 0, 0),
                Voxel::new(1, 2, 3, 2),
                Voxel::new(5, 5, 5, 2),
            ]
        );
    }

    #[test]
    fn extreme_coordinates_survive_wrapping_deltas() {
        let group = VoxelGroup::new(vec![
            Voxel::new(i32::MAX, i32::MIN, 0, 0),
            Voxel::new(i32::MIN, i32::MAX, -1, 0),
        ]);
        let codec = VoxelCodec::default();
        let decoded = codec.decode(&codec.encode(&group).unwrap()).unwrap();
        assert_eq!(decoded, group);
    }

    #[test]
    fn material_above_limit_is_rejected() {
        let codec = VoxelCodec::new(VoxelLimits {
            max_voxels: 10,
            max_materials: 4,
        });
        let err = codec
            .encode(&VoxelGroup::new(vec![Voxel::new(0, 0, 0, 4)]))
            .unwrap_err();
        assert_eq!(err, CodecError::MaterialIndexOutOfRange { index: 4, max: 4 });
    }

    #[test]
    fn garbage_is_corrupt_frame() {
        let err = VoxelCodec::default()
            .decode(&[0xde, 0xad, 0xbe, 0xef, 0x00])
            .unwrap_err();
        assert!(matches!(err, CodecError::CorruptFrame(_)));
    }

    #[test]
    fn huge_declared_count_fails_without_allocating() {
        let frame = words_to_frame(&[1, i32::MAX, 0, 0, 0]);
        let err = VoxelCodec::default().decode(&frame).unwrap_err();
        assert!(matches!(err, CodecError::TooManyVoxels { .. }));
    }

    #[test]
    fn count_beyond_frame_is_corrupt() {
        let frame = words_to_frame(&[1, 5, 1, 1, 1]);
        let err = VoxelCodec::default().decode(&frame).unwrap_err();
        assert!(matches!(err, CodecError::CorruptFrame(_)));
    }

    #[test]
    fn bucket_count_above_material_limit_is_corrupt() {
        let codec = VoxelCodec::new(VoxelLimits {
            max_voxels: 100,
            max_materials: 2,
        });
        let frame = words_to_frame(&[3, 0, 0, 0]);
        assert!(matches!(
            codec.decode(&frame).unwrap_err(),
            CodecError::CorruptFrame(_)
        ));
    }

    #[test]
    fn trailing_words_are_reported() {
        let frame = words_to_frame(&[1, 1, 2, 3, 4, 99, 98]);
        assert_eq!(
            VoxelCodec::default().decode(&frame).unwrap_err(),
            CodecError::UnexpectedTrailingData(8)
        );
    }

    #[test]
    fn partial_word_is_corrupt() {
        let frame = zstd::bulk::compress(&[1u8, 0, 0, 0, 7], 3).unwrap();
        assert!(matches!(
            VoxelCodec::default().decode(&frame).unwrap_err(),
            CodecError::CorruptFrame(_)
        ));
    }

    #[test]
    fn oversized_frame_exceeds_limit_bound() {
        let codec = VoxelCodec::new(VoxelLimits {
            max_voxels: 1,
            max_materials: 1,
        });
        let frame = words_to_frame(&[0; 64]);
        assert!(matches!(
            codec.decode(&frame).unwrap_err(),
            CodecError::CorruptFrame(_)
        ));
    }

    #[test]
    fn large_zero_frame_is_rejected_after_a_bounded_read() {
        let mut encoder = zstd::stream::write::Encoder::new(Vec::new(), 3).unwrap();
        let block = vec![0u8; 1 << 20];
        for _ in 0..64 {
            std::io::Write::write_all(&mut encoder, &block).unwrap();
        }
        let frame = encoder.finish().unwrap();
        assert!(frame.len() < 1 << 20);

        match VoxelCodec::default().decode(&frame).unwrap_err() {
            CodecError::UnexpectedTrailingData(n) => {
                assert_eq!(n as u64, TRAILING_SCAN_BYTES + 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn truncated_bucket_streams_to_corrupt_frame() {
        let codec = VoxelCodec::new(VoxelLimits {
            max_voxels: DEFAULT_MAX_VOXELS,
            max_materials: 4,
        });
        // Declares ten million voxels but carries one.
        let frame = words_to_frame(&[1, 10_000_000, 1, 2, 3]);
        assert!(matches!(
            codec.decode(&frame).unwrap_err(),
            CodecError::CorruptFrame(_)
        ));
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            raw in proptest::collection::vec((any::<i32>(), any::<i32>(), any::<i32>(), 0u32..8), 0..200)
        ) {
            let group = VoxelGroup::new(
                raw.into_iter().map(|(x, y, z, m)| Voxel::new(x, y, z, m)).collect(),
            );
            let codec = VoxelCodec::default();
            let decoded = codec.decode(&codec.encode(&group).unwrap()).unwrap();
            prop_assert_eq!(decoded, group.sorted_by_material());
        }
    }
}
