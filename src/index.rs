//! Exact nearest-neighbor index over fixed-dimension f32 vectors.
//!
//! Vectors live in a flat insertion-ordered arena and are scored by squared
//! Euclidean distance with a brute-force scan. There is no in-place delete:
//! removal is done by rebuilding a fresh index from the surviving vectors,
//! so offsets are never stable across mutations.

use crate::error::{Error, Result};

/// Header size: 4 bytes vector count + 4 bytes dimension.
const HEADER_SIZE: usize = 8;

/// An insertion-ordered flat index of fixed-dimension vectors.
///
/// Binary format produced by [`VectorIndex::to_bytes`]:
/// - 4 bytes: vector count N (u32 LE)
/// - 4 bytes: dimension D (u32 LE)
/// - N * D * 4 bytes: f32 LE values in row-major order
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl VectorIndex {
    /// Create an empty index fixed to the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of vectors currently stored.
    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a vector, returning its assigned offset.
    ///
    /// Offsets are sequential in insertion order. Fails with
    /// [`Error::DimensionMismatch`] without mutating the index if the
    /// vector's length disagrees with the index dimension.
    pub fn insert(&mut self, vector: &[f32]) -> Result<usize> {
        self.check_dimension(vector)?;
        let offset = self.len();
        self.data.extend_from_slice(vector);
        Ok(offset)
    }

    /// The vector stored at `offset`, or `None` if out of range.
    pub fn vector(&self, offset: usize) -> Option<&[f32]> {
        if offset >= self.len() {
            return None;
        }
        let start = offset * self.dimension;
        Some(&self.data[start..start + self.dimension])
    }

    /// Iterate over stored vectors in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimension.max(1))
    }

    /// Return up to `k` `(offset, squared_l2_distance)` pairs, closest first.
    ///
    /// Results are ordered by ascending distance; exact ties are broken by
    /// insertion order (earlier offset first). An empty index yields an
    /// empty result, but the query vector's length is always validated.
    pub fn query(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        self.check_dimension(query)?;
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = self
            .iter()
            .enumerate()
            .map(|(offset, vector)| (offset, squared_l2(query, vector)))
            .collect();

        scored.sort_by(|a, b| {
            a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Serialize the index to its binary blob form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.data.len() * 4);
        bytes.extend_from_slice(&(self.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        bytes.extend_from_slice(bytemuck::cast_slice(&self.data));
        bytes
    }

    /// Deserialize an index from its binary blob form.
    ///
    /// Returns `None` if the header is missing or the payload length does
    /// not match the declared count and dimension; the caller decides how
    /// to treat that as corruption.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }

        let count = u32::from_le_bytes(bytes[0..4].try_into().ok()?) as usize;
        let dimension =
            u32::from_le_bytes(bytes[4..8].try_into().ok()?) as usize;

        // The header is corrupt-blob input; a declared size that overflows
        // can never match the payload length.
        let expected_len = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(HEADER_SIZE))?;
        if bytes.len() != expected_len {
            return None;
        }

        let payload = &bytes[HEADER_SIZE..];
        let data: Vec<f32> = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();

        Some(Self { dimension, data })
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

/// Squared Euclidean distance between two equal-length vectors.
fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}
