//! Thin wrapper around a compressed bitmap of `u32` event/entity ids.
//!
//! Grounded on `original_source/include/core/bitmaps.h`'s minimal
//! `bitmap_create`/`bitmap_add`/`bitmap_contains` API; backed here by the
//! `roaring` crate so the wrapper gets portable, endian-independent
//! serialization for free.

use roaring::RoaringBitmap;
use std::ops::{BitAnd, BitOr};

use crate::error::ConsistencyError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitmap(RoaringBitmap);

impl Bitmap {
    pub fn new() -> Self {
        Self(RoaringBitmap::new())
    }

    pub fn add(&mut self, value: u32) -> bool {
        self.0.insert(value)
    }

    pub fn contains(&self, value: u32) -> bool {
        self.0.contains(value)
    }

    pub fn len(&self) -> u64 {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter()
    }

    /// Intersection (`AND`).
    pub fn and(&self, other: &Bitmap) -> Bitmap {
        Bitmap(&self.0 & &other.0)
    }

    /// Union (`OR`).
    pub fn or(&self, other: &Bitmap) -> Bitmap {
        Bitmap(&self.0 | &other.0)
    }

    /// Complement within `[0, universe)`.
    pub fn complement(&self, universe: u32) -> Bitmap {
        let mut full = RoaringBitmap::new();
        full.insert_range(0..universe);
        Bitmap(&full - &self.0)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.0.serialized_size());
        self.0
            .serialize_into(&mut buf)
            .expect("writing to a Vec cannot fail");
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, ConsistencyError> {
        RoaringBitmap::deserialize_from(bytes)
            .map(Bitmap)
            .map_err(|e| ConsistencyError::CorruptBitmap(e.to_string()))
    }
}

impl BitAnd for &Bitmap {
    type Output = Bitmap;
    fn bitand(self, rhs: Self) -> Bitmap {
        self.and(rhs)
    }
}

impl BitOr for &Bitmap {
    type Output = Bitmap;
    fn bitor(self, rhs: Self) -> Bitmap {
        self.or(rhs)
    }
}

impl FromIterator<u32> for Bitmap {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Bitmap(RoaringBitmap::from_iter(iter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_contains() {
        let mut bm = Bitmap::new();
        bm.add(1);
        bm.add(4);
        assert!(bm.contains(1));
        assert!(bm.contains(4));
        assert!(!bm.contains(2));
    }

    #[test]
    fn and_or_complement() {
        let a: Bitmap = [1u32, 4].into_iter().collect();
        let b: Bitmap = [2u32, 4].into_iter().collect();
        assert_eq!(a.and(&b), [4u32].into_iter().collect());
        assert_eq!(a.or(&b), [1u32, 2, 4].into_iter().collect());
        let not_a = a.complement(6);
        assert_eq!(not_a, [0u32, 2, 3, 5].into_iter().collect());
    }

    #[test]
    fn round_trips_through_serialization() {
        let bm: Bitmap = [1u32, 2, 3000].into_iter().collect();
        let bytes = bm.serialize();
        let back = Bitmap::deserialize(&bytes).unwrap();
        assert_eq!(bm, back);
    }
}
