// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

use std::collections::HashSet;

use arrow_array::BooleanArray;
use roaring::RoaringBitmap;

/// Sets with at least this many offsets are stored as bitmaps.
pub const BITMAP_THRESHOLD: usize = 5_000;

/// The deleted row offsets of one fragment.
///
/// Small sets are kept as a hash set and larger ones as a roaring bitmap.
/// Equality compares the offsets, not the representation.
#[derive(Debug, Clone, Default)]
pub enum DeletionVector {
    #[default]
    NoDeletions,
    Set(HashSet<u32>),
    Bitmap(RoaringBitmap),
}

impl DeletionVector {
    /// Pick the representation for `offsets` by size.
    fn from_set(offsets: HashSet<u32>) -> Self {
        match offsets.len() {
            0 => Self::NoDeletions,
            n if n >= BITMAP_THRESHOLD => Self::Bitmap(offsets.into_iter().collect()),
            _ => Self::Set(offsets),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::NoDeletions => 0,
            Self::Set(offsets) => offsets.len(),
            Self::Bitmap(bitmap) => bitmap.len() as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, offset: u32) -> bool {
        match self {
            Self::NoDeletions => false,
            Self::Set(offsets) => offsets.contains(&offset),
            Self::Bitmap(bitmap) => bitmap.contains(offset),
        }
    }

    /// Keep-mask for the physical rows `start..start + len`: `false` marks a
    /// deleted row.
    ///
    /// Returns `None` if no row in the range is deleted.
    pub fn build_predicate(&self, start: u32, len: usize) -> Option<BooleanArray> {
        let rows = start..start + len as u32;
        if self.is_empty() || !rows.clone().any(|offset| self.contains(offset)) {
            return None;
        }
        Some(BooleanArray::from_iter(
            rows.map(|offset| Some(!self.contains(offset))),
        ))
    }

    /// Sorted offsets of the deleted rows.
    pub fn to_sorted_vec(&self) -> Vec<u32> {
        match self {
            Self::NoDeletions => vec![],
            // Bitmaps iterate in order
            Self::Bitmap(bitmap) => bitmap.iter().collect(),
            Self::Set(offsets) => {
                let mut sorted = offsets.iter().copied().collect::<Vec<_>>();
                sorted.sort_unstable();
                sorted
            }
        }
    }
}

impl PartialEq for DeletionVector {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Set(a), Self::Set(b)) => a == b,
            (Self::Bitmap(a), Self::Bitmap(b)) => a == b,
            _ => self.len() == other.len() && self.to_sorted_vec() == other.to_sorted_vec(),
        }
    }
}

impl Extend<u32> for DeletionVector {
    fn extend<T: IntoIterator<Item = u32>>(&mut self, iter: T) {
        match self {
            Self::Bitmap(bitmap) => bitmap.extend(iter),
            Self::Set(offsets) => {
                offsets.extend(iter);
                if offsets.len() >= BITMAP_THRESHOLD {
                    *self = Self::from_set(std::mem::take(offsets));
                }
            }
            Self::NoDeletions => *self = Self::from_set(iter.into_iter().collect()),
        }
    }
}

impl IntoIterator for DeletionVector {
    type IntoIter = Box<dyn Iterator<Item = Self::Item> + Send>;
    type Item = u32;

    fn into_iter(self) -> Self::IntoIter {
        match self {
            Self::NoDeletions => Box::new(std::iter::empty()),
            Self::Set(offsets) => Box::new(offsets.into_iter()),
            Self::Bitmap(bitmap) => Box::new(bitmap.into_iter()),
        }
    }
}

impl FromIterator<u32> for DeletionVector {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Self::from_set(iter.into_iter().collect())
    }
}
