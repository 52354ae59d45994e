//! Segmented hash storage
//!
//! The term storage behind a series: `2^L` independent open-addressing maps
//! (hashbrown), with a term living in the segment selected by the low `L`
//! bits of its key's 64-bit hash. The full hash drives intra-segment
//! probing.
//!
//! Segmentation is what makes the parallel multiplier race-free: destination
//! segments are disjoint units of work, and the engine hands each rayon task
//! exclusive ownership of the segment it fills. Within this module no
//! synchronisation exists or is needed.
//!
//! Each segment is capped at [`MAX_TABLE_SIZE`] entries; the series layer
//! and the multiplication engine enforce the cap through
//! [`SegmentedTable::check_segment_sizes`].

use hashbrown::HashMap;
use std::hash::Hash;

/// Upper bound for the log2 of the segment count.
pub const MAX_LOG2_SEGMENTS: u32 = 16;

/// Maximum number of terms a single segment may hold.
pub const MAX_TABLE_SIZE: usize = u32::MAX as usize;

/// Keys storable in a [`SegmentedTable`]: hashable, with an explicit 64-bit
/// hash that the segmentation (and the homomorphic bucket algebra of the
/// parallel multiplier) works on.
///
/// The `Hash` impl must be consistent with [`TableKey::hash64`].
pub trait TableKey: Eq + Hash {
    /// The key's 64-bit hash.
    fn hash64(&self) -> u64;
}

/// Errors raised by the segmented storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    /// The requested segment count exceeds the supported maximum.
    #[error("cannot use {requested} as the log2 of a table's segment count: the maximum is {max}")]
    TooManySegments {
        /// Requested log2 segment count.
        requested: u32,
        /// Maximum allowed log2 segment count.
        max: u32,
    },
    /// A segment grew past the allowed size.
    #[error("a table segment holds {size} terms, more than the maximum allowed value ({max})")]
    SegmentOverflow {
        /// Observed segment size.
        size: usize,
        /// The enforced cap.
        max: usize,
    },
}

/// Hash storage partitioned into `2^L` sub-tables.
#[derive(Debug, Clone)]
pub struct SegmentedTable<K, C> {
    segments: Vec<HashMap<K, C>>,
    log2_size: u32,
}

impl<K: TableKey, C> SegmentedTable<K, C> {
    /// A single-segment table.
    pub fn new() -> Self {
        Self {
            segments: vec![HashMap::new()],
            log2_size: 0,
        }
    }

    /// A table with `2^log2_size` segments.
    pub fn with_log2_segments(log2_size: u32) -> Result<Self, TableError> {
        if log2_size > MAX_LOG2_SEGMENTS {
            return Err(TableError::TooManySegments {
                requested: log2_size,
                max: MAX_LOG2_SEGMENTS,
            });
        }
        let mut segments = Vec::with_capacity(1usize << log2_size);
        segments.resize_with(1usize << log2_size, HashMap::new);
        Ok(Self {
            segments,
            log2_size,
        })
    }

    /// Assemble a table from pre-filled segments (the parallel multiplier
    /// builds destination segments independently). The segment count must be
    /// a supported power of two, and every key must already live in its home
    /// segment.
    pub fn from_segments(segments: Vec<HashMap<K, C>>) -> Result<Self, TableError> {
        assert!(segments.len().is_power_of_two(), "segment count must be a power of two");
        let log2_size = segments.len().trailing_zeros();
        if log2_size > MAX_LOG2_SEGMENTS {
            return Err(TableError::TooManySegments {
                requested: log2_size,
                max: MAX_LOG2_SEGMENTS,
            });
        }
        let ret = Self {
            segments,
            log2_size,
        };
        debug_assert!(ret
            .segments
            .iter()
            .enumerate()
            .all(|(i, s)| s.keys().all(|k| ret.segment_index(k.hash64()) == i)));
        Ok(ret)
    }

    /// Log2 of the segment count.
    #[inline]
    pub fn log2_segments(&self) -> u32 {
        self.log2_size
    }

    /// The segment count.
    #[inline]
    pub fn n_segments(&self) -> usize {
        self.segments.len()
    }

    /// Segment selected by a 64-bit hash.
    #[inline]
    pub fn segment_index(&self, h: u64) -> usize {
        (h & ((1u64 << self.log2_size) - 1)) as usize
    }

    /// Total number of stored terms.
    pub fn len(&self) -> usize {
        self.segments.iter().map(HashMap::len).sum()
    }

    /// Whether the table holds no terms.
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(HashMap::is_empty)
    }

    /// Drop all terms, keeping the segmentation.
    pub fn clear(&mut self) {
        for s in &mut self.segments {
            s.clear();
        }
    }

    /// Look up a term.
    pub fn get(&self, key: &K) -> Option<&C> {
        self.segments[self.segment_index(key.hash64())].get(key)
    }

    /// Look up a term mutably.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut C> {
        let idx = self.segment_index(key.hash64());
        self.segments[idx].get_mut(key)
    }

    /// Remove a term, returning its coefficient.
    pub fn remove(&mut self, key: &K) -> Option<C> {
        let idx = self.segment_index(key.hash64());
        self.segments[idx].remove(key)
    }

    /// Insert or update: `make` builds the coefficient only when the key is
    /// new, `update` accumulates into the existing slot otherwise. Returns
    /// whether an insertion took place.
    pub fn insert_or_update(
        &mut self,
        key: K,
        make: impl FnOnce() -> C,
        update: impl FnOnce(&mut C),
    ) -> bool {
        let idx = self.segment_index(key.hash64());
        match self.segments[idx].entry(key) {
            hashbrown::hash_map::Entry::Occupied(mut e) => {
                update(e.get_mut());
                false
            }
            hashbrown::hash_map::Entry::Vacant(v) => {
                v.insert(make());
                true
            }
        }
    }

    /// Insert a term assumed not to be present.
    pub fn insert_unique(&mut self, key: K, value: C) {
        let idx = self.segment_index(key.hash64());
        let prev = self.segments[idx].insert(key, value);
        debug_assert!(prev.is_none(), "key was not unique");
    }

    /// Iterate all terms across segments.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &C)> {
        self.segments.iter().flat_map(HashMap::iter)
    }

    /// Iterate all terms with mutable coefficients.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut C)> {
        self.segments.iter_mut().flat_map(HashMap::iter_mut)
    }

    /// Keep only the terms for which `f` returns true.
    pub fn retain(&mut self, mut f: impl FnMut(&K, &mut C) -> bool) {
        for s in &mut self.segments {
            s.retain(|k, c| f(k, c));
        }
    }

    /// The underlying segments.
    pub fn segments(&self) -> &[HashMap<K, C>] {
        &self.segments
    }

    /// Mutable access to the underlying segments. Callers must keep every
    /// key in its home segment.
    pub fn segments_mut(&mut self) -> &mut [HashMap<K, C>] {
        &mut self.segments
    }

    /// Change the segment count, redistributing all terms.
    pub fn set_log2_segments(&mut self, log2_size: u32) -> Result<(), TableError> {
        if log2_size == self.log2_size {
            return Ok(());
        }
        let mut next = Self::with_log2_segments(log2_size)?;
        for seg in self.segments.drain(..) {
            for (k, c) in seg {
                next.insert_unique(k, c);
            }
        }
        *self = next;
        Ok(())
    }

    /// Enforce a per-segment size cap.
    pub fn check_segment_sizes(&self, max: usize) -> Result<(), TableError> {
        for s in &self.segments {
            if s.len() > max {
                return Err(TableError::SegmentOverflow {
                    size: s.len(),
                    max,
                });
            }
        }
        Ok(())
    }
}

impl<K: TableKey, C> Default for SegmentedTable<K, C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A key that *is* its own hash.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct RawKey(u64);

    impl TableKey for RawKey {
        fn hash64(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn bucket_selection_by_low_bits() {
        let t: SegmentedTable<RawKey, i64> = SegmentedTable::with_log2_segments(3).unwrap();
        assert_eq!(t.n_segments(), 8);
        assert_eq!(t.segment_index(0b101_101), 0b101);
        assert_eq!(t.segment_index(u64::MAX), 7);

        let single = SegmentedTable::<RawKey, i64>::new();
        assert_eq!(single.segment_index(u64::MAX), 0);
    }

    #[test]
    fn insert_update_remove() {
        let mut t: SegmentedTable<RawKey, i64> = SegmentedTable::with_log2_segments(2).unwrap();
        assert!(t.insert_or_update(RawKey(9), || 5, |_| unreachable!()));
        assert!(!t.insert_or_update(RawKey(9), || unreachable!(), |c| *c += 7));
        assert_eq!(t.get(&RawKey(9)), Some(&12));
        assert_eq!(t.len(), 1);

        assert_eq!(t.remove(&RawKey(9)), Some(12));
        assert!(t.is_empty());
    }

    #[test]
    fn terms_live_in_their_home_segment() {
        let mut t: SegmentedTable<RawKey, i64> = SegmentedTable::with_log2_segments(2).unwrap();
        for h in 0..64u64 {
            t.insert_unique(RawKey(h), h as i64);
        }
        for (i, s) in t.segments().iter().enumerate() {
            assert_eq!(s.len(), 16);
            assert!(s.keys().all(|k| (k.0 & 3) as usize == i));
        }
    }

    #[test]
    fn rebucketing_preserves_terms() {
        let mut t: SegmentedTable<RawKey, i64> = SegmentedTable::new();
        for h in 0..100u64 {
            t.insert_unique(RawKey(h * 17), h as i64);
        }
        t.set_log2_segments(4).unwrap();
        assert_eq!(t.n_segments(), 16);
        assert_eq!(t.len(), 100);
        for h in 0..100u64 {
            assert_eq!(t.get(&RawKey(h * 17)), Some(&(h as i64)));
        }
        t.set_log2_segments(0).unwrap();
        assert_eq!(t.len(), 100);
    }

    #[test]
    fn segment_count_and_size_limits() {
        assert!(matches!(
            SegmentedTable::<RawKey, i64>::with_log2_segments(MAX_LOG2_SEGMENTS + 1),
            Err(TableError::TooManySegments { .. })
        ));

        let mut t: SegmentedTable<RawKey, i64> = SegmentedTable::new();
        for h in 0..10u64 {
            t.insert_unique(RawKey(h), 0);
        }
        assert!(t.check_segment_sizes(10).is_ok());
        assert!(matches!(
            t.check_segment_sizes(9),
            Err(TableError::SegmentOverflow { size: 10, max: 9 })
        ));
    }

    #[test]
    fn zero_sweep_with_retain() {
        let mut t: SegmentedTable<RawKey, i64> = SegmentedTable::with_log2_segments(2).unwrap();
        for h in 0..20u64 {
            t.insert_unique(RawKey(h), (h % 2) as i64);
        }
        t.retain(|_, c| *c != 0);
        assert_eq!(t.len(), 10);
        assert!(t.iter().all(|(_, c)| *c == 1));
    }
}
