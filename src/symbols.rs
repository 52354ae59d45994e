//! Symbol sets
//!
//! An ordered set of variable names, plus the two set-algebra helpers the
//! rest of the crate leans on:
//!
//! - **merge**: union of two sets together with one *insertion map* per
//!   input, telling the packed-monomial layer where (and how many) zero
//!   exponents must be spliced in so that an old monomial stays aligned with
//!   the merged set;
//! - **index intersection**: the sorted positions, within a reference set, of
//!   the symbols shared with another set (partial-degree truncation turns an
//!   "active variables" set into such an index list).
//!
//! Symbols are kept sorted, so index lookup is a binary search and the merge
//! is a linear two-pointer pass.

use std::fmt;

/// Index of a symbol inside a [`SymbolSet`].
pub type SymbolIdx = usize;

/// A sorted list of symbol indices.
pub type SymbolIdxSet = Vec<SymbolIdx>;

/// A sorted association list keyed by symbol index.
///
/// For insertion maps the convention follows the merge operation: an entry
/// `(i, v)` means "insert `v` *before* position `i` of the original set";
/// `i` may equal the set's length, meaning "append at the end".
pub type SymbolIdxMap<V> = Vec<(SymbolIdx, V)>;

/// An ordered set of symbol names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SymbolSet {
    // Strictly increasing.
    syms: Vec<String>,
}

impl SymbolSet {
    /// The empty symbol set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of symbols.
    #[inline]
    pub fn len(&self) -> usize {
        self.syms.len()
    }

    /// Whether the set is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    /// Iterate over the names in order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &str> {
        self.syms.iter().map(String::as_str)
    }

    /// The name at position `idx`, if any.
    #[inline]
    pub fn nth(&self, idx: SymbolIdx) -> Option<&str> {
        self.syms.get(idx).map(String::as_str)
    }

    /// Position of `name`, if present. O(log n).
    #[inline]
    pub fn index_of(&self, name: &str) -> Option<SymbolIdx> {
        self.syms.binary_search_by(|s| s.as_str().cmp(name)).ok()
    }

    /// Whether `name` is in the set.
    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// Union with `other`, plus the insertion maps realigning monomials
    /// compatible with `self` (resp. `other`) to the merged set.
    pub fn merge(&self, other: &SymbolSet) -> (SymbolSet, SymbolIdxMap<SymbolSet>, SymbolIdxMap<SymbolSet>) {
        let mut merged = Vec::with_capacity(self.len() + other.len());
        let mut ins_self: SymbolIdxMap<SymbolSet> = Vec::new();
        let mut ins_other: SymbolIdxMap<SymbolSet> = Vec::new();

        // Record that `name` must be inserted before position `idx` of the
        // original set the map belongs to.
        fn note(map: &mut SymbolIdxMap<SymbolSet>, idx: SymbolIdx, name: &str) {
            match map.last_mut() {
                Some((i, set)) if *i == idx => set.syms.push(name.to_owned()),
                _ => map.push((
                    idx,
                    SymbolSet {
                        syms: vec![name.to_owned()],
                    },
                )),
            }
        }

        let (mut i, mut j) = (0usize, 0usize);
        while i < self.len() || j < other.len() {
            match (self.syms.get(i), other.syms.get(j)) {
                (Some(a), Some(b)) if a == b => {
                    merged.push(a.clone());
                    i += 1;
                    j += 1;
                }
                (Some(a), Some(b)) if a < b => {
                    merged.push(a.clone());
                    note(&mut ins_other, j, a);
                    i += 1;
                }
                (Some(_), Some(b)) => {
                    merged.push(b.clone());
                    note(&mut ins_self, i, b);
                    j += 1;
                }
                (Some(a), None) => {
                    merged.push(a.clone());
                    note(&mut ins_other, j, a);
                    i += 1;
                }
                (None, Some(b)) => {
                    merged.push(b.clone());
                    note(&mut ins_self, i, b);
                    j += 1;
                }
                (None, None) => unreachable!(),
            }
        }

        (SymbolSet { syms: merged }, ins_self, ins_other)
    }

    /// Sorted positions, within `self`, of the symbols also present in
    /// `other`.
    pub fn intersection_indices(&self, other: &SymbolSet) -> SymbolIdxSet {
        let mut out = Vec::new();
        let (mut i, mut j) = (0usize, 0usize);
        while i < self.len() && j < other.len() {
            match self.syms[i].cmp(&other.syms[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    out.push(i);
                    i += 1;
                    j += 1;
                }
            }
        }
        out
    }
}

impl<S: Into<String>> FromIterator<S> for SymbolSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut syms: Vec<String> = iter.into_iter().map(Into::into).collect();
        syms.sort_unstable();
        syms.dedup();
        SymbolSet { syms }
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for SymbolSet {
    fn from(names: [S; N]) -> Self {
        names.into_iter().collect()
    }
}

impl fmt::Display for SymbolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, s) in self.syms.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "'{s}'")?;
        }
        write!(f, "}}")
    }
}
