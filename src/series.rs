//! Series container
//!
//! A series is a sum of `(key, coefficient)` terms over a symbol set, stored
//! in a [`SegmentedTable`]. This module owns the invariants every public
//! mutator re-establishes on exit:
//!
//! - every key in the table is compatible with the series' symbol set;
//! - keys are unique across all segments combined;
//! - no stored coefficient is zero once an operation has settled.
//!
//! The term-insertion primitive is compile-time parameterised by five flags
//! (`NEGATE`, `CHECK_ZERO`, `CHECK_COMPAT`, `CHECK_TABLE_SIZE`,
//! `ASSUME_UNIQUE`) so call sites that can prove a precondition skip the
//! corresponding check; the public `add_term`/`sub_term` run them all.
//!
//! The key protocol ([`Key`], [`DegreeKey`]) is what the multiplication
//! engine consumes; the packed monomial implements it, and any key type with
//! the same surface can ride the same machinery. Series themselves implement
//! [`Ring`], so a polynomial with polynomial coefficients (rank ≥ 2)
//! composes recursively with no extra code.

use std::fmt;
use std::hash::Hash;
use std::mem::size_of;

use crate::monomial::MonomialError;
use crate::ring::{Ring, RingDiv};
use crate::symbols::{SymbolIdx, SymbolIdxMap, SymbolSet};
use crate::table::{SegmentedTable, TableError, TableKey, MAX_TABLE_SIZE};

/// Errors raised by series operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SeriesError {
    /// The inserted key is not compatible with the series' symbol set.
    #[error("cannot add a term to the series: the term's key is not compatible with the series' symbol set")]
    IncompatibleKey,
    /// Storage failure (segment overflow or bad segmentation).
    #[error(transparent)]
    Table(#[from] TableError),
    /// Division of a series by the zero scalar.
    #[error("cannot divide a series by zero")]
    ZeroDivision,
    /// Conversion of a non-scalar series to a coefficient.
    #[error("cannot convert a series with {terms} term(s) to a coefficient: only the empty series and a single term with a unit key convert")]
    NonScalar {
        /// Number of terms in the series.
        terms: usize,
    },
    /// A generator name missing from the symbol set.
    #[error("cannot create the generator '{name}': it is not in the symbol set {symbols}")]
    UnknownSymbol {
        /// Requested generator name.
        name: String,
        /// The series' symbol set.
        symbols: String,
    },
    /// Key arithmetic failure bubbled up from the monomial layer.
    #[error(transparent)]
    Key(#[from] MonomialError),
}

// ============================================================================
// Key protocol
// ============================================================================

/// The contract a series key must satisfy.
///
/// Beyond storability ([`TableKey`]), a key knows how to align itself with a
/// (merged) symbol set, how to multiply, and how to check a whole
/// multiplication for exponent overflow up front.
pub trait Key: TableKey + Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Whether `hash64(a * b) == hash64(a) + hash64(b)` (mod 2^64). The
    /// parallel multiplier requires this; keys without it always take the
    /// simple path.
    const HOMOMORPHIC_HASH: bool;

    /// The unit key (exponents all zero) for a symbol set.
    fn unit(ss: &SymbolSet) -> Self;
    /// The key with a single unit exponent at `idx`.
    fn variable(ss: &SymbolSet, idx: SymbolIdx) -> Result<Self, MonomialError>;
    /// Whether this is the unit key.
    fn is_unit(&self, ss: &SymbolSet) -> bool;
    /// Whether the key annihilates any term it appears in. Packed monomials
    /// are never zero; key families with a vanishing element override this.
    fn is_zero(&self, ss: &SymbolSet) -> bool {
        let _ = ss;
        false
    }
    /// Compatibility with a symbol set.
    fn is_compatible(&self, ss: &SymbolSet) -> bool;
    /// Realign to a merged symbol set (see [`SymbolSet::merge`]).
    fn merge_symbols(&self, ins_map: &SymbolIdxMap<SymbolSet>, ss: &SymbolSet) -> Self;
    /// Key multiplication into `out`.
    fn mul_into(out: &mut Self, a: &Self, b: &Self, ss: &SymbolSet);
    /// Whether all pairwise products of the two key ranges stay
    /// representable. Keys without a meaningful check may return `true`.
    fn range_overflow_check(r1: &[&Self], r2: &[&Self], ss: &SymbolSet) -> bool {
        let _ = (r1, r2, ss);
        true
    }
    /// Approximate in-memory footprint in bytes.
    fn byte_size(&self) -> usize;
    /// Plain-text rendering against a symbol set. Diagnostics only.
    fn fmt_pretty(&self, ss: &SymbolSet) -> String;
}

/// Keys with a (total and partial) degree, enabling degree-truncated
/// multiplication.
pub trait DegreeKey: Key {
    /// The degree scalar.
    type Degree: Copy
        + Ord
        + fmt::Debug
        + fmt::Display
        + Send
        + Sync
        + 'static
        + num_traits::CheckedAdd
        + num_traits::Zero;

    /// Total degree (overflow-checked).
    fn degree(&self, ss: &SymbolSet) -> Result<Self::Degree, MonomialError>;
    /// Partial degree over the sorted symbol indices `si` (overflow-checked).
    fn p_degree(&self, si: &[SymbolIdx], ss: &SymbolSet) -> Result<Self::Degree, MonomialError>;
}

// ============================================================================
// The series
// ============================================================================

/// A multi-term sum over `(key, coefficient)` pairs.
#[derive(Debug, Clone)]
pub struct Series<K: TableKey, C> {
    symbols: SymbolSet,
    table: SegmentedTable<K, C>,
}

impl<K: Key, C: Ring> Series<K, C> {
    /// The empty series over a symbol set.
    pub fn new(symbols: SymbolSet) -> Self {
        Self {
            symbols,
            table: SegmentedTable::new(),
        }
    }

    /// A series holding the single term `c * 1`; a zero coefficient yields
    /// the empty series.
    pub fn constant(symbols: SymbolSet, c: C) -> Self {
        let mut s = Self::new(symbols);
        if !c.is_zero() {
            s.table.insert_unique(K::unit(&s.symbols), c);
        }
        s
    }

    /// The generator `name` (coefficient one, unit exponent) over `symbols`.
    pub fn variable(symbols: SymbolSet, name: &str) -> Result<Self, SeriesError> {
        let idx = symbols
            .index_of(name)
            .ok_or_else(|| SeriesError::UnknownSymbol {
                name: name.to_owned(),
                symbols: symbols.to_string(),
            })?;
        let key = K::variable(&symbols, idx)?;
        let mut s = Self::new(symbols);
        s.table.insert_unique(key, C::one());
        Ok(s)
    }

    // Assemble a series from parts the engine built; the caller guarantees
    // the invariants.
    pub(crate) fn from_parts(symbols: SymbolSet, table: SegmentedTable<K, C>) -> Self {
        Self { symbols, table }
    }

    /// The series' symbol set.
    #[inline]
    pub fn symbol_set(&self) -> &SymbolSet {
        &self.symbols
    }

    /// Number of terms.
    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the series has no terms.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Drop all terms, keeping the symbol set and segmentation.
    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Iterate the terms.
    pub fn terms(&self) -> impl Iterator<Item = (&K, &C)> {
        self.table.iter()
    }

    /// Coefficient of `key`, if the term is present.
    pub fn coefficient(&self, key: &K) -> Option<&C> {
        self.table.get(key)
    }

    /// Log2 of the storage's segment count.
    #[inline]
    pub fn log2_segments(&self) -> u32 {
        self.table.log2_segments()
    }

    #[cfg(test)]
    pub(crate) fn set_log2_segments(&mut self, l: u32) -> Result<(), SeriesError> {
        self.table.set_log2_segments(l)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Term insertion
    // ------------------------------------------------------------------

    /// Insert-or-accumulate a term, with every flag-selectable check
    /// compiled in or out:
    ///
    /// - `NEGATE`: subtract instead of add;
    /// - `CHECK_ZERO`: skip terms with a zero coefficient or a zero key;
    /// - `CHECK_COMPAT`: verify key compatibility with the symbol set;
    /// - `CHECK_TABLE_SIZE`: enforce the per-segment size cap;
    /// - `ASSUME_UNIQUE`: the key is known absent, insert directly.
    ///
    /// Accumulation that annihilates a coefficient removes the term, keeping
    /// the zero-freeness invariant.
    pub(crate) fn add_term_impl<
        const NEGATE: bool,
        const CHECK_ZERO: bool,
        const CHECK_COMPAT: bool,
        const CHECK_TABLE_SIZE: bool,
        const ASSUME_UNIQUE: bool,
    >(
        &mut self,
        key: K,
        mut cf: C,
    ) -> Result<(), SeriesError> {
        if CHECK_COMPAT && !key.is_compatible(&self.symbols) {
            return Err(SeriesError::IncompatibleKey);
        }
        if CHECK_ZERO && (cf.is_zero() || key.is_zero(&self.symbols)) {
            return Ok(());
        }
        if NEGATE {
            cf.neg_assign();
        }

        if ASSUME_UNIQUE {
            self.table.insert_unique(key, cf);
        } else if let Some(slot) = self.table.get_mut(&key) {
            slot.add_assign_ref(&cf);
            if slot.is_zero() {
                self.table.remove(&key);
            }
        } else {
            self.table.insert_unique(key, cf);
        }

        if CHECK_TABLE_SIZE {
            self.table.check_segment_sizes(MAX_TABLE_SIZE)?;
        }
        Ok(())
    }

    /// Add a term (all checks on).
    pub fn add_term(&mut self, key: K, cf: C) -> Result<(), SeriesError> {
        self.add_term_impl::<false, true, true, true, false>(key, cf)
    }

    /// Subtract a term (all checks on).
    pub fn sub_term(&mut self, key: K, cf: C) -> Result<(), SeriesError> {
        self.add_term_impl::<true, true, true, true, false>(key, cf)
    }

    // ------------------------------------------------------------------
    // Scalar arithmetic
    // ------------------------------------------------------------------

    /// Multiply every coefficient by `c`, sweeping terms a zero-divisor
    /// annihilates.
    pub fn mul_scalar(&self, c: &C) -> Self {
        if c.is_zero() {
            return Self::new(self.symbols.clone());
        }
        let mut out = self.clone();
        for (_, cf) in out.table.iter_mut() {
            *cf = cf.mul_ref(c);
        }
        out.table.retain(|_, cf| !cf.is_zero());
        out
    }

    /// Divide every coefficient by `c`.
    pub fn div_scalar(&self, c: &C) -> Result<Self, SeriesError>
    where
        C: RingDiv,
    {
        if c.is_zero() {
            return Err(SeriesError::ZeroDivision);
        }
        let mut out = self.clone();
        for (_, cf) in out.table.iter_mut() {
            *cf = cf
                .checked_div_ref(c)
                .expect("non-zero divisor was checked above");
        }
        out.table.retain(|_, cf| !cf.is_zero());
        Ok(out)
    }

    /// Add a scalar (a `c * 1` term).
    pub fn add_scalar(&self, c: &C) -> Self {
        let mut out = self.clone();
        out.add_term_impl::<false, true, false, false, false>(K::unit(&out.symbols), c.clone())
            .expect("no checked failure path is enabled");
        out
    }

    /// Subtract a scalar.
    pub fn sub_scalar(&self, c: &C) -> Self {
        let mut out = self.clone();
        out.add_term_impl::<true, true, false, false, false>(K::unit(&out.symbols), c.clone())
            .expect("no checked failure path is enabled");
        out
    }

    // ------------------------------------------------------------------
    // Series arithmetic
    // ------------------------------------------------------------------

    // Re-home every term onto a merged symbol set.
    pub(crate) fn extended(&self, merged: &SymbolSet, ins_map: &SymbolIdxMap<SymbolSet>) -> Self {
        if ins_map.is_empty() {
            let mut out = self.clone();
            out.symbols = merged.clone();
            return out;
        }
        let mut out = Self::new(merged.clone());
        // Distinct keys stay distinct under symbol insertion.
        for (k, c) in self.terms() {
            out.table
                .insert_unique(k.merge_symbols(ins_map, &self.symbols), c.clone());
        }
        out
    }

    fn combined(&self, rhs: &Self, negate_rhs: bool) -> Self {
        if self.symbols == rhs.symbols {
            let mut out = self.clone();
            for (k, c) in rhs.terms() {
                let r = if negate_rhs {
                    out.add_term_impl::<true, true, false, false, false>(k.clone(), c.clone())
                } else {
                    out.add_term_impl::<false, true, false, false, false>(k.clone(), c.clone())
                };
                r.expect("no checked failure path is enabled");
            }
            out
        } else {
            let (merged, ins_a, ins_b) = self.symbols.merge(&rhs.symbols);
            self.extended(&merged, &ins_a)
                .combined(&rhs.extended(&merged, &ins_b), negate_rhs)
        }
    }

    // ------------------------------------------------------------------
    // Conversions
    // ------------------------------------------------------------------

    /// Whether the series is representable by a bare coefficient: empty, or
    /// a single term with the unit key.
    pub fn is_single_cf(&self) -> bool {
        self.is_empty()
            || (self.len() == 1
                && self
                    .terms()
                    .next()
                    .map_or(false, |(k, _)| k.is_unit(&self.symbols)))
    }

    /// Convert to a coefficient. The empty series converts to zero and a
    /// single term with the unit key converts to its coefficient; anything
    /// else fails, including a single term with a non-unit key, whose
    /// conversion would silently drop the monomial.
    pub fn to_cf(&self) -> Result<C, SeriesError> {
        if self.is_empty() {
            return Ok(C::zero());
        }
        if self.len() == 1 {
            let (k, c) = self.terms().next().expect("series has one term");
            if k.is_unit(&self.symbols) {
                return Ok(c.clone());
            }
        }
        Err(SeriesError::NonScalar { terms: self.len() })
    }
}

// ============================================================================
// Operators
// ============================================================================

impl<K: Key, C: Ring> PartialEq for Series<K, C> {
    fn eq(&self, other: &Self) -> bool {
        self.symbols == other.symbols
            && self.len() == other.len()
            && self
                .terms()
                .all(|(k, c)| other.table.get(k).map_or(false, |oc| oc == c))
    }
}

impl<K: Key, C: Ring> std::ops::Add for &Series<K, C> {
    type Output = Series<K, C>;
    fn add(self, rhs: Self) -> Series<K, C> {
        self.combined(rhs, false)
    }
}

impl<K: Key, C: Ring> std::ops::Sub for &Series<K, C> {
    type Output = Series<K, C>;
    fn sub(self, rhs: Self) -> Series<K, C> {
        self.combined(rhs, true)
    }
}

impl<K: Key, C: Ring> std::ops::Add for Series<K, C> {
    type Output = Series<K, C>;
    fn add(self, rhs: Self) -> Series<K, C> {
        &self + &rhs
    }
}

impl<K: Key, C: Ring> std::ops::Sub for Series<K, C> {
    type Output = Series<K, C>;
    fn sub(self, rhs: Self) -> Series<K, C> {
        &self - &rhs
    }
}

impl<K: Key, C: Ring> std::ops::Neg for Series<K, C> {
    type Output = Series<K, C>;
    fn neg(mut self) -> Series<K, C> {
        for (_, c) in self.table.iter_mut() {
            c.neg_assign();
        }
        self
    }
}

/// Multiplication through the engine.
///
/// Panics on exponent overflow; use [`crate::mul::mul`] for the checked
/// form.
impl<K: DegreeKey, C: Ring> std::ops::Mul for &Series<K, C> {
    type Output = Series<K, C>;
    fn mul(self, rhs: Self) -> Series<K, C> {
        crate::mul::mul(self, rhs).expect("series multiplication failed")
    }
}

impl<K: DegreeKey, C: Ring> std::ops::Mul for Series<K, C> {
    type Output = Series<K, C>;
    fn mul(self, rhs: Self) -> Series<K, C> {
        &self * &rhs
    }
}

impl<K: Key, C: Ring> fmt::Display for Series<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "0");
        }
        // Sort the rendered terms for a deterministic output.
        let mut parts: Vec<String> = self
            .terms()
            .map(|(k, c)| {
                if k.is_unit(&self.symbols) {
                    format!("{c}")
                } else {
                    format!("{c}*{}", k.fmt_pretty(&self.symbols))
                }
            })
            .collect();
        parts.sort_unstable();
        write!(f, "{}", parts.join(" + "))
    }
}

// ============================================================================
// Series as a coefficient ring (rank >= 2 composition)
// ============================================================================

impl<K: DegreeKey, C: Ring> Ring for Series<K, C> {
    fn zero() -> Self {
        Series::new(SymbolSet::new())
    }
    fn one() -> Self {
        Series::constant(SymbolSet::new(), C::one())
    }
    fn is_zero(&self) -> bool {
        self.is_empty()
    }
    fn add_assign_ref(&mut self, rhs: &Self) {
        *self = self.combined(rhs, false);
    }
    fn sub_assign_ref(&mut self, rhs: &Self) {
        *self = self.combined(rhs, true);
    }
    fn neg_assign(&mut self) {
        for (_, c) in self.table.iter_mut() {
            c.neg_assign();
        }
    }
    fn mul_ref(&self, rhs: &Self) -> Self {
        crate::mul::mul(self, rhs).expect("series coefficient multiplication failed")
    }
    fn byte_size(&self) -> usize {
        size_of::<Self>()
            + self
                .terms()
                .map(|(k, c)| k.byte_size() + c.byte_size())
                .sum::<usize>()
    }
}

// ============================================================================
// Tests
// ============================================================================
