//! Dynamic packed monomials
//!
//! A monomial over `n` variables is stored as `ceil(n / PSIZE)` Kronecker
//! chunks, each chunk packing `PSIZE = bits(T) / NBITS` exponents through the
//! codec in [`crate::kpack`]. The representation is parameterised by the
//! chunk scalar `T` and the per-exponent bit budget `NBITS in [3, bits(T)]`;
//! `NBITS == bits(T)` degenerates into one unpacked exponent per chunk, in
//! which case the full range of `T` is admitted and no limit checks apply.
//!
//! ## Invariants
//!
//! - A monomial is *compatible* with a symbol set of size `n` when it holds
//!   exactly `ceil(n / PSIZE)` chunks and every chunk lies inside the coded
//!   range for packing size `PSIZE` (skipped when `NBITS == bits(T)`).
//!   All operations below require compatibility unless stated otherwise.
//! - **Homomorphic hash.** `hash64` is the wrapping sum of the chunks, so
//!   `hash64(a * b) == hash64(a) + hash64(b)` (mod 2^64) by the codec's
//!   additivity. The parallel multiplier's bucket algebra rests on this.
//! - Multiplication is chunk-wise addition; callers that cannot guarantee
//!   in-range products must run [`DPackedMonomial::range_overflow_check`]
//!   first (the multiplication engine does).

use std::hash::{Hash, Hasher};
use std::mem::size_of;

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{CheckedAdd, Zero};
use smallvec::SmallVec;

use crate::kpack::{KPackable, KPacker, KUnpacker, KpackError};
use crate::ring::{ring_pow, RingDiv};
use crate::series::{DegreeKey, Key};
use crate::symbols::{SymbolIdx, SymbolIdxMap, SymbolIdxSet, SymbolSet};
use crate::table::TableKey;

/// Errors raised by packed-monomial operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MonomialError {
    /// Codec failure (component or coded value out of range, etc.).
    #[error(transparent)]
    Pack(#[from] KpackError),
    /// The degree accumulation overflowed the exponent type.
    #[error("overflow while accumulating the degree of a packed monomial")]
    DegreeOverflow,
    /// Differentiation would underflow the most-negative exponent.
    #[error("overflow while differentiating a packed monomial: the exponent of '{symbol}' is too small ({exponent})")]
    DiffOverflow {
        /// Variable being differentiated.
        symbol: String,
        /// Its current exponent.
        exponent: i128,
    },
    /// Integration would overflow the largest exponent.
    #[error("overflow while integrating a packed monomial: the exponent of '{symbol}' is too large ({exponent})")]
    IntegrateOverflow {
        /// Variable being integrated.
        symbol: String,
        /// Its current exponent.
        exponent: i128,
    },
    /// Integrating an exponent of -1 would produce a logarithmic term.
    #[error("cannot integrate a packed monomial: the exponent of '{symbol}' is -1, and the integration would generate a logarithmic term")]
    LogarithmicTerm {
        /// Variable being integrated.
        symbol: String,
    },
    /// The exponent of a monomial exponentiation is not an integer.
    #[error("invalid exponent for monomial exponentiation: the exponent ({value}) is not an integral value")]
    NonIntegralExponent {
        /// The rejected exponent.
        value: BigRational,
    },
    /// A component of a monomial exponentiation is not representable.
    #[error("overflow in monomial exponentiation: the component {value} cannot be represented")]
    PowOverflow {
        /// The unrepresentable component.
        value: BigInt,
    },
    /// A negative substitution exponent met a non-invertible value.
    #[error("a negative exponent met a non-invertible value during monomial substitution")]
    NonInvertible,
}

/// Exponent arguments accepted by [`DPackedMonomial::pow`].
///
/// Integers convert losslessly; a rational converts only when it is an
/// integer, otherwise the exponentiation is rejected.
pub trait IntoExponent {
    /// Convert into an arbitrary-precision integer exponent.
    fn into_exponent(self) -> Result<BigInt, MonomialError>;
}

macro_rules! impl_into_exponent {
    ($($t:ty),*) => {$(
        impl IntoExponent for $t {
            fn into_exponent(self) -> Result<BigInt, MonomialError> {
                Ok(BigInt::from(self))
            }
        }
    )*};
}

impl_into_exponent!(i32, u32, i64, u64, usize, isize);

impl IntoExponent for BigInt {
    fn into_exponent(self) -> Result<BigInt, MonomialError> {
        Ok(self)
    }
}

impl IntoExponent for &BigInt {
    fn into_exponent(self) -> Result<BigInt, MonomialError> {
        Ok(self.clone())
    }
}

impl IntoExponent for &BigRational {
    fn into_exponent(self) -> Result<BigInt, MonomialError> {
        if self.is_integer() {
            Ok(self.to_integer())
        } else {
            Err(MonomialError::NonIntegralExponent {
                value: self.clone(),
            })
        }
    }
}

// ============================================================================
// The monomial
// ============================================================================

/// A dynamic packed monomial: a sequence of Kronecker-packed exponent chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DPackedMonomial<T: KPackable, const NBITS: u32> {
    chunks: SmallVec<[T; 1]>,
}

impl<T: KPackable, const NBITS: u32> Default for DPackedMonomial<T, NBITS> {
    fn default() -> Self {
        Self {
            chunks: SmallVec::new(),
        }
    }
}

// Iterator over the exponents encoded in one chunk.
enum ChunkExps<T: KPackable> {
    // NBITS == bits(T): the chunk is the exponent.
    Identity(Option<T>),
    Packed(KUnpacker<T>),
}

impl<T: KPackable> Iterator for ChunkExps<T> {
    type Item = T;

    #[inline]
    fn next(&mut self) -> Option<T> {
        match self {
            ChunkExps::Identity(v) => v.take(),
            ChunkExps::Packed(ku) => ku.next(),
        }
    }
}

impl<T: KPackable, const NBITS: u32> DPackedMonomial<T, NBITS> {
    /// Number of exponents packed into each chunk.
    pub const PSIZE: u32 = {
        assert!(NBITS >= 3, "NBITS must be at least 3");
        assert!(NBITS <= T::BITS, "NBITS cannot exceed the scalar width");
        T::BITS / NBITS
    };

    // Whether chunks bypass the codec entirely.
    const IDENTITY: bool = NBITS == T::BITS;

    #[inline]
    fn nchunks_for(n_symbols: usize) -> usize {
        let ps = Self::PSIZE as usize;
        n_symbols / ps + usize::from(n_symbols % ps != 0)
    }

    #[inline]
    fn chunk_exps(chunk: T) -> ChunkExps<T> {
        if Self::IDENTITY {
            ChunkExps::Identity(Some(chunk))
        } else {
            // All operations require a compatible monomial, which puts every
            // chunk inside the coded range.
            ChunkExps::Packed(
                KUnpacker::new(chunk, Self::PSIZE).expect("monomial chunk outside the coded range"),
            )
        }
    }

    // Pack one window of exponents through the checked codec.
    fn pack_window(window: &[T]) -> Result<T, KpackError> {
        debug_assert!(window.len() <= Self::PSIZE as usize);
        if Self::IDENTITY {
            return Ok(window.first().copied().unwrap_or(T::ZERO));
        }
        let mut kp = KPacker::new(Self::PSIZE)?;
        for &c in window {
            kp.push(c)?;
        }
        Ok(kp.get())
    }

    // Re-pack exponents that are already known to be in range (they came out
    // of an unpack and were not changed, or were zeroed).
    fn pack_window_raw(window: &[T]) -> T {
        debug_assert!(window.len() <= Self::PSIZE as usize);
        if Self::IDENTITY {
            return window.first().copied().unwrap_or(T::ZERO);
        }
        let delta = T::delta(Self::PSIZE);
        let mut value = T::ZERO;
        let mut prod = T::ONE;
        for (i, &c) in window.iter().enumerate() {
            value = value.wrapping_add(c.wrapping_mul(prod));
            if i + 1 < window.len() {
                prod = prod.wrapping_mul(delta);
            }
        }
        value
    }

    fn from_exponents_raw(exps: &[T]) -> Self {
        Self {
            chunks: exps
                .chunks(Self::PSIZE as usize)
                .map(Self::pack_window_raw)
                .collect(),
        }
    }

    /// The unit monomial (all exponents zero) for a symbol set.
    pub fn unit(ss: &SymbolSet) -> Self {
        Self {
            chunks: SmallVec::from_elem(T::ZERO, Self::nchunks_for(ss.len())),
        }
    }

    /// Pack a monomial from a slice of exponents, one per symbol.
    pub fn from_exponents(exps: &[T]) -> Result<Self, MonomialError> {
        let mut chunks = SmallVec::with_capacity(Self::nchunks_for(exps.len()));
        for window in exps.chunks(Self::PSIZE as usize) {
            chunks.push(Self::pack_window(window)?);
        }
        Ok(Self { chunks })
    }

    /// Pack a monomial from an iterator of exponents.
    pub fn from_exponents_iter<I>(exps: I) -> Result<Self, MonomialError>
    where
        I: IntoIterator<Item = T>,
    {
        let v: Vec<T> = exps.into_iter().collect();
        Self::from_exponents(&v)
    }

    /// Raw chunk access (tests and diagnostics).
    pub fn chunks(&self) -> &[T] {
        &self.chunks
    }

    /// Iterate the decoded exponents, one per symbol of `ss`.
    pub fn exponents<'a>(&'a self, ss: &SymbolSet) -> impl Iterator<Item = T> + 'a {
        let n = ss.len();
        self.chunks
            .iter()
            .flat_map(move |&c| Self::chunk_exps(c))
            .take(n)
    }

    /// Whether all exponents are zero.
    pub fn is_unit(&self) -> bool {
        self.chunks.iter().all(|&c| c == T::ZERO)
    }

    /// Compatibility with a symbol set: chunk count and coded-range checks
    /// (the latter skipped when `NBITS == bits(T)`).
    pub fn is_compatible(&self, ss: &SymbolSet) -> bool {
        if self.chunks.len() != Self::nchunks_for(ss.len()) {
            return false;
        }
        if Self::IDENTITY {
            return true;
        }
        let (lo, hi) = (T::klim_min(Self::PSIZE), T::klim_max(Self::PSIZE));
        self.chunks.iter().all(|&c| c >= lo && c <= hi)
    }

    /// The homomorphic hash: wrapping sum of the chunks.
    #[inline]
    pub fn hash64(&self) -> u64 {
        self.chunks
            .iter()
            .fold(0u64, |h, &c| h.wrapping_add(c.as_u64()))
    }

    /// Multiply `a` by `b` into `out` (chunk-wise exponent addition).
    ///
    /// Requires `a` and `b` compatible with `ss` and an in-range product;
    /// the multiplication engine establishes the latter through
    /// [`Self::range_overflow_check`].
    #[inline]
    pub fn mul_into(out: &mut Self, a: &Self, b: &Self, _ss: &SymbolSet) {
        debug_assert_eq!(a.chunks.len(), b.chunks.len());
        out.chunks.clear();
        out.chunks
            .extend(a.chunks.iter().zip(&b.chunks).map(|(&x, &y)| x.wrapping_add(y)));
    }

    /// Total degree: the overflow-checked sum of all exponents.
    pub fn degree(&self, ss: &SymbolSet) -> Result<T, MonomialError> {
        let mut acc = T::ZERO;
        for e in self.exponents(ss) {
            acc = acc.checked_add(e).ok_or(MonomialError::DegreeOverflow)?;
        }
        Ok(acc)
    }

    /// Partial degree: the overflow-checked sum of the exponents at the
    /// (sorted) indices in `si`.
    pub fn p_degree(&self, si: &[SymbolIdx], ss: &SymbolSet) -> Result<T, MonomialError> {
        debug_assert!(si.windows(2).all(|w| w[0] < w[1]));
        debug_assert!(si.last().map_or(true, |&l| l < ss.len()));
        let mut acc = T::ZERO;
        let mut it = si.iter().peekable();
        for (i, e) in self.exponents(ss).enumerate() {
            match it.peek() {
                None => break,
                Some(&&idx) if idx == i => {
                    acc = acc.checked_add(e).ok_or(MonomialError::DegreeOverflow)?;
                    it.next();
                }
                _ => {}
            }
        }
        Ok(acc)
    }

    /// Rebuild the monomial against a merged symbol set, splicing in zero
    /// exponents at the positions dictated by `ins_map`.
    pub fn merge_symbols(&self, ins_map: &SymbolIdxMap<SymbolSet>, ss: &SymbolSet) -> Self {
        debug_assert!(self.is_compatible(ss));
        debug_assert!(ins_map.last().map_or(true, |(i, _)| *i <= ss.len()));

        let extra: usize = ins_map.iter().map(|(_, s)| s.len()).sum();
        let mut tmp: Vec<T> = Vec::with_capacity(ss.len() + extra);
        let mut map_it = ins_map.iter().peekable();
        for (i, e) in self.exponents(ss).enumerate() {
            if let Some((idx, set)) = map_it.peek() {
                if *idx == i {
                    tmp.resize(tmp.len() + set.len(), T::ZERO);
                    map_it.next();
                }
            }
            tmp.push(e);
        }
        // Symbols appended past the end of the original set.
        if let Some((idx, set)) = map_it.next() {
            debug_assert_eq!(*idx, ss.len());
            tmp.resize(tmp.len() + set.len(), T::ZERO);
            debug_assert!(map_it.next().is_none());
        }
        Self::from_exponents_raw(&tmp)
    }

    /// Raise the monomial to an integral power: every exponent is multiplied
    /// by `e` in arbitrary precision and the result re-packed.
    pub fn pow<E: IntoExponent>(&self, e: E, ss: &SymbolSet) -> Result<Self, MonomialError> {
        let exp = e.into_exponent()?;
        let mut out: Vec<T> = Vec::with_capacity(ss.len());
        for x in self.exponents(ss) {
            let v = BigInt::from(x.to_i128()) * &exp;
            let t = i128::try_from(&v)
                .ok()
                .and_then(T::from_i128_checked)
                .ok_or_else(|| MonomialError::PowOverflow { value: v.clone() })?;
            out.push(t);
        }
        Self::from_exponents(&out)
    }

    /// Partial derivative along the variable at `idx`: returns the original
    /// exponent and the decremented monomial. An exponent of zero returns
    /// `(0, self)` unchanged.
    pub fn diff(&self, idx: SymbolIdx, ss: &SymbolSet) -> Result<(T, Self), MonomialError> {
        assert!(idx < ss.len(), "differentiation index out of range");

        let mut exps: Vec<T> = self.exponents(ss).collect();
        let e = exps[idx];
        if e == T::ZERO {
            return Ok((T::ZERO, self.clone()));
        }
        if e == T::MIN {
            return Err(MonomialError::DiffOverflow {
                symbol: ss.nth(idx).unwrap_or_default().to_owned(),
                exponent: e.to_i128(),
            });
        }
        exps[idx] = e
            .checked_sub(T::ONE)
            .expect("decrement cannot fail above the type minimum");
        Ok((e, Self::from_exponents(&exps)?))
    }

    /// Antiderivative along the variable at `idx`: returns the incremented
    /// exponent and the incremented monomial.
    pub fn integrate(&self, idx: SymbolIdx, ss: &SymbolSet) -> Result<(T, Self), MonomialError> {
        assert!(idx < ss.len(), "integration index out of range");

        let mut exps: Vec<T> = self.exponents(ss).collect();
        let e = exps[idx];
        if let Some(neg_one) = T::from_i128_checked(-1) {
            if e == neg_one {
                return Err(MonomialError::LogarithmicTerm {
                    symbol: ss.nth(idx).unwrap_or_default().to_owned(),
                });
            }
        }
        if e == T::MAX {
            return Err(MonomialError::IntegrateOverflow {
                symbol: ss.nth(idx).unwrap_or_default().to_owned(),
                exponent: e.to_i128(),
            });
        }
        let new = e
            .checked_add(T::ONE)
            .expect("increment cannot fail below the type maximum");
        exps[idx] = new;
        Ok((new, Self::from_exponents(&exps)?))
    }

    /// Evaluate the monomial: the product of `value^exponent` over every
    /// variable, with `values` supplying one value per symbol of `ss`.
    ///
    /// Negative exponents require the values to be invertible.
    pub fn evaluate<C: RingDiv>(
        &self,
        values: &SymbolIdxMap<C>,
        ss: &SymbolSet,
    ) -> Result<C, MonomialError> {
        debug_assert_eq!(values.len(), ss.len());
        debug_assert!(values.iter().enumerate().all(|(i, (idx, _))| i == *idx));

        let mut acc = C::one();
        for (e, (_, value)) in self.exponents(ss).zip(values) {
            let p = ring_pow(value, e.to_i128()).ok_or(MonomialError::NonInvertible)?;
            acc = acc.mul_ref(&p);
        }
        Ok(acc)
    }

    /// Substitute values for the variables at the indices of `sm`: the
    /// returned ring element accumulates `value^exponent` for every
    /// substituted slot, and those slots are zeroed in the returned monomial.
    pub fn subs<C: RingDiv>(
        &self,
        sm: &SymbolIdxMap<C>,
        ss: &SymbolSet,
    ) -> Result<(C, Self), MonomialError> {
        debug_assert!(sm.last().map_or(true, |(i, _)| *i < ss.len()));

        let mut exps: Vec<T> = self.exponents(ss).collect();
        let mut acc = C::one();
        for (idx, value) in sm {
            let e = exps[*idx];
            let p = ring_pow(value, e.to_i128()).ok_or(MonomialError::NonInvertible)?;
            acc = acc.mul_ref(&p);
            exps[*idx] = T::ZERO;
        }
        Ok((acc, Self::from_exponents_raw(&exps)))
    }

    /// Clear `mask[i]` for every variable whose exponent is non-zero; used
    /// by the series layer to identify trimmable symbols.
    pub fn trim_identify(&self, mask: &mut [bool], ss: &SymbolSet) {
        debug_assert_eq!(mask.len(), ss.len());
        for (i, e) in self.exponents(ss).enumerate() {
            if e != T::ZERO {
                mask[i] = false;
            }
        }
    }

    /// Drop the exponents at the (sorted) indices in `si` and re-pack.
    pub fn trim(&self, si: &SymbolIdxSet, ss: &SymbolSet) -> Self {
        debug_assert!(si.windows(2).all(|w| w[0] < w[1]));
        debug_assert!(si.last().map_or(true, |&l| l < ss.len()));

        let mut tmp: Vec<T> = Vec::with_capacity(ss.len().saturating_sub(si.len()));
        let mut it = si.iter().peekable();
        for (i, e) in self.exponents(ss).enumerate() {
            if it.peek() == Some(&&i) {
                it.next();
            } else {
                tmp.push(e);
            }
        }
        Self::from_exponents_raw(&tmp)
    }

    /// In-memory footprint, including any heap spill of the chunk vector.
    pub fn byte_size(&self) -> usize {
        let spill = if self.chunks.spilled() {
            self.chunks.capacity() * size_of::<T>()
        } else {
            0
        };
        size_of::<Self>() + spill
    }

    /// Plain-text rendering against a symbol set (`x**2*y`; the unit
    /// monomial prints as `1`). Diagnostics only.
    pub fn to_pretty(&self, ss: &SymbolSet) -> String {
        debug_assert!(self.is_compatible(ss));
        let mut out = String::new();
        for (i, e) in self.exponents(ss).enumerate() {
            if e == T::ZERO {
                continue;
            }
            if !out.is_empty() {
                out.push('*');
            }
            out.push_str(ss.nth(i).unwrap_or("?"));
            if e != T::ONE {
                out.push_str("**");
                out.push_str(&e.to_string());
            }
        }
        if out.is_empty() {
            out.push('1');
        }
        out
    }

    // ------------------------------------------------------------------
    // Range overflow checking
    // ------------------------------------------------------------------

    /// Check that multiplying any monomial of `r1` by any monomial of `r2`
    /// keeps every product component inside the packing limits and every
    /// product degree inside the exponent type's range.
    ///
    /// Works on per-component interval hulls, so the cost is linear in the
    /// range sizes; ranges longer than 5000 monomials are reduced in
    /// parallel.
    pub fn range_overflow_check(r1: &[&Self], r2: &[&Self], ss: &SymbolSet) -> bool {
        let s_size = ss.len();
        if s_size == 0 || r1.is_empty() || r2.is_empty() {
            return true;
        }

        let (h1, h2) = rayon::join(|| Self::hull(r1, ss), || Self::hull(r2, ss));

        // Component limits of the product.
        let (lim_lo, lim_hi) = if Self::IDENTITY {
            (T::MIN.to_i128(), T::MAX.to_i128())
        } else {
            (
                T::lim_min(Self::PSIZE).to_i128(),
                T::lim_max(Self::PSIZE).to_i128(),
            )
        };
        for i in 0..s_size {
            let add_min = h1.comps[i].0.saturating_add(h2.comps[i].0);
            let add_max = h1.comps[i].1.saturating_add(h2.comps[i].1);
            if add_min < lim_lo || add_max > lim_hi {
                return false;
            }
        }

        // Degree limits of the product.
        let deg_min = h1.deg.0.saturating_add(h2.deg.0);
        let deg_max = h1.deg.1.saturating_add(h2.deg.1);
        deg_min >= T::MIN.to_i128() && deg_max <= T::MAX.to_i128()
    }

    fn hull(range: &[&Self], ss: &SymbolSet) -> Hull {
        use rayon::prelude::*;

        const PAR_THRESHOLD: usize = 5000;

        if range.len() > PAR_THRESHOLD {
            range
                .par_chunks(1024)
                .map(|c| Self::hull_serial(c, ss))
                .reduce_with(Hull::combine)
                .expect("non-empty range")
        } else {
            Self::hull_serial(range, ss)
        }
    }

    fn hull_serial(range: &[&Self], ss: &SymbolSet) -> Hull {
        let mut hull = Hull::widest(ss.len());
        for m in range {
            debug_assert!(m.is_compatible(ss));
            let mut deg: i128 = 0;
            for (i, e) in m.exponents(ss).enumerate() {
                let v = e.to_i128();
                deg = deg.saturating_add(v);
                let slot = &mut hull.comps[i];
                slot.0 = slot.0.min(v);
                slot.1 = slot.1.max(v);
            }
            hull.deg.0 = hull.deg.0.min(deg);
            hull.deg.1 = hull.deg.1.max(deg);
        }
        hull
    }
}

// Per-component and degree interval hull of a monomial range.
struct Hull {
    comps: Vec<(i128, i128)>,
    deg: (i128, i128),
}

impl Hull {
    fn widest(n: usize) -> Self {
        Hull {
            comps: vec![(i128::MAX, i128::MIN); n],
            deg: (i128::MAX, i128::MIN),
        }
    }

    fn combine(mut a: Hull, b: Hull) -> Hull {
        for (x, y) in a.comps.iter_mut().zip(&b.comps) {
            x.0 = x.0.min(y.0);
            x.1 = x.1.max(y.1);
        }
        a.deg.0 = a.deg.0.min(b.deg.0);
        a.deg.1 = a.deg.1.max(b.deg.1);
        a
    }
}

impl<T: KPackable, const NBITS: u32> Hash for DPackedMonomial<T, NBITS> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash64());
    }
}

// ============================================================================
// Key-protocol implementations
// ============================================================================

impl<T: KPackable, const NBITS: u32> TableKey for DPackedMonomial<T, NBITS> {
    #[inline]
    fn hash64(&self) -> u64 {
        DPackedMonomial::hash64(self)
    }
}

impl<T, const NBITS: u32> Key for DPackedMonomial<T, NBITS>
where
    T: KPackable + CheckedAdd + Zero,
{
    const HOMOMORPHIC_HASH: bool = true;

    fn unit(ss: &SymbolSet) -> Self {
        DPackedMonomial::unit(ss)
    }
    fn variable(ss: &SymbolSet, idx: SymbolIdx) -> Result<Self, MonomialError> {
        let mut exps = vec![T::ZERO; ss.len()];
        exps[idx] = T::ONE;
        DPackedMonomial::from_exponents(&exps)
    }
    fn is_unit(&self, _ss: &SymbolSet) -> bool {
        DPackedMonomial::is_unit(self)
    }
    fn is_compatible(&self, ss: &SymbolSet) -> bool {
        DPackedMonomial::is_compatible(self, ss)
    }
    fn merge_symbols(&self, ins_map: &SymbolIdxMap<SymbolSet>, ss: &SymbolSet) -> Self {
        DPackedMonomial::merge_symbols(self, ins_map, ss)
    }
    fn mul_into(out: &mut Self, a: &Self, b: &Self, ss: &SymbolSet) {
        DPackedMonomial::mul_into(out, a, b, ss)
    }
    fn range_overflow_check(r1: &[&Self], r2: &[&Self], ss: &SymbolSet) -> bool {
        DPackedMonomial::range_overflow_check(r1, r2, ss)
    }
    fn byte_size(&self) -> usize {
        DPackedMonomial::byte_size(self)
    }
    fn fmt_pretty(&self, ss: &SymbolSet) -> String {
        self.to_pretty(ss)
    }
}

impl<T, const NBITS: u32> DegreeKey for DPackedMonomial<T, NBITS>
where
    T: KPackable + CheckedAdd + Zero,
{
    type Degree = T;

    fn degree(&self, ss: &SymbolSet) -> Result<T, MonomialError> {
        DPackedMonomial::degree(self, ss)
    }
    fn p_degree(&self, si: &[SymbolIdx], ss: &SymbolSet) -> Result<T, MonomialError> {
        DPackedMonomial::p_degree(self, si, ss)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoroshiro128Plus;

    type M32 = DPackedMonomial<i32, 6>; // PSIZE = 5
    type M64 = DPackedMonomial<i64, 8>; // PSIZE = 8
    type MU = DPackedMonomial<u32, 8>; // PSIZE = 4
    type MId = DPackedMonomial<i32, 32>; // PSIZE = 1, identity chunks

    fn ss3() -> SymbolSet {
        SymbolSet::from(["x", "y", "z"])
    }

    #[test]
    fn unit_construction_and_compatibility() {
        let ss = ss3();
        let u = M32::unit(&ss);
        assert!(u.is_unit());
        assert!(u.is_compatible(&ss));
        assert_eq!(u.chunks().len(), 1);

        // Wrong chunk count.
        let big = SymbolSet::from(["a", "b", "c", "d", "e", "f"]);
        assert!(!u.is_compatible(&big));

        // 6 symbols over PSIZE 5 -> 2 chunks.
        let u6 = M32::unit(&big);
        assert_eq!(u6.chunks().len(), 2);
        assert!(u6.is_compatible(&big));
    }

    #[test]
    fn exponent_roundtrip_and_display() {
        let ss = ss3();
        let m = M32::from_exponents(&[2, 0, 1]).unwrap();
        assert_eq!(m.exponents(&ss).collect::<Vec<_>>(), vec![2, 0, 1]);
        assert_eq!(m.to_pretty(&ss), "x**2*z");
        assert_eq!(M32::unit(&ss).to_pretty(&ss), "1");

        let neg = M32::from_exponents(&[-1, 3, 0]).unwrap();
        assert_eq!(neg.to_pretty(&ss), "x**-1*y**3");
    }

    #[test]
    fn mul_is_exponent_addition_and_hash_is_homomorphic() {
        let ss = ss3();
        let mut r = Xoroshiro128Plus::seed_from_u64(42);
        let lim = i32::lim_max(M32::PSIZE) / 2;
        for _ in 0..500 {
            let ea: Vec<i32> = (0..3).map(|_| r.gen_range(-lim..=lim)).collect();
            let eb: Vec<i32> = (0..3).map(|_| r.gen_range(-lim..=lim)).collect();
            let a = M32::from_exponents(&ea).unwrap();
            let b = M32::from_exponents(&eb).unwrap();
            let mut ab = M32::default();
            M32::mul_into(&mut ab, &a, &b, &ss);

            let esum: Vec<i32> = ea.iter().zip(&eb).map(|(x, y)| x + y).collect();
            assert_eq!(ab, M32::from_exponents(&esum).unwrap());
            assert_eq!(
                ab.hash64(),
                a.hash64().wrapping_add(b.hash64()),
                "hash homomorphism"
            );
        }
    }

    #[test]
    fn degree_and_partial_degree() {
        let ss = SymbolSet::from(["t", "u", "x", "y", "z"]);
        let m = M64::from_exponents(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(m.degree(&ss).unwrap(), 15);
        assert_eq!(m.p_degree(&vec![0, 2, 4], &ss).unwrap(), 9);
        assert_eq!(m.p_degree(&vec![], &ss).unwrap(), 0);

        // Degree overflow through identity chunks.
        let ss2 = SymbolSet::from(["a", "b"]);
        let m = MId::from_exponents(&[i32::MAX, 1]).unwrap();
        assert_eq!(
            m.degree(&ss2),
            Err(MonomialError::DegreeOverflow)
        );
    }

    #[test]
    fn pow_matches_iterated_multiplication() {
        let ss = ss3();
        let m = M32::from_exponents(&[1, 2, 3]).unwrap();

        // e = 0 yields the unit monomial.
        assert_eq!(m.pow(0, &ss).unwrap(), M32::unit(&ss));

        // Iterated products.
        let mut acc = M32::unit(&ss);
        for e in 1..=5 {
            let mut next = M32::default();
            M32::mul_into(&mut next, &acc, &m, &ss);
            acc = next;
            assert_eq!(m.pow(e, &ss).unwrap(), acc, "e = {e}");
        }
    }

    #[test]
    fn pow_scenarios() {
        // pow((1,2,3), 2) == (2,4,6) over i32 with NBITS = 6.
        let ss = ss3();
        let m = M32::from_exponents(&[1, 2, 3]).unwrap();
        assert_eq!(
            m.pow(2, &ss).unwrap(),
            M32::from_exponents(&[2, 4, 6]).unwrap()
        );

        // Doubling maximal components overflows.
        let lim = i32::lim_max(M32::PSIZE);
        let m = M32::from_exponents(&[lim, lim, lim]).unwrap();
        assert!(matches!(
            m.pow(2, &ss),
            Err(MonomialError::Pack(_)) | Err(MonomialError::PowOverflow { .. })
        ));

        // Non-integral exponent is rejected.
        let half = crate::ring::rat(1, 2);
        assert!(matches!(
            M32::from_exponents(&[1, 0, 0]).unwrap().pow(&half, &ss),
            Err(MonomialError::NonIntegralExponent { .. })
        ));
        // An integral rational is fine.
        let two = crate::ring::rat(2, 1);
        assert_eq!(
            M32::from_exponents(&[1, 0, 0]).unwrap().pow(&two, &ss).unwrap(),
            M32::from_exponents(&[2, 0, 0]).unwrap()
        );
    }

    #[test]
    fn diff_integrate_roundtrip() {
        let ss = ss3();
        let m = M32::from_exponents(&[1, 4, 0]).unwrap();

        // Integrate then differentiate along y is the identity on the
        // monomial, with matching exponent factors.
        let (up, mi) = m.integrate(1, &ss).unwrap();
        assert_eq!(up, 5);
        let (down, back) = mi.diff(1, &ss).unwrap();
        assert_eq!(down, 5);
        assert_eq!(back, m);

        // Differentiating a zero exponent returns (0, unchanged).
        let (e, same) = m.diff(2, &ss).unwrap();
        assert_eq!(e, 0);
        assert_eq!(same, m);
    }

    #[test]
    fn integrate_domain_and_overflow_errors() {
        let ss = SymbolSet::from(["x"]);

        // Exponent -1: logarithmic term.
        let m = DPackedMonomial::<i32, 8>::from_exponents(&[-1]).unwrap();
        assert!(matches!(
            m.integrate(0, &ss),
            Err(MonomialError::LogarithmicTerm { .. })
        ));

        // Identity chunks at the type maximum: positive overflow.
        let m = MId::from_exponents(&[i32::MAX]).unwrap();
        assert!(matches!(
            m.integrate(0, &ss),
            Err(MonomialError::IntegrateOverflow { .. })
        ));

        // Identity chunks at the type minimum: diff underflows.
        let m = MId::from_exponents(&[i32::MIN]).unwrap();
        assert!(matches!(
            m.diff(0, &ss),
            Err(MonomialError::DiffOverflow { .. })
        ));

        // Unsigned exponent at the packing limit: integrate overflows the
        // component range.
        let lim = u32::lim_max(MU::PSIZE);
        let m = MU::from_exponents(&[lim, 0, 0, 0]).unwrap();
        let ss4 = SymbolSet::from(["a", "b", "c", "d"]);
        assert!(matches!(
            m.integrate(0, &ss4),
            Err(MonomialError::Pack(_))
        ));
    }

    #[test]
    fn merge_commutes_with_multiplication() {
        let ss = SymbolSet::from(["b", "d"]);
        let other = SymbolSet::from(["a", "b", "e"]);
        let (merged, ins, _) = ss.merge(&other);

        let a = M32::from_exponents(&[1, 2]).unwrap();
        let b = M32::from_exponents(&[3, 4]).unwrap();

        let am = a.merge_symbols(&ins, &ss);
        let bm = b.merge_symbols(&ins, &ss);
        assert!(am.is_compatible(&merged));
        assert_eq!(
            am.exponents(&merged).collect::<Vec<_>>(),
            vec![0, 1, 2, 0]
        );

        // Degree is untouched by inserting zeros.
        assert_eq!(a.degree(&ss).unwrap(), am.degree(&merged).unwrap());

        // merge(a) * merge(b) == merge(a * b).
        let mut ab = M32::default();
        M32::mul_into(&mut ab, &a, &b, &ss);
        let mut am_bm = M32::default();
        M32::mul_into(&mut am_bm, &am, &bm, &merged);
        assert_eq!(am_bm, ab.merge_symbols(&ins, &ss));

        // The unit stays the unit.
        assert!(M32::unit(&ss).merge_symbols(&ins, &ss).is_unit());
    }

    #[test]
    fn subs_and_trim() {
        use crate::ring::rat;

        let ss = ss3();
        // x**2 * y * z**3
        let m = M32::from_exponents(&[2, 1, 3]).unwrap();

        // Substitute x -> 1/2, z -> 2: (1/2)^2 * 2^3 = 2.
        let sm = vec![(0usize, rat(1, 2)), (2usize, rat(2, 1))];
        let (acc, out) = m.subs(&sm, &ss).unwrap();
        assert_eq!(acc, rat(2, 1));
        assert_eq!(out.exponents(&ss).collect::<Vec<_>>(), vec![0, 1, 0]);

        // Negative exponent with a non-invertible value.
        let neg = M32::from_exponents(&[-1, 0, 0]).unwrap();
        let sm0 = vec![(0usize, rat(0, 1))];
        assert!(matches!(
            neg.subs(&sm0, &ss),
            Err(MonomialError::NonInvertible)
        ));

        // trim_identify: only z's slot stays trimmable.
        let m2 = M32::from_exponents(&[2, 1, 0]).unwrap();
        let mut mask = vec![true; 3];
        m2.trim_identify(&mut mask, &ss);
        assert_eq!(mask, vec![false, false, true]);

        // Dropping z repacks to a 2-symbol monomial.
        let trimmed = m2.trim(&vec![2], &ss);
        let ss2 = SymbolSet::from(["x", "y"]);
        assert!(trimmed.is_compatible(&ss2));
        assert_eq!(trimmed.exponents(&ss2).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn evaluation_multiplies_value_powers() {
        use crate::ring::rat;

        let ss = ss3();
        // x**2 * z**-1 at x = 3, y = 7, z = 2: 9 / 2.
        let m = M32::from_exponents(&[2, 0, -1]).unwrap();
        let values = vec![
            (0usize, rat(3, 1)),
            (1usize, rat(7, 1)),
            (2usize, rat(2, 1)),
        ];
        assert_eq!(m.evaluate(&values, &ss).unwrap(), rat(9, 2));

        // The unit monomial evaluates to one everywhere.
        assert_eq!(M32::unit(&ss).evaluate(&values, &ss).unwrap(), rat(1, 1));

        // A negative exponent at zero is not invertible.
        let at_zero = vec![
            (0usize, rat(0, 1)),
            (1usize, rat(1, 1)),
            (2usize, rat(1, 1)),
        ];
        let neg = M32::from_exponents(&[-1, 0, 0]).unwrap();
        assert!(matches!(
            neg.evaluate(&at_zero, &ss),
            Err(MonomialError::NonInvertible)
        ));

        // Evaluation agrees with substituting every variable.
        let (acc, rest) = m.subs(&values, &ss).unwrap();
        assert_eq!(acc, rat(9, 2));
        assert!(rest.is_unit());
    }

    #[test]
    fn wide_chunk_types_roundtrip_and_multiply() {
        // The same algebra over u64 and i64 chunk scalars.
        let ss: SymbolSet = (0..10).map(|i| format!("v{i}")).collect();
        let mut r = Xoroshiro128Plus::seed_from_u64(99);

        type MU64 = DPackedMonomial<u64, 6>; // PSIZE = 10
        let lim = u64::lim_max(MU64::PSIZE) / 2;
        for _ in 0..200 {
            let ea: Vec<u64> = (0..10).map(|_| r.gen_range(0..=lim)).collect();
            let eb: Vec<u64> = (0..10).map(|_| r.gen_range(0..=lim)).collect();
            let a = MU64::from_exponents(&ea).unwrap();
            let b = MU64::from_exponents(&eb).unwrap();
            assert_eq!(a.exponents(&ss).collect::<Vec<_>>(), ea);

            let mut ab = MU64::default();
            MU64::mul_into(&mut ab, &a, &b, &ss);
            let esum: Vec<u64> = ea.iter().zip(&eb).map(|(x, y)| x + y).collect();
            assert_eq!(ab, MU64::from_exponents(&esum).unwrap());
            assert_eq!(ab.hash64(), a.hash64().wrapping_add(b.hash64()));

            let expected: u64 = ea.iter().sum();
            assert_eq!(a.degree(&ss).unwrap(), expected);
        }

        type MI64 = DPackedMonomial<i64, 16>; // PSIZE = 4
        let lim = i64::lim_max(MI64::PSIZE) / 2;
        let ss4: SymbolSet = (0..4).map(|i| format!("w{i}")).collect();
        for _ in 0..200 {
            let e: Vec<i64> = (0..4).map(|_| r.gen_range(-lim..=lim)).collect();
            let m = MI64::from_exponents(&e).unwrap();
            assert_eq!(m.exponents(&ss4).collect::<Vec<_>>(), e);
            assert!(m.is_compatible(&ss4));
        }
    }

    #[test]
    fn overflow_check_detects_component_and_degree_overflow() {
        let ss = ss3();
        let lim = i32::lim_max(M32::PSIZE);

        let a = M32::from_exponents(&[lim / 2, 0, 0]).unwrap();
        let b = M32::from_exponents(&[lim / 2, 0, 0]).unwrap();
        assert!(M32::range_overflow_check(&[&a], &[&b], &ss));

        // Component sums just past the limit.
        let c = M32::from_exponents(&[lim / 2 + 1, 0, 0]).unwrap();
        let d = M32::from_exponents(&[lim - lim / 2, 0, 0]).unwrap();
        assert!(!M32::range_overflow_check(&[&c], &[&d], &ss));

        // Degree overflow through identity chunks: components fit the type
        // but their sum does not.
        let ss2 = SymbolSet::from(["a", "b"]);
        let e = MId::from_exponents(&[i32::MAX, 1]).unwrap();
        let f = MId::from_exponents(&[0, 0]).unwrap();
        assert!(!MId::range_overflow_check(&[&e], &[&f], &ss2));

        // Empty ranges and empty symbol sets never overflow.
        assert!(M32::range_overflow_check(&[], &[&a], &ss));
        let ss0 = SymbolSet::new();
        let u = M32::unit(&ss0);
        assert!(M32::range_overflow_check(&[&u], &[&u], &ss0));
    }

    #[test]
    fn parallel_overflow_check_agrees_with_serial() {
        let ss = ss3();
        let mut r = Xoroshiro128Plus::seed_from_u64(7);
        let lim = i32::lim_max(M32::PSIZE) / 4;
        let monos: Vec<M32> = (0..6000)
            .map(|_| {
                let e: Vec<i32> = (0..3).map(|_| r.gen_range(-lim..=lim)).collect();
                M32::from_exponents(&e).unwrap()
            })
            .collect();
        let refs: Vec<&M32> = monos.iter().collect();
        let small: Vec<&M32> = monos.iter().take(10).collect();

        // Large range takes the parallel path; result must be the same as
        // computing over a serial-sized prefix that contains the hull.
        assert!(M32::range_overflow_check(&refs, &small, &ss));
    }

    #[test]
    fn byte_size_accounts_for_spill() {
        let ss_small = ss3();
        let inline = M32::unit(&ss_small);
        assert_eq!(inline.byte_size(), size_of::<M32>());

        let many: SymbolSet = (0..64).map(|i| format!("v{i:02}")).collect();
        let spilled = M32::unit(&many);
        assert!(spilled.byte_size() > size_of::<M32>());
    }
}
