//! Kronecker packing codec
//!
//! Bijective encoding of a fixed-length vector of bounded integers into a
//! single machine scalar, together with the constant-division unpacker that
//! inverts it without ever issuing a hardware division.
//!
//! ## Scheme
//!
//! For a packing size `s`, the tables below fix a base `delta(s)` and the
//! coded value is the positional expansion `sum_i v_i * delta(s)^i`. Each
//! component must lie in `[lim_min(s), lim_max(s)]` (symmetric around zero
//! for signed scalars, `[0, lim_max]` for unsigned ones), which confines the
//! coded value to `[klim_min(s), klim_max(s)]`.
//!
//! ## Invariants
//!
//! - **Bijection.** `KUnpacker::new(packer.get(), s)` recovers the pushed
//!   components exactly, with missing trailing components read as zero.
//! - **Additivity.** Packing is a homomorphism for component-wise addition:
//!   `pack(v + w) == pack(v) + pack(w)` whenever `v`, `w` and `v + w` are all
//!   within the component limits. The monomial layer leans on this to obtain
//!   a homomorphic hash.
//! - **No division in the hot path.** Unpacking performs exactly one high
//!   multiply and two shifts per extracted component, using the
//!   Granlund–Montgomery constants carried in the tables. Signed scalars are
//!   shifted into the unsigned domain by `klim_min` first and re-signed at
//!   the end.
//!
//! The tables are computed at compile time (`const fn`, u128 arithmetic) for
//! every size from 1 to `MAX_SIZE = bits/3` (10 for 32-bit scalars, 21 for
//! 64-bit ones), so lookups are plain loads from immutable statics.

use std::fmt;
use std::hash::Hash;

/// Errors raised by the packing codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KpackError {
    /// A packer or unpacker was constructed with a size larger than the
    /// maximum supported by the scalar type.
    #[error("invalid packing size {size} for a {width}-bit scalar: the maximum possible size is {max}")]
    SizeOverflow {
        /// Requested size.
        size: u32,
        /// Bit width of the scalar type.
        width: u32,
        /// Maximum supported size for that width.
        max: u32,
    },
    /// More values were pushed than the packer's size allows.
    #[error("cannot push any more values into this packer: the packer's size ({size}) has been reached")]
    PackerFull {
        /// Size of the packer.
        size: u32,
    },
    /// A pushed component lies outside the allowed component range.
    #[error("cannot pack the value {value}: it is outside the allowed component range [{min}, {max}]")]
    ComponentOutOfRange {
        /// Offending value.
        value: i128,
        /// Inclusive lower bound.
        min: i128,
        /// Inclusive upper bound.
        max: i128,
    },
    /// The scalar handed to an unpacker lies outside the coded-value range.
    #[error("the value {value} cannot be unpacked: it is outside the allowed coded range [{min}, {max}]")]
    CodedOutOfRange {
        /// Offending value.
        value: i128,
        /// Inclusive lower bound.
        min: i128,
        /// Inclusive upper bound.
        max: i128,
    },
    /// More components were read than the unpacker's size allows.
    #[error("cannot unpack any more values: all {size} components have been read")]
    UnpackerExhausted {
        /// Size of the unpacker.
        size: u32,
    },
    /// A size-0 unpacker accepts only the zero scalar.
    #[error("only zero can be used in an unpacker with a size of zero, but {value} was provided")]
    NonZeroEmptyUnpack {
        /// Offending value.
        value: i128,
    },
}

mod sealed {
    pub trait Sealed {}
}

// ============================================================================
// Unsigned helper surface
// ============================================================================

/// Operations the unpacker needs on the unsigned counterpart of a packable
/// scalar. Implemented for `u32` and `u64` only.
pub trait KUint:
    Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static + sealed::Sealed
{
    /// The zero value.
    const ZERO: Self;

    /// High half of the double-width product `self * rhs`.
    fn mulhi(self, rhs: Self) -> Self;
    /// Two's complement subtraction.
    fn wrapping_sub(self, rhs: Self) -> Self;
    /// Two's complement addition.
    fn wrapping_add(self, rhs: Self) -> Self;
    /// Two's complement multiplication.
    fn wrapping_mul(self, rhs: Self) -> Self;
    /// Logical right shift by `n < bits` positions.
    fn shr(self, n: u32) -> Self;
    /// Truncating conversion from the u128 table domain.
    fn from_u128(v: u128) -> Self;
    /// Widening conversion into the u128 table domain.
    fn to_u128(self) -> u128;
}

macro_rules! impl_kuint {
    ($ut:ty, $wide:ty) => {
        impl sealed::Sealed for $ut {}

        impl KUint for $ut {
            const ZERO: Self = 0;

            #[inline]
            fn mulhi(self, rhs: Self) -> Self {
                ((self as $wide * rhs as $wide) >> <$ut>::BITS) as $ut
            }
            #[inline]
            fn wrapping_sub(self, rhs: Self) -> Self {
                <$ut>::wrapping_sub(self, rhs)
            }
            #[inline]
            fn wrapping_add(self, rhs: Self) -> Self {
                <$ut>::wrapping_add(self, rhs)
            }
            #[inline]
            fn wrapping_mul(self, rhs: Self) -> Self {
                <$ut>::wrapping_mul(self, rhs)
            }
            #[inline]
            fn shr(self, n: u32) -> Self {
                self >> n
            }
            #[inline]
            fn from_u128(v: u128) -> Self {
                v as $ut
            }
            #[inline]
            fn to_u128(self) -> u128 {
                self as u128
            }
        }
    };
}

impl_kuint!(u32, u64);
impl_kuint!(u64, u128);

/// Divide `n` by a fixed constant through its Granlund–Montgomery triple:
/// one high multiply and two shifts, no division instruction.
#[inline]
fn div_by_const<U: KUint>(n: U, mp: U, sh1: u32, sh2: u32) -> U {
    let t1 = mp.mulhi(n);
    let t2 = n.wrapping_sub(t1).shr(sh1);
    t1.wrapping_add(t2).shr(sh2)
}

// ============================================================================
// Compile-time table generation
// ============================================================================

// Table slots cover the largest supported size (64-bit scalars pack up to 21
// components); 32-bit tables simply leave the tail unused.
const TBL: usize = 21;

struct RawTables {
    // Per size `s` (1-based, stored at s-1): the packing base.
    deltas: [u128; TBL],
    // Magnitude of the per-component limit.
    lims: [u128; TBL],
    // Magnitude of the coded-value limit.
    klims: [u128; TBL],
    // Per (size, index): (mp, sh1, sh2) for division by delta(s)^index.
    divcnst: [[(u128, u32, u32); TBL + 1]; TBL],
}

const fn pow_fits(base: u128, exp: u32, cap: u128) -> bool {
    let mut acc: u128 = 1;
    let mut i = 0;
    while i < exp {
        if acc > cap / base {
            return false;
        }
        acc *= base;
        i += 1;
    }
    acc <= cap
}

const fn pow_u128(base: u128, exp: u32) -> u128 {
    let mut acc: u128 = 1;
    let mut i = 0;
    while i < exp {
        acc *= base;
        i += 1;
    }
    acc
}

// Largest base d (largest odd d for signed scalars) such that d is
// representable in the scalar type and d^s is representable in its unsigned
// counterpart. The latter bound keeps every delta power the unpacker forms
// inside the unsigned domain.
const fn max_delta(s: u32, t_max: u128, u_max: u128, signed: bool) -> u128 {
    let mut lo = 2u128;
    let mut hi = t_max;
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if pow_fits(mid, s, u_max) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    let mut d = lo;
    if signed && d % 2 == 0 {
        d -= 1;
    }
    assert!(d >= 2, "packing base must be at least 2");
    assert!(!signed || d >= 3, "signed packing base must be at least 3");
    d
}

const fn ceil_log2(d: u128) -> u32 {
    let mut l = 0u32;
    while (1u128 << l) < d {
        l += 1;
    }
    l
}

// Constants from Figure 4.1 of Granlund & Montgomery, "Division by invariant
// integers using multiplication" (PLDI '94): for an N-bit divisor d,
//   l   = ceil(lg d)
//   mp  = floor(2^N * (2^l - d) / d) + 1
//   sh1 = min(l, 1), sh2 = max(l - 1, 0)
// and the quotient of n/d is SRL(t1 + SRL(n - t1, sh1), sh2) with
// t1 = mulhi(mp, n).
const fn magic(d: u128, bits: u32) -> (u128, u32, u32) {
    let l = ceil_log2(d);
    let two_l = 1u128 << l;
    let two_b = 1u128 << bits;
    let mp = (two_b * (two_l - d)) / d + 1;
    let sh1 = if l < 1 { l } else { 1 };
    let sh2 = if l == 0 { 0 } else { l - 1 };
    (mp, sh1, sh2)
}

const fn build_tables(bits: u32, signed: bool, max_size: u32) -> RawTables {
    let u_max: u128 = if bits == 64 {
        u64::MAX as u128
    } else {
        u32::MAX as u128
    };
    let t_max: u128 = if signed { u_max >> 1 } else { u_max };

    let mut t = RawTables {
        deltas: [0; TBL],
        lims: [0; TBL],
        klims: [0; TBL],
        divcnst: [[(0, 0, 0); TBL + 1]; TBL],
    };

    let mut s = 1u32;
    while s <= max_size {
        let d = max_delta(s, t_max, u_max, signed);
        let dpow = pow_u128(d, s);

        t.deltas[(s - 1) as usize] = d;
        t.lims[(s - 1) as usize] = if signed { (d - 1) / 2 } else { d - 1 };
        t.klims[(s - 1) as usize] = if signed { (dpow - 1) / 2 } else { dpow - 1 };

        let mut i = 0u32;
        while i <= s {
            t.divcnst[(s - 1) as usize][i as usize] = magic(pow_u128(d, i), bits);
            i += 1;
        }
        s += 1;
    }
    t
}

static RAW_I32: RawTables = build_tables(32, true, 10);
static RAW_U32: RawTables = build_tables(32, false, 10);
static RAW_I64: RawTables = build_tables(64, true, 21);
static RAW_U64: RawTables = build_tables(64, false, 21);

// ============================================================================
// The packable-scalar trait
// ============================================================================

/// The closed set of scalars supported by the Kronecker codec:
/// `i32`, `u32`, `i64`, `u64`.
///
/// Exposes the compile-time packing tables plus the handful of integer
/// primitives the generic packer/unpacker and the monomial layer need.
pub trait KPackable:
    Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static + sealed::Sealed
{
    /// The unsigned counterpart used for the constant-division arithmetic.
    type Unsigned: KUint;

    /// Bit width of the scalar.
    const BITS: u32;
    /// Whether the scalar is signed.
    const IS_SIGNED: bool;
    /// Maximum packing size (`bits / 3`).
    const MAX_SIZE: u32;
    /// The zero value.
    const ZERO: Self;
    /// The one value.
    const ONE: Self;
    /// The minimum representable value.
    const MIN: Self;
    /// The maximum representable value.
    const MAX: Self;

    /// Packing base for the given size (`1 <= size <= MAX_SIZE`).
    fn delta(size: u32) -> Self;
    /// Inclusive lower component limit for the given size.
    fn lim_min(size: u32) -> Self;
    /// Inclusive upper component limit for the given size.
    fn lim_max(size: u32) -> Self;
    /// Inclusive lower coded-value limit for the given size.
    fn klim_min(size: u32) -> Self;
    /// Inclusive upper coded-value limit for the given size.
    fn klim_max(size: u32) -> Self;
    /// Granlund–Montgomery triple for division by `delta(size)^index`
    /// (`0 <= index <= size`).
    fn divcnst(size: u32, index: u32) -> (Self::Unsigned, u32, u32);

    /// Bit cast into the unsigned counterpart.
    fn to_unsigned(self) -> Self::Unsigned;
    /// Bit cast from the unsigned counterpart.
    fn from_unsigned(u: Self::Unsigned) -> Self;
    /// Two's complement addition.
    fn wrapping_add(self, rhs: Self) -> Self;
    /// Two's complement multiplication.
    fn wrapping_mul(self, rhs: Self) -> Self;
    /// Checked addition.
    fn checked_add(self, rhs: Self) -> Option<Self>;
    /// Checked subtraction.
    fn checked_sub(self, rhs: Self) -> Option<Self>;
    /// Wrapping cast to `u64` (sign-extending for signed scalars), the
    /// domain of the monomial hash.
    fn as_u64(self) -> u64;
    /// Exact widening conversion.
    fn to_i128(self) -> i128;
    /// Checked narrowing conversion.
    fn from_i128_checked(v: i128) -> Option<Self>;
}

macro_rules! impl_kpackable_sealed {
    (true, $t:ty) => {
        impl sealed::Sealed for $t {}
    };
    (false, $t:ty) => {};
    ($signed:tt, $t:ty) => {};
}

macro_rules! impl_kpackable {
    ($t:ty, $ut:ty, $signed:tt, $max_size:expr, $raw:ident) => {
        impl_kpackable_sealed!($signed, $t);

        impl KPackable for $t {
            type Unsigned = $ut;

            const BITS: u32 = <$t>::BITS;
            const IS_SIGNED: bool = $signed;
            const MAX_SIZE: u32 = $max_size;
            const ZERO: Self = 0;
            const ONE: Self = 1;
            const MIN: Self = <$t>::MIN;
            const MAX: Self = <$t>::MAX;

            #[inline]
            fn delta(size: u32) -> Self {
                debug_assert!(size >= 1 && size <= Self::MAX_SIZE);
                $raw.deltas[(size - 1) as usize] as $t
            }
            #[inline]
            fn lim_min(size: u32) -> Self {
                if $signed {
                    Self::lim_max(size).wrapping_neg()
                } else {
                    0
                }
            }
            #[inline]
            fn lim_max(size: u32) -> Self {
                debug_assert!(size >= 1 && size <= Self::MAX_SIZE);
                $raw.lims[(size - 1) as usize] as $t
            }
            #[inline]
            fn klim_min(size: u32) -> Self {
                if $signed {
                    Self::klim_max(size).wrapping_neg()
                } else {
                    0
                }
            }
            #[inline]
            fn klim_max(size: u32) -> Self {
                debug_assert!(size >= 1 && size <= Self::MAX_SIZE);
                $raw.klims[(size - 1) as usize] as $t
            }
            #[inline]
            fn divcnst(size: u32, index: u32) -> (Self::Unsigned, u32, u32) {
                debug_assert!(size >= 1 && size <= Self::MAX_SIZE && index <= size);
                let (mp, sh1, sh2) = $raw.divcnst[(size - 1) as usize][index as usize];
                (mp as $ut, sh1, sh2)
            }

            #[inline]
            fn to_unsigned(self) -> Self::Unsigned {
                self as $ut
            }
            #[inline]
            fn from_unsigned(u: Self::Unsigned) -> Self {
                u as $t
            }
            #[inline]
            fn wrapping_add(self, rhs: Self) -> Self {
                <$t>::wrapping_add(self, rhs)
            }
            #[inline]
            fn wrapping_mul(self, rhs: Self) -> Self {
                <$t>::wrapping_mul(self, rhs)
            }
            #[inline]
            fn checked_add(self, rhs: Self) -> Option<Self> {
                <$t>::checked_add(self, rhs)
            }
            #[inline]
            fn checked_sub(self, rhs: Self) -> Option<Self> {
                <$t>::checked_sub(self, rhs)
            }
            #[inline]
            fn as_u64(self) -> u64 {
                self as u64
            }
            #[inline]
            fn to_i128(self) -> i128 {
                self as i128
            }
            #[inline]
            fn from_i128_checked(v: i128) -> Option<Self> {
                if v < <$t>::MIN as i128 || v > <$t>::MAX as i128 {
                    None
                } else {
                    Some(v as $t)
                }
            }
        }
    };
}

impl_kpackable!(i32, u32, true, 10, RAW_I32);
impl_kpackable!(u32, u32, false, 10, RAW_U32);
impl_kpackable!(i64, u64, true, 21, RAW_I64);
impl_kpackable!(u64, u64, false, 21, RAW_U64);

// ============================================================================
// Packer
// ============================================================================

/// Streaming Kronecker packer.
///
/// Push up to `size` components, then read the coded scalar with
/// [`KPacker::get`]. Components that were never pushed count as zero.
#[derive(Debug, Clone)]
pub struct KPacker<T: KPackable> {
    value: T,
    cur_prod: T,
    index: u32,
    size: u32,
}

impl<T: KPackable> KPacker<T> {
    /// Create a packer for `size` components.
    pub fn new(size: u32) -> Result<Self, KpackError> {
        if size > T::MAX_SIZE {
            return Err(KpackError::SizeOverflow {
                size,
                width: T::BITS,
                max: T::MAX_SIZE,
            });
        }
        Ok(Self {
            value: T::ZERO,
            cur_prod: T::ONE,
            index: 0,
            size,
        })
    }

    /// Push the next component.
    pub fn push(&mut self, n: T) -> Result<(), KpackError> {
        if self.index == self.size {
            return Err(KpackError::PackerFull { size: self.size });
        }
        let (lo, hi) = (T::lim_min(self.size), T::lim_max(self.size));
        if n < lo || n > hi {
            return Err(KpackError::ComponentOutOfRange {
                value: n.to_i128(),
                min: lo.to_i128(),
                max: hi.to_i128(),
            });
        }

        // In-range components keep every partial sum inside the coded-value
        // range, so the wrapping operations below never actually wrap.
        self.value = self.value.wrapping_add(n.wrapping_mul(self.cur_prod));
        self.index += 1;
        if self.index < self.size {
            self.cur_prod = self.cur_prod.wrapping_mul(T::delta(self.size));
        }
        Ok(())
    }

    /// The coded scalar accumulated so far.
    #[inline]
    pub fn get(&self) -> T {
        self.value
    }

    /// Number of components pushed so far.
    #[inline]
    pub fn pushed(&self) -> u32 {
        self.index
    }
}

// ============================================================================
// Unpacker
// ============================================================================

/// Streaming Kronecker unpacker: yields exactly `size` components.
///
/// Each extraction costs one high multiply and two shifts per constant
/// division (two divisions per component: remainder then digit).
#[derive(Debug, Clone)]
pub struct KUnpacker<T: KPackable> {
    // Coded value shifted into the unsigned domain (`n - klim_min`).
    shifted: T::Unsigned,
    // delta^index, advanced ahead of each extraction.
    cur_prod: T::Unsigned,
    index: u32,
    size: u32,
}

impl<T: KPackable> KUnpacker<T> {
    /// Create an unpacker for the coded scalar `n` with `size` components.
    pub fn new(n: T, size: u32) -> Result<Self, KpackError> {
        if size == 0 {
            if n != T::ZERO {
                return Err(KpackError::NonZeroEmptyUnpack {
                    value: n.to_i128(),
                });
            }
        } else {
            if size > T::MAX_SIZE {
                return Err(KpackError::SizeOverflow {
                    size,
                    width: T::BITS,
                    max: T::MAX_SIZE,
                });
            }
            let (lo, hi) = (T::klim_min(size), T::klim_max(size));
            if n < lo || n > hi {
                return Err(KpackError::CodedOutOfRange {
                    value: n.to_i128(),
                    min: lo.to_i128(),
                    max: hi.to_i128(),
                });
            }
        }

        let shifted = if size == 0 {
            T::Unsigned::ZERO
        } else {
            n.to_unsigned().wrapping_sub(T::klim_min(size).to_unsigned())
        };
        Ok(Self {
            shifted,
            cur_prod: T::Unsigned::from_u128(1),
            index: 0,
            size,
        })
    }

    /// Extract the next component.
    pub fn read(&mut self) -> Result<T, KpackError> {
        if self.index == self.size {
            return Err(KpackError::UnpackerExhausted { size: self.size });
        }

        // Advance to delta^(index + 1): the divisor of the remainder step.
        let delta_u = T::delta(self.size).to_unsigned();
        self.cur_prod = self.cur_prod.wrapping_mul(delta_u);

        // shifted mod delta^(index + 1), via the tabulated constants.
        let (mp_r, sh1_r, sh2_r) = T::divcnst(self.size, self.index + 1);
        let q_r = div_by_const(self.shifted, mp_r, sh1_r, sh2_r);
        let rem = self.shifted.wrapping_sub(q_r.wrapping_mul(self.cur_prod));

        // rem / delta^index: the component in the unsigned domain.
        let (mp_d, sh1_d, sh2_d) = T::divcnst(self.size, self.index);
        let q_d = div_by_const(rem, mp_d, sh1_d, sh2_d);

        self.index += 1;
        Ok(T::from_unsigned(q_d).wrapping_add(T::lim_min(self.size)))
    }

    /// Number of components still to be read.
    #[inline]
    pub fn remaining(&self) -> u32 {
        self.size - self.index
    }
}

impl<T: KPackable> Iterator for KUnpacker<T> {
    type Item = T;

    #[inline]
    fn next(&mut self) -> Option<T> {
        if self.index == self.size {
            None
        } else {
            // Bounds were validated at construction; read() cannot fail here.
            self.read().ok()
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rem = self.remaining() as usize;
        (rem, Some(rem))
    }
}

impl<T: KPackable> ExactSizeIterator for KUnpacker<T> {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoroshiro128Plus;

    fn rng() -> Xoroshiro128Plus {
        Xoroshiro128Plus::seed_from_u64(0x5eed_cafe)
    }

    fn sample<T: KPackable>(rng: &mut impl Rng, lo: T, hi: T) -> T {
        let v = rng.gen_range(lo.to_i128()..=hi.to_i128());
        T::from_i128_checked(v).unwrap()
    }

    fn roundtrip_type<T: KPackable>(rng: &mut impl Rng) {
        for size in 1..=T::MAX_SIZE {
            let (lo, hi) = (T::lim_min(size), T::lim_max(size));

            // Boundary vectors.
            for fill in [lo, hi, T::ZERO] {
                let v = vec![fill; size as usize];
                let mut kp = KPacker::<T>::new(size).unwrap();
                for &c in &v {
                    kp.push(c).unwrap();
                }
                let coded = kp.get();
                assert!(coded >= T::klim_min(size) && coded <= T::klim_max(size));
                let out: Vec<T> = KUnpacker::new(coded, size).unwrap().collect();
                assert_eq!(out, v);
            }

            // Random vectors.
            for _ in 0..200 {
                let v: Vec<T> = (0..size).map(|_| sample(rng, lo, hi)).collect();
                let mut kp = KPacker::<T>::new(size).unwrap();
                for &c in &v {
                    kp.push(c).unwrap();
                }
                let out: Vec<T> = KUnpacker::new(kp.get(), size).unwrap().collect();
                assert_eq!(out, v);
            }
        }
    }

    #[test]
    fn roundtrip_all_types() {
        let mut r = rng();
        roundtrip_type::<i32>(&mut r);
        roundtrip_type::<u32>(&mut r);
        roundtrip_type::<i64>(&mut r);
        roundtrip_type::<u64>(&mut r);
    }

    #[test]
    fn table_invariants() {
        fn check<T: KPackable>() {
            for size in 1..=T::MAX_SIZE {
                let d = T::delta(size);
                assert!(d.to_i128() >= 2);
                // All-max components must pack to exactly klim_max.
                let mut kp = KPacker::<T>::new(size).unwrap();
                for _ in 0..size {
                    kp.push(T::lim_max(size)).unwrap();
                }
                assert_eq!(kp.get(), T::klim_max(size));
                let mut kp = KPacker::<T>::new(size).unwrap();
                for _ in 0..size {
                    kp.push(T::lim_min(size)).unwrap();
                }
                assert_eq!(kp.get(), T::klim_min(size));
            }
        }
        check::<i32>();
        check::<u32>();
        check::<i64>();
        check::<u64>();
    }

    #[test]
    fn magic_division_matches_native() {
        // The GM constants must agree with hardware division for every
        // tabulated divisor.
        fn check<T: KPackable>(rng: &mut impl Rng) {
            for size in 1..=T::MAX_SIZE {
                let mut div: u128 = 1;
                for index in 0..=size {
                    let (mp, sh1, sh2) = T::divcnst(size, index);
                    for _ in 0..100 {
                        let span = T::klim_max(size).to_i128() - T::klim_min(size).to_i128();
                        let n = rng.gen_range(0..=span) as u128;
                        let q = div_by_const(
                            T::Unsigned::from_u128(n),
                            mp,
                            sh1,
                            sh2,
                        );
                        assert_eq!(q.to_u128(), n / div, "size {size} index {index}");
                    }
                    div *= T::delta(size).to_i128() as u128;
                }
            }
        }
        let mut r = rng();
        check::<i32>(&mut r);
        check::<u32>(&mut r);
        check::<i64>(&mut r);
        check::<u64>(&mut r);
    }

    #[test]
    fn additivity_within_limits() {
        let mut r = rng();
        for size in 1..=i64::MAX_SIZE {
            let (lo, hi) = (i64::lim_min(size), i64::lim_max(size));
            for _ in 0..100 {
                // Sample halves so the sums stay in range.
                let a: Vec<i64> = (0..size).map(|_| sample(&mut r, lo / 2, hi / 2)).collect();
                let b: Vec<i64> = (0..size).map(|_| sample(&mut r, lo / 2, hi / 2)).collect();
                let pack = |v: &[i64]| {
                    let mut kp = KPacker::<i64>::new(size).unwrap();
                    for &c in v {
                        kp.push(c).unwrap();
                    }
                    kp.get()
                };
                let sum: Vec<i64> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
                assert_eq!(pack(&sum), pack(&a) + pack(&b));
            }
        }
    }

    #[test]
    fn missing_trailing_components_are_zero() {
        let mut kp = KPacker::<i32>::new(5).unwrap();
        kp.push(3).unwrap();
        kp.push(-2).unwrap();
        let out: Vec<i32> = KUnpacker::new(kp.get(), 5).unwrap().collect();
        assert_eq!(out, vec![3, -2, 0, 0, 0]);
    }

    #[test]
    fn signed_boundary_vector_roundtrip() {
        // Packing (1, -1, 3, 3) with size 4 and boundary vectors for sizes
        // 2 through 4 must round-trip exactly.
        let v = [1i32, -1, 3, 3];
        let mut kp = KPacker::<i32>::new(4).unwrap();
        for &c in &v {
            kp.push(c).unwrap();
        }
        let out: Vec<i32> = KUnpacker::new(kp.get(), 4).unwrap().collect();
        assert_eq!(out, v);

        for size in 2..=4u32 {
            for fill in [i32::lim_min(size), i32::lim_max(size)] {
                let v = vec![fill; size as usize];
                let mut kp = KPacker::<i32>::new(size).unwrap();
                for &c in &v {
                    kp.push(c).unwrap();
                }
                let out: Vec<i32> = KUnpacker::new(kp.get(), size).unwrap().collect();
                assert_eq!(out, v);
            }
        }
    }

    #[test]
    fn error_paths() {
        // Oversized packer/unpacker.
        assert!(matches!(
            KPacker::<i32>::new(11),
            Err(KpackError::SizeOverflow { size: 11, max: 10, .. })
        ));
        assert!(matches!(
            KUnpacker::<u64>::new(0, 22),
            Err(KpackError::SizeOverflow { size: 22, max: 21, .. })
        ));

        // Pushing past capacity.
        let mut kp = KPacker::<u32>::new(0).unwrap();
        assert!(matches!(kp.push(0), Err(KpackError::PackerFull { size: 0 })));

        // Out-of-range component.
        let mut kp = KPacker::<i32>::new(10).unwrap();
        let too_big = i32::lim_max(10) + 1;
        assert!(matches!(
            kp.push(too_big),
            Err(KpackError::ComponentOutOfRange { .. })
        ));

        // Size-0 unpacker accepts only zero.
        assert!(KUnpacker::<i64>::new(0, 0).is_ok());
        assert!(matches!(
            KUnpacker::<i64>::new(42, 0),
            Err(KpackError::NonZeroEmptyUnpack { value: 42 })
        ));

        // Coded value out of range.
        let bad = i32::klim_max(10) + 1;
        assert!(matches!(
            KUnpacker::<i32>::new(bad, 10),
            Err(KpackError::CodedOutOfRange { .. })
        ));

        // Reading past the end.
        let mut ku = KUnpacker::<u32>::new(0, 1).unwrap();
        ku.read().unwrap();
        assert!(matches!(
            ku.read(),
            Err(KpackError::UnpackerExhausted { size: 1 })
        ));
    }
}
