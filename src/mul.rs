//! Polynomial multiplication engine
//!
//! Two multipliers sit behind the public [`mul`] / [`truncated_mul`] /
//! [`p_truncated_mul`] entry points:
//!
//! - a **simple** single-threaded multiplier: every admissible term pair is
//!   multiplied into a single destination segment;
//! - a **homomorphic parallel** multiplier for large products, which sizes
//!   the destination's segmented table from a byte-size sample, sorts both
//!   operands by `hash mod 2^L`, and exploits
//!   `hash(a * b) == hash(a) + hash(b)` to assign each pair of input buckets
//!   `(i, j)` to the destination bucket `(i + j) mod 2^L`. Destination
//!   buckets are then completely independent and run as one rayon task each.
//!
//! The parallel multiplier is selected when the key advertises a
//! homomorphic hash, the product has at least 1000 term pairs, and more
//! than one hardware thread is available; otherwise the simple multiplier
//! runs.
//!
//! Truncation (total or partial degree) compiles into one shape for both
//! multipliers: a degree-sorted second operand plus a binary search for the
//! first inadmissible partner. In the parallel multiplier the degree sort is
//! applied per input bucket, preserving the bucket partition.
//!
//! Failure handling is strong: every error path drops the partially built
//! destination, so callers observe either the complete product or no
//! product at all. Coefficient accumulation is lazy: `c1 * c2` is
//! materialised only when the product key is new; a duplicate key takes the
//! fused-accumulate path instead.

use std::mem::size_of;

use hashbrown::HashMap;
use num_traits::CheckedAdd;
use rand::Rng;
use rayon::prelude::*;
use tracing::debug;

use crate::estimate::{estimate_product_size, seeded_rng};
use crate::monomial::MonomialError;
use crate::ring::Ring;
use crate::series::{DegreeKey, Key, Series};
use crate::symbols::{SymbolIdxSet, SymbolSet};
use crate::table::{SegmentedTable, TableError, MAX_LOG2_SEGMENTS, MAX_TABLE_SIZE};

/// Errors raised by polynomial multiplication.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MulError {
    /// The product would overflow the monomial exponent limits.
    #[error("an overflow in the monomial exponents was detected while multiplying two polynomials")]
    ExponentOverflow,
    /// Key arithmetic failure (degree overflow in the truncation data).
    #[error(transparent)]
    Key(#[from] MonomialError),
    /// A destination segment outgrew the allowed table size.
    #[error(transparent)]
    Table(#[from] TableError),
}

// Crossover under which the simple multiplier is always used.
const SIMPLE_MUL_THRESHOLD: u64 = 1000;

// Byte-size sampling for the segment-count heuristic.
const NSEGS_SIZE_TRIALS: usize = 10;
const NSEGS_SEED_LO: u64 = 18379758338774109289;
const NSEGS_SEED_HI: u64 = 15967298767098049689;

// The sparse-case correction factor and the per-segment byte budget of the
// segment-count heuristic. Empirical; re-tune only with measurement.
const EST_TOTAL_FACTOR: f64 = 1e-4;
const SEGMENT_BYTE_BUDGET: f64 = 500.0 * 1024.0;

// Cap on the per-segment capacity reservation derived from the size
// estimate.
const MAX_SEGMENT_RESERVE: usize = 1 << 20;

// ============================================================================
// Truncation policies
// ============================================================================

/// Resolved truncation policy: indices already refer to the operands'
/// common symbol set.
#[derive(Debug, Clone)]
pub(crate) enum Truncation<D> {
    /// Untruncated multiplication.
    None,
    /// Keep terms of total degree `<= max`.
    Total(D),
    /// Keep terms whose degree over the given symbol indices is `<= max`.
    Partial(D, SymbolIdxSet),
}

impl<D: Copy> Truncation<D> {
    pub(crate) fn max_degree(&self) -> Option<D> {
        match self {
            Truncation::None => None,
            Truncation::Total(d) | Truncation::Partial(d, _) => Some(*d),
        }
    }

    pub(crate) fn degree_of<K>(&self, k: &K, ss: &SymbolSet) -> Result<D, MonomialError>
    where
        K: DegreeKey<Degree = D>,
    {
        match self {
            Truncation::Partial(_, si) => k.p_degree(si, ss),
            _ => k.degree(ss),
        }
    }
}

// User-facing truncation input; the active symbol set of the partial policy
// is resolved into indices only once the operands share a symbol set.
enum TruncInput<'a, D> {
    None,
    Total(D),
    Partial(D, &'a SymbolSet),
}

impl<'a, D: Copy> TruncInput<'a, D> {
    fn resolve(&self, ss: &SymbolSet) -> Truncation<D> {
        match self {
            TruncInput::None => Truncation::None,
            TruncInput::Total(d) => Truncation::Total(*d),
            TruncInput::Partial(d, active) => {
                Truncation::Partial(*d, ss.intersection_indices(active))
            }
        }
    }
}

// ============================================================================
// Public surface
// ============================================================================

/// Multiply two series.
pub fn mul<K, C>(x: &Series<K, C>, y: &Series<K, C>) -> Result<Series<K, C>, MulError>
where
    K: DegreeKey,
    C: Ring,
{
    mul_input(x, y, TruncInput::None)
}

/// Multiply two series, keeping only terms of total degree `<= max_degree`.
pub fn truncated_mul<K, C>(
    x: &Series<K, C>,
    y: &Series<K, C>,
    max_degree: K::Degree,
) -> Result<Series<K, C>, MulError>
where
    K: DegreeKey,
    C: Ring,
{
    mul_input(x, y, TruncInput::Total(max_degree))
}

/// Multiply two series, keeping only terms whose partial degree over the
/// variables of `active` is `<= max_degree`.
pub fn p_truncated_mul<K, C>(
    x: &Series<K, C>,
    y: &Series<K, C>,
    max_degree: K::Degree,
    active: &SymbolSet,
) -> Result<Series<K, C>, MulError>
where
    K: DegreeKey,
    C: Ring,
{
    mul_input(x, y, TruncInput::Partial(max_degree, active))
}

fn mul_input<K, C>(
    x: &Series<K, C>,
    y: &Series<K, C>,
    tr: TruncInput<'_, K::Degree>,
) -> Result<Series<K, C>, MulError>
where
    K: DegreeKey,
    C: Ring,
{
    if x.symbol_set() == y.symbol_set() {
        let trunc = tr.resolve(x.symbol_set());
        mul_identical(x, y, &trunc)
    } else {
        let (merged, ins_x, ins_y) = x.symbol_set().merge(y.symbol_set());
        let a = x.extended(&merged, &ins_x);
        let b = y.extended(&merged, &ins_y);
        let trunc = tr.resolve(&merged);
        mul_identical(&a, &b, &trunc)
    }
}

fn mul_identical<K, C>(
    x: &Series<K, C>,
    y: &Series<K, C>,
    trunc: &Truncation<K::Degree>,
) -> Result<Series<K, C>, MulError>
where
    K: DegreeKey,
    C: Ring,
{
    debug_assert_eq!(x.symbol_set(), y.symbol_set());
    let ss = x.symbol_set();

    if x.is_empty() || y.is_empty() {
        return Ok(Series::new(ss.clone()));
    }

    // Both operands are bare coefficients: promote to ring arithmetic.
    if matches!(trunc, Truncation::None) && x.is_single_cf() && y.is_single_cf() {
        let cx = x.to_cf().expect("single-cf series converts");
        let cy = y.to_cf().expect("single-cf series converts");
        return Ok(Series::constant(ss.clone(), cx.mul_ref(&cy)));
    }

    let pairs = (x.len() as u64).saturating_mul(y.len() as u64);
    if K::HOMOMORPHIC_HASH && pairs >= SIMPLE_MUL_THRESHOLD && rayon::current_num_threads() > 1
    {
        mul_mt_hm(x, y, trunc)
    } else {
        mul_simple(x, y, trunc)
    }
}

// ============================================================================
// Simple multiplier
// ============================================================================

fn mul_simple<K, C>(
    x: &Series<K, C>,
    y: &Series<K, C>,
    trunc: &Truncation<K::Degree>,
) -> Result<Series<K, C>, MulError>
where
    K: DegreeKey,
    C: Ring,
{
    let ss = x.symbol_set();
    let v1: Vec<(&K, &C)> = x.terms().collect();
    let v2: Vec<(&K, &C)> = y.terms().collect();

    {
        let k1: Vec<&K> = v1.iter().map(|t| t.0).collect();
        let k2: Vec<&K> = v2.iter().map(|t| t.0).collect();
        if !K::range_overflow_check(&k1, &k2, ss) {
            return Err(MulError::ExponentOverflow);
        }
    }

    // Under truncation both operands are degree-sorted ascending, so the
    // nested loop can binary-search the admissible prefix of v2 and bail out
    // entirely once an x term admits no partner.
    let (v1, v2, degrees) = match trunc {
        Truncation::None => (v1, v2, None),
        _ => {
            fn sort<'k, 'c, K, C>(
                v: Vec<(&'k K, &'c C)>,
                trunc: &Truncation<K::Degree>,
                ss: &SymbolSet,
            ) -> Result<(Vec<(&'k K, &'c C)>, Vec<K::Degree>), MulError>
            where
                K: DegreeKey,
            {
                let mut z: Vec<(K::Degree, (&'k K, &'c C))> = v
                    .into_iter()
                    .map(|t| Ok((trunc.degree_of(t.0, ss)?, t)))
                    .collect::<Result<_, MonomialError>>()?;
                z.sort_by_key(|e| e.0);
                let d = z.iter().map(|e| e.0).collect();
                let v = z.into_iter().map(|e| e.1).collect();
                Ok((v, d))
            }
            let (v1, d1) = sort(v1, trunc, ss)?;
            let (v2, d2) = sort(v2, trunc, ss)?;
            (v1, v2, Some((d1, d2)))
        }
    };

    let mut seg: HashMap<K, C> = HashMap::new();
    let mut tmp = K::unit(ss);

    for (i, (k1, c1)) in v1.iter().enumerate() {
        let j_end = match (&degrees, trunc.max_degree()) {
            (Some((d1, d2)), Some(max)) => {
                let di = d1[i];
                d2.partition_point(|dj| di.checked_add(dj).map_or(false, |s| s <= max))
            }
            _ => v2.len(),
        };
        if j_end == 0 {
            if degrees.is_some() {
                // v1 is degree-sorted: no later term admits a partner either.
                break;
            }
            continue;
        }

        for (k2, c2) in &v2[..j_end] {
            K::mul_into(&mut tmp, k1, k2, ss);
            if let Some(slot) = seg.get_mut(&tmp) {
                slot.add_mul_assign(c1, c2);
            } else {
                seg.insert(tmp.clone(), c1.mul_ref(c2));
            }
        }
    }

    seg.retain(|_, c| !c.is_zero());
    let table = SegmentedTable::from_segments(vec![seg])?;
    Ok(Series::from_parts(ss.clone(), table))
}

// ============================================================================
// Homomorphic parallel multiplier
// ============================================================================

fn mul_mt_hm<K, C>(
    x: &Series<K, C>,
    y: &Series<K, C>,
    trunc: &Truncation<K::Degree>,
) -> Result<Series<K, C>, MulError>
where
    K: DegreeKey,
    C: Ring,
{
    let ss = x.symbol_set().clone();

    // Term copies: the inputs get bucket-sorted (and degree-sorted under
    // truncation) in place.
    let mut v1: Vec<(K, C)> = x.terms().map(|(k, c)| (k.clone(), c.clone())).collect();
    let mut v2: Vec<(K, C)> = y.terms().map(|(k, c)| (k.clone(), c.clone())).collect();

    {
        let k1: Vec<&K> = v1.iter().map(|t| &t.0).collect();
        let k2: Vec<&K> = v2.iter().map(|t| &t.0).collect();
        if !K::range_overflow_check(&k1, &k2, &ss) {
            return Err(MulError::ExponentOverflow);
        }
    }

    // Segment count from the byte-size sample, then the product-size
    // estimate to pre-size each destination segment.
    let log2_nsegs = compute_log2_nsegs(&v1, &v2, &ss);
    let nsegs: usize = 1 << log2_nsegs;
    let mask = (nsegs - 1) as u64;

    let est = if v1.len() >= v2.len() {
        estimate_product_size(&v1, &v2, &ss, trunc)?
    } else {
        estimate_product_size(&v2, &v1, &ss, trunc)?
    };
    let est_terms = u64::try_from(&est).unwrap_or(u64::MAX);
    let reserve = usize::try_from(est_terms / nsegs as u64)
        .unwrap_or(usize::MAX)
        .min(MAX_SEGMENT_RESERVE);
    debug!(
        x_terms = v1.len(),
        y_terms = v2.len(),
        nsegs,
        estimated_terms = est_terms,
        "homomorphic parallel multiplication"
    );

    // Bucket sort: group the terms of each input by hash mod 2^L.
    v1.par_sort_unstable_by_key(|(k, _)| k.hash64() & mask);
    v2.par_sort_unstable_by_key(|(k, _)| k.hash64() & mask);
    let vseg1 = compute_vseg(&v1, nsegs, mask);
    let vseg2 = compute_vseg(&v2, nsegs, mask);

    // Truncation data: per-bucket degree sort plus global degree vectors.
    let degrees = match trunc {
        Truncation::None => None,
        _ => {
            let vd1 = sort_buckets_by_degree(&mut v1, &vseg1, trunc, &ss)?;
            let vd2 = sort_buckets_by_degree(&mut v2, &vseg2, trunc, &ss)?;
            Some((vd1, vd2))
        }
    };

    // One independent task per destination bucket: all (i, j) input bucket
    // pairs with (i + j) mod 2^L == b land here, by hash homomorphism.
    let segments: Result<Vec<HashMap<K, C>>, MulError> = (0..nsegs)
        .into_par_iter()
        .map(|b| {
            let mut seg: HashMap<K, C> = HashMap::with_capacity(reserve);
            let mut tmp = K::unit(&ss);

            for i in 0..nsegs {
                let j = (b + nsegs - i) & (nsegs - 1);
                let (lo1, hi1) = vseg1[i];
                let (lo2, hi2) = vseg2[j];
                if lo1 == hi1 || lo2 == hi2 {
                    continue;
                }

                for i1 in lo1..hi1 {
                    let (k1, c1) = &v1[i1];
                    let hi2_eff = match (&degrees, trunc.max_degree()) {
                        (Some((vd1, vd2)), Some(max)) => {
                            let d1 = vd1[i1];
                            lo2 + vd2[lo2..hi2].partition_point(|d2| {
                                d1.checked_add(d2).map_or(false, |s| s <= max)
                            })
                        }
                        _ => hi2,
                    };

                    for (k2, c2) in &v2[lo2..hi2_eff] {
                        K::mul_into(&mut tmp, k1, k2, &ss);
                        debug_assert_eq!((tmp.hash64() & mask) as usize, b);
                        if let Some(slot) = seg.get_mut(&tmp) {
                            slot.add_mul_assign(c1, c2);
                        } else {
                            seg.insert(tmp.clone(), c1.mul_ref(c2));
                        }
                    }
                }
            }

            seg.retain(|_, c| !c.is_zero());
            if seg.len() > MAX_TABLE_SIZE {
                return Err(TableError::SegmentOverflow {
                    size: seg.len(),
                    max: MAX_TABLE_SIZE,
                }
                .into());
            }
            Ok(seg)
        })
        .collect();

    // An error drops every finished segment: the destination stays empty.
    let table = SegmentedTable::from_segments(segments?)?;
    Ok(Series::from_parts(ss, table))
}

// Half-open index ranges of each hash bucket in a bucket-sorted term vector.
fn compute_vseg<K: Key, C>(v: &[(K, C)], nsegs: usize, mask: u64) -> Vec<(usize, usize)> {
    let mut vseg = Vec::with_capacity(nsegs);
    let mut lo = 0usize;
    for b in 0..nsegs as u64 {
        let hi = lo + v[lo..].partition_point(|(k, _)| (k.hash64() & mask) <= b);
        vseg.push((lo, hi));
        lo = hi;
    }
    debug_assert_eq!(lo, v.len());
    vseg
}

// Sort every bucket range of `v` by (truncation) degree, returning the
// per-term degrees aligned with the new order.
fn sort_buckets_by_degree<K, C>(
    v: &mut [(K, C)],
    vseg: &[(usize, usize)],
    trunc: &Truncation<K::Degree>,
    ss: &SymbolSet,
) -> Result<Vec<K::Degree>, MulError>
where
    K: DegreeKey,
    C: Ring,
{
    let mut vd: Vec<K::Degree> = v
        .iter()
        .map(|(k, _)| trunc.degree_of(k, ss))
        .collect::<Result<_, _>>()?;

    for &(lo, hi) in vseg {
        if hi - lo < 2 {
            continue;
        }
        let mut perm: Vec<usize> = (lo..hi).collect();
        perm.sort_by_key(|&i| vd[i]);

        let terms: Vec<(K, C)> = perm.iter().map(|&i| v[i].clone()).collect();
        let degs: Vec<K::Degree> = perm.iter().map(|&i| vd[i]).collect();
        for (off, t) in terms.into_iter().enumerate() {
            v[lo + off] = t;
        }
        vd[lo..hi].copy_from_slice(&degs);
    }
    debug_assert!(vseg
        .iter()
        .all(|&(lo, hi)| vd[lo..hi].windows(2).all(|w| w[0] <= w[1])));
    Ok(vd)
}

// Average byte size of a product term over a few random samples, scaled by
// the sparse-case factor, then converted into a power-of-two segment count
// within the supported range.
fn compute_log2_nsegs<K, C>(v1: &[(K, C)], v2: &[(K, C)], ss: &SymbolSet) -> u32
where
    K: Key,
    C: Ring,
{
    let pad = size_of::<(K, C)>().saturating_sub(size_of::<K>() + size_of::<C>());

    let mut rng = seeded_rng(
        NSEGS_SEED_LO.wrapping_add(v1.len() as u64),
        NSEGS_SEED_HI.wrapping_add(v2.len() as u64),
    );
    let mut tmp = K::unit(ss);
    let mut acc: usize = 0;
    for _ in 0..NSEGS_SIZE_TRIALS {
        let i1 = rng.gen_range(0..v1.len());
        let i2 = rng.gen_range(0..v2.len());
        K::mul_into(&mut tmp, &v1[i1].0, &v2[i2].0, ss);
        let cf = v1[i1].1.mul_ref(&v2[i2].1);
        acc += tmp.byte_size() + cf.byte_size() + pad;
    }
    let avg = acc as f64 / NSEGS_SIZE_TRIALS as f64;

    let est_total_bytes = EST_TOTAL_FACTOR * avg * v1.len() as f64 * v2.len() as f64;
    let nsegs = (est_total_bytes / SEGMENT_BYTE_BUDGET) as u64;
    let bitlen = 64 - nsegs.leading_zeros();
    bitlen.min(MAX_LOG2_SEGMENTS)
}

// ============================================================================
// Tests
// ============================================================================
