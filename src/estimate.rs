//! Product-size estimation
//!
//! A randomised estimate of how many distinct terms the product of two
//! polynomials will have, used by the parallel multiplier to size the
//! destination's segments before any real work happens.
//!
//! ## Algorithm
//!
//! 20 independent trials run as a parallel reduction. Each trial shuffles
//! the index vector of the larger operand with a deterministically seeded
//! xoroshiro128+ generator, then walks it: for every term of `X` it picks
//! one random partner among the `Y` terms admissible under the truncation
//! bound, multiplies the monomials, and inserts the product key into a local
//! hash set. The first collision ends the trial.
//!
//! - **No collision**: the trial ran in the perfectly sparse regime, and the
//!   number of admissible term products (accumulated in `acc_y`) is the
//!   exact upper bound for the product size; the trial contributes `acc_y`.
//! - **Collision**: first evidence of density; the trial falls back to the
//!   classical quadratic estimate and contributes `2 * count^2`, where
//!   `count` is the number of distinct product keys seen.
//!
//! The result is the average over the trials, clamped to at least 1, carried
//! in arbitrary precision (term counts multiply past 2^64 easily).

use hashbrown::HashSet;
use num_bigint::BigUint;
use num_traits::{CheckedAdd, Zero};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoroshiro128Plus;
use rayon::prelude::*;

use crate::monomial::MonomialError;
use crate::mul::Truncation;
use crate::series::DegreeKey;
use crate::symbols::SymbolSet;

const N_TRIALS: u64 = 20;
const MULTIPLIER: u32 = 2;

// Fixed seed material, mixed with the trial index so runs are reproducible.
const SEED_LO: u64 = 14295768699618639914;
const SEED_HI: u64 = 12042842946850383048;

// Build a xoroshiro128+ generator from two explicit state words.
pub(crate) fn seeded_rng(s0: u64, s1: u64) -> Xoroshiro128Plus {
    let mut seed = [0u8; 16];
    seed[..8].copy_from_slice(&s0.to_le_bytes());
    seed[8..].copy_from_slice(&s1.to_le_bytes());
    Xoroshiro128Plus::from_seed(seed)
}

/// Estimate the number of terms in the product of `x` and `y`.
///
/// `x` must be the larger operand (the caller swaps). The returned estimate
/// is never zero. Fails only if a degree needed for the truncation data
/// overflows.
pub(crate) fn estimate_product_size<K, C1, C2>(
    x: &[(K, C1)],
    y: &[(K, C2)],
    ss: &SymbolSet,
    trunc: &Truncation<K::Degree>,
) -> Result<BigUint, MonomialError>
where
    K: DegreeKey,
    C1: Sync,
    C2: Sync,
{
    debug_assert!(!x.is_empty() && !y.is_empty());
    debug_assert!(x.len() >= y.len());

    // Single-term operands admit an exact answer.
    if x.len() == 1 || y.len() == 1 {
        return Ok(BigUint::from(x.len() as u64) * BigUint::from(y.len() as u64));
    }

    // Degree data for the truncated variants: degrees of x in input order,
    // indices into y sorted by degree alongside the sorted degrees.
    let degree_data = match trunc {
        Truncation::None => None,
        _ => {
            let dx = x
                .iter()
                .map(|(k, _)| trunc.degree_of(k, ss))
                .collect::<Result<Vec<_>, _>>()?;
            let dy_raw = y
                .iter()
                .map(|(k, _)| trunc.degree_of(k, ss))
                .collect::<Result<Vec<_>, _>>()?;
            let mut vidx2: Vec<usize> = (0..y.len()).collect();
            vidx2.sort_by_key(|&j| dy_raw[j]);
            let dy: Vec<K::Degree> = vidx2.iter().map(|&j| dy_raw[j]).collect();
            debug_assert!(dy.windows(2).all(|w| w[0] <= w[1]));
            Some((dx, vidx2, dy))
        }
    };

    let total: BigUint = (0..N_TRIALS)
        .into_par_iter()
        .map(|trial| {
            let mut rng = seeded_rng(
                SEED_LO.wrapping_add(trial),
                SEED_HI.wrapping_add(trial),
            );

            let mut vidx1: Vec<usize> = (0..x.len()).collect();
            vidx1.shuffle(&mut rng);

            let mut seen: HashSet<K> = HashSet::with_capacity(x.len());
            let mut acc_y = BigUint::zero();
            let mut collided = false;
            let mut tmp = K::unit(ss);

            for &i1 in &vidx1 {
                // How much of y the current x term could legally multiply.
                let limit = match (&degree_data, trunc.max_degree()) {
                    (Some((dx, _, dy)), Some(max)) => {
                        let d1 = dx[i1];
                        dy.partition_point(|d2| {
                            d1.checked_add(d2).map_or(false, |sum| sum <= max)
                        })
                    }
                    _ => y.len(),
                };
                if limit == 0 {
                    continue;
                }
                acc_y += BigUint::from(limit as u64);

                // One random admissible partner.
                let j = rng.gen_range(0..limit);
                let idx2 = match &degree_data {
                    Some((_, vidx2, _)) => vidx2[j],
                    None => j,
                };

                K::mul_into(&mut tmp, &x[i1].0, &y[idx2].0, ss);
                if !seen.insert(tmp.clone()) {
                    collided = true;
                    break;
                }
            }

            if collided {
                let count = BigUint::from(seen.len() as u64);
                BigUint::from(MULTIPLIER) * &count * &count
            } else {
                acc_y
            }
        })
        .reduce(BigUint::zero, |a, b| a + b);

    let est = total / BigUint::from(N_TRIALS);
    Ok(if est.is_zero() {
        BigUint::from(1u32)
    } else {
        est
    })
}
