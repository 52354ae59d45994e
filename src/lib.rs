//! Crate root: public surface and crate-wide invariants
//!
//! `kpoly` is a computer-algebra kernel for sparse multivariate polynomials
//! over user-supplied coefficient rings. Its two load-bearing ideas:
//!
//! - **Kronecker packing.** A monomial's exponent vector is packed into a
//!   short sequence of machine scalars ([`kpack`], [`monomial`]), with a
//!   constant-division unpacker (one high multiply, two shifts) so the hot
//!   path never divides.
//! - **Homomorphic hashing.** The monomial hash is the wrapping sum of the
//!   packed chunks, so `hash(a * b) == hash(a) + hash(b)`. The parallel
//!   multiplier ([`mul`]) exploits this to partition a product across the
//!   `2^L` segments of the destination's hash table ([`table`]) with zero
//!   write contention: input bucket pair `(i, j)` always lands in output
//!   bucket `(i + j) mod 2^L`.
//!
//! ## Invariants (crate-wide)
//!
//! - Series ([`series::Series`]) hold compatible, unique keys and never
//!   expose a zero coefficient after a settled operation.
//! - The multiplication engine is strongly failure-safe: it either returns
//!   the complete product or an error with no observable destination.
//! - Packing tables are compile-time constants; randomized components (the
//!   product-size estimator) use xoroshiro128+ with fixed seed material, so
//!   estimates are reproducible run to run.
//!
//! ## Entry points
//!
//! Build series over a symbol set with [`Series::variable`](series::Series::variable) /
//! [`Series::constant`](series::Series::constant), combine them with the
//! usual operators, and multiply through [`mul::mul`],
//! [`mul::truncated_mul`] (total-degree bound) or [`mul::p_truncated_mul`]
//! (partial-degree bound over a set of active variables):
//!
//! ```
//! use kpoly::{Polynomial, SymbolSet};
//!
//! let ss = SymbolSet::from(["x", "y"]);
//! type P = Polynomial<i64, 8, num_rational::BigRational>;
//! let x = P::variable(ss.clone(), "x").unwrap();
//! let y = P::variable(ss.clone(), "y").unwrap();
//!
//! // (x + y) * (x - y) == x^2 - y^2
//! let p = kpoly::mul::mul(&(&x + &y), &(&x - &y)).unwrap();
//! assert_eq!(p.len(), 2);
//! let y2 = kpoly::DPackedMonomial::from_exponents(&[0, 2]).unwrap();
//! assert_eq!(p.coefficient(&y2), Some(&-kpoly::ring::rat(1, 1)));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Kronecker codec: pack/unpack bounded integer vectors into one scalar.
pub mod kpack;
/// Ordered symbol sets, merging, index intersection.
pub mod symbols;
/// Coefficient-ring contract and stock implementations.
pub mod ring;
/// Segmented open-addressing term storage.
pub mod table;
/// Series container and the key protocol.
pub mod series;
/// Dynamic packed monomials and their algebra.
pub mod monomial;
/// Product-size estimation for the parallel multiplier.
mod estimate;
/// The multiplication engine (simple + homomorphic parallel).
pub mod mul;

pub use crate::kpack::{KPackable, KPacker, KUnpacker, KpackError};
pub use crate::monomial::{DPackedMonomial, MonomialError};
pub use crate::mul::{mul, p_truncated_mul, truncated_mul, MulError};
pub use crate::ring::{Ring, RingDiv};
pub use crate::series::{DegreeKey, Key, Series, SeriesError};
pub use crate::symbols::{SymbolIdx, SymbolIdxMap, SymbolIdxSet, SymbolSet};
pub use crate::table::{SegmentedTable, TableError, MAX_LOG2_SEGMENTS, MAX_TABLE_SIZE};

/// A polynomial: a series keyed by dynamic packed monomials over `T` chunks
/// with `NBITS` bits per exponent.
pub type Polynomial<T, const NBITS: u32, C> = Series<DPackedMonomial<T, NBITS>, C>;
