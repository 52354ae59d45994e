//! End-to-end polynomial product scenarios.
//!
//! Small exact products over the rationals, the classic sparse 5-variable
//! benchmark pair `f^10 * g^10` (ignored by default: it produces ~2.1M
//! terms and runs for minutes in debug builds), and a scaled-down live
//! variant guarding the same properties.

use anyhow::Result;
use num_rational::BigRational;

use kpoly::ring::rat;
use kpoly::{mul, p_truncated_mul, truncated_mul, DPackedMonomial, Polynomial, SymbolSet};

// Surface the engine's tracing events (segment counts, size estimates) when
// running with RUST_LOG set, e.g. `RUST_LOG=kpoly=debug cargo test`.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

type M = DPackedMonomial<i64, 8>;
type Q = Polynomial<i64, 8, BigRational>;
type Z = Polynomial<i64, 8, i64>;

fn var(ss: &SymbolSet, name: &str) -> Q {
    Q::variable(ss.clone(), name).unwrap()
}

fn term(s: &mut Q, exps: &[i64], num: i64) {
    s.add_term(M::from_exponents(exps).unwrap(), rat(num, 1)).unwrap();
}

fn poly(ss: &SymbolSet, terms: &[(&[i64], i64)]) -> Q {
    let mut s = Q::new(ss.clone());
    for (e, c) in terms {
        term(&mut s, e, *c);
    }
    s
}

#[test]
fn s1_difference_of_squares() {
    let ss = SymbolSet::from(["x", "y"]);
    let (x, y) = (var(&ss, "x"), var(&ss, "y"));

    let p = mul(&(&x + &y), &(&x - &y)).unwrap();
    assert_eq!(
        p,
        poly(&ss, &[(&[2, 0], 1), (&[0, 2], -1)])
    );
}

#[test]
fn s2_mixed_product_and_partial_truncation() -> Result<()> {
    let ss = SymbolSet::from(["x", "y", "z"]);
    let (x, y, z) = (var(&ss, "x"), var(&ss, "y"), var(&ss, "z"));

    // (z*x + y) * (x - y - 1)
    let lhs = &(&z * &x) + &y;
    let rhs = &(&x - &y) - &Q::constant(ss.clone(), rat(1, 1));
    let p = mul(&lhs, &rhs)?;

    // x^2 z - x y z - x z + x y - y^2 - y, exponent order (x, y, z).
    let full = poly(
        &ss,
        &[
            (&[2, 0, 1], 1),
            (&[1, 1, 1], -1),
            (&[1, 0, 1], -1),
            (&[1, 1, 0], 1),
            (&[0, 2, 0], -1),
            (&[0, 1, 0], -1),
        ],
    );
    assert_eq!(p, full);

    // Truncated at partial degree <= 2 over all three variables: the two
    // cubic-in-(x,y,z) terms drop.
    let active = SymbolSet::from(["x", "y", "z"]);
    let t = p_truncated_mul(&lhs, &rhs, 2, &active)?;
    let cut = poly(
        &ss,
        &[
            (&[1, 0, 1], -1),
            (&[1, 1, 0], 1),
            (&[0, 2, 0], -1),
            (&[0, 1, 0], -1),
        ],
    );
    assert_eq!(t, cut);

    // A generous bound changes nothing.
    assert_eq!(p_truncated_mul(&lhs, &rhs, 100, &active)?, full);

    // Restricting to x only: at most one power of x survives a bound of 1.
    let only_x = SymbolSet::from(["x"]);
    let tx = p_truncated_mul(&lhs, &rhs, 1, &only_x)?;
    let cut_x = poly(
        &ss,
        &[
            (&[1, 1, 1], -1),
            (&[1, 0, 1], -1),
            (&[1, 1, 0], 1),
            (&[0, 2, 0], -1),
            (&[0, 1, 0], -1),
        ],
    );
    assert_eq!(tx, cut_x);
    Ok(())
}

// Symbol set of the classic sparse benchmark pair; coefficients stay
// integral (and all positive, so no term ever cancels and the term count is
// ring-independent).
fn vars5() -> SymbolSet {
    SymbolSet::from(["x", "y", "z", "t", "u"])
}

// f = 1 + x + y + 2 z^2 + 3 t^3 + 5 u^5, exponent order (t, u, x, y, z).
fn poly_f(ss: &SymbolSet) -> Z {
    let mut f = Z::new(ss.clone());
    for (e, c) in [
        (&[0i64, 0, 0, 0, 0] as &[i64], 1i64),
        (&[0, 0, 1, 0, 0], 1),
        (&[0, 0, 0, 1, 0], 1),
        (&[0, 0, 0, 0, 2], 2),
        (&[3, 0, 0, 0, 0], 3),
        (&[0, 5, 0, 0, 0], 5),
    ] {
        f.add_term(M::from_exponents(e).unwrap(), c).unwrap();
    }
    f
}

// g = 1 + u + t + 2 z^2 + 3 y^3 + 5 x^5, exponent order (t, u, x, y, z).
fn poly_g(ss: &SymbolSet) -> Z {
    let mut g = Z::new(ss.clone());
    for (e, c) in [
        (&[0i64, 0, 0, 0, 0] as &[i64], 1i64),
        (&[0, 1, 0, 0, 0], 1),
        (&[1, 0, 0, 0, 0], 1),
        (&[0, 0, 0, 0, 2], 2),
        (&[0, 0, 0, 3, 0], 3),
        (&[0, 0, 5, 0, 0], 5),
    ] {
        g.add_term(M::from_exponents(e).unwrap(), c).unwrap();
    }
    g
}

fn pow(base: &Z, e: u32) -> Z {
    let mut acc = Z::constant(base.symbol_set().clone(), 1);
    for _ in 0..e {
        acc = mul(&acc, base).unwrap();
    }
    acc
}

#[test]
#[ignore = "multi-minute debug-mode runtime; run with --ignored"]
fn s3_large_sparse_product_term_count() {
    let ss = vars5();
    let f10 = pow(&poly_f(&ss), 10);
    let g10 = pow(&poly_g(&ss), 10);

    let p = mul(&f10, &g10).unwrap();
    assert_eq!(p.len(), 2_096_600);
}

#[test]
#[ignore = "multi-minute debug-mode runtime; run with --ignored"]
fn s4_truncation_filters_the_large_product() {
    let ss = vars5();
    let f10 = pow(&poly_f(&ss), 10);
    let g10 = pow(&poly_g(&ss), 10);

    let full = mul(&f10, &g10).unwrap();
    let truncated = truncated_mul(&f10, &g10, 50).unwrap();

    let mut filtered = Z::new(ss.clone());
    for (k, c) in full.terms() {
        if k.degree(&ss).unwrap() <= 50 {
            filtered.add_term(k.clone(), *c).unwrap();
        }
    }
    assert_eq!(truncated, filtered);
}

#[test]
fn scaled_down_benchmark_exercises_the_parallel_path() {
    // f^3 * g^3 has enough term pairs to cross the engine's parallel
    // threshold while staying fast in debug builds.
    init_tracing();
    let ss = vars5();
    let f3 = pow(&poly_f(&ss), 3);
    let g3 = pow(&poly_g(&ss), 3);
    assert!(f3.len() * g3.len() >= 1000);

    let full = mul(&f3, &g3).unwrap();
    assert_eq!(full, mul(&g3, &f3).unwrap());

    // Truncation agrees with filtering, at several bounds.
    for max in [0i64, 5, 12, 30, 1000] {
        let truncated = truncated_mul(&f3, &g3, max).unwrap();
        let mut filtered = Z::new(ss.clone());
        for (k, c) in full.terms() {
            if k.degree(&ss).unwrap() <= max {
                filtered.add_term(k.clone(), *c).unwrap();
            }
        }
        assert_eq!(truncated, filtered, "max {max}");
    }

    // Distributivity spot check: f^3 * (g^3 + 1) == f^3 * g^3 + f^3.
    let g3p1 = g3.add_scalar(&1);
    let lhs = mul(&f3, &g3p1).unwrap();
    let rhs = &full + &f3;
    assert_eq!(lhs, rhs);
}

#[test]
fn powers_by_repeated_multiplication_match_binomials() {
    // (x + 1)^6 has binomial coefficients.
    let ss = SymbolSet::from(["x"]);
    let x1 = Q::variable(ss.clone(), "x").unwrap().add_scalar(&rat(1, 1));

    let mut p = Q::constant(ss.clone(), rat(1, 1));
    for _ in 0..6 {
        p = mul(&p, &x1).unwrap();
    }
    assert_eq!(p.len(), 7);
    for (k, expected) in [1i64, 6, 15, 20, 15, 6, 1].iter().enumerate() {
        let key = DPackedMonomial::from_exponents(&[k as i64]).unwrap();
        assert_eq!(p.coefficient(&key), Some(&rat(*expected, 1)), "x^{k}");
    }
}
