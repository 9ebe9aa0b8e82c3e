//! Shamir secret sharing over the BLS12-381 scalar field.
//!
//! A secret is the constant term of a random polynomial of degree `k - 1`;
//! share `i` is the polynomial evaluated at `i` (1-indexed). Any `k` distinct
//! shares recover the secret by Lagrange interpolation at zero.

use ark_bls12_381::Fr;
use ark_ff::{BigInteger, Field, One, PrimeField, UniformRand, Zero};
use ark_poly::{univariate::DensePolynomial, DenseUVPolynomial, Polynomial};
use ark_std::rand::RngCore;

use crate::error::DarknodeError;

/// One evaluation of a sharing polynomial.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Share {
    /// Abscissa of the evaluation (party id, >= 1)
    pub index: u64,
    pub value: Fr,
}

/// Splits `secret` into `n` shares, any `k` of which reconstruct it.
pub fn split<R: RngCore>(
    secret: Fr,
    n: usize,
    k: usize,
    rng: &mut R,
) -> Result<Vec<Share>, DarknodeError> {
    if k == 0 || k > n {
        return Err(DarknodeError::InvalidParameter(format!(
            "threshold {} is invalid for {} shares",
            k, n
        )));
    }

    let mut coefficients = Vec::with_capacity(k);
    coefficients.push(secret);
    coefficients.extend((1..k).map(|_| Fr::rand(rng)));
    let polynomial = DensePolynomial::from_coefficients_vec(coefficients);

    Ok((1..=n as u64)
        .map(|index| Share {
            index,
            value: polynomial.evaluate(&Fr::from(index)),
        })
        .collect())
}

/// Recovers the secret from shares with distinct, non-zero indices.
///
/// The caller is responsible for passing at least `k` shares; fewer shares
/// interpolate a meaningless value.
pub fn join(shares: &[Share]) -> Result<Fr, DarknodeError> {
    if shares.is_empty() {
        return Err(DarknodeError::InvalidParameter(
            "cannot join zero shares".to_string(),
        ));
    }
    if shares.iter().any(|s| s.index == 0) {
        return Err(DarknodeError::InvalidParameter(
            "share index must be >= 1".to_string(),
        ));
    }

    let mut secret = Fr::zero();
    for (j, share) in shares.iter().enumerate() {
        let xj = Fr::from(share.index);
        let mut numerator = Fr::one();
        let mut denominator = Fr::one();
        for (m, other) in shares.iter().enumerate() {
            if m == j {
                continue;
            }
            let xm = Fr::from(other.index);
            numerator *= xm;
            denominator *= xm - xj;
        }
        let inverse = denominator.inverse().ok_or_else(|| {
            DarknodeError::InvalidParameter(format!("duplicate share index {}", share.index))
        })?;
        secret += share.value * numerator * inverse;
    }
    Ok(secret)
}

/// Whether `value` encodes a non-negative integer, i.e. `value <= (p - 1) / 2`.
pub fn is_non_negative(value: &Fr) -> bool {
    value.into_bigint() <= Fr::MODULUS_MINUS_ONE_DIV_TWO
}

/// Signed integer encoded by `value`, if it fits in an `i128`.
pub fn to_signed(value: &Fr) -> Option<i128> {
    if is_non_negative(value) {
        to_u128(value).and_then(|v| i128::try_from(v).ok())
    } else {
        to_u128(&-*value)
            .and_then(|v| i128::try_from(v).ok())
            .map(|v| -v)
    }
}

fn to_u128(value: &Fr) -> Option<u128> {
    let bigint = value.into_bigint();
    if bigint.num_bits() > 128 {
        return None;
    }
    let limbs = bigint.0;
    Some(((limbs[1] as u128) << 64) | limbs[0] as u128)
}
