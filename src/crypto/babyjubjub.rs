//! Twisted-Edwards curve operations for ballot encryption
//!
//! The encryption curve is embedded in the ballot-proof inner field, so
//! ciphertext coordinates are inner field elements the circuit consumes
//! directly. Wire form of a point is `x || y`, 32 bytes each,
//! little-endian reduced coordinates; the identity is `(0, 1)`.

use ark_ec::{AffineRepr, CurveGroup};
use ark_ed_on_bn254::{EdwardsAffine, EdwardsProjective};
use ark_std::{UniformRand, Zero};
use rand::Rng;

use super::fields::{self, InnerField};
use crate::errors::{Error, Result};

/// Scalar field of the encryption subgroup.
pub type CurveScalar = ark_ed_on_bn254::Fr;

/// Curve point in projective form.
pub type CurvePoint = EdwardsProjective;

/// Subgroup generator.
pub fn generator() -> CurvePoint {
    EdwardsAffine::generator().into_group()
}

/// The identity element.
pub fn identity() -> CurvePoint {
    CurvePoint::zero()
}

pub fn scalar_mul(p: &CurvePoint, s: &CurveScalar) -> CurvePoint {
    *p * *s
}

/// Uniform scalar in `[1, order)`.
pub fn random_scalar<R: Rng + ?Sized>(rng: &mut R) -> CurveScalar {
    loop {
        let s = CurveScalar::rand(rng);
        if !s.is_zero() {
            return s;
        }
    }
}

/// Affine coordinates of a point, `(x, y)` as inner field elements.
pub fn coordinates(p: &CurvePoint) -> (InnerField, InnerField) {
    let affine = p.into_affine();
    (affine.x, affine.y)
}

/// Wire encoding: `x || y`, little-endian reduced coordinates.
pub fn point_to_bytes(p: &CurvePoint) -> [u8; 64] {
    let (x, y) = coordinates(p);
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(&fields::to_bytes_le(&x));
    out[32..].copy_from_slice(&fields::to_bytes_le(&y));
    out
}

/// Rebuild a point from affine coordinates, rejecting off-curve values.
pub fn point_from_coordinates(x: InnerField, y: InnerField) -> Result<CurvePoint> {
    let affine = EdwardsAffine::new_unchecked(x, y);
    if !affine.is_on_curve() || !affine.is_in_correct_subgroup_assuming_on_curve() {
        return Err(Error::MalformedInput("point not on curve".into()));
    }
    Ok(affine.into_group())
}

pub fn point_from_bytes(bytes: &[u8; 64]) -> Result<CurvePoint> {
    let x = fields::from_bytes_le::<InnerField>(&bytes[..32]);
    let y = fields::from_bytes_le::<InnerField>(&bytes[32..]);
    point_from_coordinates(x, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_coordinates() {
        let (x, y) = coordinates(&identity());
        assert_eq!(x, InnerField::from(0u64));
        assert_eq!(y, InnerField::from(1u64));
    }

    #[test]
    fn test_point_round_trip() {
        let mut rng = ark_std::test_rng();
        let p = scalar_mul(&generator(), &random_scalar(&mut rng));
        let bytes = point_to_bytes(&p);
        assert_eq!(point_from_bytes(&bytes).unwrap(), p);
    }

    #[test]
    fn test_off_curve_rejected() {
        let x = InnerField::from(3u64);
        let y = InnerField::from(7u64);
        assert!(point_from_coordinates(x, y).is_err());
    }

    #[test]
    fn test_scalar_mul_distributes() {
        let mut rng = ark_std::test_rng();
        let a = random_scalar(&mut rng);
        let b = random_scalar(&mut rng);
        let g = generator();
        assert_eq!(scalar_mul(&g, &a) + scalar_mul(&g, &b), scalar_mul(&g, &(a + b)));
    }
}
