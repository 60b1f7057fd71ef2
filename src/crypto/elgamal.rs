//! Exponential ElGamal over the encryption curve
//!
//! A ciphertext is `(C1, C2)` with `C1 = k*G` and `C2 = m*G + k*P`.
//! Addition is componentwise, so encrypted tallies accumulate without
//! decryption. Decryption recovers `M = C2 - d*C1 = m*G`, then solves the
//! discrete log with baby-step giant-step over a bounded message range.

use std::collections::HashMap;

use ark_std::Zero;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::babyjubjub::{
    generator, identity, point_from_bytes, point_to_bytes, random_scalar, scalar_mul, CurvePoint,
    CurveScalar,
};
use super::fields::InnerField;
use crate::constants::{BALLOT_WIRE_LEN, FIELDS_PER_BALLOT};
use crate::errors::{Error, Result};

/// Sequencer-held decryption key with its public point.
#[derive(Clone)]
pub struct EncryptionKeypair {
    pub secret: CurveScalar,
    pub public: CurvePoint,
}

impl EncryptionKeypair {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let secret = random_scalar(rng);
        let public = scalar_mul(&generator(), &secret);
        Self { secret, public }
    }
}

/// One ElGamal ciphertext.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ciphertext {
    pub c1: CurvePoint,
    pub c2: CurvePoint,
}

impl Ciphertext {
    /// Identity of componentwise addition: `(inf, inf)`.
    pub fn zero() -> Self {
        Self {
            c1: identity(),
            c2: identity(),
        }
    }

    pub fn encrypt<R: Rng + ?Sized>(message: &CurveScalar, public: &CurvePoint, rng: &mut R) -> Self {
        let k = random_scalar(rng);
        Self {
            c1: scalar_mul(&generator(), &k),
            c2: scalar_mul(&generator(), message) + scalar_mul(public, &k),
        }
    }

    pub fn add(&self, other: &Self) -> Self {
        Self {
            c1: self.c1 + other.c1,
            c2: self.c2 + other.c2,
        }
    }

    pub fn sub(&self, other: &Self) -> Self {
        Self {
            c1: self.c1 - other.c1,
            c2: self.c2 - other.c2,
        }
    }

    /// Strip the encryption layer: `M = C2 - d*C1 = m*G`.
    pub fn decrypt_point(&self, secret: &CurveScalar) -> CurvePoint {
        self.c2 - scalar_mul(&self.c1, secret)
    }
}

/// Solve `m*G = target` for `m` in `[0, max_message]` by baby-step
/// giant-step. The baby table holds `ceil(sqrt(max_message)) + 1` entries.
pub fn discrete_log(target: &CurvePoint, max_message: u64) -> Option<u64> {
    if target.is_zero() {
        return Some(0);
    }
    let g = generator();
    let step = (max_message as f64).sqrt().ceil() as u64 + 1;

    let mut baby = HashMap::with_capacity(step as usize);
    let mut acc = identity();
    for j in 0..step {
        baby.insert(point_to_bytes(&acc), j);
        acc += g;
    }

    // giant steps subtract step*G each iteration
    let giant = -scalar_mul(&g, &CurveScalar::from(step));
    let mut gamma = *target;
    for i in 0..=step {
        if let Some(j) = baby.get(&point_to_bytes(&gamma)) {
            let m = i * step + j;
            if m <= max_message {
                return Some(m);
            }
            return None;
        }
        gamma += giant;
    }
    None
}

/// Fixed-size ballot: one ciphertext per vote field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ballot {
    pub ciphertexts: [Ciphertext; FIELDS_PER_BALLOT],
}

impl Default for Ballot {
    fn default() -> Self {
        Self::zero()
    }
}

impl Ballot {
    /// Identity ballot: every field `(inf, inf)`.
    pub fn zero() -> Self {
        Self {
            ciphertexts: [Ciphertext::zero(); FIELDS_PER_BALLOT],
        }
    }

    /// Encrypt up to [`FIELDS_PER_BALLOT`] vote fields; missing fields
    /// encrypt zero.
    pub fn encrypt<R: Rng + ?Sized>(fields: &[u64], public: &CurvePoint, rng: &mut R) -> Self {
        let mut ciphertexts = [Ciphertext::zero(); FIELDS_PER_BALLOT];
        for (i, slot) in ciphertexts.iter_mut().enumerate() {
            let m = CurveScalar::from(fields.get(i).copied().unwrap_or(0));
            *slot = Ciphertext::encrypt(&m, public, rng);
        }
        Self { ciphertexts }
    }

    pub fn add(&self, other: &Self) -> Self {
        let mut out = *self;
        for (slot, o) in out.ciphertexts.iter_mut().zip(&other.ciphertexts) {
            *slot = slot.add(o);
        }
        out
    }

    pub fn sub(&self, other: &Self) -> Self {
        let mut out = *self;
        for (slot, o) in out.ciphertexts.iter_mut().zip(&other.ciphertexts) {
            *slot = slot.sub(o);
        }
        out
    }

    /// Decrypt every field, solving each discrete log over `[0, max_message]`.
    pub fn decrypt(&self, secret: &CurveScalar, max_message: u64) -> Result<[u64; FIELDS_PER_BALLOT]> {
        let mut out = [0u64; FIELDS_PER_BALLOT];
        for (i, ct) in self.ciphertexts.iter().enumerate() {
            let point = ct.decrypt_point(secret);
            out[i] = discrete_log(&point, max_message)
                .ok_or_else(|| Error::Internal("tally exceeds decryption range".into()))?;
        }
        Ok(out)
    }

    /// Wire form: for each ciphertext `C1.X, C1.Y, C2.X, C2.Y`, 32 bytes
    /// each, little-endian reduced coordinates.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BALLOT_WIRE_LEN);
        for ct in &self.ciphertexts {
            out.extend_from_slice(&point_to_bytes(&ct.c1));
            out.extend_from_slice(&point_to_bytes(&ct.c2));
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != BALLOT_WIRE_LEN {
            return Err(Error::MalformedInput(format!(
                "ballot must be {BALLOT_WIRE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut ciphertexts = [Ciphertext::zero(); FIELDS_PER_BALLOT];
        for (i, chunk) in bytes.chunks_exact(128).enumerate() {
            let c1: [u8; 64] = chunk[..64].try_into().unwrap();
            let c2: [u8; 64] = chunk[64..].try_into().unwrap();
            ciphertexts[i] = Ciphertext {
                c1: point_from_bytes(&c1)?,
                c2: point_from_bytes(&c2)?,
            };
        }
        Ok(Self { ciphertexts })
    }

    /// The 32 coordinates in public-input order: all `C1.x`, then all
    /// `C1.y`, then all `C2.x`, then all `C2.y`.
    pub fn hash_inputs(&self) -> Vec<InnerField> {
        let mut out = Vec::with_capacity(FIELDS_PER_BALLOT * 4);
        let coords: Vec<_> = self
            .ciphertexts
            .iter()
            .map(|ct| {
                (
                    super::babyjubjub::coordinates(&ct.c1),
                    super::babyjubjub::coordinates(&ct.c2),
                )
            })
            .collect();
        out.extend(coords.iter().map(|((x, _), _)| *x));
        out.extend(coords.iter().map(|((_, y), _)| *y));
        out.extend(coords.iter().map(|(_, (x, _))| *x));
        out.extend(coords.iter().map(|(_, (_, y))| *y));
        out
    }
}

/// Hex wire form for JSON transport.
impl Serialize for Ballot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for Ballot {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Ballot::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}
