//! Voter signature checks
//!
//! Voters authenticate ballots with secp256k1 ECDSA over the ballot
//! public-input hash reduced into the outer field. Census keys are
//! Ethereum-style addresses: the low 20 bytes of the Keccak-256 of the
//! uncompressed public key.

use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};

use crate::errors::{Error, Result};

/// Address of a secp256k1 public key: `keccak256(uncompressed[1..])[12..]`.
pub fn derive_address(key: &VerifyingKey) -> [u8; 20] {
    let point = key.to_encoded_point(false);
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest[12..]);
    addr
}

/// Parse a SEC1 public key (compressed or uncompressed).
pub fn parse_public_key(bytes: &[u8]) -> Result<VerifyingKey> {
    VerifyingKey::from_sec1_bytes(bytes).map_err(|_| Error::MalformedInput("bad public key".into()))
}

/// Verify a 64-byte `r || s` signature over a 32-byte prehash. A trailing
/// recovery byte, if present, is ignored.
pub fn verify_prehash(key: &VerifyingKey, prehash: &[u8; 32], signature: &[u8]) -> Result<()> {
    let raw = match signature.len() {
        64 => signature,
        65 => &signature[..64],
        n => {
            return Err(Error::MalformedInput(format!(
                "signature must be 64 or 65 bytes, got {n}"
            )))
        }
    };
    let sig = Signature::from_slice(raw).map_err(|_| Error::InvalidSignature)?;
    key.verify_prehash(prehash, &sig)
        .map_err(|_| Error::InvalidSignature)
}

/// Recover the signer address from a 65-byte `r || s || v` signature.
/// `v` accepts both the raw recovery id and the 27/28 convention.
pub fn recover_address(prehash: &[u8; 32], signature: &[u8]) -> Result<[u8; 20]> {
    if signature.len() != 65 {
        return Err(Error::MalformedInput(
            "recoverable signature must be 65 bytes".into(),
        ));
    }
    let sig = Signature::from_slice(&signature[..64]).map_err(|_| Error::InvalidSignature)?;
    let v = signature[64];
    let recovery = RecoveryId::from_byte(if v >= 27 { v - 27 } else { v })
        .ok_or(Error::InvalidSignature)?;
    let key = VerifyingKey::recover_from_prehash(prehash, &sig, recovery)
        .map_err(|_| Error::InvalidSignature)?;
    Ok(derive_address(&key))
}

/// Produce a 65-byte recoverable signature over a prehash. Used by setup
/// tooling and test fixtures; the sequencer itself only verifies.
pub fn sign_prehash(key: &SigningKey, prehash: &[u8; 32]) -> Result<[u8; 65]> {
    let (sig, recovery) = key
        .sign_prehash_recoverable(prehash)
        .map_err(|_| Error::Internal("signing failed".into()))?;
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&sig.to_bytes());
    out[64] = recovery.to_byte();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SigningKey {
        SigningKey::from_slice(&[0x42u8; 32]).unwrap()
    }

    #[test]
    fn test_verify_round_trip() {
        let key = test_key();
        let prehash = [7u8; 32];
        let sig = sign_prehash(&key, &prehash).unwrap();
        verify_prehash(&VerifyingKey::from(&key), &prehash, &sig).unwrap();
    }

    #[test]
    fn test_wrong_key_rejected() {
        let key = test_key();
        let other = SigningKey::from_slice(&[0x43u8; 32]).unwrap();
        let prehash = [7u8; 32];
        let sig = sign_prehash(&key, &prehash).unwrap();
        assert!(verify_prehash(&VerifyingKey::from(&other), &prehash, &sig).is_err());
    }

    #[test]
    fn test_recover_matches_derive() {
        let key = test_key();
        let prehash = [9u8; 32];
        let sig = sign_prehash(&key, &prehash).unwrap();
        let addr = recover_address(&prehash, &sig).unwrap();
        assert_eq!(addr, derive_address(&VerifyingKey::from(&key)));
    }

    #[test]
    fn test_v27_convention() {
        let key = test_key();
        let prehash = [1u8; 32];
        let mut sig = sign_prehash(&key, &prehash).unwrap();
        sig[64] += 27;
        let addr = recover_address(&prehash, &sig).unwrap();
        assert_eq!(addr, derive_address(&VerifyingKey::from(&key)));
    }
}
