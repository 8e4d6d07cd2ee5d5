//! Hashing and signature primitives.
//!
//! Everything consensus-visible hashes with keccak256. Block headers and
//! transactions are signed with secp256k1; the 65-byte signature layout is
//! `r ‖ s ‖ v` with `v ∈ {0, 1}`, and authorship is recovered from the
//! signature rather than carried in the header.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use primitive_types::U256;
use sha3::{Digest, Keccak256};

use crate::{Address, Hash};

/// Length of a recoverable signature: 64 bytes of `r ‖ s` plus recovery id.
pub const SIGNATURE_LENGTH: usize = 65;

/// Errors from signing or recovery.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("65 byte signature missing")]
    MissingSignature,
    #[error("invalid signature values")]
    InvalidSignature,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("public key recovery failed")]
    RecoveryFailed,
}

/// keccak256 of the input.
pub fn keccak256(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Derive the account address of an uncompressed secp256k1 public key:
/// the last 20 bytes of the keccak256 of the 64-byte curve point.
pub fn pubkey_to_address(uncompressed: &[u8]) -> Address {
    // strip the 0x04 SEC1 tag if present
    let point = if uncompressed.len() == 65 {
        &uncompressed[1..]
    } else {
        uncompressed
    };
    Address::from_slice(&keccak256(point)[12..])
}

/// A secp256k1 signing key with its derived address.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
    address: Address,
}

impl Keypair {
    pub fn from_secret(secret: &[u8; 32]) -> Result<Self, CryptoError> {
        let signing =
            SigningKey::from_bytes(secret.into()).map_err(|_| CryptoError::InvalidSecretKey)?;
        let address = pubkey_to_address(
            VerifyingKey::from(&signing)
                .to_encoded_point(false)
                .as_bytes(),
        );
        Ok(Keypair { signing, address })
    }

    pub fn from_secret_hex(s: &str) -> Result<Self, CryptoError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidSecretKey)?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidSecretKey)?;
        Self::from_secret(&secret)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign a 32-byte prehash, returning the 65-byte `r ‖ s ‖ v` signature.
    pub fn sign_hash(&self, prehash: &Hash) -> Result<[u8; SIGNATURE_LENGTH], CryptoError> {
        let (signature, recovery_id): (Signature, RecoveryId) = self
            .signing
            .sign_prehash_recoverable(prehash)
            .map_err(|_| CryptoError::InvalidSignature)?;
        let mut out = [0u8; SIGNATURE_LENGTH];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = recovery_id.to_byte();
        Ok(out)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        write!(f, "Keypair({})", self.address)
    }
}

/// Recover the signer address of a 65-byte signature over a 32-byte prehash.
pub fn recover_address(prehash: &Hash, signature: &[u8]) -> Result<Address, CryptoError> {
    if signature.len() < SIGNATURE_LENGTH {
        return Err(CryptoError::MissingSignature);
    }
    let recovery_id =
        RecoveryId::from_byte(signature[64]).ok_or(CryptoError::InvalidSignature)?;
    let signature = Signature::from_slice(&signature[..64])
        .map_err(|_| CryptoError::InvalidSignature)?;
    let verifying = VerifyingKey::recover_from_prehash(prehash, &signature, recovery_id)
        .map_err(|_| CryptoError::RecoveryFailed)?;
    Ok(pubkey_to_address(
        verifying.to_encoded_point(false).as_bytes(),
    ))
}

/// Check `(v, r, s)` ranges for a transaction signature. `v` must already be
/// reduced to the 0/1 recovery id.
pub fn validate_signature_values(v: u8, r: U256, s: U256) -> bool {
    // secp256k1 group order
    let n = U256::from_big_endian(&[
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xfe, 0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c,
        0xd0, 0x36, 0x41, 0x41,
    ]);
    if r.is_zero() || s.is_zero() {
        return false;
    }
    v <= 1 && r < n && s < n
}
