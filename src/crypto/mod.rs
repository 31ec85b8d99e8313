use ring::{
    rand::SystemRandom,
    signature::{self, Ed25519KeyPair, KeyPair},
};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Crypto operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Failed to generate key")]
    KeyGeneration,

    #[error("Invalid key material")]
    InvalidKey,
}

/// Generate an Ed25519 signing keypair
///
/// Returns the PKCS#8 document for the private half and the raw public key bytes.
pub fn generate_signing_keypair() -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let rng = SystemRandom::new();
    let pkcs8_bytes = Ed25519KeyPair::generate_pkcs8(&rng)
        .map_err(|_| CryptoError::KeyGeneration)?;
    let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8_bytes.as_ref())
        .map_err(|_| CryptoError::InvalidKey)?;

    let private_key = pkcs8_bytes.as_ref().to_vec();
    let public_key = key_pair.public_key().as_ref().to_vec();

    Ok((private_key, public_key))
}

/// Derive the public key from a PKCS#8 Ed25519 private key
pub fn derive_public_key(private_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key_pair = Ed25519KeyPair::from_pkcs8(private_key)
        .map_err(|_| CryptoError::InvalidKey)?;
    Ok(key_pair.public_key().as_ref().to_vec())
}

/// Sign a message using an Ed25519 private key
pub fn sign_message(message: &[u8], private_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key_pair = Ed25519KeyPair::from_pkcs8(private_key)
        .map_err(|_| CryptoError::InvalidKey)?;
    let signature = key_pair.sign(message);
    Ok(signature.as_ref().to_vec())
}

/// Verify a signature using an Ed25519 public key
///
/// Returns `Ok(false)` for any mismatch, including garbage signature or key
/// bytes. Verification never panics on untrusted input.
pub fn verify_signature(message: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool, CryptoError> {
    let peer_public_key = signature::UnparsedPublicKey::new(
        &signature::ED25519,
        public_key,
    );

    match peer_public_key.verify(message, signature) {
        Ok(_) => Ok(true),
        Err(_) => Ok(false),
    }
}

/// Deterministic device id: lowercase hex SHA-256 over the hex public key
/// concatenated with the device name.
///
/// The id survives address changes and re-announcements; a device keeps the same
/// id for as long as it keeps its keypair and name.
pub fn device_id_digest(public_key_hex: &str, device_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key_hex.as_bytes());
    hasher.update(device_name.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_verification() {
        let message = b"Test message for signing";

        let (private_key, public_key) = generate_signing_keypair().unwrap();

        let signature = sign_message(message, &private_key).unwrap();

        let valid = verify_signature(message, &signature, &public_key).unwrap();
        assert!(valid);

        let different_message = b"Different message";
        let invalid = verify_signature(different_message, &signature, &public_key).unwrap();
        assert!(!invalid);
    }

    #[test]
    fn test_derive_public_key_matches_generated() {
        let (private_key, public_key) = generate_signing_keypair().unwrap();
        let derived = derive_public_key(&private_key).unwrap();
        assert_eq!(derived, public_key);
    }

    #[test]
    fn test_device_id_digest_deterministic() {
        let id1 = device_id_digest("aabbcc", "living-room");
        let id2 = device_id_digest("aabbcc", "living-room");
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 64); // hex SHA-256
    }

    #[test]
    fn test_device_id_digest_varies_by_name_and_key() {
        let base = device_id_digest("aabbcc", "living-room");
        assert_ne!(base, device_id_digest("aabbcc", "kitchen"));
        assert_ne!(base, device_id_digest("ddeeff", "living-room"));
    }
}
