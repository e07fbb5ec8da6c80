// Hashing and signature seam for the whole workspace.
//
// All content hashing is blake3 with a 1-byte domain tag prepended, so
// cross-level collisions between records, pulse proofs, globule proofs
// and the cloud chain are structurally impossible.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub type Digest = [u8; 32];

/// Domain separation tags, one per hash level.
pub mod tag {
    pub const RECORD: u8 = 0x01;
    pub const PULSE: u8 = 0x02;
    pub const GLOBULE: u8 = 0x03;
    pub const CLOUD: u8 = 0x04;
    pub const CLAIM: u8 = 0x05;
    pub const TOKEN: u8 = 0x06;
}

/// Hash `parts` under the given domain tag.
pub fn hash_with_tag(domain: u8, parts: &[&[u8]]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[domain]);
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// An ed25519 node keypair.
#[derive(Debug)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        KeyPair {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

/// Serialized ed25519 verifying key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CoreError> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CoreError::BadSignature(format!("malformed public key: {e}")))?;
        let sig = Signature::from_slice(signature)
            .map_err(|e| CoreError::BadSignature(format!("malformed signature: {e}")))?;
        key.verify(message, &sig)
            .map_err(|e| CoreError::BadSignature(format!("verification failed: {e}")))
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let pair = KeyPair::from_seed([7u8; 32]);
        let sig = pair.sign(b"pulse proof");
        assert!(pair.public_key().verify(b"pulse proof", &sig).is_ok());
        assert!(pair.public_key().verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn domain_tags_separate_levels() {
        let a = hash_with_tag(tag::PULSE, &[b"data"]);
        let b = hash_with_tag(tag::GLOBULE, &[b"data"]);
        assert_ne!(a, b);
    }

    #[test]
    fn hashing_is_deterministic() {
        let a = hash_with_tag(tag::RECORD, &[b"one", b"two"]);
        let b = hash_with_tag(tag::RECORD, &[b"one", b"two"]);
        assert_eq!(a, b);
    }
}
