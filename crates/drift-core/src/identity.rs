//! Signing identity for Drift nodes.
//!
//! Each node owns one Ed25519 keypair. The public key doubles as the
//! node's author id — every block the node writes carries it. The
//! private key is created on first boot, persisted to the repo
//! registry, and never mutated afterwards.
//!
//! Secret bytes travel in `Zeroizing` buffers — wiped from memory when
//! dropped. There is no unsafe code in this module.

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::feed::{PublicKey, Signature};

/// A node's long-term Ed25519 signing keypair.
///
/// The public key appears in every authored block. The private key
/// never leaves this struct except through [`Keypair::to_bytes`],
/// which callers use for registry persistence.
pub struct Keypair {
    signing: SigningKey,
    /// Public key — the node's author id.
    pub public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let public = signing.verifying_key().to_bytes();
        Self { signing, public }
    }

    /// Reconstruct a keypair from stored secret bytes.
    /// The public key is derived deterministically from the secret.
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(secret);
        let public = signing.verifying_key().to_bytes();
        Self { signing, public }
    }

    /// Serialize the secret key for persistent storage.
    /// The public key need not be stored — it is always derived on load.
    pub fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Sign a message, returning the 64-byte detached signature.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret half.
        f.debug_struct("Keypair")
            .field("public", &hex::encode(&self.public[..8]))
            .finish_non_exhaustive()
    }
}

/// Errors from signature verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("invalid public key bytes")]
    InvalidPublicKey,

    #[error("signature verification failed")]
    BadSignature,
}

/// Verify a detached Ed25519 signature against an author public key.
pub fn verify(author: &PublicKey, message: &[u8], signature: &Signature) -> Result<(), IdentityError> {
    let key = VerifyingKey::from_bytes(author).map_err(|_| IdentityError::InvalidPublicKey)?;
    let sig = DalekSignature::from_bytes(signature);
    key.verify(message, &sig)
        .map_err(|_| IdentityError::BadSignature)
}
