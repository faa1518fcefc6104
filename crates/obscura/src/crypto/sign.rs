//! Signature algorithms over audit payloads.
//!
//! Two algorithms are supported: RSA-PSS with SHA-256 (2048-bit minimum) and
//! ECDSA on P-256 with SHA-256. Signatures are produced over the canonical
//! JSON serialization of the audit record and carried base64-encoded in the
//! envelope. ECDSA signatures use DER encoding; RSA-PSS signatures are the
//! raw modulus-sized octet string.

use p256::ecdsa::signature::Verifier as _;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier as _};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::crypto::keys::{PublicKey, SignerKey};
use crate::error::{ObscuraError, Result};

/// Signature algorithm identifiers, serialized with their envelope names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    #[serde(rename = "RSA-PSS-SHA256")]
    RsaPssSha256,
    #[serde(rename = "ECDSA-P256-SHA256")]
    EcdsaP256Sha256,
}

impl std::fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SignatureAlgorithm::RsaPssSha256 => "RSA-PSS-SHA256",
            SignatureAlgorithm::EcdsaP256Sha256 => "ECDSA-P256-SHA256",
        };
        f.write_str(name)
    }
}

/// Signs `payload` with the given private key.
pub fn sign(key: &SignerKey, payload: &[u8]) -> Result<Vec<u8>> {
    match key {
        SignerKey::RsaPss(private) => {
            let signing_key = rsa::pss::BlindedSigningKey::<Sha256>::new(private.as_ref().clone());
            let mut rng = rand::rngs::OsRng;
            let signature = signing_key.sign_with_rng(&mut rng, payload);
            Ok(signature.to_vec())
        }
        SignerKey::EcdsaP256(signing_key) => {
            use p256::ecdsa::signature::Signer as _;
            let signature: p256::ecdsa::Signature = signing_key.sign(payload);
            Ok(signature.to_der().as_bytes().to_vec())
        }
    }
}

/// Verifies `signature` over `payload` with the given public key.
///
/// Returns `Crypto` errors both for malformed signatures and for valid-shape
/// signatures that do not verify; callers distinguish neither.
pub fn verify(key: &PublicKey, payload: &[u8], signature: &[u8]) -> Result<()> {
    match key {
        PublicKey::RsaPss(public) => {
            let verifying_key = rsa::pss::VerifyingKey::<Sha256>::new(public.clone());
            let signature = rsa::pss::Signature::try_from(signature)
                .map_err(|e| ObscuraError::crypto_with_source("malformed RSA-PSS signature", e))?;
            verifying_key
                .verify(payload, &signature)
                .map_err(|e| ObscuraError::crypto_with_source("RSA-PSS verification failed", e))
        }
        PublicKey::EcdsaP256(verifying_key) => {
            let signature = p256::ecdsa::Signature::from_der(signature)
                .map_err(|e| ObscuraError::crypto_with_source("malformed ECDSA signature", e))?;
            verifying_key
                .verify(payload, &signature)
                .map_err(|e| ObscuraError::crypto_with_source("ECDSA verification failed", e))
        }
    }
}
