//! Key material and the keystore.
//!
//! Signing keys live in a process-scoped keystore. A handle to a key pair is
//! acquired for the duration of one signing operation and released
//! immediately after (the handle is an `Arc`; dropping it ends the scope).
//! Private key material is never logged and is zeroed on drop: both the RSA
//! and P-256 private key types wipe their scalars when released, and
//! PEM-loaded intermediates are wiped here explicitly.
//!
//! `signer_key_id` is derived from the public half: the SHA-256 of the SPKI
//! DER encoding, truncated to 16 bytes and hex-encoded.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rsa::pkcs8::{DecodePrivateKey as _, EncodePublicKey as _};
use zeroize::Zeroize;

use crate::crypto::hash;
use crate::crypto::sign::SignatureAlgorithm;
use crate::error::{ObscuraError, Result};

/// Private signing key material.
pub enum SignerKey {
    RsaPss(Box<rsa::RsaPrivateKey>),
    EcdsaP256(p256::ecdsa::SigningKey),
}

impl std::fmt::Debug for SignerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material must never reach logs.
        match self {
            SignerKey::RsaPss(_) => f.write_str("SignerKey::RsaPss(..)"),
            SignerKey::EcdsaP256(_) => f.write_str("SignerKey::EcdsaP256(..)"),
        }
    }
}

/// Public verification key material.
#[derive(Debug, Clone)]
pub enum PublicKey {
    RsaPss(rsa::RsaPublicKey),
    EcdsaP256(p256::ecdsa::VerifyingKey),
}

impl PublicKey {
    /// SPKI DER encoding of the key.
    pub fn spki_der(&self) -> Result<Vec<u8>> {
        let doc = match self {
            PublicKey::RsaPss(key) => key
                .to_public_key_der()
                .map_err(|e| ObscuraError::crypto_with_source("SPKI encoding failed", e))?,
            PublicKey::EcdsaP256(key) => key
                .to_public_key_der()
                .map_err(|e| ObscuraError::crypto_with_source("SPKI encoding failed", e))?,
        };
        Ok(doc.as_bytes().to_vec())
    }

    /// `signer_key_id`: hex of the first 16 bytes of SHA-256(SPKI DER).
    pub fn key_id(&self) -> Result<String> {
        let der = self.spki_der()?;
        let digest = hash::sha256_hex(&der);
        Ok(digest[..32].to_string())
    }

    /// Loads a public key from SPKI PEM, trying both supported algorithms.
    pub fn from_public_key_pem(pem: &str) -> Result<Self> {
        use p256::pkcs8::DecodePublicKey as _;
        use rsa::pkcs8::DecodePublicKey as _;
        if let Ok(key) = rsa::RsaPublicKey::from_public_key_pem(pem) {
            return Ok(PublicKey::RsaPss(key));
        }
        if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_pem(pem) {
            return Ok(PublicKey::EcdsaP256(key));
        }
        Err(ObscuraError::crypto("unrecognized public key PEM"))
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            PublicKey::RsaPss(_) => SignatureAlgorithm::RsaPssSha256,
            PublicKey::EcdsaP256(_) => SignatureAlgorithm::EcdsaP256Sha256,
        }
    }
}

/// A private/public key pair bound to its algorithm and derived key id.
pub struct KeyPair {
    signer: SignerKey,
    public: PublicKey,
    algorithm: SignatureAlgorithm,
    key_id: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    fn from_parts(signer: SignerKey, public: PublicKey) -> Result<Self> {
        let key_id = public.key_id()?;
        let algorithm = public.algorithm();
        Ok(Self {
            signer,
            public,
            algorithm,
            key_id,
        })
    }

    /// Generates an RSA key pair. `bits` must be at least 2048.
    pub fn generate_rsa(bits: usize) -> Result<Self> {
        if bits < 2048 {
            return Err(ObscuraError::crypto(format!(
                "RSA keys must be at least 2048 bits, got {}",
                bits
            )));
        }
        let mut rng = rand::rngs::OsRng;
        let private = rsa::RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| ObscuraError::crypto_with_source("RSA key generation failed", e))?;
        let public = rsa::RsaPublicKey::from(&private);
        Self::from_parts(SignerKey::RsaPss(Box::new(private)), PublicKey::RsaPss(public))
    }

    /// Generates a P-256 key pair.
    pub fn generate_p256() -> Self {
        let signing = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let verifying = *signing.verifying_key();
        Self::from_parts(SignerKey::EcdsaP256(signing), PublicKey::EcdsaP256(verifying))
            .expect("P-256 SPKI encoding cannot fail")
    }

    /// Loads a key pair from a PKCS#8 PEM private key.
    pub fn from_pkcs8_pem(algorithm: SignatureAlgorithm, pem: &str) -> Result<Self> {
        let mut pem_owned = pem.to_string();
        let result = match algorithm {
            SignatureAlgorithm::RsaPssSha256 => rsa::RsaPrivateKey::from_pkcs8_pem(&pem_owned)
                .map_err(|e| ObscuraError::crypto_with_source("invalid RSA PKCS#8 PEM", e))
                .and_then(|private| {
                    let public = rsa::RsaPublicKey::from(&private);
                    Self::from_parts(SignerKey::RsaPss(Box::new(private)), PublicKey::RsaPss(public))
                }),
            SignatureAlgorithm::EcdsaP256Sha256 => {
                p256::ecdsa::SigningKey::from_pkcs8_pem(&pem_owned)
                    .map_err(|e| ObscuraError::crypto_with_source("invalid P-256 PKCS#8 PEM", e))
                    .and_then(|signing| {
                        let verifying = *signing.verifying_key();
                        Self::from_parts(
                            SignerKey::EcdsaP256(signing),
                            PublicKey::EcdsaP256(verifying),
                        )
                    })
            }
        };
        pem_owned.zeroize();
        result
    }

    pub fn signer(&self) -> &SignerKey {
        &self.signer
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

/// Process-scoped store of signing keys.
///
/// Lookups hand out `Arc` handles; callers hold them only for the duration of
/// one signing operation.
pub trait KeyStore: Send + Sync {
    fn acquire(&self, key_id: &str) -> Result<Arc<KeyPair>>;

    fn public_key(&self, key_id: &str) -> Result<PublicKey>;
}

/// In-memory keystore.
#[derive(Default)]
pub struct InMemoryKeyStore {
    keys: RwLock<HashMap<String, Arc<KeyPair>>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a key pair and returns its derived key id.
    pub fn insert(&self, pair: KeyPair) -> String {
        let key_id = pair.key_id().to_string();
        self.keys.write().insert(key_id.clone(), Arc::new(pair));
        key_id
    }

    /// Loads a PKCS#8 PEM file into the store.
    pub fn insert_pem_file(
        &self,
        algorithm: SignatureAlgorithm,
        path: impl AsRef<std::path::Path>,
    ) -> Result<String> {
        let mut pem = std::fs::read_to_string(path)?;
        let pair = KeyPair::from_pkcs8_pem(algorithm, &pem);
        pem.zeroize();
        Ok(self.insert(pair?))
    }
}

impl KeyStore for InMemoryKeyStore {
    fn acquire(&self, key_id: &str) -> Result<Arc<KeyPair>> {
        self.keys
            .read()
            .get(key_id)
            .cloned()
            .ok_or_else(|| ObscuraError::crypto(format!("key not found: {}", key_id)))
    }

    fn public_key(&self, key_id: &str) -> Result<PublicKey> {
        Ok(self.acquire(key_id)?.public_key().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_id_is_stable_and_truncated() {
        let pair = KeyPair::generate_p256();
        let id_a = pair.public_key().key_id().unwrap();
        let id_b = pair.public_key().key_id().unwrap();
        assert_eq!(id_a, id_b);
        // 16 bytes hex-encoded.
        assert_eq!(id_a.len(), 32);
        assert!(id_a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_distinct_keys_distinct_ids() {
        let a = KeyPair::generate_p256();
        let b = KeyPair::generate_p256();
        assert_ne!(a.key_id(), b.key_id());
    }

    #[test]
    fn test_rsa_bits_floor() {
        assert!(KeyPair::generate_rsa(1024).is_err());
    }

    #[test]
    fn test_store_acquire_and_missing() {
        let store = InMemoryKeyStore::new();
        let key_id = store.insert(KeyPair::generate_p256());

        let handle = store.acquire(&key_id).unwrap();
        assert_eq!(handle.key_id(), key_id);
        drop(handle);

        let err = store.acquire("deadbeefdeadbeefdeadbeefdeadbeef").unwrap_err();
        assert!(matches!(err, ObscuraError::Crypto { .. }));
    }

    #[test]
    fn test_debug_never_prints_key_material() {
        let pair = KeyPair::generate_p256();
        let debug = format!("{:?}", pair);
        assert!(debug.contains("key_id"));
        assert!(!debug.to_lowercase().contains("secret"));
        assert_eq!(format!("{:?}", pair.signer()), "SignerKey::EcdsaP256(..)");
    }

    #[test]
    fn test_public_key_pem_round_trip() {
        use p256::pkcs8::{EncodePublicKey as _, LineEnding};
        let pair = KeyPair::generate_p256();
        let PublicKey::EcdsaP256(vk) = pair.public_key() else {
            panic!("expected P-256 key");
        };
        let pem = vk.to_public_key_pem(LineEnding::LF).unwrap();
        let loaded = PublicKey::from_public_key_pem(&pem).unwrap();
        assert_eq!(loaded.key_id().unwrap(), pair.key_id());
    }
}
