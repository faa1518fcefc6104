//! Forensic audit engine: signed, append-only records of what was done to
//! which bytes under which policy.
//!
//! Each processed document yields exactly one [`AuditRecord`], sealed into a
//! [`SignedAuditRecord`] envelope whose signature covers the RFC 8785
//! canonical serialization of the record. Records are persisted exactly once
//! through an [`AuditSink`] and never modified; reprocessing a document
//! produces a new record that references its predecessor's content digest,
//! forming a hash chain. Timestamps live in their own sub-object so the
//! content digest used for chaining and determinism checks can exclude them.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::hash::sha256_hex;
use crate::crypto::keys::KeyStore;
use crate::crypto::sign::{self, SignatureAlgorithm};
use crate::error::{ObscuraError, Result};
use crate::profile::EffectiveProfile;
use crate::redact::DegradedRedaction;
use crate::types::Detection;

pub mod canonical;
pub mod validate;

pub use validate::{validate, ValidationFailure, ValidationReport};

/// Process-wide monotonic counter for audit timestamps. Wall clocks can step;
/// this cannot.
static MONOTONIC_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_monotonic() -> u64 {
    MONOTONIC_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Wall-clock bounds plus a monotonic counter, kept in one sub-object so the
/// rest of the record hashes identically across reruns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditTimestamps {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub monotonic_counter: u64,
}

/// Record of one scrubbed text span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubRecord {
    pub page_index: usize,
    pub reading_order: usize,
    pub replaced_chars: usize,
}

/// The signed payload: everything the pipeline did to one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub document_id: Uuid,
    /// SHA-256 of the raw input bytes, lowercase hex.
    pub input_fingerprint: String,
    /// SHA-256 of the final output bytes, lowercase hex.
    pub output_fingerprint: String,
    /// Pre-mux SHA-256 per page raster, indexed by page order.
    pub per_page_output_fingerprints: Vec<String>,
    /// The resolved profile, inlined with its precedence notes.
    pub profile: EffectiveProfile,
    /// Every detection actually applied (post-fusion, pre-redaction), in
    /// deterministic order.
    pub detections: Vec<Detection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_redactions: Vec<DegradedRedaction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scrubbed_spans: Vec<ScrubRecord>,
    pub timestamps: AuditTimestamps,
    pub tool_version: String,
    pub model_tags: Vec<String>,
    /// Content digest of the predecessor record when a document is
    /// reprocessed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_audit_id: Option<String>,
    /// Monotonic sequence number within a document's chain.
    pub sequence: u64,
}

impl AuditRecord {
    /// Digest of the canonical record with `timestamps` removed.
    ///
    /// This is the value chained into successor records and the one that is
    /// byte-stable across reruns with identical inputs and keys.
    pub fn content_digest(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("timestamps");
        }
        let bytes = canonical::to_canonical_bytes(&value)?;
        Ok(sha256_hex(&bytes))
    }
}

/// Outer envelope: the record plus its detached signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedAuditRecord {
    pub record: AuditRecord,
    /// Base64 signature over the canonical serialization of `record`.
    pub signature: String,
    pub signer_key_id: String,
    pub signature_algorithm: SignatureAlgorithm,
}

impl SignedAuditRecord {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Destination for persisted audit records. The audit engine is the only
/// component permitted to emit persisted metadata.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn persist(&self, envelope: &SignedAuditRecord) -> Result<()>;
}

#[async_trait]
impl<T: AuditSink + ?Sized> AuditSink for std::sync::Arc<T> {
    async fn persist(&self, envelope: &SignedAuditRecord) -> Result<()> {
        (**self).persist(envelope).await
    }
}

/// One self-contained JSON file per record: `<document_id>-<sequence>.audit.json`.
#[cfg(feature = "tokio-runtime")]
pub struct FsAuditSink {
    directory: std::path::PathBuf,
}

#[cfg(feature = "tokio-runtime")]
impl FsAuditSink {
    pub fn new(directory: impl Into<std::path::PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[cfg(feature = "tokio-runtime")]
#[async_trait]
impl AuditSink for FsAuditSink {
    async fn persist(&self, envelope: &SignedAuditRecord) -> Result<()> {
        let name = format!(
            "{}-{}.audit.json",
            envelope.record.document_id, envelope.record.sequence
        );
        let path = self.directory.join(name);
        tokio::fs::create_dir_all(&self.directory).await?;
        tokio::fs::write(&path, envelope.to_json_bytes()?).await?;
        Ok(())
    }
}

/// Sink that keeps envelopes in memory; used by tests and embedders that
/// manage persistence themselves.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: parking_lot::Mutex<Vec<SignedAuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SignedAuditRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn persist(&self, envelope: &SignedAuditRecord) -> Result<()> {
        self.records.lock().push(envelope.clone());
        Ok(())
    }
}

/// Builds, signs, and persists audit records.
pub struct AuditEngine<S: AuditSink> {
    keystore: std::sync::Arc<dyn KeyStore>,
    sink: S,
}

impl<S: AuditSink> AuditEngine<S> {
    pub fn new(keystore: std::sync::Arc<dyn KeyStore>, sink: S) -> Self {
        Self { keystore, sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Fills in chain fields for a successor of `previous`.
    pub fn chain_fields(previous: Option<&AuditRecord>) -> Result<(Option<String>, u64)> {
        match previous {
            Some(prev) => Ok((Some(prev.content_digest()?), prev.sequence + 1)),
            None => Ok((None, 0)),
        }
    }

    /// Stamps the record's timestamps sub-object.
    pub fn timestamps(
        started_at: chrono::DateTime<chrono::Utc>,
        finished_at: chrono::DateTime<chrono::Utc>,
    ) -> AuditTimestamps {
        AuditTimestamps {
            started_at,
            finished_at,
            monotonic_counter: next_monotonic(),
        }
    }

    /// Signs `record` with the key identified by `key_id`.
    ///
    /// The signing key handle is scoped to this call: acquired, used, and
    /// released before returning.
    pub fn seal(&self, record: AuditRecord, key_id: &str) -> Result<SignedAuditRecord> {
        let pair = self.keystore.acquire(key_id)?;
        let payload = canonical::canonicalize(&record)?;
        let signature = sign::sign(pair.signer(), &payload)?;
        Ok(SignedAuditRecord {
            record,
            signature: base64::engine::general_purpose::STANDARD.encode(signature),
            signer_key_id: pair.key_id().to_string(),
            signature_algorithm: pair.algorithm(),
        })
    }

    /// Seals and persists in one step. Persisting happens exactly once per
    /// record; the engine never rewrites an existing record.
    pub async fn seal_and_persist(
        &self,
        record: AuditRecord,
        key_id: &str,
    ) -> Result<SignedAuditRecord> {
        let envelope = self.seal(record, key_id)?;
        self.sink.persist(&envelope).await?;
        Ok(envelope)
    }
}

/// Verifies the envelope signature against the given public key.
pub fn verify_envelope(
    envelope: &SignedAuditRecord,
    public_key: &crate::crypto::keys::PublicKey,
) -> Result<()> {
    let expected_key_id = public_key.key_id()?;
    if expected_key_id != envelope.signer_key_id {
        return Err(ObscuraError::crypto(format!(
            "signer key id mismatch: envelope names {}, provided key is {}",
            envelope.signer_key_id, expected_key_id
        )));
    }
    let payload = canonical::canonicalize(&envelope.record)?;
    let signature = base64::engine::general_purpose::STANDARD
        .decode(&envelope.signature)
        .map_err(|e| ObscuraError::crypto_with_source("signature is not valid base64", e))?;
    sign::verify(public_key, &payload, &signature)
}
