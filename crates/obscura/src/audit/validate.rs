//! Integrity validation: prove a redacted artifact matches its audit record.
//!
//! Given a candidate output document, a signed audit record, and the signer's
//! public key, validation (1) verifies the envelope signature, (2) recomputes
//! the output fingerprint, and (3) recomputes per-page fingerprints when the
//! per-page artifacts are available. The first mismatch is reported with a
//! structured diagnostic; diagnostics never include detection plaintext.

use serde::{Deserialize, Serialize};

use crate::audit::{verify_envelope, SignedAuditRecord};
use crate::crypto::hash::sha256_hex;
use crate::crypto::keys::PublicKey;
use crate::error::Result;

/// The first integrity failure found, in check order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationFailure {
    /// The envelope could not be parsed at all.
    MalformedRecord { detail: String },
    /// Signature verification failed (wrong key, tampered record, or
    /// tampered signature).
    SignatureInvalid { detail: String },
    /// The candidate output's SHA-256 differs from the record.
    OutputFingerprintMismatch { expected: String, actual: String },
    /// A supplied page artifact's fingerprint differs from the record.
    PageFingerprintMismatch {
        page_index: usize,
        expected: String,
        actual: String,
    },
    /// More page artifacts were supplied than the record describes.
    PageCountMismatch { recorded: usize, supplied: usize },
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationFailure::MalformedRecord { detail } => {
                write!(f, "audit record is malformed: {}", detail)
            }
            ValidationFailure::SignatureInvalid { detail } => {
                write!(f, "signature verification failed: {}", detail)
            }
            ValidationFailure::OutputFingerprintMismatch { .. } => {
                f.write_str("output bytes do not match the audited fingerprint")
            }
            ValidationFailure::PageFingerprintMismatch { page_index, .. } => {
                write!(f, "page {} does not match its audited fingerprint", page_index)
            }
            ValidationFailure::PageCountMismatch { recorded, supplied } => {
                write!(f, "record describes {} pages, {} supplied", recorded, supplied)
            }
        }
    }
}

/// Outcome of a validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ValidationFailure>,
    /// Number of per-page artifacts that were checked.
    pub pages_checked: usize,
}

impl ValidationReport {
    fn pass(pages_checked: usize) -> Self {
        Self {
            ok: true,
            failure: None,
            pages_checked,
        }
    }

    fn fail(failure: ValidationFailure, pages_checked: usize) -> Self {
        Self {
            ok: false,
            failure: Some(failure),
            pages_checked,
        }
    }
}

/// Validates `output_bytes` against a serialized audit envelope.
///
/// Returns `Err` only for internal faults (canonicalization of a parsed
/// record); every integrity mismatch is reported through the
/// [`ValidationReport`] instead.
pub fn validate(
    output_bytes: &[u8],
    audit_record_bytes: &[u8],
    public_key: &PublicKey,
) -> Result<ValidationReport> {
    let envelope = match SignedAuditRecord::from_json_bytes(audit_record_bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            return Ok(ValidationReport::fail(
                ValidationFailure::MalformedRecord {
                    detail: err.to_string(),
                },
                0,
            ));
        }
    };
    validate_envelope(output_bytes, &envelope, public_key, None)
}

/// Validation against an already-parsed envelope, optionally checking
/// per-page artifacts (pre-mux raster fingerprints, indexed by page order).
pub fn validate_envelope(
    output_bytes: &[u8],
    envelope: &SignedAuditRecord,
    public_key: &PublicKey,
    page_fingerprints: Option<&[String]>,
) -> Result<ValidationReport> {
    // Step 1: signature.
    if let Err(err) = verify_envelope(envelope, public_key) {
        return Ok(ValidationReport::fail(
            ValidationFailure::SignatureInvalid {
                detail: err.to_string(),
            },
            0,
        ));
    }

    // Step 2: output fingerprint.
    let actual = sha256_hex(output_bytes);
    if actual != envelope.record.output_fingerprint {
        return Ok(ValidationReport::fail(
            ValidationFailure::OutputFingerprintMismatch {
                expected: envelope.record.output_fingerprint.clone(),
                actual,
            },
            0,
        ));
    }

    // Step 3: per-page artifacts, when available.
    let mut pages_checked = 0;
    if let Some(supplied) = page_fingerprints {
        let recorded = &envelope.record.per_page_output_fingerprints;
        if supplied.len() > recorded.len() {
            return Ok(ValidationReport::fail(
                ValidationFailure::PageCountMismatch {
                    recorded: recorded.len(),
                    supplied: supplied.len(),
                },
                0,
            ));
        }
        for (page_index, (actual, expected)) in supplied.iter().zip(recorded).enumerate() {
            if actual != expected {
                return Ok(ValidationReport::fail(
                    ValidationFailure::PageFingerprintMismatch {
                        page_index,
                        expected: expected.clone(),
                        actual: actual.clone(),
                    },
                    pages_checked,
                ));
            }
            pages_checked += 1;
        }
    }

    Ok(ValidationReport::pass(pages_checked))
}
