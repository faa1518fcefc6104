//! Obscura - Forensic Document Deidentification
//!
//! Obscura is a Rust-first document deidentification pipeline. It detects
//! personally identifiable information by fusing visual and textual evidence,
//! applies layout-preserving redactions, and emits cryptographically signed
//! audit records that prove - later and independently - that a specific
//! redacted artifact was produced from a specific input under a specific
//! policy.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use obscura::{
//!     InMemoryKeyStore, KeyPair, MemoryAuditSink, PatternTextDetector, Processor,
//!     ProcessorConfig,
//! };
//!
//! # fn main() -> obscura::Result<()> {
//! let keystore = Arc::new(InMemoryKeyStore::new());
//! let key_id = keystore.insert(KeyPair::generate_p256());
//!
//! let processor = Processor::builder()
//!     .keystore(keystore)
//!     .audit_sink(Arc::new(MemoryAuditSink::new()))
//!     .text_detector(Arc::new(PatternTextDetector::new()))
//!     .config(ProcessorConfig::new(key_id))
//!     .build()?;
//!
//! let input = std::fs::read("scan.png")?;
//! let processed = processor.process_sync(&input, "default")?;
//! println!("{} redactions applied", processed.result.redactions_applied);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Document Loader** (`document`): per-page rasters plus optional
//!   positioned text layers from raster images and (with the `pdf` feature)
//!   paginated PDFs
//! - **Hybrid Detection** (`detect`): visual and textual detector contracts
//!   and the fusion pass that dedupes and ranks their evidence
//! - **Redaction Engine** (`redact`): solid, pixelate, blur, and pattern
//!   styles applied to a distinct output raster; text-layer scrubbing
//! - **Forensic Audit** (`audit` + `crypto`): SHA-256 fingerprints, RFC 8785
//!   canonical records, RSA-PSS / ECDSA-P256 signatures, integrity validation
//! - **Processor** (`processor`): per-document orchestration and the bounded
//!   batch driver

#![deny(unsafe_code)]

pub mod audit;
pub mod crypto;
pub mod detect;
pub mod document;
pub mod error;
pub mod profile;
pub mod redact;
pub mod types;

#[cfg(feature = "tokio-runtime")]
pub mod processor;

pub use error::{ObscuraError, Result};
pub use types::*;

pub use audit::{
    validate, AuditRecord, AuditSink, AuditTimestamps, MemoryAuditSink, SignedAuditRecord,
    ValidationFailure, ValidationReport,
};

#[cfg(feature = "tokio-runtime")]
pub use audit::FsAuditSink;
pub use crypto::{
    sha256_hex, InMemoryKeyStore, KeyPair, KeyStore, PublicKey, SignatureAlgorithm,
};
pub use detect::patterns::PatternTextDetector;
pub use detect::{TextDetector, VisualDetector};
pub use document::{
    detect_format, open_document, DocumentHandle, InputFormat, LoaderConfig, OutputWriter,
};
pub use profile::{
    EffectiveProfile, EffectiveRule, PatternId, ProfileStore, RedactionProfile, RgbColor,
    RuleSpec, StyleSpec,
};
pub use redact::{DegradedReason, DegradedRedaction, RedactedPage, RedactionEngine};

#[cfg(feature = "tokio-runtime")]
pub use processor::{
    CancelToken, DocumentState, ProcessedDocument, Processor, ProcessorBuilder, ProcessorConfig,
};
