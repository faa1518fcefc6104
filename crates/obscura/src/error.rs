//! Error types for Obscura.
//!
//! This module defines all error types used throughout the library. All errors
//! inherit from `ObscuraError` and follow Rust error handling best practices:
//!
//! - Use `thiserror` for automatic `Error` trait implementation
//! - Preserve error chains with `#[source]` attributes
//! - Include context in error messages (page indices, profile names, key ids)
//!
//! # Error Handling Philosophy
//!
//! **System errors MUST always bubble up unchanged:**
//! - `ObscuraError::Io` (from `std::io::Error`) - File system errors, permission errors
//! - `ObscuraError::Crypto` - a processing run must never silently proceed
//!   without a valid signature
//!
//! **Recoverable conditions are handled locally and recorded in the audit:**
//! - Invalid individual detections are dropped and logged
//! - Per-box rendering failures degrade to a solid fallback
//! - Per-page decode failures emit a fully redacted page (non-strict mode)
//!
//! **Sensitive content never appears in error messages.** Errors carry page
//! indices, kinds, and counts - never detected text or raster bytes.
use thiserror::Error;

/// Result type alias using `ObscuraError`.
///
/// This is the standard return type for all fallible operations in Obscura.
pub type Result<T> = std::result::Result<T, ObscuraError>;

/// Main error type for all Obscura operations.
///
/// # Variants
///
/// - `Io` - File system and I/O errors (always bubble up)
/// - `UnsupportedFormat` - Input container format not recognized
/// - `Input` - Corrupt or unreadable input container
/// - `PageDecode` - A single page failed to decode (recoverable per-page)
/// - `Profile` - Invalid profile schema, unknown PII kind, inheritance cycle
/// - `Detection` - Detector unavailable, timed out, or returned invalid output
/// - `Redaction` - Rendering failed for a redaction box
/// - `Crypto` - Key not found, signing failed, verification failed
/// - `Serialization` - JSON/YAML/TOML serialization errors
/// - `Resource` - Memory pressure, disk full, graceful-shutdown failures
/// - `Cancelled` - Processing was cancelled by the caller
/// - `DeadlineExceeded` - A per-page deadline elapsed in strict mode
/// - `LockPoisoned` - Mutex/RwLock poisoning (should not happen in normal operation)
#[derive(Debug, Error)]
pub enum ObscuraError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Input error: {message}")]
    Input {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Page {page_index} failed to decode: {message}")]
    PageDecode { page_index: usize, message: String },

    #[error("Profile error: {message}")]
    Profile {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Detection error: {message}")]
    Detection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Redaction error: {message}")]
    Redaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Crypto error: {message}")]
    Crypto {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Resource error: {message}")]
    Resource {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Processing cancelled by caller")]
    Cancelled,

    #[error("Deadline exceeded on page {page_index}")]
    DeadlineExceeded { page_index: usize },

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for ObscuraError {
    fn from(err: serde_json::Error) -> Self {
        ObscuraError::Serialization {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<image::ImageError> for ObscuraError {
    fn from(err: image::ImageError) -> Self {
        ObscuraError::Input {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

macro_rules! error_constructor {
    ($name:ident, $variant:ident) => {
        pastey::paste! {
            #[doc = "Create a " $variant " error"]
            pub fn $name<S: Into<String>>(message: S) -> Self {
                Self::$variant {
                    message: message.into(),
                    source: None,
                }
            }

            #[doc = "Create a " $variant " error with source"]
            pub fn [<$name _with_source>]<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
                message: S,
                source: E,
            ) -> Self {
                Self::$variant {
                    message: message.into(),
                    source: Some(Box::new(source)),
                }
            }
        }
    };
}

impl ObscuraError {
    error_constructor!(input, Input);
    error_constructor!(profile, Profile);
    error_constructor!(detection, Detection);
    error_constructor!(redaction, Redaction);
    error_constructor!(crypto, Crypto);
    error_constructor!(serialization, Serialization);
    error_constructor!(resource, Resource);

    /// Whether this error is recoverable at the page level in non-strict mode.
    pub fn is_page_recoverable(&self) -> bool {
        matches!(
            self,
            ObscuraError::PageDecode { .. }
                | ObscuraError::Redaction { .. }
                | ObscuraError::Detection { .. }
        )
    }
}
