//! SHA-256 content hashing.
//!
//! All fingerprints in the system are lowercase-hex SHA-256 digests: input
//! bytes, output bytes, per-page rasters, and the record digests used for
//! chain links. Streaming hashing lets the processor fingerprint documents
//! without holding a second copy of the bytes.

use sha2::{Digest, Sha256};

/// One-shot digest, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Incremental hasher for streamed inputs and outputs.
#[derive(Default)]
pub struct StreamingHasher {
    inner: Sha256,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Fingerprint of a redacted page: raster dimensions and raw pixels plus the
/// scrubbed text layer when one exists, hashed before the writer muxes the
/// page into the output container.
pub fn page_fingerprint(raster: &image::RgbaImage, scrubbed_text: Option<&[String]>) -> String {
    let mut hasher = StreamingHasher::new();
    hasher.update(&raster.width().to_le_bytes());
    hasher.update(&raster.height().to_le_bytes());
    hasher.update(raster.as_raw());
    if let Some(texts) = scrubbed_text {
        for text in texts {
            hasher.update(text.as_bytes());
            hasher.update(&[0]);
        }
    }
    hasher.finalize_hex()
}
