//! Document loading: per-page rasters plus optional positioned text layers.
//!
//! The core consumes documents through the [`DocumentHandle`] contract: a
//! total page count and a restartable `page(i)` accessor that yields
//! [`PageView`]s in ascending index order. Built-in backends cover single-page
//! raster images ([`raster`]) and in-memory synthetic documents ([`memory`]);
//! paginated PDF support lives behind the `pdf` cargo feature. Anything else
//! (OCR, exotic containers) is an external collaborator that implements the
//! same contract.
//!
//! DPI policy: vector sources are rasterized at the configured target DPI
//! (default 200); raster sources keep their native resolution, which is
//! recorded on the page view.

use crate::error::{ObscuraError, Result};
use crate::redact::RedactedPage;
use crate::types::PageView;

pub mod memory;
pub mod raster;

#[cfg(feature = "pdf")]
pub mod pdf;

/// Default rasterization density for vector sources, in dots per inch.
pub const DEFAULT_TARGET_DPI: f32 = 200.0;

/// Loader options shared by all backends.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Density used when rasterizing paginated vector sources.
    pub target_dpi: f32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            target_dpi: DEFAULT_TARGET_DPI,
        }
    }
}

/// Input container formats the core recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Png,
    Jpeg,
    Tiff,
    Bmp,
    Pdf,
}

impl InputFormat {
    pub fn is_raster(&self) -> bool {
        !matches!(self, InputFormat::Pdf)
    }
}

/// Sniffs the container format from leading magic bytes.
pub fn detect_format(bytes: &[u8]) -> Result<InputFormat> {
    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
    const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
    const TIFF_LE: &[u8] = b"II*\0";
    const TIFF_BE: &[u8] = b"MM\0*";
    const BMP_MAGIC: &[u8] = b"BM";
    const PDF_MAGIC: &[u8] = b"%PDF-";

    if bytes.starts_with(PNG_MAGIC) {
        Ok(InputFormat::Png)
    } else if bytes.starts_with(JPEG_MAGIC) {
        Ok(InputFormat::Jpeg)
    } else if bytes.starts_with(TIFF_LE) || bytes.starts_with(TIFF_BE) {
        Ok(InputFormat::Tiff)
    } else if bytes.starts_with(BMP_MAGIC) {
        Ok(InputFormat::Bmp)
    } else if bytes.starts_with(PDF_MAGIC) {
        Ok(InputFormat::Pdf)
    } else {
        Err(ObscuraError::UnsupportedFormat(format!(
            "unrecognized container (first bytes: {:02x?})",
            &bytes[..bytes.len().min(8)]
        )))
    }
}

/// A loaded document: page count plus restartable per-page access.
///
/// Implementations SHOULD decode lazily but MUST yield pages in ascending
/// index order when iterated via [`DocumentHandle::pages`]. A per-page decode
/// failure surfaces as [`ObscuraError::PageDecode`], which the processor
/// recovers from in non-strict mode.
pub trait DocumentHandle: Send + Sync {
    fn page_count(&self) -> usize;

    /// Builds the page view for `index`. Restartable: calling twice for the
    /// same index yields equivalent views.
    fn page(&self, index: usize) -> Result<PageView>;

    /// Page dimensions without decoding, when the container records them.
    /// Lets the processor emit a correctly sized fallback page for an
    /// undecodable page.
    fn page_dimensions(&self, index: usize) -> Option<(u32, u32)> {
        let _ = index;
        None
    }

    fn format(&self) -> InputFormat;

    /// Ordered, lazy iteration over all pages.
    fn pages(&self) -> PageIter<'_>
    where
        Self: Sized,
    {
        PageIter {
            handle: self,
            next_index: 0,
        }
    }
}

/// Ascending-order page iterator over a [`DocumentHandle`].
pub struct PageIter<'a> {
    handle: &'a dyn DocumentHandle,
    next_index: usize,
}

impl Iterator for PageIter<'_> {
    type Item = Result<PageView>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index >= self.handle.page_count() {
            return None;
        }
        let page = self.handle.page(self.next_index);
        self.next_index += 1;
        Some(page)
    }
}

/// Opens a document from raw bytes, dispatching on the sniffed format.
pub fn open_document(bytes: &[u8], config: &LoaderConfig) -> Result<Box<dyn DocumentHandle>> {
    match detect_format(bytes)? {
        format @ (InputFormat::Png | InputFormat::Jpeg | InputFormat::Tiff | InputFormat::Bmp) => {
            Ok(Box::new(raster::RasterDocument::from_bytes(bytes, format)?))
        }
        #[cfg(feature = "pdf")]
        InputFormat::Pdf => Ok(Box::new(pdf::PdfDocumentHandle::from_bytes(bytes, config)?)),
        #[cfg(not(feature = "pdf"))]
        InputFormat::Pdf => {
            let _ = config;
            Err(ObscuraError::UnsupportedFormat(
                "PDF input requires the `pdf` feature".to_string(),
            ))
        }
    }
}

/// Assembles redacted pages into the final output container.
///
/// Pages arrive strictly in ascending index order; `finish` returns the muxed
/// output bytes. The per-page fingerprints bound by the audit are computed by
/// the redaction engine before pages reach a writer.
pub trait OutputWriter: Send {
    fn begin(&mut self, total_pages: usize) -> Result<()>;

    fn write_page(&mut self, page: &RedactedPage) -> Result<()>;

    fn finish(&mut self) -> Result<Vec<u8>>;
}

/// Picks the output writer matching the input container.
pub fn writer_for(format: InputFormat, config: &LoaderConfig) -> Box<dyn OutputWriter> {
    match format {
        #[cfg(feature = "pdf")]
        InputFormat::Pdf => Box::new(pdf::PdfWriter::new(config.target_dpi)),
        #[cfg(not(feature = "pdf"))]
        InputFormat::Pdf => {
            // Unreachable in practice: `open_document` already rejected PDF
            // input without the feature. Fall back to PNG so the type exists.
            let _ = config;
            Box::new(raster::RasterWriter::new(InputFormat::Png))
        }
        raster_format => Box::new(raster::RasterWriter::new(raster_format)),
    }
}
