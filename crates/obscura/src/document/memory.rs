//! In-memory documents: the reference implementation of the loader contract.
//!
//! A [`MemoryDocument`] holds pre-built pages (raster, optional text spans,
//! optional forced decode failure) and is the substrate for multi-page
//! pipeline tests and for integrators that produce pages from their own
//! container code.

use std::sync::Arc;

use crate::document::{DocumentHandle, InputFormat};
use crate::error::{ObscuraError, Result};
use crate::types::{PageBuffer, PageView, TextSpan};

enum MemoryPage {
    Page {
        raster: Arc<PageBuffer>,
        dpi: f32,
        text_spans: Option<Vec<TextSpan>>,
    },
    /// Simulates a page whose decode fails, for degraded-page paths.
    Corrupt { width_px: u32, height_px: u32 },
}

/// A document handle over pre-built in-memory pages.
pub struct MemoryDocument {
    pages: Vec<MemoryPage>,
    format: InputFormat,
}

impl MemoryDocument {
    pub fn builder() -> MemoryDocumentBuilder {
        MemoryDocumentBuilder {
            pages: Vec::new(),
            format: InputFormat::Png,
        }
    }

    /// Dimensions of a corrupt page, used by the processor to emit a
    /// full-page fallback redaction of the right size.
    pub fn corrupt_page_dimensions(&self, index: usize) -> Option<(u32, u32)> {
        match self.pages.get(index) {
            Some(MemoryPage::Corrupt { width_px, height_px }) => Some((*width_px, *height_px)),
            _ => None,
        }
    }
}

impl DocumentHandle for MemoryDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page(&self, index: usize) -> Result<PageView> {
        match self.pages.get(index) {
            Some(MemoryPage::Page {
                raster,
                dpi,
                text_spans,
            }) => {
                let view =
                    PageView::from_shared(index, Arc::clone(raster), *dpi, text_spans.clone());
                view.validate()?;
                Ok(view)
            }
            Some(MemoryPage::Corrupt { .. }) => Err(ObscuraError::PageDecode {
                page_index: index,
                message: "page stream is corrupt".to_string(),
            }),
            None => Err(ObscuraError::PageDecode {
                page_index: index,
                message: format!("page index out of range ({} pages)", self.pages.len()),
            }),
        }
    }

    fn page_dimensions(&self, index: usize) -> Option<(u32, u32)> {
        match self.pages.get(index)? {
            MemoryPage::Page { raster, .. } => Some((raster.width(), raster.height())),
            MemoryPage::Corrupt { width_px, height_px } => Some((*width_px, *height_px)),
        }
    }

    fn format(&self) -> InputFormat {
        self.format
    }
}

/// Builder for [`MemoryDocument`].
pub struct MemoryDocumentBuilder {
    pages: Vec<MemoryPage>,
    format: InputFormat,
}

impl MemoryDocumentBuilder {
    /// Appends a page with raster content and no text layer.
    pub fn page(mut self, raster: image::RgbaImage, dpi: f32) -> Self {
        self.pages.push(MemoryPage::Page {
            raster: Arc::new(PageBuffer::new(raster)),
            dpi,
            text_spans: None,
        });
        self
    }

    /// Appends a page carrying an embedded text layer.
    pub fn page_with_spans(
        mut self,
        raster: image::RgbaImage,
        dpi: f32,
        spans: Vec<TextSpan>,
    ) -> Self {
        self.pages.push(MemoryPage::Page {
            raster: Arc::new(PageBuffer::new(raster)),
            dpi,
            text_spans: Some(spans),
        });
        self
    }

    /// Appends a blank white page.
    pub fn blank_page(self, width_px: u32, height_px: u32) -> Self {
        let raster =
            image::RgbaImage::from_pixel(width_px, height_px, image::Rgba([255, 255, 255, 255]));
        self.page(raster, 200.0)
    }

    /// Appends a page whose decode always fails.
    pub fn corrupt_page(mut self, width_px: u32, height_px: u32) -> Self {
        self.pages.push(MemoryPage::Corrupt {
            width_px,
            height_px,
        });
        self
    }

    /// Overrides the format the document reports (default PNG).
    pub fn format(mut self, format: InputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn build(self) -> MemoryDocument {
        MemoryDocument {
            pages: self.pages,
            format: self.format,
        }
    }
}
