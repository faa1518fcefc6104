//! Single-page raster documents (PNG, JPEG, TIFF, BMP).
//!
//! A raster image is treated as a one-page document at its native resolution.
//! Raster inputs never carry a text layer, so `text_spans` is `None` and
//! textual detection relies on an external OCR-backed detector.

use std::io::Cursor;
use std::sync::Arc;

use crate::document::{DocumentHandle, InputFormat, OutputWriter};
use crate::error::{ObscuraError, Result};
use crate::redact::RedactedPage;
use crate::types::{PageBuffer, PageView};

/// Native density recorded for raster inputs that do not declare one.
const NATIVE_DPI: f32 = 72.0;

/// One-page document backed by a decoded raster image.
#[derive(Debug)]
pub struct RasterDocument {
    raster: Arc<PageBuffer>,
    format: InputFormat,
}

impl RasterDocument {
    /// Decodes the image once; `page(0)` hands out shared views of it.
    pub fn from_bytes(bytes: &[u8], format: InputFormat) -> Result<Self> {
        let decoded = image::load_from_memory(bytes).map_err(|e| {
            ObscuraError::input_with_source("failed to decode raster image", e)
        })?;
        Ok(Self {
            raster: Arc::new(PageBuffer::new(decoded.into_rgba8())),
            format,
        })
    }

    pub fn from_image(raster: image::RgbaImage, format: InputFormat) -> Self {
        Self {
            raster: Arc::new(PageBuffer::new(raster)),
            format,
        }
    }
}

impl DocumentHandle for RasterDocument {
    fn page_count(&self) -> usize {
        1
    }

    fn page(&self, index: usize) -> Result<PageView> {
        if index != 0 {
            return Err(ObscuraError::PageDecode {
                page_index: index,
                message: "raster documents have exactly one page".to_string(),
            });
        }
        Ok(PageView::from_shared(0, Arc::clone(&self.raster), NATIVE_DPI, None))
    }

    fn page_dimensions(&self, index: usize) -> Option<(u32, u32)> {
        (index == 0).then(|| (self.raster.width(), self.raster.height()))
    }

    fn format(&self) -> InputFormat {
        self.format
    }
}

/// Encodes the single redacted page back into the input's raster format.
///
/// The output preserves the input's native resolution; pixel data stays RGBA
/// except for JPEG, which has no alpha channel and is written RGB.
pub struct RasterWriter {
    format: InputFormat,
    encoded: Option<Vec<u8>>,
}

impl RasterWriter {
    pub fn new(format: InputFormat) -> Self {
        Self {
            format,
            encoded: None,
        }
    }

    fn image_format(&self) -> image::ImageFormat {
        match self.format {
            InputFormat::Png => image::ImageFormat::Png,
            InputFormat::Jpeg => image::ImageFormat::Jpeg,
            InputFormat::Tiff => image::ImageFormat::Tiff,
            InputFormat::Bmp => image::ImageFormat::Bmp,
            // PDF pages never route here; see `writer_for`.
            InputFormat::Pdf => image::ImageFormat::Png,
        }
    }
}

impl OutputWriter for RasterWriter {
    fn begin(&mut self, total_pages: usize) -> Result<()> {
        if total_pages != 1 {
            return Err(ObscuraError::input(format!(
                "raster output supports exactly one page, got {}",
                total_pages
            )));
        }
        Ok(())
    }

    fn write_page(&mut self, page: &RedactedPage) -> Result<()> {
        if self.encoded.is_some() {
            return Err(ObscuraError::input("raster output already has a page"));
        }
        let mut buf = Cursor::new(Vec::new());
        let format = self.image_format();
        match format {
            image::ImageFormat::Jpeg => {
                let rgb = image::DynamicImage::ImageRgba8(page.raster.clone()).into_rgb8();
                rgb.write_to(&mut buf, format)
            }
            _ => page.raster.write_to(&mut buf, format),
        }
        .map_err(|e| ObscuraError::redaction_with_source("failed to encode output page", e))?;
        self.encoded = Some(buf.into_inner());
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        self.encoded
            .take()
            .ok_or_else(|| ObscuraError::redaction("no page was written"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(w, h, image::Rgba([120, 130, 140, 255]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_raster_document_single_page() {
        let doc = RasterDocument::from_bytes(&png_bytes(64, 32), InputFormat::Png).unwrap();
        assert_eq!(doc.page_count(), 1);

        let page = doc.page(0).unwrap();
        assert_eq!(page.width_px, 64);
        assert_eq!(page.height_px, 32);
        assert!(page.text_spans.is_none());

        assert!(doc.page(1).is_err());
    }

    #[test]
    fn test_raster_document_restartable() {
        let doc = RasterDocument::from_bytes(&png_bytes(16, 16), InputFormat::Png).unwrap();
        let a = doc.page(0).unwrap();
        let b = doc.page(0).unwrap();
        assert_eq!(a.width_px, b.width_px);
        assert!(Arc::ptr_eq(&a.raster, &b.raster));
    }

    #[test]
    fn test_raster_writer_round_trip() {
        let raster = image::RgbaImage::from_pixel(8, 8, image::Rgba([1, 2, 3, 255]));
        let page = RedactedPage::for_tests(0, raster);

        let mut writer = RasterWriter::new(InputFormat::Png);
        writer.begin(1).unwrap();
        writer.write_page(&page).unwrap();
        let bytes = writer.finish().unwrap();

        let decoded = image::load_from_memory(&bytes).unwrap().into_rgba8();
        assert_eq!(decoded.get_pixel(4, 4), &image::Rgba([1, 2, 3, 255]));
    }

    #[test]
    fn test_raster_writer_rejects_multi_page() {
        let mut writer = RasterWriter::new(InputFormat::Png);
        assert!(writer.begin(2).is_err());
    }

    #[test]
    fn test_corrupt_raster_is_input_error() {
        let err = RasterDocument::from_bytes(b"\x89PNG\r\n\x1a\nnot-a-real-png", InputFormat::Png)
            .unwrap_err();
        assert!(matches!(err, ObscuraError::Input { .. }));
    }
}
