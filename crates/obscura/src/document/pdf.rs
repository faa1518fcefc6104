//! Paginated PDF documents (cargo feature `pdf`).
//!
//! Pages are rasterized through pdfium at the configured target DPI and the
//! embedded text layer, when present, is lifted into positioned spans (one
//! span per text line, coordinates converted from PDF bottom-left points to
//! raster top-left pixels). Output assembly rebuilds a paginated PDF with
//! `lopdf`, embedding each redacted page raster as a DCTDecode image object.
//! The output deliberately carries no text layer: the scrubbed layer is
//! recorded in the audit, and omitting it from the container is the one
//! arrangement that cannot leak through text extraction.
//!
//! The pdfium document type is not `Send`, so the handle keeps the raw bytes
//! and binds pdfium per call; `page(i)` stays restartable and thread-safe.

use std::io::Cursor;

use lopdf::{dictionary, Document, Object, Stream};
use pdfium_render::prelude::*;

use crate::document::{DocumentHandle, InputFormat, OutputWriter};
use crate::error::{ObscuraError, Result};
use crate::redact::RedactedPage;
use crate::types::{BoundingBox, PageView, TextSpan};

const PDF_POINTS_PER_INCH: f32 = 72.0;

/// Vertical tolerance (fraction of char height) for grouping characters into
/// one line span.
const LINE_GROUP_TOLERANCE: f32 = 0.5;

fn bind_pdfium() -> Result<Pdfium> {
    let bindings = Pdfium::bind_to_system_library()
        .map_err(|e| ObscuraError::input_with_source("pdfium library unavailable", e))?;
    Ok(Pdfium::new(bindings))
}

/// A paginated PDF document.
pub struct PdfDocumentHandle {
    bytes: Vec<u8>,
    page_count: usize,
    /// Per-page dimensions in points, captured at open time.
    page_sizes: Vec<(f32, f32)>,
    target_dpi: f32,
}

impl PdfDocumentHandle {
    pub fn from_bytes(bytes: &[u8], config: &crate::document::LoaderConfig) -> Result<Self> {
        let pdfium = bind_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|e| ObscuraError::input_with_source("failed to open PDF", e))?;
        let pages = document.pages();
        let page_count = pages.len() as usize;
        let mut page_sizes = Vec::with_capacity(page_count);
        for page in pages.iter() {
            page_sizes.push((page.width().value, page.height().value));
        }
        Ok(Self {
            bytes: bytes.to_vec(),
            page_count,
            page_sizes,
            target_dpi: config.target_dpi,
        })
    }

    fn scale(&self) -> f32 {
        self.target_dpi / PDF_POINTS_PER_INCH
    }
}

impl DocumentHandle for PdfDocumentHandle {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn page(&self, index: usize) -> Result<PageView> {
        let pdfium = bind_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(&self.bytes, None)
            .map_err(|e| ObscuraError::input_with_source("failed to reopen PDF", e))?;
        let page = document
            .pages()
            .get(index as u16)
            .map_err(|_| ObscuraError::PageDecode {
                page_index: index,
                message: "page not found".to_string(),
            })?;

        let width_points = page.width().value;
        let height_points = page.height().value;
        let scale = self.scale();
        let width_px = ((width_points * scale) as i32).max(1);
        let height_px = ((height_points * scale) as i32).max(1);

        let config = PdfRenderConfig::new()
            .set_target_width(width_px)
            .set_target_height(height_px)
            .rotate_if_landscape(PdfPageRenderRotation::None, false);
        let bitmap = page.render_with_config(&config).map_err(|e| {
            ObscuraError::PageDecode {
                page_index: index,
                message: format!("rendering failed: {}", e),
            }
        })?;
        let raster = bitmap.as_image().into_rgba8();

        let text_spans = extract_line_spans(&page, height_points, scale, raster.dimensions())?;

        Ok(PageView::from_raster(index, raster, self.target_dpi, text_spans))
    }

    fn page_dimensions(&self, index: usize) -> Option<(u32, u32)> {
        let (w_pts, h_pts) = *self.page_sizes.get(index)?;
        let scale = self.scale();
        Some((
            ((w_pts * scale) as u32).max(1),
            ((h_pts * scale) as u32).max(1),
        ))
    }

    fn format(&self) -> InputFormat {
        InputFormat::Pdf
    }
}

struct LineAccumulator {
    text: String,
    left: f32,
    right: f32,
    top: f32,
    bottom: f32,
    baseline: f32,
    char_height: f32,
    reading_order: usize,
}

impl LineAccumulator {
    fn into_span(self, page_height_points: f32, scale: f32, raster: (u32, u32)) -> Option<TextSpan> {
        let trimmed = self.text.trim_end();
        if trimmed.is_empty() {
            return None;
        }
        // PDF coordinates are bottom-left origin; the raster is top-left.
        let x = (self.left * scale).max(0.0) as u32;
        let y = ((page_height_points - self.top) * scale).max(0.0) as u32;
        let w = ((self.right - self.left) * scale).ceil().max(1.0) as u32;
        let h = ((self.top - self.bottom) * scale).ceil().max(1.0) as u32;

        let (raster_w, raster_h) = raster;
        let bbox = BoundingBox::new(x.min(raster_w - 1), y.min(raster_h - 1), w, h)
            .clip_to(raster_w, raster_h)?;
        Some(TextSpan {
            text: trimmed.to_string(),
            bbox,
            language: None,
            font_size: Some(self.char_height),
            reading_order: self.reading_order,
        })
    }
}

/// Groups page characters into line-level spans with pixel coordinates.
///
/// Returns `None` when the page carries no text layer at all, so textual
/// detection can fall back to an OCR-backed adapter.
fn extract_line_spans(
    page: &PdfPage<'_>,
    page_height_points: f32,
    scale: f32,
    raster: (u32, u32),
) -> Result<Option<Vec<TextSpan>>> {
    let text = match page.text() {
        Ok(text) => text,
        Err(_) => return Ok(None),
    };

    let mut spans: Vec<TextSpan> = Vec::new();
    let mut current: Option<LineAccumulator> = None;
    let mut reading_order = 0usize;

    for pdf_char in text.chars().iter() {
        let Ok(bounds) = pdf_char.loose_bounds() else {
            continue;
        };
        let Some(ch) = pdf_char.unicode_char() else {
            continue;
        };
        let left = bounds.left().value;
        let bottom = bounds.bottom().value;
        let width = bounds.width().value;
        let height = bounds.height().value;
        let top = bottom + height;

        let starts_new_line = match &current {
            None => true,
            Some(line) => {
                (bottom - line.baseline).abs() > line.char_height * LINE_GROUP_TOLERANCE
            }
        };

        if starts_new_line {
            if let Some(line) = current.take() {
                if let Some(span) = line.into_span(page_height_points, scale, raster) {
                    spans.push(span);
                }
            }
            if ch.is_whitespace() {
                continue;
            }
            current = Some(LineAccumulator {
                text: ch.to_string(),
                left,
                right: left + width,
                top,
                bottom,
                baseline: bottom,
                char_height: height.max(1.0),
                reading_order,
            });
            reading_order += 1;
        } else if let Some(line) = current.as_mut() {
            line.text.push(ch);
            if !ch.is_whitespace() {
                line.left = line.left.min(left);
                line.right = line.right.max(left + width);
                line.top = line.top.max(top);
                line.bottom = line.bottom.min(bottom);
                line.char_height = line.char_height.max(height);
            }
        }
    }
    if let Some(line) = current.take() {
        if let Some(span) = line.into_span(page_height_points, scale, raster) {
            spans.push(span);
        }
    }

    if spans.is_empty() {
        Ok(None)
    } else {
        Ok(Some(spans))
    }
}

/// Rebuilds a paginated PDF from redacted page rasters.
pub struct PdfWriter {
    target_dpi: f32,
    pages: Vec<(u32, u32, Vec<u8>)>,
}

impl PdfWriter {
    pub fn new(target_dpi: f32) -> Self {
        Self {
            target_dpi,
            pages: Vec::new(),
        }
    }
}

impl OutputWriter for PdfWriter {
    fn begin(&mut self, total_pages: usize) -> Result<()> {
        self.pages.reserve(total_pages);
        Ok(())
    }

    fn write_page(&mut self, page: &RedactedPage) -> Result<()> {
        // DCTDecode: encode the raster as baseline JPEG once, here.
        let rgb = image::DynamicImage::ImageRgba8(page.raster.clone()).into_rgb8();
        let mut encoded = Cursor::new(Vec::new());
        rgb.write_to(&mut encoded, image::ImageFormat::Jpeg)
            .map_err(|e| ObscuraError::redaction_with_source("page JPEG encoding failed", e))?;
        self.pages
            .push((page.raster.width(), page.raster.height(), encoded.into_inner()));
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids: Vec<Object> = Vec::with_capacity(self.pages.len());

        for (width_px, height_px, jpeg) in self.pages.drain(..) {
            let width_pts = width_px as f32 * PDF_POINTS_PER_INCH / self.target_dpi;
            let height_pts = height_px as f32 * PDF_POINTS_PER_INCH / self.target_dpi;

            let image_id = doc.add_object(Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => width_px as i64,
                    "Height" => height_px as i64,
                    "ColorSpace" => "DeviceRGB",
                    "BitsPerComponent" => 8,
                    "Filter" => "DCTDecode",
                },
                jpeg,
            ));

            let content = format!("q {width_pts} 0 0 {height_pts} 0 0 cm /Im0 Do Q");
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));

            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![
                    0.into(),
                    0.into(),
                    Object::Real(width_pts),
                    Object::Real(height_pts),
                ],
                "Contents" => content_id,
                "Resources" => dictionary! {
                    "XObject" => dictionary! { "Im0" => image_id },
                },
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Cursor::new(Vec::new());
        doc.save_to(&mut out)
            .map_err(|e| ObscuraError::redaction_with_source("PDF assembly failed", e))?;
        Ok(out.into_inner())
    }
}
