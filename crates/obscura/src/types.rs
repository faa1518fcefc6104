//! Core data model: geometry, PII kinds, detections, pages, and results.
//!
//! Everything in this module is plain data. Coordinates are integer pixels in
//! page space with a top-left origin (y grows downward). Bounding boxes are
//! compared with intersection-over-union; cross-modal co-location uses
//! containment fractions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::error::{ObscuraError, Result};

/// Integer pixel rectangle in page coordinates (top-left origin, y-down).
///
/// Invariant: `w > 0 && h > 0` and the box lies inside its page. Construction
/// does not enforce page containment (the page is not known yet); use
/// [`BoundingBox::validate_in_page`] or [`BoundingBox::clip_to`] at the page
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Area in pixels. `w` and `h` are positive for any valid box.
    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.w)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.h)
    }

    /// Checks the full invariant against page dimensions.
    pub fn validate_in_page(&self, page_width: u32, page_height: u32) -> Result<()> {
        if self.w == 0 || self.h == 0 {
            return Err(ObscuraError::detection(format!(
                "degenerate bounding box {}x{}",
                self.w, self.h
            )));
        }
        if self.right() > page_width || self.bottom() > page_height {
            return Err(ObscuraError::detection(format!(
                "bounding box ({}, {}, {}, {}) exceeds page {}x{}",
                self.x, self.y, self.w, self.h, page_width, page_height
            )));
        }
        Ok(())
    }

    /// Clips this box to page bounds. Returns `None` when nothing remains.
    pub fn clip_to(&self, page_width: u32, page_height: u32) -> Option<BoundingBox> {
        if self.x >= page_width || self.y >= page_height {
            return None;
        }
        let w = self.w.min(page_width - self.x);
        let h = self.h.min(page_height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(BoundingBox::new(self.x, self.y, w, h))
    }

    /// Intersection area in pixels, 0 when disjoint.
    pub fn intersection_area(&self, other: &BoundingBox) -> u64 {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return 0;
        }
        (x1 - x0) as u64 * (y1 - y0) as u64
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.intersection_area(other) > 0
    }

    /// Intersection-over-union. Returns 0.0 for disjoint boxes.
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let inter = self.intersection_area(other);
        if inter == 0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        inter as f64 / union as f64
    }

    /// Fraction of `self`'s area covered by `other`, in `[0, 1]`.
    pub fn coverage_by(&self, other: &BoundingBox) -> f64 {
        self.intersection_area(other) as f64 / self.area() as f64
    }

    /// Axis-aligned union of two boxes.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        BoundingBox::new(x, y, right - x, bottom - y)
    }
}

/// Closed enumeration of PII kinds.
///
/// Each kind carries a stable string tag used in profiles, logs, and on-wire
/// audit records. The enum is split into a visual group (detected from the
/// raster) and a textual group (detected from the text layer or OCR output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    // Visual kinds
    Face,
    Signature,
    Barcode,
    QrCode,
    PhotoIdPortrait,
    // Textual kinds
    PersonName,
    Email,
    Phone,
    PostalAddress,
    NationalId,
    MedicalRecordNumber,
    FinancialAccount,
    DateOfBirth,
    IpAddress,
    LicensePlate,
}

impl PiiKind {
    /// All kinds, visual group first, in declaration order.
    pub const ALL: [PiiKind; 15] = [
        PiiKind::Face,
        PiiKind::Signature,
        PiiKind::Barcode,
        PiiKind::QrCode,
        PiiKind::PhotoIdPortrait,
        PiiKind::PersonName,
        PiiKind::Email,
        PiiKind::Phone,
        PiiKind::PostalAddress,
        PiiKind::NationalId,
        PiiKind::MedicalRecordNumber,
        PiiKind::FinancialAccount,
        PiiKind::DateOfBirth,
        PiiKind::IpAddress,
        PiiKind::LicensePlate,
    ];

    /// The stable string tag for this kind.
    pub fn tag(&self) -> &'static str {
        match self {
            PiiKind::Face => "face",
            PiiKind::Signature => "signature",
            PiiKind::Barcode => "barcode",
            PiiKind::QrCode => "qr_code",
            PiiKind::PhotoIdPortrait => "photo_id_portrait",
            PiiKind::PersonName => "person_name",
            PiiKind::Email => "email",
            PiiKind::Phone => "phone",
            PiiKind::PostalAddress => "postal_address",
            PiiKind::NationalId => "national_id",
            PiiKind::MedicalRecordNumber => "medical_record_number",
            PiiKind::FinancialAccount => "financial_account",
            PiiKind::DateOfBirth => "date_of_birth",
            PiiKind::IpAddress => "ip_address",
            PiiKind::LicensePlate => "license_plate",
        }
    }

    /// Parses a stable tag back into a kind.
    pub fn from_tag(tag: &str) -> Option<PiiKind> {
        PiiKind::ALL.iter().copied().find(|k| k.tag() == tag)
    }

    pub fn is_visual(&self) -> bool {
        matches!(
            self,
            PiiKind::Face
                | PiiKind::Signature
                | PiiKind::Barcode
                | PiiKind::QrCode
                | PiiKind::PhotoIdPortrait
        )
    }

    pub fn is_textual(&self) -> bool {
        !self.is_visual()
    }
}

impl std::fmt::Display for PiiKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Where a detection came from.
///
/// `Fused` is set iff the detection was produced by merging two or more
/// inputs during hybrid fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Visual,
    Textual,
    Fused,
}

/// A localized claim that a region of a page contains PII of a specific kind.
///
/// Detections are immutable once produced; fusion creates new records rather
/// than mutating inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub id: Uuid,
    pub kind: PiiKind,
    pub page_index: usize,
    pub bbox: BoundingBox,
    pub confidence: f64,
    pub source: DetectionSource,
    /// The matched text run, for textual detections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// BCP-47 language tag when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Opaque model+version identifier of the producing detector.
    pub model_tag: String,
    /// Reading order of the originating span, used for deterministic
    /// tie-breaking in fusion. Not meaningful for visual detections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reading_order: Option<usize>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extras: HashMap<String, serde_json::Value>,
}

impl Detection {
    /// Builds a detection with a fresh id and no optional fields set.
    pub fn new(
        kind: PiiKind,
        page_index: usize,
        bbox: BoundingBox,
        confidence: f64,
        source: DetectionSource,
        model_tag: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            page_index,
            bbox,
            confidence,
            source,
            text: None,
            language: None,
            model_tag: model_tag.into(),
            reading_order: None,
            extras: HashMap::new(),
        }
    }

    /// Checks the detection invariants against its page.
    ///
    /// Rejected detections are dropped by the pipeline, never fixed up.
    pub fn validate_in_page(&self, page: &PageView) -> Result<()> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(ObscuraError::detection(format!(
                "confidence {} out of range for kind {}",
                self.confidence, self.kind
            )));
        }
        if self.page_index != page.page_index {
            return Err(ObscuraError::detection(format!(
                "detection targets page {} but was attached to page {}",
                self.page_index, page.page_index
            )));
        }
        self.bbox.validate_in_page(page.width_px, page.height_px)
    }
}

/// A positioned run of text on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSpan {
    pub text: String,
    pub bbox: BoundingBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f32>,
    pub reading_order: usize,
}

/// Immutable RGBA pixel buffer for one page.
///
/// The buffer is wiped on release: page rasters routinely contain the very
/// PII the pipeline exists to remove, so the last owner zeroes the pixel data
/// before the allocation is returned.
pub struct PageBuffer {
    raster: image::RgbaImage,
}

impl PageBuffer {
    pub fn new(raster: image::RgbaImage) -> Self {
        Self { raster }
    }

    pub fn image(&self) -> &image::RgbaImage {
        &self.raster
    }

    pub fn width(&self) -> u32 {
        self.raster.width()
    }

    pub fn height(&self) -> u32 {
        self.raster.height()
    }
}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Pixel contents are sensitive; only dimensions are printed.
        f.debug_struct("PageBuffer")
            .field("width", &self.raster.width())
            .field("height", &self.raster.height())
            .finish()
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        let samples: &mut [u8] = &mut self.raster;
        samples.zeroize();
    }
}

/// Immutable per-page working set: raster plus optional positioned text layer.
///
/// Created by the document loader when a page enters the pipeline and dropped
/// after the redaction engine has written the corresponding output page.
/// Detectors receive a read-only reference; the raster is never redacted in
/// place.
#[derive(Debug, Clone)]
pub struct PageView {
    pub page_index: usize,
    pub width_px: u32,
    pub height_px: u32,
    pub dpi: f32,
    pub raster: Arc<PageBuffer>,
    /// Populated iff the source carries an embedded text layer.
    pub text_spans: Option<Vec<TextSpan>>,
}

impl PageView {
    /// Builds a page view from a raster, taking dimensions from the buffer.
    pub fn from_raster(
        page_index: usize,
        raster: image::RgbaImage,
        dpi: f32,
        text_spans: Option<Vec<TextSpan>>,
    ) -> Self {
        let (width_px, height_px) = raster.dimensions();
        Self {
            page_index,
            width_px,
            height_px,
            dpi,
            raster: Arc::new(PageBuffer::new(raster)),
            text_spans,
        }
    }

    /// Builds a page view over an already-shared buffer. Used by restartable
    /// document handles so repeated `page(i)` calls do not copy pixel data.
    pub fn from_shared(
        page_index: usize,
        raster: Arc<PageBuffer>,
        dpi: f32,
        text_spans: Option<Vec<TextSpan>>,
    ) -> Self {
        Self {
            page_index,
            width_px: raster.width(),
            height_px: raster.height(),
            dpi,
            raster,
            text_spans,
        }
    }

    /// A page view is valid iff every text span's bbox is contained in the page.
    pub fn validate(&self) -> Result<()> {
        if let Some(spans) = &self.text_spans {
            for span in spans {
                span.bbox
                    .validate_in_page(self.width_px, self.height_px)
                    .map_err(|e| {
                        ObscuraError::input_with_source(
                            format!(
                                "text span {} escapes page {}",
                                span.reading_order, self.page_index
                            ),
                            e,
                        )
                    })?;
            }
        }
        Ok(())
    }
}

/// Error entry surfaced on a [`ProcessingResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingError {
    pub kind: ProcessingErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_index: Option<usize>,
    /// Actionable message. Never contains detected text or raster bytes.
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingErrorKind {
    Input,
    Profile,
    Detection,
    Redaction,
    Crypto,
    Resource,
    Cancelled,
    DeadlineExceeded,
    Internal,
}

impl ProcessingError {
    pub fn from_error(err: &ObscuraError, page_index: Option<usize>) -> Self {
        let kind = match err {
            ObscuraError::Io(_) | ObscuraError::Resource { .. } => ProcessingErrorKind::Resource,
            ObscuraError::UnsupportedFormat(_)
            | ObscuraError::Input { .. }
            | ObscuraError::PageDecode { .. } => ProcessingErrorKind::Input,
            ObscuraError::Profile { .. } => ProcessingErrorKind::Profile,
            ObscuraError::Detection { .. } => ProcessingErrorKind::Detection,
            ObscuraError::Redaction { .. } => ProcessingErrorKind::Redaction,
            ObscuraError::Crypto { .. } | ObscuraError::Serialization { .. } => {
                ProcessingErrorKind::Crypto
            }
            ObscuraError::Cancelled => ProcessingErrorKind::Cancelled,
            ObscuraError::DeadlineExceeded { .. } => ProcessingErrorKind::DeadlineExceeded,
            ObscuraError::LockPoisoned(_) | ObscuraError::Other(_) => ProcessingErrorKind::Internal,
        };
        let page_index = page_index.or(match err {
            ObscuraError::PageDecode { page_index, .. }
            | ObscuraError::DeadlineExceeded { page_index } => Some(*page_index),
            _ => None,
        });
        Self {
            kind,
            page_index,
            message: err.to_string(),
        }
    }
}

/// Reference to the profile a document was processed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRef {
    pub name: String,
    pub version: String,
}

/// Outcome of processing one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub document_id: Uuid,
    /// SHA-256 of the raw input bytes, lowercase hex.
    pub input_fingerprint: String,
    /// SHA-256 of the final output bytes, lowercase hex.
    pub output_fingerprint: String,
    pub profile_ref: ProfileRef,
    /// Applied detections in deterministic `(page, y, x, kind)` order.
    pub detections: Vec<Detection>,
    pub pages_processed: usize,
    pub redactions_applied: usize,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ProcessingError>,
}
