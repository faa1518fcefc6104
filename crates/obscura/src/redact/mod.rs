//! Redaction engine: coordinate-driven pixel and text redaction with layout
//! preservation.
//!
//! The engine receives an immutable [`PageView`] and the fused detection set
//! for that page and produces a [`RedactedPage`]: a distinct output raster
//! (the input is never written), an optionally scrubbed text layer, the
//! pre-mux page fingerprint, and any degraded-rendering entries. A single
//! failing box never aborts the page: the engine escalates to a solid black
//! fallback and records the degradation for the audit.

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::crypto::hash::page_fingerprint;
use crate::error::Result;
use crate::profile::{EffectiveProfile, RgbColor};
use crate::types::{BoundingBox, Detection, PageView, TextSpan};

pub mod styles;
pub mod text;

pub use text::{ScrubbedSpan, SCRUB_OVERLAP};

/// Why a fallback rendering was applied.
///
/// The reason lands in a signed audit record, so it must state what actually
/// happened: a decode failure is not a detector failure is not a missed
/// deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    RenderFailure,
    DetectorFailure,
    PageDecodeFailure,
    DeadlineExceeded,
}

/// Audit entry for a degraded redaction or page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradedRedaction {
    pub page_index: usize,
    /// The detection whose styled rendering failed; `None` for whole-page
    /// fallbacks (decode failure, deadline).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection_id: Option<Uuid>,
    pub reason: DegradedReason,
    /// Diagnostic message. Carries no detected text.
    pub message: String,
}

/// Output of redacting one page.
pub struct RedactedPage {
    pub page_index: usize,
    pub raster: image::RgbaImage,
    /// The full text layer after scrubbing, when the source had one.
    pub text_spans: Option<Vec<TextSpan>>,
    /// Spans that were replaced, in reading order.
    pub scrubbed: Vec<ScrubbedSpan>,
    /// SHA-256 over raster and scrubbed layer, computed pre-mux.
    pub fingerprint: String,
    pub degraded: Vec<DegradedRedaction>,
}

impl RedactedPage {
    #[cfg(test)]
    pub(crate) fn for_tests(page_index: usize, raster: image::RgbaImage) -> Self {
        let fingerprint = page_fingerprint(&raster, None);
        Self {
            page_index,
            raster,
            text_spans: None,
            scrubbed: Vec::new(),
            fingerprint,
            degraded: Vec::new(),
        }
    }
}

/// Applies per-box redaction styles to a copy of the page raster and scrubs
/// the text layer.
#[derive(Debug, Clone, Default)]
pub struct RedactionEngine {
    _private: (),
}

impl RedactionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redacts one page.
    ///
    /// Detections are rendered in deterministic `(y, x, kind)` order; where
    /// boxes overlap the last write wins. Boxes are clipped to the page
    /// before rendering. The caller passes the post-fusion detection set;
    /// styles come from the resolved profile.
    pub fn redact_page(
        &self,
        page: &PageView,
        detections: &[Detection],
        profile: &EffectiveProfile,
    ) -> Result<RedactedPage> {
        // The output raster is a distinct buffer; the input is never redacted
        // in place.
        let mut out = page.raster.image().clone();
        let mut degraded = Vec::new();
        let mut applied_boxes: Vec<BoundingBox> = Vec::with_capacity(detections.len());

        let mut ordered: Vec<&Detection> = detections.iter().collect();
        ordered.sort_by(|a, b| {
            (a.bbox.y, a.bbox.x, a.kind).cmp(&(b.bbox.y, b.bbox.x, b.kind))
        });

        for detection in ordered {
            let Some(bbox) = detection.bbox.clip_to(page.width_px, page.height_px) else {
                warn!(
                    page_index = page.page_index,
                    kind = %detection.kind,
                    "redaction box clipped to nothing, skipping"
                );
                continue;
            };
            let style = profile.effective_rule(detection.kind).style;
            if let Err(err) = styles::apply_style(&mut out, &bbox, &style) {
                warn!(
                    page_index = page.page_index,
                    kind = %detection.kind,
                    error = %err,
                    "styled rendering failed, falling back to solid"
                );
                styles::fill_solid(&mut out, &bbox, RgbColor::BLACK);
                degraded.push(DegradedRedaction {
                    page_index: page.page_index,
                    detection_id: Some(detection.id),
                    reason: DegradedReason::RenderFailure,
                    message: err.to_string(),
                });
            }
            applied_boxes.push(bbox);
        }

        let (text_spans, scrubbed, fingerprint) = scrub_and_fingerprint(page, &out, &applied_boxes);

        Ok(RedactedPage {
            page_index: page.page_index,
            raster: out,
            text_spans,
            scrubbed,
            fingerprint,
            degraded,
        })
    }

    /// Deadline fallback: renders every candidate box solid black, ignoring
    /// profile styles, and scrubs the text layer against those boxes. The
    /// rest of the page is left intact, unlike [`Self::full_page_fallback`].
    pub fn redact_page_black(
        &self,
        page: &PageView,
        detections: &[Detection],
        reason: DegradedReason,
        message: impl Into<String>,
    ) -> RedactedPage {
        let mut out = page.raster.image().clone();
        let mut applied_boxes: Vec<BoundingBox> = Vec::with_capacity(detections.len());
        for detection in detections {
            if let Some(bbox) = detection.bbox.clip_to(page.width_px, page.height_px) {
                styles::fill_solid(&mut out, &bbox, RgbColor::BLACK);
                applied_boxes.push(bbox);
            }
        }

        let (text_spans, scrubbed, fingerprint) = scrub_and_fingerprint(page, &out, &applied_boxes);

        RedactedPage {
            page_index: page.page_index,
            raster: out,
            text_spans,
            scrubbed,
            fingerprint,
            degraded: vec![DegradedRedaction {
                page_index: page.page_index,
                detection_id: None,
                reason,
                message: message.into(),
            }],
        }
    }

    /// Whole-page fallback: a fully black page of the given dimensions.
    ///
    /// Used when a page cannot be decoded or a detector failed in non-strict
    /// mode, so the failure is visible and attestable rather than silently
    /// dropped.
    pub fn full_page_fallback(
        &self,
        page_index: usize,
        width_px: u32,
        height_px: u32,
        reason: DegradedReason,
        message: impl Into<String>,
    ) -> RedactedPage {
        let raster =
            image::RgbaImage::from_pixel(width_px, height_px, image::Rgba([0, 0, 0, 255]));
        let fingerprint = page_fingerprint(&raster, None);
        RedactedPage {
            page_index,
            raster,
            text_spans: None,
            scrubbed: Vec::new(),
            fingerprint,
            degraded: vec![DegradedRedaction {
                page_index,
                detection_id: None,
                reason,
                message: message.into(),
            }],
        }
    }
}

/// Scrubs the page's text layer against the applied boxes and computes the
/// pre-mux fingerprint over the output raster plus the scrubbed layer.
fn scrub_and_fingerprint(
    page: &PageView,
    out: &image::RgbaImage,
    applied_boxes: &[BoundingBox],
) -> (Option<Vec<TextSpan>>, Vec<ScrubbedSpan>, String) {
    let (text_spans, scrubbed) = match &page.text_spans {
        Some(spans) => {
            let mut spans = spans.clone();
            let scrubbed = text::scrub_spans(&mut spans, applied_boxes);
            (Some(spans), scrubbed)
        }
        None => (None, Vec::new()),
    };

    let scrubbed_texts: Option<Vec<String>> = text_spans
        .as_ref()
        .map(|spans| spans.iter().map(|s| s.text.clone()).collect());
    let fingerprint = page_fingerprint(out, scrubbed_texts.as_deref());
    (text_spans, scrubbed, fingerprint)
}
