//! Detection: visual and textual detector contracts plus hybrid fusion.
//!
//! The core does not ship models. It defines the [`VisualDetector`] and
//! [`TextDetector`] contracts, sanitizes whatever adapters return, and fuses
//! the two evidence streams into a single profile-filtered, non-redundant
//! detection set per page ([`fusion`]). A deterministic regex-based reference
//! implementation of the text contract lives in [`patterns`].

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::types::{Detection, DetectionSource, PageView};

pub mod fusion;
pub mod patterns;

/// Detects visual PII (faces, signatures, barcodes, QR codes, portraits)
/// from a page raster.
///
/// Contract: detections carry `source = visual`, a visual kind, a bbox inside
/// the page, a finite confidence in `[0, 1]`, and the adapter's `model_tag`.
/// Output must be deterministic given the same raster and `model_tag`.
#[async_trait]
pub trait VisualDetector: Send + Sync {
    /// Opaque model+version identifier recorded in audits.
    fn model_tag(&self) -> &str;

    async fn detect(&self, page: &PageView) -> Result<Vec<Detection>>;
}

/// Detects textual PII from a page's text layer (or OCR output).
///
/// Contract: detections carry `source = textual`, a textual kind, the matched
/// `text`, a bbox covering the glyph run, and `language` when known. When the
/// page has no text layer the adapter may invoke OCR internally and return
/// coordinates in page space.
#[async_trait]
pub trait TextDetector: Send + Sync {
    fn model_tag(&self) -> &str;

    async fn detect(&self, page: &PageView) -> Result<Vec<Detection>>;
}

/// Enforces the detector contract on raw adapter output.
///
/// Bounding boxes are clipped to the page; detections with the wrong source,
/// the wrong kind group, a non-finite or out-of-range confidence, or a bbox
/// entirely outside the page are rejected and logged, never fixed up.
pub fn sanitize_detections(
    raw: Vec<Detection>,
    page: &PageView,
    expected_source: DetectionSource,
) -> Vec<Detection> {
    let mut kept = Vec::with_capacity(raw.len());
    for mut detection in raw {
        if detection.source != expected_source {
            warn!(
                kind = %detection.kind,
                model_tag = %detection.model_tag,
                "detector emitted wrong source, rejecting"
            );
            continue;
        }
        let group_ok = match expected_source {
            DetectionSource::Visual => detection.kind.is_visual(),
            DetectionSource::Textual => detection.kind.is_textual(),
            DetectionSource::Fused => false,
        };
        if !group_ok {
            warn!(
                kind = %detection.kind,
                model_tag = %detection.model_tag,
                "detector emitted kind outside its group, rejecting"
            );
            continue;
        }
        if !detection.confidence.is_finite() || !(0.0..=1.0).contains(&detection.confidence) {
            warn!(
                kind = %detection.kind,
                model_tag = %detection.model_tag,
                "detector emitted invalid confidence, rejecting"
            );
            continue;
        }
        if detection.page_index != page.page_index {
            warn!(
                kind = %detection.kind,
                page_index = detection.page_index,
                "detector emitted detection for wrong page, rejecting"
            );
            continue;
        }
        match detection.bbox.clip_to(page.width_px, page.height_px) {
            Some(clipped) => {
                detection.bbox = clipped;
                kept.push(detection);
            }
            None => {
                warn!(
                    kind = %detection.kind,
                    model_tag = %detection.model_tag,
                    "detector emitted bbox outside page, rejecting"
                );
            }
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, PiiKind};

    fn page() -> PageView {
        PageView::from_raster(0, image::RgbaImage::new(100, 100), 200.0, None)
    }

    fn detection(kind: PiiKind, source: DetectionSource, bbox: BoundingBox) -> Detection {
        Detection::new(kind, 0, bbox, 0.9, source, "test/1")
    }

    #[test]
    fn test_sanitize_clips_overflowing_bbox() {
        let raw = vec![detection(
            PiiKind::Face,
            DetectionSource::Visual,
            BoundingBox::new(90, 90, 30, 30),
        )];
        let kept = sanitize_detections(raw, &page(), DetectionSource::Visual);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].bbox, BoundingBox::new(90, 90, 10, 10));
    }

    #[test]
    fn test_sanitize_rejects_wrong_group() {
        let raw = vec![detection(
            PiiKind::Email,
            DetectionSource::Visual,
            BoundingBox::new(0, 0, 10, 10),
        )];
        assert!(sanitize_detections(raw, &page(), DetectionSource::Visual).is_empty());
    }

    #[test]
    fn test_sanitize_rejects_wrong_source() {
        let raw = vec![detection(
            PiiKind::Face,
            DetectionSource::Textual,
            BoundingBox::new(0, 0, 10, 10),
        )];
        assert!(sanitize_detections(raw, &page(), DetectionSource::Visual).is_empty());
    }

    #[test]
    fn test_sanitize_rejects_bad_confidence() {
        let mut d = detection(
            PiiKind::Face,
            DetectionSource::Visual,
            BoundingBox::new(0, 0, 10, 10),
        );
        d.confidence = 1.5;
        assert!(sanitize_detections(vec![d], &page(), DetectionSource::Visual).is_empty());
    }

    #[test]
    fn test_sanitize_rejects_offpage_bbox() {
        let raw = vec![detection(
            PiiKind::Face,
            DetectionSource::Visual,
            BoundingBox::new(200, 200, 10, 10),
        )];
        assert!(sanitize_detections(raw, &page(), DetectionSource::Visual).is_empty());
    }
}
