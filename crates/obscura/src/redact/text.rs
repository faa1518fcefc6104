//! Text-layer scrubbing.
//!
//! When the source carries an embedded text layer, redacting the raster alone
//! still leaks PII to text extraction. Every span whose bbox intersects an
//! applied redaction box by at least [`SCRUB_OVERLAP`] of its area is replaced
//! with an equal-length run of U+25A0 so downstream extraction sees only
//! placeholder glyphs. Span geometry is preserved to keep the page layout
//! intact.

use serde::{Deserialize, Serialize};

use crate::types::{BoundingBox, TextSpan};

/// Minimum fraction of a span's area that must be covered by a redaction box
/// for the span to be scrubbed.
pub const SCRUB_OVERLAP: f64 = 0.2;

/// Replacement glyph: BLACK SQUARE.
pub const REPLACEMENT_CHAR: char = '\u{25A0}';

/// Record of one scrubbed span, safe to include in audits (the original text
/// is gone by construction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubbedSpan {
    pub reading_order: usize,
    pub bbox: BoundingBox,
    /// Number of characters replaced.
    pub replaced_chars: usize,
}

/// Scrubs `spans` in place against the applied redaction boxes.
///
/// Returns one [`ScrubbedSpan`] entry per replaced span, in reading order.
pub fn scrub_spans(spans: &mut [TextSpan], redaction_boxes: &[BoundingBox]) -> Vec<ScrubbedSpan> {
    let mut scrubbed = Vec::new();
    for span in spans.iter_mut() {
        let covered = redaction_boxes
            .iter()
            .any(|b| span.bbox.coverage_by(b) >= SCRUB_OVERLAP);
        if !covered {
            continue;
        }
        let replaced_chars = span.text.chars().count();
        span.text = REPLACEMENT_CHAR.to_string().repeat(replaced_chars);
        scrubbed.push(ScrubbedSpan {
            reading_order: span.reading_order,
            bbox: span.bbox,
            replaced_chars,
        });
    }
    scrubbed.sort_by_key(|s| s.reading_order);
    scrubbed
}
