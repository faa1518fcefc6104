//! Deterministic regex-based text detector.
//!
//! Reference implementation of the [`TextDetector`](crate::detect::TextDetector)
//! contract. It consumes the page's embedded text spans only; pages without a
//! text layer yield no detections (pair it with an OCR-backed adapter when
//! scanned input must be covered). Matches are mapped back to page space by
//! proportionally slicing the span's glyph run, which is exact for monospaced
//! runs and a close, deterministic approximation otherwise.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::detect::TextDetector;
use crate::error::Result;
use crate::types::{BoundingBox, Detection, DetectionSource, PageView, PiiKind, TextSpan};

const MODEL_TAG: &str = "pattern-text/1.0";

struct PatternRule {
    kind: PiiKind,
    regex: &'static Lazy<Regex>,
    confidence: f64,
    /// Post-match validation hook (checksum checks and the like).
    accept: Option<fn(&str) -> bool>,
}

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("email regex")
});

static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+?1[-. ])?\(?\d{3}\)?[-. ]\d{3}[-. ]\d{4}\b").expect("phone regex")
});

static NATIONAL_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("national id regex"));

static IP_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1\d{2}|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d{2}|[1-9]?\d)\b")
        .expect("ip regex")
});

static DATE_OF_BIRTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:DOB|date of birth|born)[:\s]+\d{1,2}[/-]\d{1,2}[/-]\d{2,4}\b")
        .expect("dob regex")
});

static MEDICAL_RECORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:MRN|medical record (?:number|no\.?))[:#\s]+[A-Z0-9][A-Z0-9-]{4,11}\b")
        .expect("mrn regex")
});

static FINANCIAL_ACCOUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d(?:[ -]?\d){12,18}\b").expect("account regex"));

static LICENSE_PLATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:license plate|plate(?: no\.?| number)?)[:#\s]+[A-Z0-9][A-Z0-9-]{3,7}\b")
        .expect("plate regex")
});

static POSTAL_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b\d{1,5}\s+(?:[A-Z][A-Za-z]*\s+)+(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr|Court|Ct|Way|Place|Pl)\b\.?",
    )
    .expect("address regex")
});

static PERSON_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z]\.)?\s+[A-Z][a-z]+\b").expect("name regex")
});

/// Rules in evaluation order. More specific patterns run first so their
/// matches can suppress weaker overlapping heuristics (names, addresses).
static RULES: Lazy<Vec<PatternRule>> = Lazy::new(|| {
    vec![
        PatternRule {
            kind: PiiKind::Email,
            regex: &EMAIL,
            confidence: 0.95,
            accept: None,
        },
        PatternRule {
            kind: PiiKind::NationalId,
            regex: &NATIONAL_ID,
            confidence: 0.93,
            accept: None,
        },
        PatternRule {
            kind: PiiKind::Phone,
            regex: &PHONE,
            confidence: 0.90,
            accept: None,
        },
        PatternRule {
            kind: PiiKind::IpAddress,
            regex: &IP_ADDRESS,
            confidence: 0.90,
            accept: None,
        },
        PatternRule {
            kind: PiiKind::FinancialAccount,
            regex: &FINANCIAL_ACCOUNT,
            confidence: 0.88,
            accept: Some(luhn_valid),
        },
        PatternRule {
            kind: PiiKind::DateOfBirth,
            regex: &DATE_OF_BIRTH,
            confidence: 0.85,
            accept: None,
        },
        PatternRule {
            kind: PiiKind::MedicalRecordNumber,
            regex: &MEDICAL_RECORD,
            confidence: 0.85,
            accept: None,
        },
        PatternRule {
            kind: PiiKind::LicensePlate,
            regex: &LICENSE_PLATE,
            confidence: 0.80,
            accept: None,
        },
        PatternRule {
            kind: PiiKind::PostalAddress,
            regex: &POSTAL_ADDRESS,
            confidence: 0.80,
            accept: None,
        },
        PatternRule {
            kind: PiiKind::PersonName,
            regex: &PERSON_NAME,
            confidence: 0.75,
            accept: None,
        },
    ]
});

/// Luhn checksum over the digits of a candidate account number.
fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Maps a character range of a span back to page coordinates by slicing the
/// span's bbox proportionally to character counts.
fn slice_span_bbox(span: &TextSpan, byte_start: usize, byte_end: usize) -> Option<BoundingBox> {
    let total_chars = span.text.chars().count();
    if total_chars == 0 {
        return None;
    }
    let prefix_chars = span.text[..byte_start].chars().count();
    let match_chars = span.text[byte_start..byte_end].chars().count();
    if match_chars == 0 {
        return None;
    }

    let x = span.bbox.x + ((span.bbox.w as u64 * prefix_chars as u64) / total_chars as u64) as u32;
    let w = (((span.bbox.w as u64 * match_chars as u64) + total_chars as u64 - 1)
        / total_chars as u64) as u32;
    Some(BoundingBox::new(x, span.bbox.y, w.max(1), span.bbox.h))
}

/// Regex-driven reference text detector.
#[derive(Debug, Default)]
pub struct PatternTextDetector {
    _private: (),
}

impl PatternTextDetector {
    pub fn new() -> Self {
        Self::default()
    }

    fn detect_in_span(&self, page_index: usize, span: &TextSpan, out: &mut Vec<Detection>) {
        // Byte ranges already claimed by an earlier (more specific) rule.
        let mut claimed: Vec<(usize, usize)> = Vec::new();

        for rule in RULES.iter() {
            for found in rule.regex.find_iter(&span.text) {
                let (start, end) = (found.start(), found.end());
                if claimed.iter().any(|&(s, e)| start < e && s < end) {
                    continue;
                }
                if let Some(accept) = rule.accept {
                    if !accept(found.as_str()) {
                        continue;
                    }
                }
                let Some(bbox) = slice_span_bbox(span, start, end) else {
                    continue;
                };
                claimed.push((start, end));

                let mut detection = Detection::new(
                    rule.kind,
                    page_index,
                    bbox,
                    rule.confidence,
                    DetectionSource::Textual,
                    MODEL_TAG,
                );
                detection.text = Some(found.as_str().to_string());
                detection.language = span.language.clone();
                detection.reading_order = Some(span.reading_order);
                out.push(detection);
            }
        }
    }
}

#[async_trait]
impl TextDetector for PatternTextDetector {
    fn model_tag(&self) -> &str {
        MODEL_TAG
    }

    async fn detect(&self, page: &PageView) -> Result<Vec<Detection>> {
        let Some(spans) = &page.text_spans else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for span in spans {
            self.detect_in_span(page.page_index, span, &mut out);
        }
        Ok(out)
    }
}
