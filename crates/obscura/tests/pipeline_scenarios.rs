//! End-to-end pipeline scenarios over in-memory documents.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use obscura::document::memory::MemoryDocument;
use std::time::Duration;

use obscura::{
    BoundingBox, CancelToken, Detection, DetectionSource, InMemoryKeyStore, KeyPair, KeyStore,
    MemoryAuditSink, ObscuraError, OutputWriter, PageView, PatternTextDetector, PiiKind,
    Processor, ProcessorConfig, ProfileStore, RedactedPage, RedactionProfile, Result,
    TextDetector, TextSpan, VisualDetector,
};

/// Writer that concatenates length-prefixed PNG pages and exposes the raw
/// rasters for pixel assertions.
struct ConcatWriter {
    captured: Arc<Mutex<Vec<image::RgbaImage>>>,
    bytes: Vec<u8>,
}

impl ConcatWriter {
    fn new(captured: Arc<Mutex<Vec<image::RgbaImage>>>) -> Self {
        Self {
            captured,
            bytes: Vec::new(),
        }
    }
}

impl OutputWriter for ConcatWriter {
    fn begin(&mut self, _total_pages: usize) -> Result<()> {
        Ok(())
    }

    fn write_page(&mut self, page: &RedactedPage) -> Result<()> {
        let mut buf = Cursor::new(Vec::new());
        page.raster.write_to(&mut buf, image::ImageFormat::Png)?;
        let encoded = buf.into_inner();
        self.bytes.extend((encoded.len() as u64).to_le_bytes());
        self.bytes.extend(&encoded);
        self.captured.lock().push(page.raster.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.bytes))
    }
}

/// Visual detector stub that reports fixed face boxes.
struct StubFaceDetector {
    faces: Vec<(usize, BoundingBox, f64)>,
}

#[async_trait]
impl VisualDetector for StubFaceDetector {
    fn model_tag(&self) -> &str {
        "stub-face/1"
    }

    async fn detect(&self, page: &PageView) -> Result<Vec<Detection>> {
        Ok(self
            .faces
            .iter()
            .filter(|(index, _, _)| *index == page.page_index)
            .map(|(index, bbox, confidence)| {
                Detection::new(
                    PiiKind::Face,
                    *index,
                    *bbox,
                    *confidence,
                    DetectionSource::Visual,
                    "stub-face/1",
                )
            })
            .collect())
    }
}

/// Text detector that never finishes within any sane page deadline.
struct SlowTextDetector;

#[async_trait]
impl TextDetector for SlowTextDetector {
    fn model_tag(&self) -> &str {
        "slow-text/1"
    }

    async fn detect(&self, _page: &PageView) -> Result<Vec<Detection>> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Vec::new())
    }
}

/// Text detector whose backing model is unavailable.
struct FailingTextDetector;

#[async_trait]
impl TextDetector for FailingTextDetector {
    fn model_tag(&self) -> &str {
        "failing-text/1"
    }

    async fn detect(&self, _page: &PageView) -> Result<Vec<Detection>> {
        Err(ObscuraError::detection("text model unavailable"))
    }
}

struct Harness {
    processor: Arc<Processor>,
    sink: Arc<MemoryAuditSink>,
    keystore: Arc<InMemoryKeyStore>,
    key_id: String,
    captured: Arc<Mutex<Vec<image::RgbaImage>>>,
}

fn harness(
    profiles: Option<ProfileStore>,
    visual: Option<StubFaceDetector>,
) -> Harness {
    let keystore = Arc::new(InMemoryKeyStore::new());
    let key_id = keystore.insert(KeyPair::generate_p256());
    let sink = Arc::new(MemoryAuditSink::new());
    let mut builder = Processor::builder()
        .keystore(keystore.clone())
        .audit_sink(sink.clone())
        .text_detector(Arc::new(PatternTextDetector::new()))
        .config(ProcessorConfig::new(key_id.clone()));
    if let Some(store) = profiles {
        builder = builder.profiles(Arc::new(store));
    }
    if let Some(detector) = visual {
        builder = builder.visual_detector(Arc::new(detector));
    }
    Harness {
        processor: Arc::new(builder.build().unwrap()),
        sink,
        keystore,
        key_id,
        captured: Arc::new(Mutex::new(Vec::new())),
    }
}

fn white_page(w: u32, h: u32) -> image::RgbaImage {
    image::RgbaImage::from_pixel(w, h, image::Rgba([255, 255, 255, 255]))
}

fn span(text: &str, bbox: BoundingBox, order: usize) -> TextSpan {
    TextSpan {
        text: text.to_string(),
        bbox,
        language: Some("en".to_string()),
        font_size: Some(11.0),
        reading_order: order,
    }
}

fn center(bbox: &BoundingBox) -> (u32, u32) {
    (bbox.x + bbox.w / 2, bbox.y + bbox.h / 2)
}

const BLACK: image::Rgba<u8> = image::Rgba([0, 0, 0, 255]);
const WHITE: image::Rgba<u8> = image::Rgba([255, 255, 255, 255]);

#[tokio::test]
async fn scenario_name_phone_email_redacted_and_audited() {
    let h = harness(None, None);
    let doc = MemoryDocument::builder()
        .page_with_spans(
            white_page(1000, 300),
            200.0,
            vec![span(
                "John Doe 555-123-4567 jane@example.com",
                BoundingBox::new(50, 100, 900, 24),
                0,
            )],
        )
        .build();

    let input = b"one-page-scan";
    let processed = h
        .processor
        .process_parts(
            Arc::new(doc),
            Box::new(ConcatWriter::new(h.captured.clone())),
            input,
            "default",
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(processed.result.success);
    assert!(processed.result.detections.len() >= 3);
    let kinds: Vec<PiiKind> = processed.result.detections.iter().map(|d| d.kind).collect();
    assert!(kinds.contains(&PiiKind::PersonName));
    assert!(kinds.contains(&PiiKind::Phone));
    assert!(kinds.contains(&PiiKind::Email));

    // Every applied detection leaves a solid black rectangle on the page.
    let pages = h.captured.lock();
    for detection in &processed.result.detections {
        let (cx, cy) = center(&detection.bbox);
        assert_eq!(pages[0].get_pixel(cx, cy), &BLACK, "{}", detection.kind);
    }
    drop(pages);

    // The audit record verifies against the emitted output.
    let envelope = processed.audit.unwrap();
    let public = h.keystore.public_key(&h.key_id).unwrap();
    let report = obscura::validate(
        &processed.output,
        &envelope.to_json_bytes().unwrap(),
        &public,
    )
    .unwrap();
    assert!(report.ok);
    assert_eq!(h.sink.records().len(), 1);
}

#[tokio::test]
async fn scenario_ssn_on_second_page_with_healthcare_profile() {
    let mut store = ProfileStore::with_defaults();
    store.insert(
        RedactionProfile::from_yaml_str(
            r#"
name: healthcare
version: "1"
base: default
pii_rules:
  national_id:
    enabled: true
    min_confidence: 0.9
"#,
        )
        .unwrap(),
    );
    let h = harness(Some(store), None);

    let page0_raster = white_page(800, 200);
    let page1_raster = white_page(800, 200);
    let page0_spans = vec![span(
        "general correspondence",
        BoundingBox::new(40, 40, 400, 20),
        0,
    )];
    let page1_spans = vec![span(
        "SSN on file: 123-45-6789",
        BoundingBox::new(40, 80, 480, 20),
        0,
    )];

    let doc = MemoryDocument::builder()
        .page_with_spans(page0_raster.clone(), 200.0, page0_spans.clone())
        .page_with_spans(page1_raster.clone(), 200.0, page1_spans.clone())
        .build();

    let processed = h
        .processor
        .process_parts(
            Arc::new(doc),
            Box::new(ConcatWriter::new(h.captured.clone())),
            b"two-page-document",
            "healthcare",
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(processed.result.success);
    assert_eq!(processed.result.detections.len(), 1);
    let detection = &processed.result.detections[0];
    assert_eq!(detection.kind, PiiKind::NationalId);
    assert_eq!(detection.page_index, 1);

    let record = &processed.audit.as_ref().unwrap().record;
    assert_eq!(record.per_page_output_fingerprints.len(), 2);

    // Page 0 was untouched: its fingerprint equals the hash of the original
    // rasterized page plus its unmodified text layer.
    let page0_texts: Vec<String> = page0_spans.iter().map(|s| s.text.clone()).collect();
    assert_eq!(
        record.per_page_output_fingerprints[0],
        obscura::crypto::page_fingerprint(&page0_raster, Some(page0_texts.as_slice()))
    );

    // Page 1 was redacted and scrubbed: its fingerprint must differ from the
    // untouched form.
    let page1_texts: Vec<String> = page1_spans.iter().map(|s| s.text.clone()).collect();
    assert_ne!(
        record.per_page_output_fingerprints[1],
        obscura::crypto::page_fingerprint(&page1_raster, Some(page1_texts.as_slice()))
    );

    // The text layer on page 1 was scrubbed.
    assert_eq!(record.scrubbed_spans.len(), 1);
    assert_eq!(record.scrubbed_spans[0].page_index, 1);
}

#[tokio::test]
async fn scenario_face_and_printed_name_fuse_into_one_redaction() {
    let face_bbox = BoundingBox::new(100, 50, 300, 200);
    let h = harness(
        None,
        Some(StubFaceDetector {
            faces: vec![(0, face_bbox, 0.92)],
        }),
    );

    // The printed name sits fully inside the face region.
    let doc = MemoryDocument::builder()
        .page_with_spans(
            white_page(600, 400),
            200.0,
            vec![span("Alice Smith", BoundingBox::new(150, 200, 180, 22), 0)],
        )
        .build();

    let processed = h
        .processor
        .process_parts(
            Arc::new(doc),
            Box::new(ConcatWriter::new(h.captured.clone())),
            b"portrait-page",
            "default",
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(processed.result.detections.len(), 1);
    let fused = &processed.result.detections[0];
    assert_eq!(fused.source, DetectionSource::Fused);
    assert_eq!(fused.bbox, face_bbox);

    // Both source model tags are recorded in the audit.
    let record = &processed.audit.as_ref().unwrap().record;
    assert_eq!(record.detections.len(), 1);
    assert!(record.detections[0].model_tag.contains("stub-face/1"));
    assert!(record.detections[0].model_tag.contains("pattern-text/1.0"));

    // A single redaction covers the fused region.
    let pages = h.captured.lock();
    let (cx, cy) = center(&face_bbox);
    assert_eq!(pages[0].get_pixel(cx, cy), &BLACK);
    assert_eq!(pages[0].get_pixel(10, 10), &WHITE);
}

#[tokio::test]
async fn scenario_corrupt_middle_page_degrades_not_fails() {
    let h = harness(None, None);
    let doc = MemoryDocument::builder()
        .page_with_spans(
            white_page(200, 100),
            200.0,
            vec![span("jane@example.com", BoundingBox::new(10, 10, 150, 15), 0)],
        )
        .corrupt_page(200, 100)
        .blank_page(200, 100)
        .build();

    let processed = h
        .processor
        .process_parts(
            Arc::new(doc),
            Box::new(ConcatWriter::new(h.captured.clone())),
            b"three-page-document",
            "default",
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(processed.result.success);
    assert_eq!(processed.result.pages_processed, 3);

    let record = &processed.audit.as_ref().unwrap().record;
    assert_eq!(record.degraded_redactions.len(), 1);
    assert_eq!(record.degraded_redactions[0].page_index, 1);
    assert_eq!(
        record.degraded_redactions[0].reason,
        obscura::DegradedReason::PageDecodeFailure
    );

    // The corrupt page came out fully black at its recorded dimensions.
    let pages = h.captured.lock();
    assert_eq!(pages[1].dimensions(), (200, 100));
    assert!(pages[1].pixels().all(|p| *p == BLACK));
    // Page 0 was still redacted normally, page 2 untouched.
    assert_eq!(pages[2].get_pixel(100, 50), &WHITE);
    drop(pages);

    // Degraded runs are attestable like any other.
    let public = h.keystore.public_key(&h.key_id).unwrap();
    let envelope = processed.audit.unwrap();
    let report = obscura::validate(
        &processed.output,
        &envelope.to_json_bytes().unwrap(),
        &public,
    )
    .unwrap();
    assert!(report.ok);
}

#[tokio::test]
async fn scenario_corrupt_page_fails_document_in_strict_mode() {
    let keystore = Arc::new(InMemoryKeyStore::new());
    let key_id = keystore.insert(KeyPair::generate_p256());
    let sink = Arc::new(MemoryAuditSink::new());
    let mut config = ProcessorConfig::new(key_id);
    config.strict_mode = true;
    let processor = Processor::builder()
        .keystore(keystore)
        .audit_sink(sink)
        .config(config)
        .build()
        .unwrap();

    let doc = MemoryDocument::builder()
        .blank_page(50, 50)
        .corrupt_page(50, 50)
        .build();

    let captured = Arc::new(Mutex::new(Vec::new()));
    let processed = processor
        .process_parts(
            Arc::new(doc),
            Box::new(ConcatWriter::new(captured)),
            b"strict-document",
            "default",
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(!processed.result.success);
    assert_eq!(
        processed.result.errors[0].kind,
        obscura::ProcessingErrorKind::Input
    );
    assert_eq!(processed.result.errors[0].page_index, Some(1));
}

#[tokio::test]
async fn missed_deadline_blacks_out_candidate_boxes_not_whole_page() {
    let face_bbox = BoundingBox::new(20, 20, 60, 40);
    let keystore = Arc::new(InMemoryKeyStore::new());
    let key_id = keystore.insert(KeyPair::generate_p256());
    let sink = Arc::new(MemoryAuditSink::new());
    let mut config = ProcessorConfig::new(key_id.clone());
    config.page_deadline = Some(Duration::from_millis(250));
    let processor = Processor::builder()
        .keystore(keystore.clone())
        .audit_sink(sink)
        .visual_detector(Arc::new(StubFaceDetector {
            faces: vec![(0, face_bbox, 0.9)],
        }))
        .text_detector(Arc::new(SlowTextDetector))
        .config(config)
        .build()
        .unwrap();

    let doc = MemoryDocument::builder().blank_page(200, 100).build();
    let captured = Arc::new(Mutex::new(Vec::new()));
    let processed = processor
        .process_parts(
            Arc::new(doc),
            Box::new(ConcatWriter::new(captured.clone())),
            b"deadline-document",
            "default",
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(processed.result.success);

    // The face candidate gathered before the cutoff was applied.
    assert_eq!(processed.result.detections.len(), 1);
    assert_eq!(processed.result.detections[0].kind, PiiKind::Face);

    let record = &processed.audit.as_ref().unwrap().record;
    assert_eq!(record.degraded_redactions.len(), 1);
    assert_eq!(
        record.degraded_redactions[0].reason,
        obscura::DegradedReason::DeadlineExceeded
    );
    assert_eq!(record.degraded_redactions[0].page_index, 0);

    // The candidate box is black; the rest of the page is NOT blacked out.
    let pages = captured.lock();
    let (cx, cy) = center(&face_bbox);
    assert_eq!(pages[0].get_pixel(cx, cy), &BLACK);
    assert_eq!(pages[0].get_pixel(150, 80), &WHITE);
    assert_eq!(pages[0].get_pixel(5, 5), &WHITE);

    // Verifiable like any other run.
    drop(pages);
    let public = keystore.public_key(&key_id).unwrap();
    let envelope = processed.audit.unwrap();
    let report = obscura::validate(
        &processed.output,
        &envelope.to_json_bytes().unwrap(),
        &public,
    )
    .unwrap();
    assert!(report.ok);
}

#[tokio::test]
async fn missed_deadline_fails_document_in_strict_mode() {
    let keystore = Arc::new(InMemoryKeyStore::new());
    let key_id = keystore.insert(KeyPair::generate_p256());
    let mut config = ProcessorConfig::new(key_id);
    config.page_deadline = Some(Duration::from_millis(250));
    config.strict_mode = true;
    let processor = Processor::builder()
        .keystore(keystore)
        .audit_sink(Arc::new(MemoryAuditSink::new()))
        .text_detector(Arc::new(SlowTextDetector))
        .config(config)
        .build()
        .unwrap();

    let doc = MemoryDocument::builder().blank_page(100, 60).build();
    let captured = Arc::new(Mutex::new(Vec::new()));
    let processed = processor
        .process_parts(
            Arc::new(doc),
            Box::new(ConcatWriter::new(captured)),
            b"strict-deadline-document",
            "default",
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(!processed.result.success);
    assert_eq!(
        processed.result.errors[0].kind,
        obscura::ProcessingErrorKind::DeadlineExceeded
    );
    assert_eq!(processed.result.errors[0].page_index, Some(0));
}

#[tokio::test]
async fn detector_failure_is_recorded_as_detector_failure() {
    let keystore = Arc::new(InMemoryKeyStore::new());
    let key_id = keystore.insert(KeyPair::generate_p256());
    let sink = Arc::new(MemoryAuditSink::new());
    let processor = Processor::builder()
        .keystore(keystore)
        .audit_sink(sink)
        .text_detector(Arc::new(FailingTextDetector))
        .config(ProcessorConfig::new(key_id))
        .build()
        .unwrap();

    let doc = MemoryDocument::builder().blank_page(100, 60).build();
    let captured = Arc::new(Mutex::new(Vec::new()));
    let processed = processor
        .process_parts(
            Arc::new(doc),
            Box::new(ConcatWriter::new(captured.clone())),
            b"failing-detector-document",
            "default",
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap();

    // Non-strict: the page degrades instead of failing the document, and the
    // signed record names the detector failure, not a decode failure.
    assert!(processed.result.success);
    let record = &processed.audit.as_ref().unwrap().record;
    assert_eq!(record.degraded_redactions.len(), 1);
    assert_eq!(
        record.degraded_redactions[0].reason,
        obscura::DegradedReason::DetectorFailure
    );

    let pages = captured.lock();
    assert!(pages[0].pixels().all(|p| *p == BLACK));
}

#[tokio::test]
async fn page_parallel_mode_preserves_output_order() {
    let keystore = Arc::new(InMemoryKeyStore::new());
    let key_id = keystore.insert(KeyPair::generate_p256());
    let sink = Arc::new(MemoryAuditSink::new());
    let mut config = ProcessorConfig::new(key_id);
    config.page_parallelism = 4;
    let processor = Processor::builder()
        .keystore(keystore)
        .audit_sink(sink)
        .text_detector(Arc::new(PatternTextDetector::new()))
        .config(config)
        .build()
        .unwrap();

    // Eight pages, each with a distinct marker pixel so order is observable.
    let mut builder = MemoryDocument::builder();
    for index in 0..8u8 {
        let mut raster = white_page(40, 40);
        raster.put_pixel(0, 0, image::Rgba([index, index, index, 255]));
        builder = builder.page(raster, 200.0);
    }
    let doc = builder.build();

    let captured = Arc::new(Mutex::new(Vec::new()));
    let processed = processor
        .process_parts(
            Arc::new(doc),
            Box::new(ConcatWriter::new(captured.clone())),
            b"parallel-pages",
            "default",
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(processed.result.success);
    assert_eq!(processed.result.pages_processed, 8);
    let pages = captured.lock();
    for (index, page) in pages.iter().enumerate() {
        assert_eq!(page.get_pixel(0, 0)[0], index as u8);
    }
}
