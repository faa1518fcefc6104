//! Tamper detection and chain-of-custody behavior over real pipeline output.

use std::sync::Arc;

use obscura::{
    validate, CancelToken, InMemoryKeyStore, KeyPair, KeyStore, MemoryAuditSink,
    PatternTextDetector, Processor, ProcessorConfig, ValidationFailure,
};

fn processor() -> (Arc<Processor>, Arc<InMemoryKeyStore>, String) {
    let keystore = Arc::new(InMemoryKeyStore::new());
    let key_id = keystore.insert(KeyPair::generate_p256());
    let processor = Processor::builder()
        .keystore(keystore.clone())
        .audit_sink(Arc::new(MemoryAuditSink::new()))
        .text_detector(Arc::new(PatternTextDetector::new()))
        .config(ProcessorConfig::new(key_id.clone()))
        .build()
        .unwrap();
    (Arc::new(processor), keystore, key_id)
}

fn png_input() -> Vec<u8> {
    let img = image::RgbaImage::from_fn(400, 200, |x, y| {
        image::Rgba([(x % 251) as u8, (y % 241) as u8, 90, 255])
    });
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

#[tokio::test]
async fn untouched_output_validates() {
    let (processor, keystore, key_id) = processor();
    let processed = processor.process(&png_input(), "default").await.unwrap();
    let envelope = processed.audit.unwrap();
    let public = keystore.public_key(&key_id).unwrap();

    let report = validate(
        &processed.output,
        &envelope.to_json_bytes().unwrap(),
        &public,
    )
    .unwrap();
    assert!(report.ok);
    assert!(report.failure.is_none());
}

#[tokio::test]
async fn byte_flip_at_offset_1024_is_detected() {
    let (processor, keystore, key_id) = processor();
    let processed = processor.process(&png_input(), "default").await.unwrap();
    let envelope = processed.audit.unwrap();
    let public = keystore.public_key(&key_id).unwrap();

    let mut tampered = processed.output.clone();
    assert!(tampered.len() > 1024, "output too small for the tamper test");
    tampered[1024] ^= 0x01;

    let report = validate(&tampered, &envelope.to_json_bytes().unwrap(), &public).unwrap();
    assert!(!report.ok);
    assert!(matches!(
        report.failure,
        Some(ValidationFailure::OutputFingerprintMismatch { .. })
    ));
}

#[tokio::test]
async fn edited_record_is_detected() {
    let (processor, keystore, key_id) = processor();
    let processed = processor.process(&png_input(), "default").await.unwrap();
    let mut envelope = processed.audit.unwrap();
    let public = keystore.public_key(&key_id).unwrap();

    // Rewriting history: point the record at a different input.
    envelope.record.input_fingerprint = obscura::sha256_hex(b"some other document");

    let report = validate(
        &processed.output,
        &envelope.to_json_bytes().unwrap(),
        &public,
    )
    .unwrap();
    assert!(!report.ok);
    assert!(matches!(
        report.failure,
        Some(ValidationFailure::SignatureInvalid { .. })
    ));
}

#[tokio::test]
async fn verification_requires_the_signing_key() {
    let (processor, _, _) = processor();
    let processed = processor.process(&png_input(), "default").await.unwrap();
    let envelope = processed.audit.unwrap();

    let stranger = KeyPair::generate_p256();
    let report = validate(
        &processed.output,
        &envelope.to_json_bytes().unwrap(),
        stranger.public_key(),
    )
    .unwrap();
    assert!(!report.ok);
    assert!(matches!(
        report.failure,
        Some(ValidationFailure::SignatureInvalid { .. })
    ));
}

#[tokio::test]
async fn reprocessing_chains_to_the_prior_record() {
    let (processor, _, _) = processor();
    let input = png_input();

    let first = processor.process(&input, "default").await.unwrap();
    let first_record = first.audit.unwrap().record;
    assert_eq!(first_record.sequence, 0);
    assert!(first_record.previous_audit_id.is_none());

    let second = processor
        .process_chained(&input, "default", &CancelToken::new(), Some(&first_record))
        .await
        .unwrap();
    let second_record = second.audit.unwrap().record;

    assert_eq!(second_record.sequence, 1);
    assert_eq!(
        second_record.previous_audit_id.as_deref(),
        Some(first_record.content_digest().unwrap().as_str())
    );
    // Distinct runs get distinct document ids even over identical bytes.
    assert_ne!(second_record.document_id, first_record.document_id);
}

#[tokio::test]
async fn rsa_pss_audits_verify_too() {
    let keystore = Arc::new(InMemoryKeyStore::new());
    let key_id = keystore.insert(KeyPair::generate_rsa(2048).unwrap());
    let processor = Processor::builder()
        .keystore(keystore.clone())
        .audit_sink(Arc::new(MemoryAuditSink::new()))
        .config(ProcessorConfig::new(key_id.clone()))
        .build()
        .unwrap();

    let processed = processor.process(&png_input(), "default").await.unwrap();
    let envelope = processed.audit.unwrap();
    assert_eq!(
        envelope.signature_algorithm,
        obscura::SignatureAlgorithm::RsaPssSha256
    );

    let public = keystore.public_key(&key_id).unwrap();
    let report = validate(
        &processed.output,
        &envelope.to_json_bytes().unwrap(),
        &public,
    )
    .unwrap();
    assert!(report.ok);
}
