//! Document processing orchestration.
//!
//! The [`Processor`] owns everything a document passes through: loader,
//! detectors, fusion, redaction, output assembly, and the audit engine. Pages
//! are processed sequentially by default to bound memory; an opt-in
//! page-parallel mode runs up to `page_parallelism` pages concurrently while
//! output assembly still muxes pages in ascending index order. Within a page
//! the visual and textual detectors run in parallel over a shared read-only
//! [`PageView`]; fusion is the join point.
//!
//! Cancellation is cooperative and checked between pages and at suspension
//! points. Per-page deadlines cover the detector phase: when one elapses in
//! non-strict mode, every candidate box gathered before the cutoff is
//! rendered solid black and the page is recorded as degraded; in strict mode
//! the document fails.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{
    AuditEngine, AuditRecord, AuditSink, ScrubRecord, SignedAuditRecord,
};
use crate::crypto::hash::sha256_hex;
use crate::crypto::keys::KeyStore;
use crate::detect::fusion::fuse_page_detections;
use crate::detect::{sanitize_detections, TextDetector, VisualDetector};
use crate::document::{open_document, writer_for, DocumentHandle, LoaderConfig, OutputWriter};
use crate::error::{ObscuraError, Result};
use crate::profile::{EffectiveProfile, ProfileStore};
use crate::redact::{DegradedReason, DegradedRedaction, RedactedPage, RedactionEngine};
use crate::types::{Detection, DetectionSource, ProcessingError, ProcessingResult};

pub mod batch;

/// Global Tokio runtime backing the synchronous wrappers.
///
/// Lazily initialized on first use and shared across all sync calls; creating
/// a runtime per call would dominate the cost of small documents.
static GLOBAL_RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create global Tokio runtime")
});

pub(crate) fn block_on_global<F: std::future::Future>(future: F) -> F::Output {
    GLOBAL_RUNTIME.block_on(future)
}

/// Per-document lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    Pending,
    Loading,
    Detecting,
    Redacting,
    Finalizing,
    Audited,
    Done,
    Failed,
}

fn advance(state: &mut DocumentState, next: DocumentState, document_id: Uuid) {
    debug!(document_id = %document_id, from = ?state, to = ?next, "document state");
    *state = next;
}

/// Cooperative cancellation flag shared between a caller and in-flight
/// processing.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ObscuraError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub loader: LoaderConfig,
    /// Key id used to sign audit records.
    pub signing_key_id: String,
    /// When set, any degradation (undecodable page, failed box, missed
    /// deadline) fails the document instead of degrading it.
    pub strict_mode: bool,
    /// Pages processed concurrently per document. 1 = sequential (default).
    pub page_parallelism: usize,
    /// Optional per-page deadline over the detector phase. When it elapses
    /// in non-strict mode, candidate boxes gathered before the cutoff are
    /// blacked out and the page is recorded as degraded.
    pub page_deadline: Option<Duration>,
    /// Documents processed concurrently by the batch driver
    /// (default: physical CPU count).
    pub max_in_flight: Option<usize>,
    /// Abort a batch on the first document failure.
    pub fail_fast: bool,
}

impl ProcessorConfig {
    pub fn new(signing_key_id: impl Into<String>) -> Self {
        Self {
            loader: LoaderConfig::default(),
            signing_key_id: signing_key_id.into(),
            strict_mode: false,
            page_parallelism: 1,
            page_deadline: None,
            max_in_flight: None,
            fail_fast: false,
        }
    }
}

/// Outcome of processing one document: the caller-visible result, the muxed
/// output bytes, and the persisted audit envelope.
#[derive(Debug)]
pub struct ProcessedDocument {
    pub result: ProcessingResult,
    /// Final output bytes; empty when processing failed before any output
    /// was assembled.
    pub output: Vec<u8>,
    /// `None` only for failed runs that emitted no output bytes; failures
    /// with output are as attestable as successes.
    pub audit: Option<SignedAuditRecord>,
}

struct PageOutcome {
    redacted: RedactedPage,
    detections: Vec<Detection>,
}

/// Accumulated state for one document run.
struct DocumentRun {
    document_id: Uuid,
    input_fingerprint: String,
    profile: Arc<EffectiveProfile>,
    started_at: chrono::DateTime<chrono::Utc>,
    detections: Vec<Detection>,
    per_page_fingerprints: Vec<String>,
    degraded: Vec<DegradedRedaction>,
    scrubbed: Vec<ScrubRecord>,
    redactions_applied: usize,
    pages_written: usize,
    previous_audit_id: Option<String>,
    sequence: u64,
}

/// Builder for [`Processor`]. Collaborators are injected at construction.
#[derive(Default)]
pub struct ProcessorBuilder {
    profiles: Option<Arc<ProfileStore>>,
    keystore: Option<Arc<dyn KeyStore>>,
    sink: Option<Arc<dyn AuditSink>>,
    visual_detectors: Vec<Arc<dyn VisualDetector>>,
    text_detectors: Vec<Arc<dyn TextDetector>>,
    config: Option<ProcessorConfig>,
}

impl ProcessorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn profiles(mut self, profiles: Arc<ProfileStore>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn keystore(mut self, keystore: Arc<dyn KeyStore>) -> Self {
        self.keystore = Some(keystore);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn visual_detector(mut self, detector: Arc<dyn VisualDetector>) -> Self {
        self.visual_detectors.push(detector);
        self
    }

    pub fn text_detector(mut self, detector: Arc<dyn TextDetector>) -> Self {
        self.text_detectors.push(detector);
        self
    }

    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<Processor> {
        let keystore = self
            .keystore
            .ok_or_else(|| ObscuraError::crypto("processor requires a keystore"))?;
        let sink: Arc<dyn AuditSink> = self
            .sink
            .ok_or_else(|| ObscuraError::Other("processor requires an audit sink".to_string()))?;
        let config = self
            .config
            .ok_or_else(|| ObscuraError::Other("processor requires a config".to_string()))?;
        Ok(Processor {
            profiles: self.profiles.unwrap_or_else(|| Arc::new(ProfileStore::with_defaults())),
            audit: AuditEngine::new(keystore, sink),
            visual_detectors: self.visual_detectors,
            text_detectors: self.text_detectors,
            engine: RedactionEngine::new(),
            config,
        })
    }
}

/// Orchestrates loading, detection, fusion, redaction, and auditing for
/// single documents and batches.
pub struct Processor {
    profiles: Arc<ProfileStore>,
    visual_detectors: Vec<Arc<dyn VisualDetector>>,
    text_detectors: Vec<Arc<dyn TextDetector>>,
    audit: AuditEngine<Arc<dyn AuditSink>>,
    engine: RedactionEngine,
    config: ProcessorConfig,
}

impl Processor {
    pub fn builder() -> ProcessorBuilder {
        ProcessorBuilder::new()
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Processes one document under the named profile.
    pub async fn process(&self, input_bytes: &[u8], profile_name: &str) -> Result<ProcessedDocument> {
        self.process_chained(input_bytes, profile_name, &CancelToken::new(), None)
            .await
    }

    /// Synchronous wrapper over [`Processor::process`].
    pub fn process_sync(&self, input_bytes: &[u8], profile_name: &str) -> Result<ProcessedDocument> {
        GLOBAL_RUNTIME.block_on(self.process(input_bytes, profile_name))
    }

    /// Processes one document with cooperative cancellation and an optional
    /// predecessor record for chain-of-custody linking.
    pub async fn process_chained(
        &self,
        input_bytes: &[u8],
        profile_name: &str,
        cancel: &CancelToken,
        previous: Option<&AuditRecord>,
    ) -> Result<ProcessedDocument> {
        let handle: Arc<dyn DocumentHandle> =
            Arc::from(open_document(input_bytes, &self.config.loader)?);
        let writer = writer_for(handle.format(), &self.config.loader);
        self.process_parts(handle, writer, input_bytes, profile_name, cancel, previous)
            .await
    }

    /// Processes a document through an explicit handle and output writer.
    ///
    /// This is the seam for integrators whose container formats the core does
    /// not read or write itself: anything satisfying the loader and writer
    /// contracts can be driven through the full pipeline.
    pub async fn process_parts(
        &self,
        handle: Arc<dyn DocumentHandle>,
        mut writer: Box<dyn OutputWriter>,
        input_bytes: &[u8],
        profile_name: &str,
        cancel: &CancelToken,
        previous: Option<&AuditRecord>,
    ) -> Result<ProcessedDocument> {
        let started_at = chrono::Utc::now();
        let document_id = Uuid::new_v4();
        let mut state = DocumentState::Pending;
        advance(&mut state, DocumentState::Loading, document_id);

        let input_fingerprint = sha256_hex(input_bytes);
        let profile = Arc::new(self.profiles.resolve(profile_name)?);
        let page_count = handle.page_count();
        writer.begin(page_count)?;

        let (previous_audit_id, sequence) =
            AuditEngine::<Arc<dyn AuditSink>>::chain_fields(previous)?;

        let mut run = DocumentRun {
            document_id,
            input_fingerprint,
            profile: Arc::clone(&profile),
            started_at,
            detections: Vec::new(),
            per_page_fingerprints: Vec::with_capacity(page_count),
            degraded: Vec::new(),
            scrubbed: Vec::new(),
            redactions_applied: 0,
            pages_written: 0,
            previous_audit_id,
            sequence,
        };

        // Detection and redaction interleave page by page; the document-level
        // state passes through both phases once the page loop completes.
        advance(&mut state, DocumentState::Detecting, document_id);
        let pages = if self.config.page_parallelism > 1 {
            self.run_pages_parallel(&handle, &profile, writer.as_mut(), &mut run, cancel)
                .await
        } else {
            self.run_pages_sequential(&handle, &profile, writer.as_mut(), &mut run, cancel)
                .await
        };

        if let Err(err) = pages {
            advance(&mut state, DocumentState::Failed, document_id);
            return self.fail_document(run, writer, err).await;
        }

        advance(&mut state, DocumentState::Redacting, document_id);
        advance(&mut state, DocumentState::Finalizing, document_id);
        let output = writer.finish()?;
        let output_fingerprint = sha256_hex(&output);
        let finished_at = chrono::Utc::now();

        let record = self.build_record(&run, output_fingerprint.clone(), finished_at);
        let envelope = self
            .audit
            .seal_and_persist(record, &self.config.signing_key_id)
            .await?;
        advance(&mut state, DocumentState::Audited, document_id);

        info!(
            document_id = %document_id,
            pages = run.pages_written,
            detections = run.detections.len(),
            "document processed"
        );
        advance(&mut state, DocumentState::Done, document_id);

        Ok(ProcessedDocument {
            result: ProcessingResult {
                document_id,
                input_fingerprint: run.input_fingerprint,
                output_fingerprint,
                profile_ref: profile.profile_ref(),
                detections: run.detections,
                pages_processed: run.pages_written,
                redactions_applied: run.redactions_applied,
                started_at,
                finished_at,
                success: true,
                errors: Vec::new(),
            },
            output,
            audit: Some(envelope),
        })
    }

    async fn run_pages_sequential(
        &self,
        handle: &Arc<dyn DocumentHandle>,
        profile: &Arc<EffectiveProfile>,
        writer: &mut dyn OutputWriter,
        run: &mut DocumentRun,
        cancel: &CancelToken,
    ) -> Result<()> {
        for index in 0..handle.page_count() {
            cancel.check()?;
            let (_, result) = run_page(
                Arc::clone(handle),
                index,
                Arc::clone(profile),
                self.visual_detectors.clone(),
                self.text_detectors.clone(),
                self.engine.clone(),
                self.config.page_deadline,
                self.config.strict_mode,
            )
            .await;
            let outcome = self.settle_page(handle, index, result)?;
            self.accumulate(writer, run, outcome)?;
        }
        Ok(())
    }

    async fn run_pages_parallel(
        &self,
        handle: &Arc<dyn DocumentHandle>,
        profile: &Arc<EffectiveProfile>,
        writer: &mut dyn OutputWriter,
        run: &mut DocumentRun,
        cancel: &CancelToken,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.page_parallelism));
        let mut tasks = JoinSet::new();

        for index in 0..handle.page_count() {
            cancel.check()?;
            let semaphore = Arc::clone(&semaphore);
            let handle = Arc::clone(handle);
            let profile = Arc::clone(profile);
            let visual = self.visual_detectors.clone();
            let text = self.text_detectors.clone();
            let engine = self.engine.clone();
            let deadline = self.config.page_deadline;
            let strict_mode = self.config.strict_mode;
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                run_page(
                    handle, index, profile, visual, text, engine, deadline, strict_mode,
                )
                .await
            });
        }

        // Output assembly waits until page `i` is ready before muxing
        // page `i + 1`.
        let mut pending: BTreeMap<usize, PageOutcome> = BTreeMap::new();
        let mut next_write = 0usize;
        while let Some(joined) = tasks.join_next().await {
            cancel.check()?;
            let (index, result) = joined
                .map_err(|e| ObscuraError::Other(format!("page task panicked: {}", e)))?;
            let outcome = self.settle_page(handle, index, result)?;
            pending.insert(index, outcome);
            while let Some(ready) = pending.remove(&next_write) {
                self.accumulate(writer, run, ready)?;
                next_write += 1;
            }
        }
        Ok(())
    }

    /// Decides between degraded recovery and document failure for one page.
    fn settle_page(
        &self,
        handle: &Arc<dyn DocumentHandle>,
        index: usize,
        result: Result<PageOutcome>,
    ) -> Result<PageOutcome> {
        let err = match result {
            Ok(outcome) => {
                // Per-box degraded fallbacks are non-fatal only outside
                // strict mode.
                if self.config.strict_mode && !outcome.redacted.degraded.is_empty() {
                    return Err(ObscuraError::redaction(format!(
                        "page {} required {} degraded fallback(s) in strict mode",
                        index,
                        outcome.redacted.degraded.len()
                    )));
                }
                return Ok(outcome);
            }
            Err(err) => err,
        };
        // Missed deadlines are degraded inside `run_page`, where the
        // gathered candidate boxes still exist; a `DeadlineExceeded` arriving
        // here is a strict-mode failure and passes through.
        if self.config.strict_mode || !err.is_page_recoverable() {
            return Err(err);
        }
        warn!(page_index = index, error = %err, "degrading page to full redaction");
        let (width, height) = handle.page_dimensions(index).unwrap_or_else(|| {
            // US Letter at the configured density.
            let dpi = self.config.loader.target_dpi;
            ((dpi * 8.5) as u32, (dpi * 11.0) as u32)
        });
        // The reason is part of a signed record; it must name the failure
        // that actually occurred.
        let reason = match &err {
            ObscuraError::Detection { .. } => DegradedReason::DetectorFailure,
            ObscuraError::Redaction { .. } => DegradedReason::RenderFailure,
            _ => DegradedReason::PageDecodeFailure,
        };
        let redacted = self
            .engine
            .full_page_fallback(index, width, height, reason, err.to_string());
        Ok(PageOutcome {
            redacted,
            detections: Vec::new(),
        })
    }

    fn accumulate(
        &self,
        writer: &mut dyn OutputWriter,
        run: &mut DocumentRun,
        outcome: PageOutcome,
    ) -> Result<()> {
        writer.write_page(&outcome.redacted)?;
        run.per_page_fingerprints
            .push(outcome.redacted.fingerprint.clone());
        run.degraded.extend(outcome.redacted.degraded.iter().cloned());
        run.scrubbed
            .extend(outcome.redacted.scrubbed.iter().map(|s| ScrubRecord {
                page_index: outcome.redacted.page_index,
                reading_order: s.reading_order,
                replaced_chars: s.replaced_chars,
            }));
        run.redactions_applied += outcome.detections.len();
        run.detections.extend(outcome.detections);
        run.pages_written += 1;
        Ok(())
    }

    fn model_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .visual_detectors
            .iter()
            .map(|d| d.model_tag().to_string())
            .chain(self.text_detectors.iter().map(|d| d.model_tag().to_string()))
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }

    fn build_record(
        &self,
        run: &DocumentRun,
        output_fingerprint: String,
        finished_at: chrono::DateTime<chrono::Utc>,
    ) -> AuditRecord {
        AuditRecord {
            document_id: run.document_id,
            input_fingerprint: run.input_fingerprint.clone(),
            output_fingerprint,
            per_page_output_fingerprints: run.per_page_fingerprints.clone(),
            profile: (*run.profile).clone(),
            detections: run.detections.clone(),
            degraded_redactions: run.degraded.clone(),
            scrubbed_spans: run.scrubbed.clone(),
            timestamps: AuditEngine::<Arc<dyn AuditSink>>::timestamps(run.started_at, finished_at),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            model_tags: self.model_tags(),
            previous_audit_id: run.previous_audit_id.clone(),
            sequence: run.sequence,
        }
    }

    /// Terminal handling for a failed document.
    ///
    /// If any output bytes can still be assembled the failure is audited like
    /// a success; system errors and lock poisoning surface to the caller
    /// instead of being converted into a result.
    async fn fail_document(
        &self,
        run: DocumentRun,
        mut writer: Box<dyn OutputWriter>,
        err: ObscuraError,
    ) -> Result<ProcessedDocument> {
        if matches!(
            err,
            ObscuraError::Io(_) | ObscuraError::LockPoisoned(_) | ObscuraError::Other(_)
        ) {
            return Err(err);
        }

        let finished_at = chrono::Utc::now();
        let output = if run.pages_written > 0 {
            writer.finish().unwrap_or_default()
        } else {
            Vec::new()
        };

        let (output_fingerprint, audit) = if output.is_empty() {
            (String::new(), None)
        } else {
            let fingerprint = sha256_hex(&output);
            let record = self.build_record(&run, fingerprint.clone(), finished_at);
            let envelope = self
                .audit
                .seal_and_persist(record, &self.config.signing_key_id)
                .await?;
            (fingerprint, Some(envelope))
        };

        let errors = vec![ProcessingError::from_error(&err, None)];
        warn!(document_id = %run.document_id, error = %err, "document failed");

        Ok(ProcessedDocument {
            result: ProcessingResult {
                document_id: run.document_id,
                input_fingerprint: run.input_fingerprint,
                output_fingerprint,
                profile_ref: run.profile.profile_ref(),
                detections: run.detections,
                pages_processed: run.pages_written,
                redactions_applied: run.redactions_applied,
                started_at: run.started_at,
                finished_at,
                success: false,
                errors,
            },
            output,
            audit,
        })
    }
}

/// Processes a single page end to end: decode, detect (visual ∥ textual),
/// fuse, redact.
///
/// Free function so page-parallel mode can spawn it; everything it needs is
/// owned.
#[allow(clippy::too_many_arguments)]
async fn run_page(
    handle: Arc<dyn DocumentHandle>,
    index: usize,
    profile: Arc<EffectiveProfile>,
    visual: Vec<Arc<dyn VisualDetector>>,
    text: Vec<Arc<dyn TextDetector>>,
    engine: RedactionEngine,
    deadline: Option<Duration>,
    strict_mode: bool,
) -> (usize, Result<PageOutcome>) {
    let result = run_page_inner(
        handle,
        index,
        profile,
        visual,
        text,
        engine,
        deadline,
        strict_mode,
    )
    .await;
    (index, result)
}

/// The deadline, when present, covers the detector phase - the page's only
/// suspension points. Detections are captured as each detector completes, so
/// a missed deadline in non-strict mode still knows every candidate gathered
/// before the cutoff: those candidate boxes are rendered solid black and the
/// page is recorded as degraded, rather than blacking out the whole page. In
/// strict mode a missed deadline fails the document.
#[allow(clippy::too_many_arguments)]
async fn run_page_inner(
    handle: Arc<dyn DocumentHandle>,
    index: usize,
    profile: Arc<EffectiveProfile>,
    visual: Vec<Arc<dyn VisualDetector>>,
    text: Vec<Arc<dyn TextDetector>>,
    engine: RedactionEngine,
    deadline: Option<Duration>,
    strict_mode: bool,
) -> Result<PageOutcome> {
    let page = handle.page(index)?;
    page.validate()?;

    let candidates: Mutex<Vec<Detection>> = Mutex::new(Vec::new());
    let visual_pass = async {
        for detector in &visual {
            let raw = detector.detect(&page).await?;
            candidates
                .lock()
                .extend(sanitize_detections(raw, &page, DetectionSource::Visual));
        }
        Ok::<_, ObscuraError>(())
    };
    let text_pass = async {
        for detector in &text {
            let raw = detector.detect(&page).await?;
            candidates
                .lock()
                .extend(sanitize_detections(raw, &page, DetectionSource::Textual));
        }
        Ok::<_, ObscuraError>(())
    };
    let detect_phase = async {
        let (visual_done, text_done) = tokio::join!(visual_pass, text_pass);
        visual_done?;
        text_done?;
        Ok::<_, ObscuraError>(())
    };

    match deadline {
        Some(limit) => match tokio::time::timeout(limit, detect_phase).await {
            Ok(finished) => finished?,
            Err(_) => {
                if strict_mode {
                    return Err(ObscuraError::DeadlineExceeded { page_index: index });
                }
                let gathered = std::mem::take(&mut *candidates.lock());
                let candidate_count = gathered.len();
                let fused = fuse_page_detections(gathered, &profile);
                warn!(
                    page_index = index,
                    candidates = candidate_count,
                    "page deadline elapsed, blacking out candidate boxes"
                );
                let redacted = engine.redact_page_black(
                    &page,
                    &fused,
                    DegradedReason::DeadlineExceeded,
                    format!(
                        "page deadline elapsed with {} candidate box(es) gathered",
                        candidate_count
                    ),
                );
                return Ok(PageOutcome {
                    redacted,
                    detections: fused,
                });
            }
        },
        None => detect_phase.await?,
    }

    let raw = std::mem::take(&mut *candidates.lock());
    let fused = fuse_page_detections(raw, &profile);
    let redacted = engine.redact_page(&page, &fused, &profile)?;
    // `page` drops here: the view is released as soon as its output raster
    // exists.
    Ok(PageOutcome {
        redacted,
        detections: fused,
    })
}
