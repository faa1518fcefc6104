//! Batch driver: bounded-concurrency processing of ordered document sets.
//!
//! Documents are processed concurrently up to `max_in_flight` (default: CPU
//! count) with results collected in input order. One document's failure does
//! not abort the batch unless `fail_fast` is set; every document gets its own
//! independent audit record.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::error::{ObscuraError, Result};
use crate::processor::{CancelToken, ProcessedDocument, Processor};
use crate::types::{ProcessingError, ProcessingResult, ProfileRef};

impl Processor {
    /// Processes a batch of documents under one profile.
    ///
    /// Results come back in input order. Unless `fail_fast` is configured,
    /// per-document errors are converted into failed results and the batch
    /// continues; system errors always abort.
    pub async fn process_batch(
        self: &Arc<Self>,
        inputs: Vec<Vec<u8>>,
        profile_name: &str,
    ) -> Result<Vec<ProcessedDocument>> {
        self.process_batch_cancellable(inputs, profile_name, &CancelToken::new())
            .await
    }

    /// Synchronous wrapper over [`Processor::process_batch`].
    pub fn process_batch_sync(
        self: &Arc<Self>,
        inputs: Vec<Vec<u8>>,
        profile_name: &str,
    ) -> Result<Vec<ProcessedDocument>> {
        crate::processor::block_on_global(self.process_batch(inputs, profile_name))
    }

    pub async fn process_batch_cancellable(
        self: &Arc<Self>,
        inputs: Vec<Vec<u8>>,
        profile_name: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<ProcessedDocument>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let max_in_flight = self
            .config()
            .max_in_flight
            .unwrap_or_else(num_cpus::get_physical);
        let semaphore = Arc::new(Semaphore::new(max_in_flight.max(1)));
        let fail_fast = self.config().fail_fast;
        let profile_name = profile_name.to_string();

        let mut tasks = JoinSet::new();
        for (index, input) in inputs.into_iter().enumerate() {
            let processor = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let profile_name = profile_name.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let result = processor
                    .process_chained(&input, &profile_name, &cancel, None)
                    .await;
                (index, result)
            });
        }

        let mut results: Vec<Option<ProcessedDocument>> = Vec::new();
        results.resize_with(tasks.len(), || None);

        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined
                .map_err(|e| ObscuraError::Other(format!("batch task panicked: {}", e)))?;
            match result {
                Ok(processed) => {
                    if fail_fast && !processed.result.success {
                        tasks.abort_all();
                        return Err(ObscuraError::Other(format!(
                            "document {} failed: {}",
                            index,
                            processed
                                .result
                                .errors
                                .first()
                                .map(|e| e.message.as_str())
                                .unwrap_or("unknown error")
                        )));
                    }
                    results[index] = Some(processed);
                }
                Err(err) => {
                    // System errors abort the batch regardless of fail_fast.
                    if fail_fast || matches!(err, ObscuraError::Io(_)) {
                        tasks.abort_all();
                        return Err(err);
                    }
                    results[index] = Some(failed_placeholder(&err, &profile_name));
                }
            }
        }

        Ok(results
            .into_iter()
            .map(|r| r.expect("every batch index is filled"))
            .collect())
    }
}

/// Result stub for a document that never got far enough to produce output.
fn failed_placeholder(err: &ObscuraError, profile_name: &str) -> ProcessedDocument {
    let now = chrono::Utc::now();
    ProcessedDocument {
        result: ProcessingResult {
            document_id: Uuid::new_v4(),
            input_fingerprint: String::new(),
            output_fingerprint: String::new(),
            profile_ref: ProfileRef {
                name: profile_name.to_string(),
                version: String::new(),
            },
            detections: Vec::new(),
            pages_processed: 0,
            redactions_applied: 0,
            started_at: now,
            finished_at: now,
            success: false,
            errors: vec![ProcessingError::from_error(err, None)],
        },
        output: Vec::new(),
        audit: None,
    }
}
