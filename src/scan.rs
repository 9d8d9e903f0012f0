// src/scan.rs

use crate::assemble::{self, Assembled};
use crate::error::{AssemblyWarning, ScanError};
use crate::llm_extract::ReceiptExtraction;
use crate::model::Receipt;
use crate::store::ReceiptStore;
use crate::transcript::{self, RecognizedText, Transcript};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use time::OffsetDateTime;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

/// Progress of one scan attempt. `Done` and `Failed` are terminal for the
/// attempt; the next capture resets to `Idle` before starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Capturing,
    Recognizing,
    Extracting,
    Assembling,
    Done,
    Failed,
}

/// The recognition collaborator: image in, fragments plus orientation out.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> Result<RecognizedText, ScanError>;
}

/// Everything one successful scan produces.
#[derive(Debug)]
pub struct ScanOutcome {
    pub receipt: Receipt,
    pub transcript: Transcript,
    pub warnings: Vec<AssemblyWarning>,
}

/// Drives one capture at a time through recognition, transcript assembly,
/// extraction and persistence. Collaborators are injected; there are no
/// process-wide singletons.
pub struct ScanOrchestrator {
    recognizer: Arc<dyn TextRecognizer>,
    extractor: Arc<dyn ReceiptExtraction>,
    store: Arc<dyn ReceiptStore>,
    /// Attach the annotated overlay instead of the plain capture as evidence.
    attach_overlay: bool,
    state_tx: watch::Sender<ScanState>,
    flight: Mutex<()>,
    unsaved: StdMutex<Option<Receipt>>,
}

impl ScanOrchestrator {
    pub fn new(
        recognizer: Arc<dyn TextRecognizer>,
        extractor: Arc<dyn ReceiptExtraction>,
        store: Arc<dyn ReceiptStore>,
        attach_overlay: bool,
    ) -> Self {
        let (state_tx, _) = watch::channel(ScanState::Idle);
        ScanOrchestrator {
            recognizer,
            extractor,
            store,
            attach_overlay,
            state_tx,
            flight: Mutex::new(()),
            unsaved: StdMutex::new(None),
        }
    }

    /// Subscribe to state transitions, e.g. to drive a progress indicator.
    pub fn state(&self) -> watch::Receiver<ScanState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ScanState) {
        self.state_tx.send_replace(state);
    }

    fn fail(&self, err: ScanError) -> ScanError {
        warn!(kind = err.kind(), error = %err, "Scan failed");
        self.set_state(ScanState::Failed);
        err
    }

    /// Run one capture through the whole pipeline and persist the result.
    ///
    /// Single-flight: a second call while one is running is rejected with
    /// [`ScanError::ScanInFlight`] without touching the in-flight scan.
    /// Dropping the returned future cancels the in-flight external calls; no
    /// partial receipt is ever assembled or stored for a cancelled flow.
    pub async fn scan(&self, image: Vec<u8>) -> Result<ScanOutcome, ScanError> {
        let Ok(_flight) = self.flight.try_lock() else {
            return Err(ScanError::ScanInFlight);
        };

        self.set_state(ScanState::Idle);
        self.set_state(ScanState::Capturing);

        self.set_state(ScanState::Recognizing);
        let page = self
            .recognizer
            .recognize(&image)
            .await
            .map_err(|e| self.fail(e))?;

        let transcript = transcript::build_transcript(&page);
        if transcript.is_empty() {
            return Err(self.fail(ScanError::Recognition(
                "no text found on the image".to_string(),
            )));
        }

        let evidence = if self.attach_overlay {
            transcript::render_overlay(&image, &page).map_err(|e| self.fail(e))?
        } else {
            image
        };

        self.set_state(ScanState::Extracting);
        let payload = self
            .extractor
            .extract(&transcript.text())
            .await
            .map_err(|e| self.fail(e))?;

        self.set_state(ScanState::Assembling);
        let Assembled { receipt, warnings } =
            assemble::assemble(payload, Some(evidence), OffsetDateTime::now_utc())
                .map_err(|e| self.fail(e))?;

        if let Err(err) = self
            .store
            .insert(&receipt)
            .and_then(|()| self.store.save())
        {
            // Unstage so the receipt cannot surface on a later unrelated save;
            // it lives on in memory for retry_save.
            if let Err(cleanup) = self.store.delete(receipt.id) {
                warn!(error = %cleanup, "Could not unstage receipt after failed save");
            }
            *self
                .unsaved
                .lock()
                .expect("unsaved-receipt lock poisoned") = Some(receipt);
            return Err(self.fail(err));
        }

        self.set_state(ScanState::Done);
        info!(
            id = %receipt.id,
            store = %receipt.store_name,
            items = receipt.items.len(),
            total = receipt.total,
            "Receipt scanned and saved"
        );
        Ok(ScanOutcome {
            receipt,
            transcript,
            warnings,
        })
    }

    /// Retry persisting the receipt from a scan whose save failed. The
    /// assembled receipt is kept in memory until a retry succeeds.
    pub fn retry_save(&self) -> Result<Receipt, ScanError> {
        let receipt = self
            .unsaved
            .lock()
            .expect("unsaved-receipt lock poisoned")
            .take()
            .ok_or_else(|| ScanError::Validation("no unsaved receipt to retry".to_string()))?;

        if let Err(err) = self
            .store
            .insert(&receipt)
            .and_then(|()| self.store.save())
        {
            if let Err(cleanup) = self.store.delete(receipt.id) {
                warn!(error = %cleanup, "Could not unstage receipt after failed save");
            }
            *self
                .unsaved
                .lock()
                .expect("unsaved-receipt lock poisoned") = Some(receipt);
            return Err(err);
        }

        self.set_state(ScanState::Done);
        info!(id = %receipt.id, "Receipt saved on retry");
        Ok(receipt)
    }
}
