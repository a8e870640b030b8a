//! Single-flight gzip upload pipeline for the pulse event store.
//!
//! One [`Uploader`] per agent. An upload snapshots the staged portion of
//! the store, gzips it, and POSTs it to the collector. Rows are purged
//! only on a terminal response; transport failures and 5xx responses
//! leave them staged for the next attempt.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::Client;
use tracing::{debug, info, instrument, warn};

use pulse_core::wire;
use pulse_store::{EventStore, StoreError};

const UPLOAD_PATH_PREFIX: &str = "/api/v2/applications";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Why staged rows were kept for a later attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetainReason {
    /// Connection failure, request timeout, or any other error before a
    /// status line was read.
    Transport(String),
    /// The collector answered 5xx.
    ServerError(u16),
}

/// Result of one upload attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Another upload was already in flight; nothing was done.
    AlreadyRunning,
    /// The store held no staged data.
    NothingToSend,
    /// The collector accepted (or terminally rejected) the batch; the
    /// staged rows were purged. Non-5xx error statuses land here too:
    /// a batch the collector will never accept is not worth retrying.
    Delivered { status: u16 },
    /// Staged rows were kept for the next attempt.
    Retained(RetainReason),
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("gzip error: {0}")]
    Compress(#[from] std::io::Error),

    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Uploads the staged contents of an [`EventStore`] to the collector.
/// At most one upload runs at a time per instance.
pub struct Uploader {
    client: Client,
    base_url: String,
    in_flight: AtomicBool,
}

impl Uploader {
    /// `base_url` is scheme + host, e.g. `https://collector.example.com`.
    pub fn new(base_url: String, request_timeout: Duration) -> Result<Self, UploadError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url,
            in_flight: AtomicBool::new(false),
        })
    }

    /// Whether an upload attempt is currently in flight.
    pub fn is_uploading(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one upload attempt. Store errors surface as `Err`; network and
    /// collector failures are data, not errors, and come back as an
    /// [`UploadOutcome`].
    #[instrument(skip(self, store))]
    pub async fn upload(
        &self,
        store: &EventStore,
        app_key: &str,
        install_id: &str,
    ) -> Result<UploadOutcome, UploadError> {
        // Single-flight gate. compare_exchange so two concurrent callers
        // cannot both pass.
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("upload already in flight, skipping");
            return Ok(UploadOutcome::AlreadyRunning);
        }

        let outcome = self.upload_inner(store, app_key, install_id).await;

        self.in_flight.store(false, Ordering::Release);
        // Space is reclaimed after every attempt, successful or not.
        store.vacuum_if_oversized()?;

        outcome
    }

    async fn upload_inner(
        &self,
        store: &EventStore,
        app_key: &str,
        install_id: &str,
    ) -> Result<UploadOutcome, UploadError> {
        let blob = store.snapshot_upload_blob()?;
        if blob.is_empty() {
            debug!("nothing staged to upload");
            return Ok(UploadOutcome::NothingToSend);
        }

        let body = gzip(blob.as_bytes())?;
        debug!(raw = blob.len(), compressed = body.len(), "posting upload batch");

        let url = format!(
            "{}{UPLOAD_PATH_PREFIX}/{}/uploads",
            self.base_url,
            utf8_percent_encode(app_key, NON_ALPHANUMERIC)
        );

        let response = self
            .client
            .post(&url)
            .header(wire::HEADER_UPLOAD_TIME, pulse_core::unix_now().to_string())
            .header(wire::HEADER_INSTALL_ID, install_id)
            .header(reqwest::header::CONTENT_TYPE, "application/x-gzip")
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                // Timeout, refused connection, DNS failure. The rows stay
                // staged and the next attempt resends the same batch.
                warn!(error = %e, "upload transport failure, retaining rows");
                return Ok(UploadOutcome::Retained(RetainReason::Transport(
                    e.to_string(),
                )));
            }
        };

        let status = response.status().as_u16();
        if (500..600).contains(&status) {
            warn!(status, "collector unavailable, retaining rows");
            return Ok(UploadOutcome::Retained(RetainReason::ServerError(status)));
        }

        store.purge_uploaded_data()?;
        info!(status, bytes = blob.len(), "upload batch delivered");
        Ok(UploadOutcome::Delivered { status })
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}
