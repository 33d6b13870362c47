//! Batched best-effort upload of samples to a remote document store.
//!
//! Samples queue while recording. A periodic check drains the whole queue
//! once it holds a full batch or the upload interval has elapsed; each
//! sample is submitted as its own document. Failed documents are counted
//! and dropped.

use crate::clock::Clock;
use crate::config::UploadConfig;
use crate::sample::Sample;
use crate::ticker::Ticker;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Upload once this long has passed since the last upload
pub const UPLOAD_INTERVAL_MS: u64 = 5000;

/// Upload once this many samples are pending
pub const BATCH_SIZE: usize = 100;

/// Interval of the periodic upload check
pub const CHECK_INTERVAL_MS: u64 = 1000;

pub const DEFAULT_DEVICE_ID: &str = "SmartRacket_001";

const STATS_CHANNEL_CAPACITY: usize = 32;

/// Errors raised while submitting a document.
#[derive(Error, Debug, Clone)]
pub enum UploadError {
    #[error("Failed to serialize document: {0}")]
    Serialization(String),

    #[error("Document store error: {0}")]
    Store(String),
}

/// One uploaded sample. The store assigns the upload time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuDocument {
    pub device_id: String,
    pub session_id: String,
    pub timestamp: u32,
    #[serde(rename = "accelX")]
    pub accel_x: f32,
    #[serde(rename = "accelY")]
    pub accel_y: f32,
    #[serde(rename = "accelZ")]
    pub accel_z: f32,
    #[serde(rename = "gyroX")]
    pub gyro_x: f32,
    #[serde(rename = "gyroY")]
    pub gyro_y: f32,
    #[serde(rename = "gyroZ")]
    pub gyro_z: f32,
    pub voltage: f32,
    pub received_at: i64,
    pub calibrated: bool,
}

impl ImuDocument {
    pub fn new(sample: &Sample, device_id: &str, session_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            session_id: session_id.to_string(),
            timestamp: sample.device_timestamp,
            accel_x: sample.accel_x,
            accel_y: sample.accel_y,
            accel_z: sample.accel_z,
            gyro_x: sample.gyro_x,
            gyro_y: sample.gyro_y,
            gyro_z: sample.gyro_z,
            voltage: sample.voltage,
            received_at: sample.received_at,
            calibrated: sample.calibrated,
        }
    }
}

/// Remote store accepting one document per write.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, document: &ImuDocument) -> Result<(), UploadError>;
}

/// Uploader counters, published after every batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadStats {
    pub uploaded: u64,
    pub failed: u64,
    pub pending: usize,
    pub batches: u64,
}

/// Size- and time-triggered batch uploader.
pub struct Uploader {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    upload_interval: Duration,
    concurrency: usize,
    device_id: RwLock<String>,
    session_id: RwLock<Option<String>>,
    recording: AtomicBool,
    pending: Mutex<Vec<Sample>>,
    last_upload: Mutex<Instant>,
    batch_lock: tokio::sync::Mutex<()>,
    wake: Arc<Notify>,
    stats: RwLock<UploadStats>,
    ticker: Ticker,
    stats_tx: broadcast::Sender<UploadStats>,
}

impl Uploader {
    pub fn new(config: &UploadConfig, store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        let (stats_tx, _) = broadcast::channel(STATS_CHANNEL_CAPACITY);

        Self {
            store,
            clock,
            batch_size: config.batch_size.max(1),
            upload_interval: config.upload_interval(),
            concurrency: config.concurrency.max(1),
            device_id: RwLock::new(config.device_id.clone()),
            session_id: RwLock::new(None),
            recording: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            last_upload: Mutex::new(Instant::now()),
            batch_lock: tokio::sync::Mutex::new(()),
            wake: Arc::new(Notify::new()),
            stats: RwLock::new(UploadStats::default()),
            ticker: Ticker::new("upload-check", config.check_interval()),
            stats_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadStats> {
        self.stats_tx.subscribe()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Session of the current (or last) recording.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn device_id(&self) -> String {
        self.device_id.read().clone()
    }

    pub fn set_device_id(&self, device_id: impl Into<String>) {
        *self.device_id.write() = device_id.into();
    }

    pub fn stats(&self) -> UploadStats {
        let mut stats = self.stats.read().clone();
        stats.pending = self.pending.lock().len();
        stats
    }

    /// Queue a sample. Ignored unless recording; never touches the network.
    pub fn add(&self, sample: &Sample) {
        if !self.is_recording() {
            return;
        }
        let len = {
            let mut pending = self.pending.lock();
            pending.push(*sample);
            pending.len()
        };
        if len >= self.batch_size {
            self.wake.notify_one();
        }
    }

    /// Turn recording on or off. Turning off uploads whatever is pending
    /// and returns once that attempt has finished.
    pub async fn set_recording(self: &Arc<Self>, on: bool) {
        if on {
            if self.recording.swap(true, Ordering::SeqCst) {
                return;
            }
            let session = generate_session_id(self.clock.now_millis());
            info!(session_id = %session, device_id = %self.device_id(), "Upload recording started");
            *self.session_id.write() = Some(session);
            *self.last_upload.lock() = Instant::now();

            let weak = Arc::downgrade(self);
            self.ticker.start_with_wake(self.wake.clone(), move || {
                let uploader = weak.upgrade();
                async move {
                    if let Some(uploader) = uploader {
                        uploader.check_and_upload().await;
                    }
                }
            });
        } else {
            if !self.recording.swap(false, Ordering::SeqCst) {
                return;
            }
            self.ticker.stop();
            info!("Upload recording stopped, uploading remaining samples");
            self.upload_batch().await;
        }
    }

    /// Upload if a full batch is pending or the interval has elapsed.
    pub async fn check_and_upload(&self) {
        if !self.is_recording() {
            return;
        }
        let size_due = self.pending.lock().len() >= self.batch_size;
        let time_due = self.last_upload.lock().elapsed() >= self.upload_interval;
        if size_due || time_due {
            self.upload_batch().await;
        }
    }

    /// Drain the queue and submit every sample. Returns the stats after the
    /// batch; an empty queue uploads nothing.
    #[instrument(level = "debug", skip(self))]
    pub async fn upload_batch(&self) -> UploadStats {
        let _batch = self.batch_lock.lock().await;

        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return self.stats();
        }
        *self.last_upload.lock() = Instant::now();

        let device_id = self.device_id();
        let session_id = self.session_id().unwrap_or_default();
        let size = batch.len();
        let started = std::time::Instant::now();

        debug!(size, session_id = %session_id, "Uploading batch");

        let results: Vec<Result<(), UploadError>> = stream::iter(batch)
            .map(|sample| {
                let store = self.store.clone();
                let document = ImuDocument::new(&sample, &device_id, &session_id);
                async move { store.put(&document).await }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut succeeded = 0u64;
        let mut failed = 0u64;
        for result in results {
            match result {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    failed += 1;
                    debug!(error = %e, "Document upload failed");
                }
            }
        }

        metrics::counter!("upload.samples.succeeded").increment(succeeded);
        metrics::counter!("upload.samples.failed").increment(failed);
        metrics::histogram!("upload.batch.duration_seconds").record(started.elapsed().as_secs_f64());

        {
            let mut stats = self.stats.write();
            stats.uploaded += succeeded;
            stats.failed += failed;
            stats.batches += 1;
        }

        if failed > 0 {
            warn!(size, succeeded, failed, "Batch uploaded with failures");
        } else {
            debug!(size, "Batch uploaded");
        }

        let stats = self.stats();
        let _ = self.stats_tx.send(stats.clone());
        stats
    }

    /// Stop the check, upload what is left and clear the queue.
    pub async fn cleanup(self: &Arc<Self>) {
        self.ticker.stop();
        self.set_recording(false).await;
        self.pending.lock().clear();
    }
}

/// `session_<ms>_<8 hex chars>`
pub fn generate_session_id(now_ms: i64) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("session_{}_{}", now_ms, &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn sample(seq: u32) -> Sample {
        Sample {
            device_timestamp: seq,
            accel_x: 0.0,
            accel_y: 0.0,
            accel_z: 1.0,
            gyro_x: 0.0,
            gyro_y: 0.0,
            gyro_z: 0.0,
            voltage: 3.7,
            received_at: 1_700_000_000_000 + seq as i64,
            calibrated: true,
        }
    }

    fn counting_store(count: Arc<AtomicUsize>) -> MockDocumentStore {
        let mut store = MockDocumentStore::new();
        store.expect_put().returning(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        store
    }

    fn uploader(store: MockDocumentStore) -> Arc<Uploader> {
        Arc::new(Uploader::new(
            &UploadConfig::default(),
            Arc::new(store),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        ))
    }

    #[test]
    fn test_session_id_format() {
        let id = generate_session_id(1234);
        let suffix = id.strip_prefix("session_1234_").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_document_field_names() {
        let doc = ImuDocument::new(&sample(9), "dev", "session_1_abcdef01");
        let json = serde_json::to_value(&doc).unwrap();
        for key in [
            "device_id",
            "session_id",
            "timestamp",
            "accelX",
            "accelY",
            "accelZ",
            "gyroX",
            "gyroY",
            "gyroZ",
            "voltage",
            "received_at",
            "calibrated",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert!(json.get("uploaded_at").is_none());
        assert_eq!(json["timestamp"], 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_samples_when_not_recording() {
        let uploader = uploader(MockDocumentStore::new());
        uploader.add(&sample(1));
        assert_eq!(uploader.stats().pending, 0);
        assert!(uploader.session_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_uploads_before_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let uploader = uploader(counting_store(count.clone()));
        uploader.set_recording(true).await;

        for seq in 0..BATCH_SIZE as u32 {
            uploader.add(&sample(seq));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(count.load(Ordering::SeqCst), BATCH_SIZE);
        let stats = uploader.stats();
        assert_eq!(stats.uploaded, BATCH_SIZE as u64);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.batches, 1);
        uploader.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_trigger_uploads_single_sample() {
        let count = Arc::new(AtomicUsize::new(0));
        let uploader = uploader(counting_store(count.clone()));
        uploader.set_recording(true).await;
        uploader.add(&sample(1));

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(uploader.stats().pending, 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(uploader.stats().pending, 0);
        uploader.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_off_drains_and_counts_failures() {
        let mut store = MockDocumentStore::new();
        store.expect_put().returning(|doc| {
            if doc.timestamp % 2 == 0 {
                Ok(())
            } else {
                Err(UploadError::Store("rejected".to_string()))
            }
        });
        let uploader = uploader(store);
        let mut rx = uploader.subscribe();

        uploader.set_recording(true).await;
        let session = uploader.session_id().unwrap();
        assert!(session.starts_with("session_1700000000000_"));

        for seq in 0..10 {
            uploader.add(&sample(seq));
        }
        uploader.set_recording(false).await;

        let stats = uploader.stats();
        assert_eq!(stats.uploaded, 5);
        assert_eq!(stats.failed, 5);
        assert_eq!(stats.pending, 0);
        assert_eq!(rx.try_recv().unwrap(), stats);

        // Not recording any more
        uploader.add(&sample(11));
        assert_eq!(uploader.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_documents_carry_session_and_device() {
        let seen = Arc::new(Mutex::new(Vec::<ImuDocument>::new()));
        let mut store = MockDocumentStore::new();
        let s = seen.clone();
        store.expect_put().returning(move |doc| {
            s.lock().push(doc.clone());
            Ok(())
        });
        let uploader = uploader(store);
        uploader.set_device_id("Racket_42");

        uploader.set_recording(true).await;
        uploader.add(&sample(3));
        uploader.set_recording(false).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].device_id, "Racket_42");
        assert_eq!(Some(seen[0].session_id.clone()), uploader.session_id());
        assert!(seen[0].calibrated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_session_per_recording() {
        let uploader = uploader(MockDocumentStore::new());
        uploader.set_recording(true).await;
        let first = uploader.session_id();
        uploader.set_recording(false).await;
        uploader.set_recording(true).await;
        assert_ne!(first, uploader.session_id());
        uploader.cleanup().await;
    }
}
