//! The single entry point the transport pushes frames into.
//!
//! Each frame is decoded, range checked, optionally fed to a running
//! calibration, calibrated and then handed to the chart feed, the log
//! writer and the uploader in that order. None of these steps block on I/O.

use crate::calibration::CalibrationEngine;
use crate::chart_feed::ChartFeed;
use crate::clock::Clock;
use crate::codec::{self, DecodeError};
use crate::config::PipelineConfig;
use crate::log_writer::{LogWriter, StorageError};
use crate::profile_store::ProfileStore;
use crate::sample::Sample;
use crate::uploader::{DocumentStore, Uploader};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

const SAMPLE_CHANNEL_CAPACITY: usize = 256;

/// Ingestion counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub frames_received: u64,
    pub rejected_format: u64,
    pub rejected_range: u64,
    pub samples_routed: u64,
    pub calibration_samples: u64,
}

/// Routes decoded samples to calibration and the three consumers.
pub struct Pipeline {
    clock: Arc<dyn Clock>,
    calibration: Arc<CalibrationEngine>,
    chart: Arc<ChartFeed>,
    log: Arc<LogWriter>,
    uploader: Arc<Uploader>,
    recording: AtomicBool,
    stats: RwLock<PipelineStats>,
    samples: broadcast::Sender<Sample>,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        profiles: Arc<dyn ProfileStore>,
        documents: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let calibration = Arc::new(CalibrationEngine::new(
            &config.calibration,
            profiles,
            clock.clone(),
        ));
        let chart = Arc::new(ChartFeed::new(&config.chart));
        let log = Arc::new(LogWriter::new(&config.log, clock.clone()));
        let uploader = Arc::new(Uploader::new(&config.upload, documents, clock.clone()));
        let (samples, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);

        Self {
            clock,
            calibration,
            chart,
            log,
            uploader,
            recording: AtomicBool::new(false),
            stats: RwLock::new(PipelineStats::default()),
            samples,
        }
    }

    pub fn calibration(&self) -> &Arc<CalibrationEngine> {
        &self.calibration
    }

    pub fn chart(&self) -> &Arc<ChartFeed> {
        &self.chart
    }

    pub fn log_writer(&self) -> &Arc<LogWriter> {
        &self.log
    }

    pub fn uploader(&self) -> &Arc<Uploader> {
        &self.uploader
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.read().clone()
    }

    /// Every routed (calibrated) sample. Slow subscribers lag and skip.
    pub fn subscribe_samples(&self) -> broadcast::Receiver<Sample> {
        self.samples.subscribe()
    }

    /// False once the log writer has turned itself off after a failed
    /// partition rotation.
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst) && self.log.is_recording()
    }

    /// Ingest one raw frame. Returns the routed sample, or `None` if the
    /// frame was dropped.
    pub fn on_frame(&self, raw: &[u8]) -> Option<Sample> {
        metrics::counter!("pipeline.frames.received").increment(1);
        self.stats.write().frames_received += 1;

        let sample = match codec::decode_at(raw, self.clock.now_millis()) {
            Ok(sample) => sample,
            Err(DecodeError::InvalidLength { expected, actual }) => {
                metrics::counter!("pipeline.frames.rejected", "reason" => "format").increment(1);
                self.stats.write().rejected_format += 1;
                debug!(expected, actual, "Dropping malformed frame");
                return None;
            }
        };

        self.on_sample(sample)
    }

    /// Route an already decoded sample.
    pub fn on_sample(&self, raw: Sample) -> Option<Sample> {
        if let Err(e) = codec::check_ranges(&raw) {
            metrics::counter!("pipeline.frames.rejected", "reason" => "range").increment(1);
            self.stats.write().rejected_range += 1;
            debug!(field = e.field, value = e.value, "Dropping out-of-range sample");
            return None;
        }

        if self.calibration.is_calibrating() {
            self.calibration.add_sample(&raw);
            self.stats.write().calibration_samples += 1;
        }

        let sample = self.calibration.apply(&raw);
        self.chart.add(&sample);
        self.log.add(&sample);
        self.uploader.add(&sample);
        let _ = self.samples.send(sample);

        self.stats.write().samples_routed += 1;
        trace!(device_timestamp = sample.device_timestamp, "Sample routed");
        Some(sample)
    }

    /// Start the display tick.
    pub fn start(&self) {
        self.chart.start();
        info!("Pipeline started");
    }

    /// Turn recording on or off for both the log writer and the uploader.
    ///
    /// If the log partition cannot be opened, recording stays off for both.
    /// Turning off returns once the final log flush and the final upload
    /// attempt have both completed.
    pub async fn set_recording(&self, on: bool) -> Result<(), StorageError> {
        if on {
            self.log.set_recording(true).await?;
            self.uploader.set_recording(true).await;
            self.recording.store(true, Ordering::SeqCst);
            info!(session_id = ?self.uploader.session_id(), "Recording started");
            Ok(())
        } else {
            self.recording.store(false, Ordering::SeqCst);
            let (log_result, ()) = tokio::join!(
                self.log.set_recording(false),
                self.uploader.set_recording(false)
            );
            if let Err(e) = &log_result {
                warn!(error = %e, "Final log flush failed");
            }
            info!("Recording stopped");
            log_result
        }
    }

    /// Stop every tick, end recording and release the chart buffers.
    pub async fn shutdown(&self) {
        if let Err(e) = self.set_recording(false).await {
            warn!(error = %e, "Recording did not stop cleanly");
        }
        self.calibration.cancel();
        self.log.cleanup().await;
        self.uploader.cleanup().await;
        self.chart.release();
        info!("Pipeline shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationEvent, REQUIRED_SAMPLES};
    use crate::clock::ManualClock;
    use crate::config::PartitionTimezone;
    use crate::log_writer::CSV_COLUMNS;
    use crate::profile_store::MemoryStore;
    use crate::uploader::MockDocumentStore;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn at(h: u32, m: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(2025, 1, 24, h, m, s)
            .unwrap()
            .timestamp_millis()
    }

    fn frame(seq: u32, accel: [f32; 3], gyro: [f32; 3]) -> [u8; codec::FRAME_LEN] {
        codec::encode(&Sample {
            device_timestamp: seq,
            accel_x: accel[0],
            accel_y: accel[1],
            accel_z: accel[2],
            gyro_x: gyro[0],
            gyro_y: gyro[1],
            gyro_z: gyro[2],
            voltage: 3.85,
            received_at: 0,
            calibrated: false,
        })
    }

    fn pipeline(dir: &TempDir, clock: Arc<ManualClock>, uploads: Arc<AtomicUsize>) -> Pipeline {
        let mut config = PipelineConfig::default();
        config.log.data_dir = dir.path().to_path_buf();
        config.log.timezone = PartitionTimezone::Utc;

        let mut documents = MockDocumentStore::new();
        documents.expect_put().returning(move |_| {
            uploads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        Pipeline::new(
            &config,
            Arc::new(MemoryStore::new()),
            Arc::new(documents),
            clock,
        )
    }

    fn line_count(path: &std::path::Path) -> (usize, usize) {
        let content = std::fs::read_to_string(path).unwrap();
        let header = CSV_COLUMNS.join(",");
        let headers = content.lines().filter(|l| *l == header).count();
        (headers, content.lines().count() - headers)
    }

    #[tokio::test]
    async fn test_recording_across_boundary() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(at(10, 7, 0)));
        let uploads = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline(&dir, clock.clone(), uploads.clone());

        assert_ok!(pipeline.set_recording(true).await);
        assert!(pipeline.is_recording());

        let mut routed = 0;
        let mut t = at(10, 7, 0);
        let mut seq = 0;
        while t <= at(10, 11, 0) {
            clock.set(t);
            assert!(pipeline
                .on_frame(&frame(seq, [0.0, 0.0, 1.0], [0.0; 3]))
                .is_some());
            routed += 1;
            seq += 1;
            t += 1000;
        }

        assert_ok!(pipeline.set_recording(false).await);

        let log_dir = dir.path().join("IMU_Data");
        let mut files: Vec<String> = std::fs::read_dir(&log_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(
            files,
            vec![
                "imu_data_20250124_101000.csv".to_string(),
                "imu_data_20250124_102000.csv".to_string()
            ]
        );

        // 10:07:00 through 10:10:00 inclusive
        let first = line_count(&log_dir.join(&files[0]));
        let second = line_count(&log_dir.join(&files[1]));
        assert_eq!(first, (1, 181));
        assert_eq!(second, (1, 60));
        assert_eq!(first.1 + second.1, routed);

        assert_eq!(uploads.load(Ordering::SeqCst), routed);
        assert_eq!(pipeline.uploader().stats().pending, 0);
        assert_eq!(pipeline.log_writer().stats().pending, 0);
        assert_eq!(pipeline.stats().samples_routed, routed as u64);
    }

    #[tokio::test]
    async fn test_rejected_frames_are_counted() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(
            &dir,
            Arc::new(ManualClock::new(at(10, 0, 0))),
            Arc::new(AtomicUsize::new(0)),
        );

        let mut routed = pipeline.subscribe_samples();

        assert!(pipeline.on_frame(&[0u8; 29]).is_none());
        assert!(pipeline
            .on_frame(&frame(1, [16.5, 0.0, 1.0], [0.0; 3]))
            .is_none());
        assert!(pipeline
            .on_frame(&frame(2, [0.0, 0.0, 1.0], [0.0, 2500.0, 0.0]))
            .is_none());
        assert!(pipeline
            .on_frame(&frame(3, [0.0, 0.0, 1.0], [0.0; 3]))
            .is_some());

        let stats = pipeline.stats();
        assert_eq!(stats.frames_received, 4);
        assert_eq!(stats.rejected_format, 1);
        assert_eq!(stats.rejected_range, 2);
        assert_eq!(stats.samples_routed, 1);
        assert_eq!(routed.try_recv().unwrap().device_timestamp, 3);
        assert!(routed.try_recv().is_err());
        // Rejected samples never reach the chart
        pipeline.chart().tick();
        assert_eq!(pipeline.chart().snapshot()[0][0].value, 0.0);
    }

    #[tokio::test]
    async fn test_calibration_through_frames() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(at(9, 0, 0)));
        let pipeline = pipeline(&dir, clock, Arc::new(AtomicUsize::new(0)));
        let mut events = pipeline.calibration().subscribe();

        pipeline.calibration().start();
        let resting = frame(0, [0.02, -0.01, 1.03], [0.5, -0.25, 0.125]);
        for _ in 0..REQUIRED_SAMPLES - 1 {
            assert!(!pipeline.on_frame(&resting).unwrap().calibrated);
        }
        // The completing sample is already calibrated with the new profile
        assert!(pipeline.on_frame(&resting).unwrap().calibrated);

        assert!(pipeline.calibration().has_calibration());
        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            completed |= matches!(event, CalibrationEvent::Completed(_));
        }
        assert!(completed);

        let sample = pipeline.on_frame(&resting).unwrap();
        assert!(sample.calibrated);
        assert!(sample.accel_x.abs() < 1e-5);
        assert!(sample.accel_y.abs() < 1e-5);
        assert!((sample.accel_z - 1.0).abs() < 1e-5);
        assert!(sample.gyro_x.abs() < 1e-5);
        assert_eq!(pipeline.stats().calibration_samples, REQUIRED_SAMPLES as u64);
    }

    #[tokio::test]
    async fn test_recording_stays_off_when_log_cannot_open() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("IMU_Data"), b"").unwrap();
        let pipeline = pipeline(
            &dir,
            Arc::new(ManualClock::new(at(10, 0, 0))),
            Arc::new(AtomicUsize::new(0)),
        );

        assert_err!(pipeline.set_recording(true).await);
        assert!(!pipeline.is_recording());
        assert!(!pipeline.uploader().is_recording());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_recording_reported_off_after_rotation_failure() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(at(10, 7, 0)));
        let pipeline = pipeline(&dir, clock.clone(), Arc::new(AtomicUsize::new(0)));

        assert_ok!(pipeline.set_recording(true).await);
        std::fs::create_dir_all(dir.path().join("IMU_Data/imu_data_20250124_102000.csv"))
            .unwrap();

        clock.set(at(10, 12, 0));
        assert!(pipeline
            .on_frame(&frame(1, [0.0, 0.0, 1.0], [0.0; 3]))
            .is_some());
        assert_err!(pipeline.log_writer().flush().await);

        assert!(!pipeline.log_writer().is_recording());
        assert!(!pipeline.is_recording());
        pipeline.shutdown().await;
    }
}
