//! Time-partitioned CSV log of calibrated samples.
//!
//! Each partition covers one interval of wall-clock time and is named after
//! the boundary that closes it, so `10:08:13` lands in the `10:10:00` file.
//!
//! `add` only queues the sample. The flush tick drains the queue in arrival
//! order, rotating to a new partition whenever a sample's boundary differs
//! from the open one, so a partition never holds samples from another
//! interval.

use crate::clock::Clock;
use crate::config::{LogConfig, PartitionTimezone};
use crate::sample::Sample;
use crate::ticker::Ticker;
use chrono::{DateTime, Local, Offset, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Partition length in minutes
pub const INTERVAL_MINUTES: u32 = 10;

/// Interval between buffered flushes
pub const FLUSH_INTERVAL_MS: u64 = 2000;

/// Samples retained for retry after a failed write
pub const MAX_RETAINED_ON_FAILURE: usize = 1000;

/// Subfolder of the data directory holding the partitions
pub const DIRECTORY_NAME: &str = "IMU_Data";

pub const FILE_PREFIX: &str = "imu_data_";
pub const FILE_EXTENSION: &str = "csv";
pub const CSV_COLUMNS: [&str; 8] = [
    "timestamp",
    "receivedAt",
    "accelX",
    "accelY",
    "accelZ",
    "gyroX",
    "gyroY",
    "gyroZ",
];

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Errors raised by the log writer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV encoding failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("Timestamp {0} is out of range")]
    InvalidTimestamp(i64),
}

impl StorageError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
        move |source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Notifications published by the log writer.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent {
    PartitionOpened { path: PathBuf, boundary: i64 },
    PartitionClosed { path: PathBuf, boundary: i64 },
    Error { message: String },
}

/// Log writer counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogStats {
    pub written: u64,
    pub failed: u64,
    pub pending: usize,
}

/// The open partition.
struct LogFile {
    start_boundary: i64,
    path: PathBuf,
    file: File,
    /// Bytes known to be complete on disk
    len: u64,
}

/// Align a wall-clock timestamp to the boundary of its partition.
///
/// A timestamp exactly on a boundary maps to itself, anything else to the
/// next boundary. Minutes are evaluated in `tz`.
pub fn align_to_interval(ms: i64, interval_minutes: u32, tz: PartitionTimezone) -> i64 {
    let interval_ms = interval_minutes.max(1) as i64 * 60_000;
    let offset_ms = utc_offset_ms(ms, tz);

    let local = ms + offset_ms;
    let rem = local.rem_euclid(interval_ms);
    let aligned = if rem == 0 {
        local
    } else {
        local - rem + interval_ms
    };
    aligned - offset_ms
}

fn utc_offset_ms(ms: i64, tz: PartitionTimezone) -> i64 {
    match tz {
        PartitionTimezone::Utc => 0,
        PartitionTimezone::Local => DateTime::from_timestamp_millis(ms)
            .map(|utc| {
                Local
                    .offset_from_utc_datetime(&utc.naive_utc())
                    .fix()
                    .local_minus_utc() as i64
                    * 1000
            })
            .unwrap_or(0),
    }
}

/// File name of the partition closing at `boundary`.
pub fn partition_file_name(boundary: i64, tz: PartitionTimezone) -> Result<String, StorageError> {
    let utc: DateTime<Utc> =
        DateTime::from_timestamp_millis(boundary).ok_or(StorageError::InvalidTimestamp(boundary))?;
    let stamp = match tz {
        PartitionTimezone::Utc => utc.format("%Y%m%d_%H%M%S").to_string(),
        PartitionTimezone::Local => utc.with_timezone(&Local).format("%Y%m%d_%H%M%S").to_string(),
    };
    Ok(format!("{FILE_PREFIX}{stamp}.{FILE_EXTENSION}"))
}

/// Fields of one sample's record, floats at six decimals.
pub fn record_fields(sample: &Sample) -> [String; 8] {
    [
        sample.device_timestamp.to_string(),
        sample.received_at.to_string(),
        format!("{:.6}", sample.accel_x),
        format!("{:.6}", sample.accel_y),
        format!("{:.6}", sample.accel_z),
        format!("{:.6}", sample.gyro_x),
        format!("{:.6}", sample.gyro_y),
        format!("{:.6}", sample.gyro_z),
    ]
}

/// Encode samples as CSV rows, optionally preceded by the header row.
pub fn encode_records(samples: &[Sample], header: bool) -> Result<Vec<u8>, StorageError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(samples.len() * 96));
    if header {
        writer.write_record(CSV_COLUMNS)?;
    }
    for sample in samples {
        writer.write_record(record_fields(sample))?;
    }
    writer
        .into_inner()
        .map_err(|e| StorageError::Csv(e.into_error().into()))
}

/// Partitioned CSV log writer.
pub struct LogWriter {
    directory: PathBuf,
    interval_minutes: u32,
    timezone: PartitionTimezone,
    max_retained: usize,
    clock: Arc<dyn Clock>,
    recording: AtomicBool,
    pending: Mutex<VecDeque<Sample>>,
    file: tokio::sync::Mutex<Option<LogFile>>,
    current_path: Mutex<Option<PathBuf>>,
    stats: RwLock<LogStats>,
    ticker: Ticker,
    events: broadcast::Sender<StorageEvent>,
}

impl LogWriter {
    pub fn new(config: &LogConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            directory: config.directory(),
            interval_minutes: config.interval_minutes,
            timezone: config.timezone,
            max_retained: config.max_retained_on_failure,
            clock,
            recording: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            file: tokio::sync::Mutex::new(None),
            current_path: Mutex::new(None),
            stats: RwLock::new(LogStats::default()),
            ticker: Ticker::new("log-flush", config.flush_interval()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Path of the open partition, if any.
    pub fn current_file_path(&self) -> Option<PathBuf> {
        self.current_path.lock().clone()
    }

    pub fn stats(&self) -> LogStats {
        let mut stats = self.stats.read().clone();
        stats.pending = self.pending.lock().len();
        stats
    }

    /// Boundary of the partition a timestamp belongs to.
    pub fn boundary_for(&self, ms: i64) -> i64 {
        align_to_interval(ms, self.interval_minutes, self.timezone)
    }

    /// Queue a sample. Ignored unless recording; never touches the disk.
    pub fn add(&self, sample: &Sample) {
        if !self.is_recording() {
            return;
        }
        self.pending.lock().push_back(*sample);
    }

    /// Turn recording on or off.
    ///
    /// Turning on opens the partition for the current time and starts the
    /// flush tick; if the partition cannot be opened recording stays off.
    /// Turning off writes everything pending and closes the partition before
    /// returning.
    pub async fn set_recording(self: &Arc<Self>, on: bool) -> Result<(), StorageError> {
        if on {
            self.enable().await
        } else {
            self.disable().await
        }
    }

    async fn enable(self: &Arc<Self>) -> Result<(), StorageError> {
        if self.is_recording() {
            return Ok(());
        }

        let boundary = self.boundary_for(self.clock.now_millis());
        {
            let mut file = self.file.lock().await;
            let same = file.as_ref().is_some_and(|f| f.start_boundary == boundary);
            if !same {
                if let Some(old) = file.take() {
                    self.close_partition(old).await;
                }
                match self.open_partition(boundary).await {
                    Ok(opened) => *file = Some(opened),
                    Err(e) => {
                        error!(error = %e, "Failed to open log partition, recording stays off");
                        self.emit(StorageEvent::Error {
                            message: e.to_string(),
                        });
                        return Err(e);
                    }
                }
            }
        }

        self.recording.store(true, Ordering::SeqCst);

        let weak = Arc::downgrade(self);
        self.ticker.start(move || {
            let writer = weak.upgrade();
            async move {
                if let Some(writer) = writer {
                    if let Err(e) = writer.flush().await {
                        warn!(error = %e, "Log flush failed");
                    }
                }
            }
        });

        info!(directory = %self.directory.display(), boundary, "Log recording started");
        Ok(())
    }

    async fn disable(&self) -> Result<(), StorageError> {
        if !self.recording.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.ticker.stop();

        let result = self.flush().await;

        let mut file = self.file.lock().await;
        if let Some(open) = file.take() {
            self.close_partition(open).await;
        }

        let stats = self.stats();
        info!(
            written = stats.written,
            failed = stats.failed,
            pending = stats.pending,
            "Log recording stopped"
        );
        result.map(|_| ())
    }

    /// Write every pending sample to its partition. Returns the number of
    /// samples written.
    #[instrument(level = "debug", skip(self))]
    pub async fn flush(&self) -> Result<usize, StorageError> {
        let mut file = self.file.lock().await;

        let batch: Vec<Sample> = self.pending.lock().drain(..).collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let mut start = 0;
        while start < batch.len() {
            let boundary = self.boundary_for(batch[start].received_at);
            let end = batch[start..]
                .iter()
                .position(|s| self.boundary_for(s.received_at) != boundary)
                .map_or(batch.len(), |offset| start + offset);

            let needs_rotation = file.as_ref().map_or(true, |f| f.start_boundary != boundary);
            if needs_rotation {
                if let Some(old) = file.take() {
                    self.close_partition(old).await;
                }
                match self.open_partition(boundary).await {
                    Ok(opened) => *file = Some(opened),
                    Err(e) => {
                        let dropped = batch.len() - start;
                        self.recording.store(false, Ordering::SeqCst);
                        self.ticker.stop();
                        self.stats.write().failed += dropped as u64;
                        metrics::counter!("log.write.failures").increment(1);
                        error!(
                            error = %e,
                            dropped,
                            "Failed to rotate log partition, recording disabled"
                        );
                        self.emit(StorageEvent::Error {
                            message: e.to_string(),
                        });
                        return Err(e);
                    }
                }
            }

            let Some(open) = file.as_mut() else {
                break;
            };
            if let Err(e) = Self::write_group(open, &batch[start..end]).await {
                self.requeue(&batch[start..]);
                metrics::counter!("log.write.failures").increment(1);
                warn!(error = %e, retry = batch.len() - start, "Log write failed, samples requeued");
                self.emit(StorageEvent::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }

            let count = end - start;
            written += count;
            self.stats.write().written += count as u64;
            metrics::counter!("log.samples.written").increment(count as u64);
            start = end;
        }

        debug!(written, "Log batch written");
        Ok(written)
    }

    /// Append a group to the open partition. A failed write is rolled back
    /// to the last complete record so the retry does not duplicate lines.
    async fn write_group(open: &mut LogFile, samples: &[Sample]) -> Result<(), StorageError> {
        let buf = encode_records(samples, false)?;
        if let Err(e) = append(&mut open.file, &buf).await {
            if let Err(rollback) = Self::truncate_to_committed(open).await {
                warn!(
                    path = %open.path.display(),
                    error = %rollback,
                    "Failed to roll back partial log write, retry may duplicate records"
                );
            }
            return Err(StorageError::Io {
                path: open.path.clone(),
                source: e,
            });
        }
        open.len += buf.len() as u64;
        Ok(())
    }

    async fn truncate_to_committed(open: &LogFile) -> std::io::Result<()> {
        open.file.set_len(open.len).await
    }

    /// Put samples back at the front of the queue, keeping the most recent
    /// `max_retained`.
    fn requeue(&self, samples: &[Sample]) {
        let mut pending = self.pending.lock();
        let mut retained: VecDeque<Sample> = samples.iter().copied().collect();
        retained.extend(pending.drain(..));

        let overflow = retained.len().saturating_sub(self.max_retained);
        if overflow > 0 {
            retained.drain(..overflow);
            self.stats.write().failed += overflow as u64;
        }
        *pending = retained;
    }

    #[instrument(level = "debug", skip(self))]
    async fn open_partition(&self, boundary: i64) -> Result<LogFile, StorageError> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(StorageError::io(&self.directory))?;

        let path = self
            .directory
            .join(partition_file_name(boundary, self.timezone)?);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(StorageError::io(&path))?;

        let mut len = file
            .metadata()
            .await
            .map_err(StorageError::io(&path))?
            .len();
        if len == 0 {
            let header = encode_records(&[], true)?;
            append(&mut file, &header)
                .await
                .map_err(StorageError::io(&path))?;
            len = header.len() as u64;
        }

        info!(path = %path.display(), boundary, "Log partition opened");
        *self.current_path.lock() = Some(path.clone());
        self.emit(StorageEvent::PartitionOpened {
            path: path.clone(),
            boundary,
        });

        Ok(LogFile {
            start_boundary: boundary,
            path,
            file,
            len,
        })
    }

    async fn close_partition(&self, mut open: LogFile) {
        if let Err(source) = sync(&mut open.file).await {
            let e = StorageError::Io {
                path: open.path.clone(),
                source,
            };
            metrics::counter!("log.write.failures").increment(1);
            error!(error = %e, "Failed to close log partition");
            self.emit(StorageEvent::Error {
                message: e.to_string(),
            });
        }

        debug!(path = %open.path.display(), "Log partition closed");
        *self.current_path.lock() = None;
        self.emit(StorageEvent::PartitionClosed {
            path: open.path,
            boundary: open.start_boundary,
        });
    }

    /// Stop the tick, turn recording off and drop whatever is still queued.
    pub async fn cleanup(self: &Arc<Self>) {
        self.ticker.stop();
        if let Err(e) = self.set_recording(false).await {
            warn!(error = %e, "Final log flush failed");
        }
        self.pending.lock().clear();
    }

    fn emit(&self, event: StorageEvent) {
        let _ = self.events.send(event);
    }
}

async fn append(file: &mut File, buf: &[u8]) -> std::io::Result<()> {
    file.write_all(buf).await?;
    file.flush().await
}

async fn sync(file: &mut File) -> std::io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}
