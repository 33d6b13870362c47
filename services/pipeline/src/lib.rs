//! IMU Pipeline - real-time sample pipeline for a wearable inertial sensor
//!
//! This library turns raw 30-byte sensor frames into calibrated samples and
//! fans them out to three consumers with different temporal contracts:
//!
//! - A bounded, decimated window for the live chart
//! - A durable CSV log partitioned into 10-minute files
//! - A batched, best-effort upload queue to a remote document store
//!
//! # Example
//!
//! ```rust,no_run
//! use imu_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load()?;
//!     let documents = Arc::new(S3DocumentStore::new(&config.upload.s3).await?);
//!     let profiles = Arc::new(JsonFileStore::new(&config.calibration.store_dir));
//!
//!     let pipeline = Pipeline::new(&config, profiles, documents, Arc::new(SystemClock));
//!     pipeline.start();
//!     pipeline.set_recording(true).await?;
//!
//!     // Frames from the transport
//!     pipeline.on_frame(&[0u8; FRAME_LEN]);
//!
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod calibration;
pub mod chart_feed;
pub mod clock;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod log_writer;
pub mod profile_store;
pub mod s3_store;
pub mod sample;
pub mod ticker;
pub mod transport;
pub mod uploader;

// Re-export main types
pub use calibration::{CalibrationEngine, CalibrationError, CalibrationEvent, CalibrationProfile};
pub use chart_feed::{ChartFeed, ChartPoint, ChartUpdate};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{decode, decode_at, encode, validate, DecodeError, RangeError, FRAME_LEN};
pub use config::{ConfigValidationError, PartitionTimezone, PipelineConfig};
pub use coordinator::{Pipeline, PipelineStats};
pub use log_writer::{align_to_interval, LogStats, LogWriter, StorageError, StorageEvent};
pub use profile_store::{JsonFileStore, MemoryStore, ProfileStore, ProfileStoreError};
pub use s3_store::S3DocumentStore;
pub use sample::Sample;
pub use transport::{TransportError, UdpFrameSource};
pub use uploader::{DocumentStore, ImuDocument, UploadError, UploadStats, Uploader};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::calibration::{CalibrationEvent, CalibrationProfile};
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::codec::FRAME_LEN;
    pub use crate::config::PipelineConfig;
    pub use crate::coordinator::Pipeline;
    pub use crate::profile_store::{JsonFileStore, ProfileStore};
    pub use crate::s3_store::S3DocumentStore;
    pub use crate::sample::Sample;
    pub use crate::uploader::{DocumentStore, UploadStats};
    pub use async_trait::async_trait;
}
