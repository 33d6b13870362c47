//! One-shot statistical calibration of the sensor's resting offsets.
//!
//! A run collects a fixed number of raw samples with the sensor lying flat,
//! takes the per-axis mean and stores it as the offset profile. Gravity is
//! removed from the Z axis so a level sensor reads exactly 1 g after `apply`.

use crate::clock::Clock;
use crate::config::CalibrationConfig;
use crate::profile_store::ProfileStore;
use crate::sample::Sample;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Samples collected per run (about 4 s at 50 Hz)
pub const REQUIRED_SAMPLES: usize = 200;

/// A progress event is emitted every this many samples
pub const PROGRESS_EVERY: usize = 10;

/// Key of the persisted calibration record
pub const CALIBRATION_KEY: &str = "calibration_data";

/// Standard gravity in g, removed from the Z axis offset
const GRAVITY_G: f64 = 1.0;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Per-axis offsets subtracted from raw samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationProfile {
    pub accel_x_offset: f32,
    pub accel_y_offset: f32,
    pub accel_z_offset: f32,
    pub gyro_x_offset: f32,
    pub gyro_y_offset: f32,
    pub gyro_z_offset: f32,
    /// Wall-clock milliseconds the profile was computed at
    #[serde(alias = "calibrationTime")]
    pub calibrated_at: i64,
}

impl CalibrationProfile {
    pub fn is_valid(&self) -> bool {
        self.calibrated_at > 0
    }
}

/// Reasons a calibration run did not produce a profile.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Insufficient data: collected {collected} of {required} samples")]
    InsufficientData { collected: usize, required: usize },

    #[error("Non-finite mean on {axis}")]
    NonFiniteMean { axis: &'static str },

    #[error("Failed to persist calibration: {0}")]
    Persistence(String),
}

/// Notifications published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationEvent {
    Started { required: usize },
    Progress { count: usize, required: usize },
    Completed(CalibrationProfile),
    Failed(CalibrationError),
    Cancelled,
}

#[derive(Default)]
struct EngineState {
    active: Option<CalibrationProfile>,
    session: Option<Vec<Sample>>,
}

/// Collects samples, computes offsets and applies the active profile.
pub struct CalibrationEngine {
    required: usize,
    progress_every: usize,
    key: String,
    store: Arc<dyn ProfileStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<EngineState>,
    events: broadcast::Sender<CalibrationEvent>,
}

impl CalibrationEngine {
    /// Create an engine and load the persisted profile, if any.
    pub fn new(
        config: &CalibrationConfig,
        store: Arc<dyn ProfileStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let active = match store.load(&config.store_key) {
            Ok(Some(profile)) if profile.is_valid() => {
                info!(
                    calibrated_at = profile.calibrated_at,
                    "Loaded calibration profile"
                );
                Some(profile)
            }
            Ok(Some(_)) => {
                debug!("Stored calibration profile is not valid, ignoring");
                None
            }
            Ok(None) => {
                debug!("No stored calibration profile");
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to load calibration profile");
                None
            }
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            required: config.required_samples.max(1),
            progress_every: config.progress_every.max(1),
            key: config.store_key.clone(),
            store,
            clock,
            state: Mutex::new(EngineState {
                active,
                session: None,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CalibrationEvent> {
        self.events.subscribe()
    }

    pub fn required_samples(&self) -> usize {
        self.required
    }

    /// Begin collecting. Does nothing if a run is already in progress.
    pub fn start(&self) {
        {
            let mut state = self.state.lock();
            if state.session.is_some() {
                warn!("Calibration already in progress");
                return;
            }
            state.session = Some(Vec::with_capacity(self.required));
        }

        info!(required = self.required, "Calibration started");
        self.emit(CalibrationEvent::Started {
            required: self.required,
        });
    }

    /// Feed one raw sample into the running session.
    pub fn add_sample(&self, sample: &Sample) {
        let mut progress = None;
        let finished = {
            let mut state = self.state.lock();
            let Some(session) = state.session.as_mut() else {
                return;
            };
            session.push(*sample);
            let count = session.len();

            if count % self.progress_every == 0 {
                progress = Some(count);
            }
            if count >= self.required {
                state.session.take()
            } else {
                None
            }
        };

        if let Some(count) = progress {
            self.emit(CalibrationEvent::Progress {
                count,
                required: self.required,
            });
        }
        if let Some(samples) = finished {
            self.complete(samples);
        }
    }

    /// End the running session now with whatever was collected.
    pub fn finish(&self) {
        let session = self.state.lock().session.take();
        if let Some(samples) = session {
            self.complete(samples);
        }
    }

    /// Abort the running session. Nothing is persisted.
    pub fn cancel(&self) {
        let session = self.state.lock().session.take();
        if let Some(samples) = session {
            info!(collected = samples.len(), "Calibration cancelled");
            self.emit(CalibrationEvent::Cancelled);
        }
    }

    fn complete(&self, samples: Vec<Sample>) {
        match self.compute_profile(&samples) {
            Ok(profile) => {
                if let Err(e) = self.store.save(&self.key, &profile) {
                    error!(error = %e, "Failed to persist calibration profile");
                    self.emit(CalibrationEvent::Failed(CalibrationError::Persistence(
                        e.to_string(),
                    )));
                    return;
                }

                self.state.lock().active = Some(profile);
                metrics::counter!("calibration.completed").increment(1);
                info!(
                    accel_x = profile.accel_x_offset,
                    accel_y = profile.accel_y_offset,
                    accel_z = profile.accel_z_offset,
                    gyro_x = profile.gyro_x_offset,
                    gyro_y = profile.gyro_y_offset,
                    gyro_z = profile.gyro_z_offset,
                    "Calibration completed"
                );
                self.emit(CalibrationEvent::Completed(profile));
            }
            Err(e) => {
                warn!(error = %e, "Calibration failed");
                self.emit(CalibrationEvent::Failed(e));
            }
        }
    }

    fn compute_profile(&self, samples: &[Sample]) -> Result<CalibrationProfile, CalibrationError> {
        if samples.len() < self.required {
            return Err(CalibrationError::InsufficientData {
                collected: samples.len(),
                required: self.required,
            });
        }

        let mut sums = [0f64; 6];
        for sample in samples {
            for (sum, value) in sums.iter_mut().zip(sample.channels()) {
                *sum += value as f64;
            }
        }

        const AXES: [&str; 6] = ["accel_x", "accel_y", "accel_z", "gyro_x", "gyro_y", "gyro_z"];
        let count = samples.len() as f64;
        let mut means = [0f32; 6];
        for ((mean, sum), axis) in means.iter_mut().zip(sums).zip(AXES) {
            let value = sum / count;
            if !value.is_finite() {
                return Err(CalibrationError::NonFiniteMean { axis });
            }
            *mean = value as f32;
        }

        Ok(CalibrationProfile {
            accel_x_offset: means[0],
            accel_y_offset: means[1],
            accel_z_offset: (sums[2] / count - GRAVITY_G) as f32,
            gyro_x_offset: means[3],
            gyro_y_offset: means[4],
            gyro_z_offset: means[5],
            calibrated_at: self.clock.now_millis(),
        })
    }

    /// Subtract the active offsets. Returns the input unchanged when there
    /// is no valid profile.
    pub fn apply(&self, raw: &Sample) -> Sample {
        let Some(profile) = self.current_profile() else {
            return *raw;
        };

        Sample {
            accel_x: raw.accel_x - profile.accel_x_offset,
            accel_y: raw.accel_y - profile.accel_y_offset,
            accel_z: raw.accel_z - profile.accel_z_offset,
            gyro_x: raw.gyro_x - profile.gyro_x_offset,
            gyro_y: raw.gyro_y - profile.gyro_y_offset,
            gyro_z: raw.gyro_z - profile.gyro_z_offset,
            calibrated: true,
            ..*raw
        }
    }

    pub fn current_profile(&self) -> Option<CalibrationProfile> {
        self.state.lock().active.filter(CalibrationProfile::is_valid)
    }

    pub fn has_calibration(&self) -> bool {
        self.current_profile().is_some()
    }

    pub fn is_calibrating(&self) -> bool {
        self.state.lock().session.is_some()
    }

    /// Percentage of the run collected so far, 0 when idle.
    pub fn progress_percent(&self) -> u32 {
        match &self.state.lock().session {
            Some(samples) => (samples.len() * 100 / self.required) as u32,
            None => 0,
        }
    }

    /// Remove the stored record and the active profile.
    pub fn clear(&self) {
        if let Err(e) = self.store.clear(&self.key) {
            warn!(error = %e, "Failed to clear stored calibration profile");
        }
        self.state.lock().active = None;
        info!("Calibration cleared");
    }

    fn emit(&self, event: CalibrationEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::profile_store::{MemoryStore, MockProfileStore, ProfileStoreError};

    const NOW: i64 = 1_700_000_000_000;

    fn resting(accel: [f32; 3], gyro: [f32; 3]) -> Sample {
        Sample {
            device_timestamp: 0,
            accel_x: accel[0],
            accel_y: accel[1],
            accel_z: accel[2],
            gyro_x: gyro[0],
            gyro_y: gyro[1],
            gyro_z: gyro[2],
            voltage: 3.9,
            received_at: NOW,
            calibrated: false,
        }
    }

    fn engine_with(store: Arc<dyn ProfileStore>) -> CalibrationEngine {
        CalibrationEngine::new(
            &CalibrationConfig::default(),
            store,
            Arc::new(ManualClock::new(NOW)),
        )
    }

    fn drain(rx: &mut broadcast::Receiver<CalibrationEvent>) -> Vec<CalibrationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_constant_samples_produce_offsets() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone());
        let mut rx = engine.subscribe();

        engine.start();
        let sample = resting([0.5, -0.25, 1.25], [2.0, -4.0, 8.0]);
        for _ in 0..REQUIRED_SAMPLES {
            engine.add_sample(&sample);
        }

        let profile = engine.current_profile().unwrap();
        assert!((profile.accel_x_offset - 0.5).abs() < 1e-6);
        assert!((profile.accel_y_offset + 0.25).abs() < 1e-6);
        assert!((profile.accel_z_offset - 0.25).abs() < 1e-6);
        assert!((profile.gyro_x_offset - 2.0).abs() < 1e-6);
        assert!((profile.gyro_y_offset + 4.0).abs() < 1e-6);
        assert!((profile.gyro_z_offset - 8.0).abs() < 1e-6);
        assert_eq!(profile.calibrated_at, NOW);
        assert!(!engine.is_calibrating());

        assert_eq!(store.load(CALIBRATION_KEY).unwrap(), Some(profile));

        // Resting Z reads 1 g once the gravity-adjusted offset is removed
        let applied = engine.apply(&sample);
        assert!(applied.accel_x.abs() < 1e-6);
        assert!(applied.accel_y.abs() < 1e-6);
        assert!((applied.accel_z - 1.0).abs() < 1e-6);
        for value in applied.gyro() {
            assert!(value.abs() < 1e-6, "{value}");
        }
        assert!(applied.calibrated);
        assert_eq!(applied.voltage, sample.voltage);
        assert_eq!(applied.received_at, sample.received_at);

        let events = drain(&mut rx);
        assert_eq!(events[0], CalibrationEvent::Started { required: 200 });
        let progress = events
            .iter()
            .filter(|e| matches!(e, CalibrationEvent::Progress { .. }))
            .count();
        assert_eq!(progress, REQUIRED_SAMPLES / PROGRESS_EVERY);
        assert_eq!(events.last(), Some(&CalibrationEvent::Completed(profile)));
    }

    #[test]
    fn test_apply_without_profile_is_identity() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        let sample = resting([0.1, 0.2, 0.9], [1.0, 2.0, 3.0]);
        assert!(!engine.has_calibration());
        assert_eq!(engine.apply(&sample), sample);
    }

    #[test]
    fn test_samples_ignored_when_idle() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        engine.add_sample(&resting([0.0; 3], [0.0; 3]));
        assert!(!engine.is_calibrating());
        assert_eq!(engine.progress_percent(), 0);
    }

    #[test]
    fn test_progress_percent_and_double_start() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        engine.start();
        for _ in 0..50 {
            engine.add_sample(&resting([0.0, 0.0, 1.0], [0.0; 3]));
        }
        engine.start();
        assert_eq!(engine.progress_percent(), 25);
    }

    #[test]
    fn test_cancel_discards_session() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone());
        let mut rx = engine.subscribe();

        engine.start();
        for _ in 0..100 {
            engine.add_sample(&resting([0.0, 0.0, 1.0], [0.0; 3]));
        }
        engine.cancel();

        assert!(!engine.is_calibrating());
        assert!(!engine.has_calibration());
        assert!(store.load(CALIBRATION_KEY).unwrap().is_none());
        assert_eq!(drain(&mut rx).last(), Some(&CalibrationEvent::Cancelled));
    }

    #[test]
    fn test_finish_early_is_insufficient() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        let mut rx = engine.subscribe();

        engine.start();
        for _ in 0..42 {
            engine.add_sample(&resting([0.0, 0.0, 1.0], [0.0; 3]));
        }
        engine.finish();

        assert!(!engine.has_calibration());
        assert_eq!(
            drain(&mut rx).last(),
            Some(&CalibrationEvent::Failed(CalibrationError::InsufficientData {
                collected: 42,
                required: 200
            }))
        );
    }

    #[test]
    fn test_non_finite_mean_keeps_previous_profile() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone());

        engine.start();
        for _ in 0..REQUIRED_SAMPLES {
            engine.add_sample(&resting([0.1, 0.0, 1.0], [0.0; 3]));
        }
        let previous = engine.current_profile().unwrap();

        let mut rx = engine.subscribe();
        engine.start();
        for _ in 0..REQUIRED_SAMPLES {
            engine.add_sample(&resting([f32::INFINITY, 0.0, 1.0], [0.0; 3]));
        }

        assert_eq!(engine.current_profile(), Some(previous));
        assert_eq!(
            drain(&mut rx).last(),
            Some(&CalibrationEvent::Failed(CalibrationError::NonFiniteMean {
                axis: "accel_x"
            }))
        );
    }

    #[test]
    fn test_persistence_failure_is_reported() {
        let mut store = MockProfileStore::new();
        store.expect_load().returning(|_| Ok(None));
        store.expect_save().returning(|key, _| {
            Err(ProfileStoreError::InvalidKey(key.to_string()))
        });
        let engine = engine_with(Arc::new(store));
        let mut rx = engine.subscribe();

        engine.start();
        for _ in 0..REQUIRED_SAMPLES {
            engine.add_sample(&resting([0.0, 0.0, 1.0], [0.0; 3]));
        }

        assert!(!engine.has_calibration());
        assert!(matches!(
            drain(&mut rx).last(),
            Some(CalibrationEvent::Failed(CalibrationError::Persistence(_)))
        ));
    }

    #[test]
    fn test_loads_and_clears_stored_profile() {
        let store = Arc::new(MemoryStore::new());
        let stored = CalibrationProfile {
            accel_x_offset: 0.1,
            accel_y_offset: 0.0,
            accel_z_offset: 0.0,
            gyro_x_offset: 0.0,
            gyro_y_offset: 0.0,
            gyro_z_offset: 0.0,
            calibrated_at: 5,
        };
        store.save(CALIBRATION_KEY, &stored).unwrap();

        let engine = engine_with(store.clone());
        assert_eq!(engine.current_profile(), Some(stored));

        engine.clear();
        assert!(!engine.has_calibration());
        assert!(store.load(CALIBRATION_KEY).unwrap().is_none());
    }

    #[test]
    fn test_invalid_stored_profile_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let mut stored = CalibrationProfile {
            accel_x_offset: 0.1,
            accel_y_offset: 0.0,
            accel_z_offset: 0.0,
            gyro_x_offset: 0.0,
            gyro_y_offset: 0.0,
            gyro_z_offset: 0.0,
            calibrated_at: 0,
        };
        store.save(CALIBRATION_KEY, &stored).unwrap();
        assert!(!engine_with(store.clone()).has_calibration());

        stored.calibrated_at = -1;
        store.save(CALIBRATION_KEY, &stored).unwrap();
        assert!(!engine_with(store).has_calibration());
    }

    #[test]
    fn test_profile_json_field_names() {
        let json = r#"{"accelXOffset":0.1,"accelYOffset":0.2,"accelZOffset":0.3,
            "gyroXOffset":1.0,"gyroYOffset":2.0,"gyroZOffset":3.0,"calibrationTime":99}"#;
        let profile: CalibrationProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.calibrated_at, 99);
        assert!(serde_json::to_string(&profile).unwrap().contains("\"calibratedAt\":99"));
    }
}
