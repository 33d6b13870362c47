use serde::{Deserialize, Serialize};

/// One decoded IMU reading.
///
/// A sample is created once per frame and never mutated afterwards;
/// calibration produces a new value so the raw reading stays available.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Monotonic device counter, wraps at `u32::MAX`
    pub device_timestamp: u32,
    /// Acceleration in g
    pub accel_x: f32,
    pub accel_y: f32,
    pub accel_z: f32,
    /// Angular rate in degrees per second
    pub gyro_x: f32,
    pub gyro_y: f32,
    pub gyro_z: f32,
    /// Battery voltage in volts
    pub voltage: f32,
    /// Host wall-clock milliseconds, stamped once at ingestion
    pub received_at: i64,
    /// Whether calibration offsets have been subtracted
    #[serde(default)]
    pub calibrated: bool,
}

impl Sample {
    /// Accelerometer axes as `[x, y, z]`.
    pub fn accel(&self) -> [f32; 3] {
        [self.accel_x, self.accel_y, self.accel_z]
    }

    /// Gyroscope axes as `[x, y, z]`.
    pub fn gyro(&self) -> [f32; 3] {
        [self.gyro_x, self.gyro_y, self.gyro_z]
    }

    /// The six plotted channels in display order.
    pub fn channels(&self) -> [f32; 6] {
        [
            self.accel_x,
            self.accel_y,
            self.accel_z,
            self.gyro_x,
            self.gyro_y,
            self.gyro_z,
        ]
    }
}
