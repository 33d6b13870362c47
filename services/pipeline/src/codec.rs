//! Binary frame codec for the sensor's 30-byte notification payload.
//!
//! Layout (little-endian):
//!
//! ```text
//! 0..4    u32  device timestamp
//! 4..16   f32  accel x, y, z (g)
//! 16..28  f32  gyro x, y, z (deg/s)
//! 28..30  u16  voltage in centivolts
//! ```

use crate::clock::{Clock, SystemClock};
use crate::sample::Sample;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Size of one frame on the wire
pub const FRAME_LEN: usize = 30;

/// Largest accepted accelerometer magnitude per axis, in g
pub const ACCEL_LIMIT_G: f32 = 16.0;

/// Largest accepted gyroscope magnitude per axis, in deg/s
pub const GYRO_LIMIT_DPS: f32 = 2000.0;

/// Accepted battery voltage range, inclusive
pub const VOLTAGE_MIN: f32 = 0.0;
pub const VOLTAGE_MAX: f32 = 5.0;

const VOLTAGE_SCALE: f32 = 100.0;

/// Malformed frame.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Invalid frame length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Sample outside the sensor's physical range.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{field} out of range: {value}")]
pub struct RangeError {
    pub field: &'static str,
    pub value: f32,
}

/// Decode a frame, stamping it with the system wall clock.
pub fn decode(bytes: &[u8]) -> Result<Sample, DecodeError> {
    decode_at(bytes, SystemClock.now_millis())
}

/// Decode a frame with an explicit host arrival time.
pub fn decode_at(bytes: &[u8], received_at: i64) -> Result<Sample, DecodeError> {
    if bytes.len() != FRAME_LEN {
        return Err(DecodeError::InvalidLength {
            expected: FRAME_LEN,
            actual: bytes.len(),
        });
    }

    let mut buf = bytes;
    let device_timestamp = buf.get_u32_le();
    let accel_x = buf.get_f32_le();
    let accel_y = buf.get_f32_le();
    let accel_z = buf.get_f32_le();
    let gyro_x = buf.get_f32_le();
    let gyro_y = buf.get_f32_le();
    let gyro_z = buf.get_f32_le();
    let voltage = buf.get_u16_le() as f32 / VOLTAGE_SCALE;

    Ok(Sample {
        device_timestamp,
        accel_x,
        accel_y,
        accel_z,
        gyro_x,
        gyro_y,
        gyro_z,
        voltage,
        received_at,
        calibrated: false,
    })
}

/// Encode a sample into the wire layout. Voltage is rounded to centivolts.
pub fn encode(sample: &Sample) -> [u8; FRAME_LEN] {
    let mut buf = BytesMut::with_capacity(FRAME_LEN);
    buf.put_u32_le(sample.device_timestamp);
    for value in sample.channels() {
        buf.put_f32_le(value);
    }
    let centivolts = (sample.voltage * VOLTAGE_SCALE)
        .round()
        .clamp(0.0, u16::MAX as f32) as u16;
    buf.put_u16_le(centivolts);

    let mut frame = [0u8; FRAME_LEN];
    frame.copy_from_slice(&buf);
    frame
}

/// Check every axis against the sensor's physical range.
pub fn check_ranges(sample: &Sample) -> Result<(), RangeError> {
    let accel = [
        ("accel_x", sample.accel_x),
        ("accel_y", sample.accel_y),
        ("accel_z", sample.accel_z),
    ];
    for (field, value) in accel {
        // NaN fails the comparison and is rejected too
        if !(value.abs() <= ACCEL_LIMIT_G) {
            return Err(RangeError { field, value });
        }
    }

    let gyro = [
        ("gyro_x", sample.gyro_x),
        ("gyro_y", sample.gyro_y),
        ("gyro_z", sample.gyro_z),
    ];
    for (field, value) in gyro {
        if !(value.abs() <= GYRO_LIMIT_DPS) {
            return Err(RangeError { field, value });
        }
    }

    if !(VOLTAGE_MIN..=VOLTAGE_MAX).contains(&sample.voltage) {
        return Err(RangeError {
            field: "voltage",
            value: sample.voltage,
        });
    }

    Ok(())
}

/// Whether a sample is within the sensor's physical range.
pub fn validate(sample: &Sample) -> bool {
    check_ranges(sample).is_ok()
}
