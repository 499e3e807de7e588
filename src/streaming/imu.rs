//! IMU payload decoding
//!
//! The `com.pupillabs.imu1` encoding carries one fixed-size big-endian
//! record per RTP packet: capture timestamp, accelerometer, gyroscope, and
//! orientation quaternion, with an optional trailing temperature reading.

use crate::error::{Error, Result};
use bytes::Buf;

/// Record size without the temperature field
const LEN_BASE: usize = 8 + 3 * 4 + 3 * 4 + 4 * 4;
/// Record size with the trailing temperature field
const LEN_WITH_TEMPERATURE: usize = LEN_BASE + 4;

/// A 3-axis reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Data3D {
    /// X axis
    pub x: f32,
    /// Y axis
    pub y: f32,
    /// Z axis
    pub z: f32,
}

/// Orientation quaternion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    /// Scalar part
    pub w: f32,
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component
    pub z: f32,
}

/// One inertial measurement frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuFrame {
    /// Capture time on the device clock, nanoseconds since the Unix epoch
    pub timestamp_unix_ns: i64,
    /// Acceleration in g
    pub accel: Data3D,
    /// Angular velocity in degrees per second
    pub gyro: Data3D,
    /// Orientation relative to magnetic north
    pub quaternion: Quaternion,
    /// Module temperature in degrees Celsius, if reported
    pub temperature_c: Option<f32>,
}

fn get_data3d(buf: &mut &[u8]) -> Data3D {
    Data3D {
        x: buf.get_f32(),
        y: buf.get_f32(),
        z: buf.get_f32(),
    }
}

/// Decode one IMU record
pub fn decode_imu(payload: &[u8]) -> Result<ImuFrame> {
    let has_temperature = match payload.len() {
        LEN_BASE => false,
        LEN_WITH_TEMPERATURE => true,
        other => {
            return Err(Error::MalformedPayload {
                stream: "imu",
                detail: format!("{other} bytes, expected {LEN_BASE} or {LEN_WITH_TEMPERATURE}"),
            })
        }
    };

    let mut buf = payload;
    Ok(ImuFrame {
        timestamp_unix_ns: buf.get_i64(),
        accel: get_data3d(&mut buf),
        gyro: get_data3d(&mut buf),
        quaternion: Quaternion {
            w: buf.get_f32(),
            x: buf.get_f32(),
            y: buf.get_f32(),
            z: buf.get_f32(),
        },
        temperature_c: has_temperature.then(|| buf.get_f32()),
    })
}
