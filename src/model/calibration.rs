//! Device calibration blob parsing
//!
//! `GET /api/calibration` returns a fixed-layout little-endian record with
//! intrinsics and extrinsics for the scene camera, the left eye camera, and
//! the right eye camera, in that order, terminated by a CRC-32 of everything
//! before it.

use crate::error::{Error, Result};
use bytes::Buf;

/// Serialized size of one camera block (3x3 matrix, 8 coefficients, 4x4 affine)
const CAMERA_BLOCK_LEN: usize = 9 * 8 + 8 * 8 + 16 * 8;

/// Total blob size: version, serial, three camera blocks, CRC trailer
const CALIBRATION_LEN: usize = 1 + 6 + 3 * CAMERA_BLOCK_LEN + 4;

/// Intrinsics and extrinsics of a single camera
#[derive(Debug, Clone, PartialEq)]
pub struct CameraCalibration {
    /// 3x3 pinhole camera matrix, row major
    pub camera_matrix: [[f64; 3]; 3],
    /// Distortion coefficients (OpenCV ordering, 8 terms)
    pub distortion_coefficients: [f64; 8],
    /// 4x4 affine pose relative to the module, row major
    pub extrinsics_affine_matrix: [[f64; 4]; 4],
}

/// Factory calibration of the scene and eye cameras
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    /// Blob format version
    pub version: u8,
    /// Module serial number (ASCII)
    pub serial: String,
    /// Scene camera calibration
    pub scene_camera: CameraCalibration,
    /// Left eye camera calibration
    pub left_camera: CameraCalibration,
    /// Right eye camera calibration
    pub right_camera: CameraCalibration,
}

impl Calibration {
    /// Parse and checksum a calibration blob
    pub fn parse(blob: &[u8]) -> Result<Self> {
        if blob.len() != CALIBRATION_LEN {
            return Err(Error::Device {
                status: 200,
                message: format!(
                    "calibration blob has {} bytes, expected {CALIBRATION_LEN}",
                    blob.len()
                ),
            });
        }

        let body = &blob[..CALIBRATION_LEN - 4];
        let mut trailer = &blob[CALIBRATION_LEN - 4..];
        let expected_crc = trailer.get_u32_le();
        let actual_crc = crc32(body);
        if expected_crc != actual_crc {
            return Err(Error::Device {
                status: 200,
                message: format!(
                    "calibration checksum mismatch: expected {expected_crc:#010x}, \
                     computed {actual_crc:#010x}"
                ),
            });
        }

        let mut buf = body;
        let version = buf.get_u8();
        let mut serial_bytes = [0u8; 6];
        buf.copy_to_slice(&mut serial_bytes);
        let serial = String::from_utf8_lossy(&serial_bytes)
            .trim_end_matches('\0')
            .to_string();

        let scene_camera = read_camera(&mut buf);
        let left_camera = read_camera(&mut buf);
        let right_camera = read_camera(&mut buf);

        Ok(Self {
            version,
            serial,
            scene_camera,
            left_camera,
            right_camera,
        })
    }
}

fn read_camera(buf: &mut &[u8]) -> CameraCalibration {
    let mut camera_matrix = [[0f64; 3]; 3];
    for row in &mut camera_matrix {
        for value in row.iter_mut() {
            *value = buf.get_f64_le();
        }
    }
    let mut distortion_coefficients = [0f64; 8];
    for value in &mut distortion_coefficients {
        *value = buf.get_f64_le();
    }
    let mut extrinsics_affine_matrix = [[0f64; 4]; 4];
    for row in &mut extrinsics_affine_matrix {
        for value in row.iter_mut() {
            *value = buf.get_f64_le();
        }
    }
    CameraCalibration {
        camera_matrix,
        distortion_coefficients,
        extrinsics_affine_matrix,
    }
}

/// CRC-32 (IEEE 802.3, reflected, polynomial 0xEDB88320)
fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn sample_blob() -> Vec<u8> {
        let mut blob = Vec::with_capacity(CALIBRATION_LEN);
        blob.put_u8(1);
        blob.put_slice(b"844425");
        for camera in 0..3u32 {
            // camera matrix: fx/fy on the diagonal, principal point in column 2
            let fx = 890.0 + camera as f64;
            let matrix = [
                [fx, 0.0, 800.0],
                [0.0, fx, 600.0],
                [0.0, 0.0, 1.0],
            ];
            for row in matrix {
                for value in row {
                    blob.put_f64_le(value);
                }
            }
            for i in 0..8 {
                blob.put_f64_le(-0.1 * i as f64);
            }
            for r in 0..4 {
                for c in 0..4 {
                    blob.put_f64_le(if r == c { 1.0 } else { 0.0 });
                }
            }
        }
        let crc = crc32(&blob);
        blob.put_u32_le(crc);
        blob
    }

    #[test]
    fn test_crc32_known_vector() {
        // Standard check value for "123456789"
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_parse_valid_blob() {
        // Camera blocks are serialized scene, left, right; the fx seed
        // (890 + block index) pins each struct field to its blob position.
        let calibration = Calibration::parse(&sample_blob()).unwrap();
        assert_eq!(calibration.version, 1);
        assert_eq!(calibration.serial, "844425");
        assert_eq!(calibration.scene_camera.camera_matrix[0][0], 890.0);
        assert_eq!(calibration.left_camera.camera_matrix[0][0], 891.0);
        assert_eq!(calibration.right_camera.camera_matrix[0][0], 892.0);
        assert_eq!(calibration.scene_camera.extrinsics_affine_matrix[3][3], 1.0);
    }

    #[test]
    fn test_corrupted_blob_fails_checksum() {
        let mut blob = sample_blob();
        blob[100] ^= 0xFF;
        match Calibration::parse(&blob) {
            Err(Error::Device { message, .. }) => assert!(message.contains("checksum")),
            other => panic!("expected checksum failure, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_blob_fails() {
        let blob = sample_blob();
        assert!(Calibration::parse(&blob[..blob.len() - 1]).is_err());
    }
}
