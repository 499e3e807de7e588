//! Gaze payload decoding
//!
//! Each RTP packet of a gaze stream carries exactly one datum in network
//! byte order. The payload length selects the variant; fields are read from
//! the front of the payload and any remaining bytes are reserved.

use crate::error::{Error, Result};
use bytes::Buf;

/// Payload length of a minimal gaze datum
pub const LEN_MINIMAL: usize = 9;
/// Payload length of a minimal datum with device timestamp
pub const LEN_MINIMAL_TIMESTAMPED: usize = 21;
/// Payload length of a dual monocular datum (left and right eye)
pub const LEN_DUAL: usize = 18;
/// Payload length of a datum with full eye state
pub const LEN_EYE_STATE: usize = 77;
/// Payload length of a datum with eye state and eyelid state
pub const LEN_EYE_STATE_EYELIDS: usize = 121;

/// A gaze point for a single eye
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonocularGaze {
    /// X coordinate in scene camera pixels
    pub x: f32,
    /// Y coordinate in scene camera pixels
    pub y: f32,
    /// Whether the glasses are being worn (wire: 255 = worn, 0 = not worn)
    pub worn: bool,
}

/// Per-eye optical state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeState {
    /// Pupil diameter in millimeters
    pub pupil_diameter_mm: f32,
    /// Eyeball center in millimeters relative to the scene camera
    pub eyeball_center: [f32; 3],
    /// Optical axis direction vector
    pub optical_axis: [f32; 3],
}

/// Per-eye eyelid state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyelidState {
    /// Angle of the top eyelid in radians
    pub angle_top: f32,
    /// Angle of the bottom eyelid in radians
    pub angle_bottom: f32,
    /// Aperture between the eyelids in millimeters
    pub aperture_mm: f32,
}

/// One decoded gaze datum
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GazeSample {
    /// Gaze point and worn bit only
    Minimal {
        /// X coordinate in scene camera pixels
        x: f32,
        /// Y coordinate in scene camera pixels
        y: f32,
        /// Whether the glasses are being worn
        worn: bool,
    },
    /// Gaze point with the device's own capture timestamp
    MinimalTimestamped {
        /// X coordinate in scene camera pixels
        x: f32,
        /// Y coordinate in scene camera pixels
        y: f32,
        /// Whether the glasses are being worn
        worn: bool,
        /// Capture time in seconds since the Unix epoch (device clock)
        timestamp_unix_seconds: f64,
    },
    /// Gaze point with per-eye optical state
    EyeStates {
        /// X coordinate in scene camera pixels
        x: f32,
        /// Y coordinate in scene camera pixels
        y: f32,
        /// Whether the glasses are being worn
        worn: bool,
        /// Left eye state
        left: EyeState,
        /// Right eye state
        right: EyeState,
        /// Capture time in seconds since the Unix epoch (device clock)
        timestamp_unix_seconds: f64,
    },
    /// Gaze point with per-eye optical and eyelid state
    EyeStatesEyelids {
        /// X coordinate in scene camera pixels
        x: f32,
        /// Y coordinate in scene camera pixels
        y: f32,
        /// Whether the glasses are being worn
        worn: bool,
        /// Left eye state
        left: EyeState,
        /// Right eye state
        right: EyeState,
        /// Left eyelid state
        left_eyelid: EyelidState,
        /// Right eyelid state
        right_eyelid: EyelidState,
        /// Capture time in seconds since the Unix epoch (device clock)
        timestamp_unix_seconds: f64,
    },
    /// Separate gaze points per eye (Pupil Invisible)
    Dual {
        /// Left eye gaze
        left: MonocularGaze,
        /// Right eye gaze
        right: MonocularGaze,
    },
}

fn get_worn(buf: &mut &[u8]) -> bool {
    buf.get_u8() == 255
}

fn get_eye_state(buf: &mut &[u8]) -> EyeState {
    let pupil_diameter_mm = buf.get_f32();
    let mut eyeball_center = [0f32; 3];
    for value in &mut eyeball_center {
        *value = buf.get_f32();
    }
    let mut optical_axis = [0f32; 3];
    for value in &mut optical_axis {
        *value = buf.get_f32();
    }
    EyeState {
        pupil_diameter_mm,
        eyeball_center,
        optical_axis,
    }
}

fn get_eyelid_state(buf: &mut &[u8]) -> EyelidState {
    EyelidState {
        angle_top: buf.get_f32(),
        angle_bottom: buf.get_f32(),
        aperture_mm: buf.get_f32(),
    }
}

/// Decode one gaze RTP payload
///
/// The payload length selects the variant; unknown lengths fail with
/// [`Error::GazePayloadDecode`] and the session should continue with the
/// next packet.
pub fn decode_gaze(payload: &[u8]) -> Result<GazeSample> {
    let mut buf = payload;
    match payload.len() {
        LEN_MINIMAL => Ok(GazeSample::Minimal {
            x: buf.get_f32(),
            y: buf.get_f32(),
            worn: get_worn(&mut buf),
        }),
        LEN_MINIMAL_TIMESTAMPED => Ok(GazeSample::MinimalTimestamped {
            x: buf.get_f32(),
            y: buf.get_f32(),
            worn: get_worn(&mut buf),
            timestamp_unix_seconds: buf.get_f64(),
        }),
        LEN_DUAL => Ok(GazeSample::Dual {
            left: MonocularGaze {
                x: buf.get_f32(),
                y: buf.get_f32(),
                worn: get_worn(&mut buf),
            },
            right: MonocularGaze {
                x: buf.get_f32(),
                y: buf.get_f32(),
                worn: get_worn(&mut buf),
            },
        }),
        LEN_EYE_STATE => {
            let x = buf.get_f32();
            let y = buf.get_f32();
            let worn = get_worn(&mut buf);
            let left = get_eye_state(&mut buf);
            let right = get_eye_state(&mut buf);
            Ok(GazeSample::EyeStates {
                x,
                y,
                worn,
                left,
                right,
                timestamp_unix_seconds: buf.get_f64(),
            })
        }
        LEN_EYE_STATE_EYELIDS => {
            let x = buf.get_f32();
            let y = buf.get_f32();
            let worn = get_worn(&mut buf);
            let left = get_eye_state(&mut buf);
            let right = get_eye_state(&mut buf);
            let left_eyelid = get_eyelid_state(&mut buf);
            let right_eyelid = get_eyelid_state(&mut buf);
            Ok(GazeSample::EyeStatesEyelids {
                x,
                y,
                worn,
                left,
                right,
                left_eyelid,
                right_eyelid,
                timestamp_unix_seconds: buf.get_f64(),
            })
        }
        other => Err(Error::GazePayloadDecode(other)),
    }
}

impl GazeSample {
    /// Primary gaze point of this sample (left eye for dual data)
    pub fn point(&self) -> (f32, f32) {
        match self {
            GazeSample::Minimal { x, y, .. }
            | GazeSample::MinimalTimestamped { x, y, .. }
            | GazeSample::EyeStates { x, y, .. }
            | GazeSample::EyeStatesEyelids { x, y, .. } => (*x, *y),
            GazeSample::Dual { left, .. } => (left.x, left.y),
        }
    }

    /// Whether the glasses are being worn
    pub fn worn(&self) -> bool {
        match self {
            GazeSample::Minimal { worn, .. }
            | GazeSample::MinimalTimestamped { worn, .. }
            | GazeSample::EyeStates { worn, .. }
            | GazeSample::EyeStatesEyelids { worn, .. } => *worn,
            GazeSample::Dual { left, right } => left.worn && right.worn,
        }
    }
}
