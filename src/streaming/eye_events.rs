//! Eye event payload decoding (fixations, saccades, blinks)
//!
//! The `com.pupillabs.eventlist1` encoding carries one event per RTP packet
//! in network byte order: a 32-bit event type selector followed by the
//! type-specific fields. Type 5 is a keepalive and carries no event.

use crate::error::{Error, Result};
use bytes::Buf;

const EVENT_SACCADE_END: i32 = 0;
const EVENT_FIXATION_END: i32 = 1;
const EVENT_SACCADE_ONSET: i32 = 2;
const EVENT_FIXATION_ONSET: i32 = 3;
const EVENT_BLINK: i32 = 4;
const EVENT_KEEPALIVE: i32 = 5;

/// Summary statistics of a completed fixation or saccade
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GazeMotionSummary {
    /// Event start on the device clock, nanoseconds since the Unix epoch
    pub start_time_ns: i64,
    /// Event end on the device clock, nanoseconds since the Unix epoch
    pub end_time_ns: i64,
    /// Gaze position at event start, scene camera pixels
    pub start_gaze: (f32, f32),
    /// Gaze position at event end, scene camera pixels
    pub end_gaze: (f32, f32),
    /// Mean gaze position over the event, scene camera pixels
    pub mean_gaze: (f32, f32),
    /// Movement amplitude in pixels
    pub amplitude_pixels: f32,
    /// Movement amplitude in degrees of visual angle
    pub amplitude_angle_deg: f32,
    /// Mean angular velocity in degrees per second
    pub mean_velocity: f32,
    /// Peak angular velocity in degrees per second
    pub max_velocity: f32,
}

/// One decoded eye event
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EyeEvent {
    /// A saccade started
    SaccadeOnset {
        /// Start on the device clock, nanoseconds since the Unix epoch
        start_time_ns: i64,
    },
    /// A fixation started
    FixationOnset {
        /// Start on the device clock, nanoseconds since the Unix epoch
        start_time_ns: i64,
    },
    /// A saccade completed
    SaccadeEnd(GazeMotionSummary),
    /// A fixation completed
    FixationEnd(GazeMotionSummary),
    /// A blink completed
    Blink {
        /// Start on the device clock, nanoseconds since the Unix epoch
        start_time_ns: i64,
        /// End on the device clock, nanoseconds since the Unix epoch
        end_time_ns: i64,
    },
}

fn malformed(detail: impl Into<String>) -> Error {
    Error::MalformedPayload {
        stream: "eye_events",
        detail: detail.into(),
    }
}

fn ensure_len(payload: &[u8], needed: usize) -> Result<()> {
    if payload.len() < needed {
        Err(malformed(format!(
            "{} bytes, need at least {needed}",
            payload.len()
        )))
    } else {
        Ok(())
    }
}

fn get_summary(buf: &mut &[u8]) -> GazeMotionSummary {
    GazeMotionSummary {
        start_time_ns: buf.get_i64(),
        end_time_ns: buf.get_i64(),
        start_gaze: (buf.get_f32(), buf.get_f32()),
        end_gaze: (buf.get_f32(), buf.get_f32()),
        mean_gaze: (buf.get_f32(), buf.get_f32()),
        amplitude_pixels: buf.get_f32(),
        amplitude_angle_deg: buf.get_f32(),
        mean_velocity: buf.get_f32(),
        max_velocity: buf.get_f32(),
    }
}

/// Decode one eye event payload; `Ok(None)` for keepalives
pub fn decode_eye_event(payload: &[u8]) -> Result<Option<EyeEvent>> {
    ensure_len(payload, 4)?;
    let mut buf = payload;
    let event_type = buf.get_i32();
    match event_type {
        EVENT_SACCADE_END | EVENT_FIXATION_END => {
            ensure_len(payload, 4 + 16 + 40)?;
            let summary = get_summary(&mut buf);
            Ok(Some(if event_type == EVENT_SACCADE_END {
                EyeEvent::SaccadeEnd(summary)
            } else {
                EyeEvent::FixationEnd(summary)
            }))
        }
        EVENT_SACCADE_ONSET | EVENT_FIXATION_ONSET => {
            ensure_len(payload, 4 + 8)?;
            let start_time_ns = buf.get_i64();
            Ok(Some(if event_type == EVENT_SACCADE_ONSET {
                EyeEvent::SaccadeOnset { start_time_ns }
            } else {
                EyeEvent::FixationOnset { start_time_ns }
            }))
        }
        EVENT_BLINK => {
            ensure_len(payload, 4 + 16)?;
            Ok(Some(EyeEvent::Blink {
                start_time_ns: buf.get_i64(),
                end_time_ns: buf.get_i64(),
            }))
        }
        EVENT_KEEPALIVE => Ok(None),
        other => Err(malformed(format!("unexpected event type {other}"))),
    }
}
