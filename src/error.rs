//! Error types for the realtime client

use crate::control::RecordingStartReason;
use crate::model::TemplateItemError;
use thiserror::Error;

/// Result type alias using the crate-wide [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in realtime client operations
#[derive(Debug, Error)]
pub enum Error {
    /// mDNS browsing failed above the transport layer
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// No device was discovered within the given deadline
    #[error("No device found before the deadline")]
    DeviceNotFound,

    /// HTTP transport failure while talking to the control API
    #[error("Control transport error: {0}")]
    ControlTransport(#[from] reqwest::Error),

    /// The device rejected a request with an error message
    #[error("Device error (HTTP {status}): {message}")]
    Device {
        /// HTTP status code returned by the device
        status: u16,
        /// Error message reported by the device
        message: String,
    },

    /// The device refused to start a recording
    #[error("Could not start recording ({reason:?}): {message}")]
    RecordingStart {
        /// Classified refusal reason
        reason: RecordingStartReason,
        /// Verbatim device message
        message: String,
    },

    /// The device refused to stop or cancel a recording
    #[error("Could not stop recording: {0}")]
    RecordingStop(String),

    /// Template answers failed validation; one entry per offending item
    #[error("Invalid template answers ({} item(s))", .0.len())]
    InvalidTemplateAnswers(Vec<TemplateItemError>),

    /// A status component with an unrecognized `model` tag
    #[error("Unknown status component model: {0}")]
    UnknownComponent(String),

    /// The component payload did not match the advertised model
    #[error("Malformed {model} component: {source}")]
    MalformedComponent {
        /// Advertised `model` tag
        model: String,
        /// Underlying deserialization error
        #[source]
        source: serde_json::Error,
    },

    /// The device does not expose a time echo port
    #[error("Device does not support the time echo protocol")]
    TimeEchoNotSupported,

    /// A time echo round did not complete within its deadline
    #[error("Time echo round timed out")]
    TimeEchoTimeout,

    /// A gaze RTP payload had an unrecognized length
    #[error("Cannot decode gaze payload of {0} bytes")]
    GazePayloadDecode(usize),

    /// An eye-event or IMU RTP payload did not match its wire layout
    #[error("Malformed {stream} payload: {detail}")]
    MalformedPayload {
        /// Stream the payload came from
        stream: &'static str,
        /// What did not match
        detail: String,
    },

    /// H.264 NAL unit reassembly failed; the affected access unit is dropped
    #[error("NAL reassembly error: {0}")]
    NalReassembly(String),

    /// RTSP signaling failure (request, response, or transport)
    #[error("RTSP error: {0}")]
    Rtsp(String),

    /// SDP from DESCRIBE is missing or malformed
    #[error("SDP error: {0}")]
    Sdp(String),

    /// WebSocket failure on the status channel
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A bounded sample queue rejected a push
    #[error("Sample queue overflow")]
    Overflow,

    /// The stream has terminated and no further samples will arrive
    #[error("Stream closed")]
    StreamClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable at the session boundary
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ControlTransport(_)
                | Error::Rtsp(_)
                | Error::WebSocket(_)
                | Error::Io(_)
                | Error::TimeEchoTimeout
        )
    }

    /// Check if this error only affects a single packet or access unit
    ///
    /// Payload-level decode errors drop the affected datum; the enclosing
    /// stream keeps running.
    pub fn is_payload_error(&self) -> bool {
        matches!(
            self,
            Error::GazePayloadDecode(_)
                | Error::MalformedPayload { .. }
                | Error::NalReassembly(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Device {
            status: 400,
            message: "Recording not running".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Device error (HTTP 400): Recording not running"
        );
    }

    #[test]
    fn test_payload_errors_are_not_retryable() {
        assert!(Error::GazePayloadDecode(13).is_payload_error());
        assert!(!Error::GazePayloadDecode(13).is_retryable());
        assert!(Error::NalReassembly("gap".to_string()).is_payload_error());
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(Error::Rtsp("connection reset".to_string()).is_retryable());
        assert!(Error::WebSocket("closed".to_string()).is_retryable());
        assert!(!Error::UnknownComponent("Gizmo".to_string()).is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
    }
}
