//! Realtime network API client for Pupil Labs wearable eye trackers
//!
//! The device's companion app exposes its services over the local network:
//! an HTTP control API, a WebSocket channel mirroring the device status,
//! RTSP/RTP sensor streams (scene and eye cameras, gaze, eye events, IMU),
//! an mDNS advertisement for discovery, and a UDP time echo service for
//! clock offset estimation. This crate covers all of them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  DeviceDiscovery (mDNS)  →  DiscoveredDevice             │
//! │  ControlClient (HTTP)    →  Status, recordings, events   │
//! │  StatusNotifier (WS)     →  live Status mirror           │
//! │  RtspSession (RTSP/RTP)  →  RtpPacket + wall clock       │
//! │    ├─ GazeStream / VideoStream / ImuStream / EyeEvents   │
//! │    └─ WallClockMapper (RTCP SR → Unix nanoseconds)       │
//! │  MatchingEngine          →  fused (frame, gaze, …)       │
//! │  SimpleDevice            →  blocking facade over it all  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use pupil_realtime::{ControlClient, StatusNotifier};
//!
//! # async fn example() -> pupil_realtime::Result<()> {
//! let control = ControlClient::new("192.168.1.21", 8080)?;
//! let status = control.get_status().await?;
//! println!("battery at {}%", status.phone.battery_level);
//!
//! let recording_id = control.recording_start().await?;
//! control.send_event("stimulus onset", None).await?;
//! control.recording_stop_and_save().await?;
//! # let _ = recording_id;
//! # Ok(())
//! # }
//! ```
//!
//! For synchronous use, [`SimpleDevice`] wraps the same functionality behind
//! a blocking API driven by a background worker.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod control;
pub mod discovery;
pub mod matching;
pub mod model;
pub mod notifier;
pub mod simple;
pub mod streaming;
pub mod time_echo;

mod error;

pub use config::{MatchingConfig, StreamingConfig, TimeEchoConfig};
pub use control::{ControlClient, DeviceErrorEntry, Event, RecordingStartReason};
pub use discovery::{DeviceDiscovery, DiscoveredDevice, DiscoveryEvent};
pub use error::{Error, Result};
pub use matching::{MatchedSample, MatchingEngine, SampleProducer, StreamSample, TimedSample};
pub use model::{
    parse_component, BatteryState, Calibration, Component, ConnectionType, Hardware, MemoryState,
    NetworkDevice, Phone, Recording, RecordingAction, Sensor, SensorName, Status, Template,
    TemplateItem, TemplateItemError, TemplateResponses,
};
pub use notifier::{NotifierEvent, StatusNotifier};
pub use simple::{MatchedSceneEyesGaze, MatchedSceneGaze, SimpleDevice};
pub use streaming::{
    EyeEvent, EyeEventStream, GazeSample, GazeStream, ImuFrame, ImuStream, RtpPacket, RtspSession,
    SenderReport, Timestamped, VideoFrame, VideoStream, WallClockMapper,
};
pub use time_echo::{TimeEchoEstimate, TimeEchoSample, TimeOffsetEstimator};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
