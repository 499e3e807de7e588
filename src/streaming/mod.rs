//! Sensor streaming: RTSP sessions, depacketizers, and typed streams
//!
//! The RTP layer is payload-agnostic: [`RtspSession`] delivers raw packets
//! tagged with wall-clock timestamps, and each encoding has its own decoder
//! on top. The typed streams ([`GazeStream`], [`VideoStream`], [`ImuStream`],
//! [`EyeEventStream`]) tie a session to its decoder and reopen the session on
//! transport failure up to the configured retry budget. Payload-level decode
//! failures drop the affected datum and keep the stream alive.

pub mod eye_events;
pub mod gaze;
pub mod imu;
pub mod rtsp;
pub mod video;
pub mod wallclock;

pub use eye_events::{decode_eye_event, EyeEvent, GazeMotionSummary};
pub use gaze::{decode_gaze, EyeState, EyelidState, GazeSample, MonocularGaze};
pub use imu::{decode_imu, Data3D, ImuFrame, Quaternion};
pub use rtsp::{MediaInfo, RtspSession};
pub use video::{parse_sprop_parameter_sets, VideoDepacketizer, VideoFrame};
pub use wallclock::{ntp_to_unix_ns, unix_ns_to_ntp, WallClockMapper};

use crate::config::StreamingConfig;
use crate::error::{Error, Result};
use bytes::Bytes;
use tracing::warn;

/// Encoding name of the gaze stream
pub const ENCODING_GAZE: &str = "com.pupillabs.gaze1";
/// Encoding name of the IMU stream
pub const ENCODING_IMU: &str = "com.pupillabs.imu1";
/// Encoding name of the eye event stream
pub const ENCODING_EYE_EVENTS: &str = "com.pupillabs.eventlist1";
/// Encoding name of the video streams
pub const ENCODING_H264: &str = "H264";

/// One RTP packet as delivered by a session
#[derive(Debug, Clone, PartialEq)]
pub struct RtpPacket {
    /// Packet payload, header stripped
    pub payload: Bytes,
    /// Raw 32-bit RTP timestamp in media clock units
    pub timestamp: u32,
    /// RTP sequence number
    pub sequence_number: u16,
    /// RTP marker bit
    pub marker: bool,
    /// Device wall clock of the timestamp, nanoseconds since the Unix epoch;
    /// `None` before the first sender report when the grace window elapsed
    pub wall_clock_ns: Option<i64>,
}

/// An RTCP sender report's timestamp pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    /// RTP timestamp in media clock units
    pub rtp_timestamp: u32,
    /// 64-bit fixed-point NTP timestamp
    pub ntp_timestamp: u64,
}

/// A decoded sample tagged with its reconstructed wall-clock timestamp
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timestamped<T> {
    /// The decoded sample
    pub value: T,
    /// Device wall clock in nanoseconds since the Unix epoch, if anchored
    pub wall_clock_ns: Option<i64>,
}

/// Session holder shared by the typed streams: reopens the RTSP session on
/// transport failure up to the configured retry budget
struct StreamDriver {
    url: String,
    config: StreamingConfig,
    session: Option<RtspSession>,
    generation: u64,
    retries_left: u32,
}

impl StreamDriver {
    async fn connect(url: &str, config: StreamingConfig) -> Result<Self> {
        let session = RtspSession::connect(url, &config).await?;
        Ok(Self {
            url: url.to_string(),
            retries_left: config.max_session_retries,
            config,
            session: Some(session),
            generation: 0,
        })
    }

    fn media(&self) -> Option<&MediaInfo> {
        self.session.as_ref().map(RtspSession::media)
    }

    /// Bumped every time the session is reopened; decoders reset on change
    fn generation(&self) -> u64 {
        self.generation
    }

    async fn next_packet(&mut self) -> Result<Option<RtpPacket>> {
        loop {
            let Some(session) = self.session.as_mut() else {
                return Ok(None);
            };
            if let Some(packet) = session.next_packet().await {
                return Ok(Some(packet));
            }
            // The reader tasks died; reopen the session if the budget allows.
            self.session = None;
            if self.retries_left == 0 {
                return Err(Error::StreamClosed);
            }
            self.retries_left -= 1;
            warn!(
                "RTSP session to {} broke; reopening ({} retries left)",
                self.url, self.retries_left
            );
            self.session = Some(RtspSession::connect(&self.url, &self.config).await?);
            self.generation += 1;
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            session.teardown().await?;
        }
        Ok(())
    }
}

/// Stream of decoded gaze samples from a gaze sensor URL
pub struct GazeStream {
    driver: StreamDriver,
}

impl GazeStream {
    /// Connect to a gaze sensor's RTSP URL
    pub async fn connect(url: &str, config: StreamingConfig) -> Result<Self> {
        let driver = StreamDriver::connect(url, config).await?;
        Ok(Self { driver })
    }

    /// Receive the next gaze sample; `None` after [`close`](Self::close)
    pub async fn next(&mut self) -> Result<Option<Timestamped<GazeSample>>> {
        loop {
            let Some(packet) = self.driver.next_packet().await? else {
                return Ok(None);
            };
            match decode_gaze(&packet.payload) {
                Ok(value) => {
                    return Ok(Some(Timestamped {
                        value,
                        wall_clock_ns: packet.wall_clock_ns,
                    }))
                }
                Err(e) => warn!("Dropping gaze packet: {e}"),
            }
        }
    }

    /// Tear the session down
    pub async fn close(&mut self) -> Result<()> {
        self.driver.close().await
    }
}

/// Stream of reassembled H.264 access units from a camera sensor URL
pub struct VideoStream {
    driver: StreamDriver,
    depacketizer: VideoDepacketizer,
    generation: u64,
}

impl VideoStream {
    /// Connect to a camera sensor's RTSP URL
    pub async fn connect(url: &str, config: StreamingConfig) -> Result<Self> {
        let driver = StreamDriver::connect(url, config).await?;
        let parameter_sets = driver
            .media()
            .map(|media| media.sprop_parameter_sets.clone())
            .unwrap_or_default();
        let generation = driver.generation();
        Ok(Self {
            driver,
            depacketizer: VideoDepacketizer::new(parameter_sets),
            generation,
        })
    }

    /// The out-of-band SPS/PPS parameter sets from the session's SDP
    pub fn parameter_sets(&self) -> &[Bytes] {
        self.depacketizer.parameter_sets()
    }

    /// Receive the next access unit; `None` after [`close`](Self::close)
    pub async fn next(&mut self) -> Result<Option<Timestamped<VideoFrame>>> {
        loop {
            let Some(packet) = self.driver.next_packet().await? else {
                return Ok(None);
            };
            if self.driver.generation() != self.generation {
                // Fresh session: new timestamp space, re-emit parameter sets.
                self.generation = self.driver.generation();
                let parameter_sets = self
                    .driver
                    .media()
                    .map(|media| media.sprop_parameter_sets.clone())
                    .unwrap_or_default();
                self.depacketizer = VideoDepacketizer::new(parameter_sets);
            }
            match self.depacketizer.push(&packet) {
                Ok(Some(frame)) => {
                    return Ok(Some(Timestamped {
                        value: frame,
                        wall_clock_ns: packet.wall_clock_ns,
                    }))
                }
                Ok(None) => {}
                Err(e) => warn!("Dropping access unit: {e}"),
            }
        }
    }

    /// Tear the session down
    pub async fn close(&mut self) -> Result<()> {
        self.driver.close().await
    }
}

/// Stream of IMU frames from the IMU sensor URL
pub struct ImuStream {
    driver: StreamDriver,
}

impl ImuStream {
    /// Connect to the IMU sensor's RTSP URL
    pub async fn connect(url: &str, config: StreamingConfig) -> Result<Self> {
        let driver = StreamDriver::connect(url, config).await?;
        Ok(Self { driver })
    }

    /// Receive the next IMU frame; `None` after [`close`](Self::close)
    pub async fn next(&mut self) -> Result<Option<Timestamped<ImuFrame>>> {
        loop {
            let Some(packet) = self.driver.next_packet().await? else {
                return Ok(None);
            };
            match decode_imu(&packet.payload) {
                Ok(value) => {
                    return Ok(Some(Timestamped {
                        value,
                        wall_clock_ns: packet.wall_clock_ns,
                    }))
                }
                Err(e) => warn!("Dropping IMU packet: {e}"),
            }
        }
    }

    /// Tear the session down
    pub async fn close(&mut self) -> Result<()> {
        self.driver.close().await
    }
}

/// Stream of eye events from the eye events sensor URL
pub struct EyeEventStream {
    driver: StreamDriver,
}

impl EyeEventStream {
    /// Connect to the eye events sensor's RTSP URL
    pub async fn connect(url: &str, config: StreamingConfig) -> Result<Self> {
        let driver = StreamDriver::connect(url, config).await?;
        Ok(Self { driver })
    }

    /// Receive the next eye event; keepalives are skipped silently.
    /// `None` after [`close`](Self::close)
    pub async fn next(&mut self) -> Result<Option<Timestamped<EyeEvent>>> {
        loop {
            let Some(packet) = self.driver.next_packet().await? else {
                return Ok(None);
            };
            match decode_eye_event(&packet.payload) {
                Ok(Some(value)) => {
                    return Ok(Some(Timestamped {
                        value,
                        wall_clock_ns: packet.wall_clock_ns,
                    }))
                }
                Ok(None) => {}
                Err(e) => warn!("Dropping eye event packet: {e}"),
            }
        }
    }

    /// Tear the session down
    pub async fn close(&mut self) -> Result<()> {
        self.driver.close().await
    }
}
