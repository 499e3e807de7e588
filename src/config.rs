//! Configuration types for streaming and matching

use std::time::Duration;

/// Configuration for an RTSP streaming session
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Deadline for RTSP signaling round trips (default: 5 s)
    pub request_timeout: Duration,

    /// Fallback RTSP session timeout when the server does not advertise one
    /// (default: 60 s)
    pub default_session_timeout: Duration,

    /// Upper bound on the keepalive interval; keepalives are sent at 2/3 of
    /// the session timeout but never less often than this (default: 25 s)
    pub max_keepalive_interval: Duration,

    /// How long samples are withheld while waiting for the first RTCP sender
    /// report before they are delivered without a wall-clock timestamp
    /// (default: 2 s)
    pub sender_report_grace: Duration,

    /// Capacity of the packet channel between the session reader and the
    /// depacketizer (default: 512)
    pub packet_channel_depth: usize,

    /// How many times a broken session is reopened before the failure is
    /// surfaced to the consumer (default: 3)
    pub max_session_retries: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            default_session_timeout: Duration::from_secs(60),
            max_keepalive_interval: Duration::from_secs(25),
            sender_report_grace: Duration::from_secs(2),
            packet_channel_depth: 512,
            max_session_retries: 3,
        }
    }
}

/// Configuration for the temporal matching engine
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Nominal period of the leader stream; also the default matching window
    /// for followers (default: 33 ms, a 30 Hz scene camera)
    pub leader_period: Duration,

    /// How long the matcher waits for follower samples around a leader
    /// sample before emitting `None` for that follower (default: 1 s)
    pub wait_budget: Duration,

    /// Depth of each per-stream sample queue (default: 256)
    pub queue_depth: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            leader_period: Duration::from_millis(33),
            wait_budget: Duration::from_secs(1),
            queue_depth: 256,
        }
    }
}

/// Configuration for time echo offset estimation
#[derive(Debug, Clone)]
pub struct TimeEchoConfig {
    /// Number of request/response exchanges per estimate (default: 100)
    pub rounds: u32,

    /// Per-round response deadline (default: 1 s)
    pub round_timeout: Duration,

    /// Optional pause between exchanges (default: none)
    pub pause_between_rounds: Option<Duration>,
}

impl Default for TimeEchoConfig {
    fn default() -> Self {
        Self {
            rounds: 100,
            round_timeout: Duration::from_secs(1),
            pause_between_rounds: None,
        }
    }
}
