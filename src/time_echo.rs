//! Clock offset estimation via the device's UDP time echo service
//!
//! The device timestamps all of its data in nanoseconds since the Unix epoch
//! on its own clock. For analyses that mix device data with locally captured
//! events, NTP alone is often not good enough; the time echo service allows a
//! direct estimate of the offset between the two clocks.
//!
//! One exchange: the client records `t0`, sends it as an 8-byte big-endian
//! nanosecond value, the device answers with its own clock reading, and the
//! client records `t1` on receipt. Assuming symmetric transport, the device
//! reading corresponds to the midpoint `t0 + rtt/2`, so
//! `offset = t_device - (t0 + rtt/2)`. Repeating the exchange and averaging
//! makes the estimate robust against scheduling jitter.
//!
//! To convert a device timestamp into the local clock domain, subtract the
//! offset; to convert a local timestamp into the device domain, add it.

use crate::config::TimeEchoConfig;
use crate::error::{Error, Result};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// One request/response exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeEchoSample {
    /// Round trip duration in nanoseconds
    pub rtt_ns: i64,
    /// Estimated clock offset (device minus local) in nanoseconds
    pub offset_ns: i64,
}

/// Aggregated result of a time echo measurement run
#[derive(Debug, Clone, PartialEq)]
pub struct TimeEchoEstimate {
    /// Mean clock offset (device minus local) in nanoseconds
    pub mean_offset_ns: i64,
    /// Mean round trip duration in nanoseconds
    pub mean_rtt_ns: i64,
    /// Per-round measurements, in exchange order
    pub samples: Vec<TimeEchoSample>,
}

impl TimeEchoEstimate {
    fn from_samples(samples: Vec<TimeEchoSample>) -> Self {
        let n = samples.len().max(1) as i64;
        let mean_offset_ns = samples.iter().map(|s| s.offset_ns).sum::<i64>() / n;
        let mean_rtt_ns = samples.iter().map(|s| s.rtt_ns).sum::<i64>() / n;
        Self {
            mean_offset_ns,
            mean_rtt_ns,
            samples,
        }
    }
}

/// Local wall clock in nanoseconds since the Unix epoch
pub(crate) fn local_now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_nanos() as i64
}

/// Estimates the offset between the local clock and the device clock
///
/// Construct with the device address and the `time_echo_port` advertised in
/// the [`Phone`](crate::model::Phone) component, then call
/// [`estimate`](Self::estimate).
#[derive(Debug, Clone)]
pub struct TimeOffsetEstimator {
    host: String,
    port: u16,
    config: TimeEchoConfig,
}

impl TimeOffsetEstimator {
    /// Create an estimator for `host:port` with default configuration
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            config: TimeEchoConfig::default(),
        }
    }

    /// Override the measurement configuration
    pub fn with_config(mut self, config: TimeEchoConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the configured number of exchanges and aggregate the result
    ///
    /// The first exchange warms up ARP caches and socket paths and is
    /// discarded. Fails with [`Error::TimeEchoTimeout`] if any round misses
    /// its response deadline.
    pub async fn estimate(&self) -> Result<TimeEchoEstimate> {
        self.estimate_with_clock(local_now_ns).await
    }

    /// Like [`estimate`](Self::estimate) with an injectable clock source
    pub async fn estimate_with_clock(
        &self,
        clock: impl Fn() -> i64,
    ) -> Result<TimeEchoEstimate> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((self.host.as_str(), self.port)).await?;
        debug!("Time echo against {}:{}", self.host, self.port);

        let warmup = self.exchange(&socket, &clock).await?;
        debug!(
            "Discarding warm-up measurement (rtt {} ns, offset {} ns)",
            warmup.rtt_ns, warmup.offset_ns
        );

        info!("Measuring {} time echo rounds...", self.config.rounds);
        let mut samples = Vec::with_capacity(self.config.rounds as usize);
        for _ in 0..self.config.rounds {
            samples.push(self.exchange(&socket, &clock).await?);
            if let Some(pause) = self.config.pause_between_rounds {
                tokio::time::sleep(pause).await;
            }
        }

        Ok(TimeEchoEstimate::from_samples(samples))
    }

    async fn exchange(
        &self,
        socket: &UdpSocket,
        clock: &impl Fn() -> i64,
    ) -> Result<TimeEchoSample> {
        let t0 = clock();
        socket.send(&(t0 as u64).to_be_bytes()).await?;

        let mut response = [0u8; 8];
        let received = timeout(self.config.round_timeout, socket.recv(&mut response)).await;
        let t1 = clock();

        let len = match received {
            Ok(len) => len?,
            Err(_) => return Err(Error::TimeEchoTimeout),
        };
        if len != 8 {
            warn!("Dropping malformed time echo response of {len} bytes");
            return Err(Error::TimeEchoTimeout);
        }

        let t_device = u64::from_be_bytes(response) as i64;
        let rtt_ns = t1 - t0;
        let offset_ns = t_device - (t0 + rtt_ns / 2);
        Ok(TimeEchoSample { rtt_ns, offset_ns })
    }
}
