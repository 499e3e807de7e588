//! RTP to wall-clock timestamp mapping via RTCP Sender Reports
//!
//! RTP packets carry 32-bit timestamps in media clock units with an arbitrary
//! origin. RTCP Sender Reports pair one RTP timestamp with the sender's NTP
//! wall clock, anchoring the stream: once a report has been observed, any RTP
//! timestamp converts to nanoseconds since the Unix epoch on the device clock.
//!
//! The 32-bit RTP timestamp wraps every `2^32 / clock_rate` seconds (about
//! 13 hours at 90 kHz); the mapper tracks a 64-bit extended timestamp and
//! adds `2^32` whenever the raw value regresses by more than `2^31`.

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970)
pub const NTP_UNIX_OFFSET_SECONDS: u64 = 2_208_988_800;

/// Convert a 64-bit fixed-point NTP timestamp to Unix nanoseconds
pub fn ntp_to_unix_ns(ntp: u64) -> i64 {
    let seconds = (ntp >> 32) as i64 - NTP_UNIX_OFFSET_SECONDS as i64;
    let fraction_ns = (((ntp & 0xFFFF_FFFF) * 1_000_000_000) >> 32) as i64;
    seconds * 1_000_000_000 + fraction_ns
}

/// Convert Unix nanoseconds to a 64-bit fixed-point NTP timestamp
pub fn unix_ns_to_ntp(unix_ns: i64) -> u64 {
    let seconds = (unix_ns.div_euclid(1_000_000_000) + NTP_UNIX_OFFSET_SECONDS as i64) as u64;
    let remainder_ns = unix_ns.rem_euclid(1_000_000_000) as u64;
    let fraction = (remainder_ns << 32) / 1_000_000_000;
    (seconds << 32) | fraction
}

/// Per-media mapper from RTP timestamps to device wall-clock nanoseconds
#[derive(Debug)]
pub struct WallClockMapper {
    clock_rate: u32,
    last_raw_ts: Option<u32>,
    wrap_offset: u64,
    /// `ntp_unix_ns - rtp_ext * 1e9 / clock_rate` from the latest SR
    offset_ns: Option<f64>,
}

impl WallClockMapper {
    /// Create a mapper for a media stream with the given RTP clock rate
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            last_raw_ts: None,
            wrap_offset: 0,
            offset_ns: None,
        }
    }

    /// Whether a sender report has been observed yet
    pub fn is_anchored(&self) -> bool {
        self.offset_ns.is_some()
    }

    /// Extend a raw 32-bit timestamp into the 64-bit monotone series
    ///
    /// Must be called in packet arrival order; a regression of more than
    /// `2^31` is interpreted as a wrap of the 32-bit counter.
    pub fn extend_timestamp(&mut self, raw_ts: u32) -> u64 {
        if let Some(last) = self.last_raw_ts {
            if raw_ts < last && last - raw_ts > (1 << 31) {
                self.wrap_offset += 1u64 << 32;
            }
        }
        self.last_raw_ts = Some(raw_ts);
        self.wrap_offset + raw_ts as u64
    }

    /// Anchor the stream on a sender report's RTP/NTP timestamp pair
    pub fn observe_sender_report(&mut self, rtp_ts: u32, ntp_ts: u64) {
        let ext = self.extend_timestamp(rtp_ts);
        let rtp_ns = ext as f64 * 1e9 / self.clock_rate as f64;
        self.offset_ns = Some(ntp_to_unix_ns(ntp_ts) as f64 - rtp_ns);
    }

    /// Map an extended timestamp to Unix nanoseconds, if anchored
    pub fn wall_clock_from_extended(&self, ext_ts: u64) -> Option<i64> {
        let offset = self.offset_ns?;
        Some((ext_ts as f64 * 1e9 / self.clock_rate as f64 + offset) as i64)
    }

    /// Extend and map a raw timestamp in one step
    pub fn wall_clock_ns(&mut self, raw_ts: u32) -> Option<i64> {
        let ext = self.extend_timestamp(raw_ts);
        self.wall_clock_from_extended(ext)
    }
}
