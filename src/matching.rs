//! Temporal fusion of independent sensor streams
//!
//! Streams arrive on their own cadence (a 30 Hz scene camera, 200 Hz gaze,
//! ~110 Hz IMU) and share nothing but the device wall clock reconstructed by
//! the streaming layer. The matching engine pairs each sample of a leader
//! stream with the nearest-in-time sample of every follower stream.
//!
//! Producers push into bounded, timestamp-ordered queues; the matcher drains
//! them with peek semantics:
//!
//! 1. Pop the next leader sample at `t_L`.
//! 2. For each follower, wait (bounded by the wait budget) until a sample at
//!    or past `t_L` is buffered, so both bracketing candidates are visible.
//! 3. Select the follower sample minimizing `|t - t_L|`; ties go to the
//!    later sample. Samples older than `t_L - W` are discarded, they can
//!    never be the best match for a future leader sample.
//! 4. A follower that produces nothing in time yields `None`.
//!
//! No leader sample is ever dropped by the matcher itself; a full leader
//! queue rejects the producer's push with [`Error::Overflow`] instead.

use crate::config::MatchingConfig;
use crate::error::{Error, Result};
use crate::streaming::{EyeEvent, GazeSample, ImuFrame, VideoFrame};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

/// A sample from any stream kind, as consumed by the matching engine
#[derive(Debug, Clone)]
pub enum StreamSample {
    /// Gaze datum
    Gaze(GazeSample),
    /// Scene camera access unit
    SceneFrame(VideoFrame),
    /// Eye cameras access unit
    EyesFrame(VideoFrame),
    /// IMU frame
    Imu(ImuFrame),
    /// Eye event
    EyeEvent(EyeEvent),
}

/// A stream sample with its device wall-clock timestamp
#[derive(Debug, Clone)]
pub struct TimedSample {
    /// Device wall clock in nanoseconds since the Unix epoch
    pub wall_clock_ns: i64,
    /// The sample itself
    pub sample: StreamSample,
}

/// One fused tuple: a leader sample and its best follower matches
#[derive(Debug, Clone)]
pub struct MatchedSample {
    /// The leader sample driving this tuple
    pub leader: TimedSample,
    /// Per-follower best matches, in follower registration order;
    /// `None` when a follower produced nothing in time
    pub followers: Vec<Option<TimedSample>>,
}

struct QueueInner {
    samples: Mutex<VecDeque<TimedSample>>,
    notify: Notify,
    depth: usize,
    is_leader: bool,
    closed: AtomicBool,
}

impl QueueInner {
    fn new(depth: usize, is_leader: bool) -> Arc<Self> {
        Arc::new(Self {
            samples: Mutex::new(VecDeque::with_capacity(depth)),
            notify: Notify::new(),
            depth,
            is_leader,
            closed: AtomicBool::new(false),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Producer handle pushing one stream's samples into the engine
///
/// Samples must be pushed in nondecreasing timestamp order. Dropping the
/// handle closes the stream.
pub struct SampleProducer {
    queue: Arc<QueueInner>,
}

impl SampleProducer {
    /// Push one sample
    ///
    /// When the queue is full: a leader push fails with [`Error::Overflow`];
    /// a follower push drops the oldest buffered sample and succeeds.
    pub fn push(&self, sample: TimedSample) -> Result<()> {
        let mut samples = self.queue.samples.lock().unwrap();
        if samples.len() >= self.queue.depth {
            if self.queue.is_leader {
                return Err(Error::Overflow);
            }
            samples.pop_front();
            warn!("Follower queue full; dropping oldest sample");
        }
        samples.push_back(sample);
        drop(samples);
        self.queue.notify.notify_waiters();
        Ok(())
    }

    /// Signal that no further samples will arrive
    pub fn close(&self) {
        self.queue.close();
    }
}

impl Drop for SampleProducer {
    fn drop(&mut self) {
        self.queue.close();
    }
}

struct Follower {
    queue: Arc<QueueInner>,
    window_ns: i64,
}

/// Nearest-timestamp matcher over one leader and N follower streams
pub struct MatchingEngine {
    config: MatchingConfig,
    leader: Arc<QueueInner>,
    leader_producer_taken: bool,
    followers: Vec<Follower>,
}

impl MatchingEngine {
    /// Create an engine with the given configuration
    pub fn new(config: MatchingConfig) -> Self {
        let leader = QueueInner::new(config.queue_depth, true);
        Self {
            config,
            leader,
            leader_producer_taken: false,
            followers: Vec::new(),
        }
    }

    /// Producer handle for the leader stream; available exactly once
    pub fn leader_producer(&mut self) -> Option<SampleProducer> {
        if self.leader_producer_taken {
            return None;
        }
        self.leader_producer_taken = true;
        Some(SampleProducer {
            queue: self.leader.clone(),
        })
    }

    /// Register a follower stream and get its producer handle
    ///
    /// `window` bounds how far a follower match may lie from the leader
    /// timestamp; defaults to the leader's nominal period.
    pub fn add_follower(&mut self, window: Option<Duration>) -> SampleProducer {
        let window_ns = window.unwrap_or(self.config.leader_period).as_nanos() as i64;
        let queue = QueueInner::new(self.config.queue_depth, false);
        self.followers.push(Follower {
            queue: queue.clone(),
            window_ns,
        });
        SampleProducer { queue }
    }

    /// Produce the next fused tuple; `None` once the leader stream is closed
    /// and drained
    pub async fn next_matched(&mut self) -> Option<MatchedSample> {
        let leader = pop_leader(&self.leader).await?;
        let deadline = Instant::now() + self.config.wait_budget;

        let mut followers = Vec::with_capacity(self.followers.len());
        for follower in &self.followers {
            followers.push(
                select_follower(
                    &follower.queue,
                    leader.wall_clock_ns,
                    follower.window_ns,
                    deadline,
                )
                .await,
            );
        }

        Some(MatchedSample { leader, followers })
    }
}

async fn pop_leader(queue: &Arc<QueueInner>) -> Option<TimedSample> {
    loop {
        let notified = queue.notify.notified();
        tokio::pin!(notified);
        {
            let mut samples = queue.samples.lock().unwrap();
            if let Some(sample) = samples.pop_front() {
                return Some(sample);
            }
            if queue.is_closed() {
                return None;
            }
        }
        notified.await;
    }
}

/// Wait for the bracket around `t_leader` to be buffered, then pick the
/// closest sample within the window and discard everything too old to ever
/// match again
async fn select_follower(
    queue: &Arc<QueueInner>,
    t_leader: i64,
    window_ns: i64,
    deadline: Instant,
) -> Option<TimedSample> {
    loop {
        let notified = queue.notify.notified();
        tokio::pin!(notified);
        {
            let samples = queue.samples.lock().unwrap();
            let bracketed = samples.iter().any(|s| s.wall_clock_ns >= t_leader);
            if bracketed || queue.is_closed() {
                break;
            }
        }
        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep_until(deadline) => break,
        }
    }

    let mut samples = queue.samples.lock().unwrap();
    let cutoff = t_leader - window_ns;

    let mut best: Option<(i64, TimedSample)> = None;
    for sample in samples.iter() {
        if sample.wall_clock_ns < cutoff {
            continue;
        }
        let delta = (sample.wall_clock_ns - t_leader).abs();
        // `<=` keeps the later of two equidistant samples (the queue is
        // timestamp-ordered).
        match &best {
            Some((best_delta, _)) if delta > *best_delta => {}
            _ => best = Some((delta, sample.clone())),
        }
    }

    while let Some(front) = samples.front() {
        if front.wall_clock_ns < cutoff {
            samples.pop_front();
        } else {
            break;
        }
    }

    best.map(|(_, sample)| sample)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;

    fn gaze_at(ts_ms: i64) -> TimedSample {
        TimedSample {
            wall_clock_ns: ts_ms * MS,
            sample: StreamSample::Gaze(GazeSample::Minimal {
                x: ts_ms as f32,
                y: 0.0,
                worn: true,
            }),
        }
    }

    fn frame_at(ts_ms: i64) -> TimedSample {
        TimedSample {
            wall_clock_ns: ts_ms * MS,
            sample: StreamSample::SceneFrame(VideoFrame {
                nal_units: vec![],
                rtp_timestamp: ts_ms as u32,
                keyframe: false,
            }),
        }
    }

    fn engine_with_one_follower(wait_budget: Duration) -> (MatchingEngine, SampleProducer, SampleProducer) {
        let mut engine = MatchingEngine::new(MatchingConfig {
            leader_period: Duration::from_millis(33),
            wait_budget,
            queue_depth: 256,
        });
        let leader = engine.leader_producer().unwrap();
        let follower = engine.add_follower(None);
        (engine, leader, follower)
    }

    #[tokio::test]
    async fn test_nearest_match_wins() {
        // 30 Hz leader, 200 Hz follower: for the frame at 66 ms the gaze
        // candidates are 65 and 70; 65 has the smaller delta and must win.
        let (mut engine, leader, follower) = engine_with_one_follower(Duration::from_secs(1));

        for ts in (0..=100).step_by(5) {
            follower.push(gaze_at(ts)).unwrap();
        }
        for ts in [0, 33, 66] {
            leader.push(frame_at(ts)).unwrap();
        }

        let m0 = engine.next_matched().await.unwrap();
        assert_eq!(m0.followers[0].as_ref().unwrap().wall_clock_ns, 0);

        let m1 = engine.next_matched().await.unwrap();
        // 33 ms leader: candidates 30 (delta 3) and 35 (delta 2) -> 35.
        assert_eq!(m1.followers[0].as_ref().unwrap().wall_clock_ns, 35 * MS);

        let m2 = engine.next_matched().await.unwrap();
        assert_eq!(m2.followers[0].as_ref().unwrap().wall_clock_ns, 65 * MS);
    }

    #[tokio::test]
    async fn test_tie_breaks_to_later_sample() {
        let (mut engine, leader, follower) = engine_with_one_follower(Duration::from_secs(1));
        follower.push(gaze_at(64)).unwrap();
        follower.push(gaze_at(68)).unwrap();
        leader.push(frame_at(66)).unwrap();

        let matched = engine.next_matched().await.unwrap();
        assert_eq!(matched.followers[0].as_ref().unwrap().wall_clock_ns, 68 * MS);
    }

    #[tokio::test]
    async fn test_window_bound_holds_for_every_tuple() {
        let (mut engine, leader, follower) = engine_with_one_follower(Duration::from_millis(20));

        for ts in (0..=200).step_by(7) {
            follower.push(gaze_at(ts)).unwrap();
        }
        for ts in [0, 33, 66, 99, 132] {
            leader.push(frame_at(ts)).unwrap();
        }
        leader.close();

        let window_ns = 33 * MS;
        let mut tuples = 0;
        while let Some(matched) = engine.next_matched().await {
            if let Some(follower_sample) = &matched.followers[0] {
                let delta = (follower_sample.wall_clock_ns - matched.leader.wall_clock_ns).abs();
                assert!(delta <= window_ns, "delta {delta} exceeds window");
            }
            tuples += 1;
        }
        // Every leader sample produced a tuple.
        assert_eq!(tuples, 5);
    }

    #[tokio::test]
    async fn test_missing_follower_yields_none() {
        let (mut engine, leader, _follower) =
            engine_with_one_follower(Duration::from_millis(20));
        leader.push(frame_at(0)).unwrap();

        let matched = engine.next_matched().await.unwrap();
        assert!(matched.followers[0].is_none());
    }

    #[tokio::test]
    async fn test_closed_follower_matches_remaining_samples() {
        let (mut engine, leader, follower) = engine_with_one_follower(Duration::from_secs(1));
        follower.push(gaze_at(30)).unwrap();
        follower.close();
        leader.push(frame_at(33)).unwrap();

        let matched = engine.next_matched().await.unwrap();
        assert_eq!(matched.followers[0].as_ref().unwrap().wall_clock_ns, 30 * MS);
    }

    #[tokio::test]
    async fn test_engine_ends_when_leader_closes() {
        let (mut engine, leader, _follower) = engine_with_one_follower(Duration::from_secs(1));
        leader.push(frame_at(0)).unwrap();
        leader.close();

        assert!(engine.next_matched().await.is_some());
        assert!(engine.next_matched().await.is_none());
    }

    #[tokio::test]
    async fn test_leader_overflow_rejected_follower_drops_oldest() {
        let mut engine = MatchingEngine::new(MatchingConfig {
            leader_period: Duration::from_millis(33),
            wait_budget: Duration::from_millis(10),
            queue_depth: 2,
        });
        let leader = engine.leader_producer().unwrap();
        let follower = engine.add_follower(None);

        leader.push(frame_at(0)).unwrap();
        leader.push(frame_at(33)).unwrap();
        match leader.push(frame_at(66)) {
            Err(Error::Overflow) => {}
            other => panic!("expected Overflow, got {other:?}"),
        }

        // Follower drops its oldest sample instead of failing.
        follower.push(gaze_at(0)).unwrap();
        follower.push(gaze_at(5)).unwrap();
        follower.push(gaze_at(10)).unwrap();
        let matched = engine.next_matched().await.unwrap();
        // Leader 0 ms: the 0 ms gaze was dropped by overflow; 5 ms is closest.
        assert_eq!(matched.followers[0].as_ref().unwrap().wall_clock_ns, 5 * MS);
    }

    #[tokio::test]
    async fn test_stale_followers_are_discarded() {
        let (mut engine, leader, follower) = engine_with_one_follower(Duration::from_secs(1));
        for ts in (0..=66).step_by(5) {
            follower.push(gaze_at(ts)).unwrap();
        }
        leader.push(frame_at(66)).unwrap();
        let _ = engine.next_matched().await.unwrap();

        // Everything older than 66 - 33 = 33 ms must be gone.
        let remaining = engine.followers[0].queue.samples.lock().unwrap();
        assert!(remaining.iter().all(|s| s.wall_clock_ns >= 33 * MS));
        assert!(!remaining.is_empty());
    }

    #[tokio::test]
    async fn test_leader_producer_is_single_use() {
        let mut engine = MatchingEngine::new(MatchingConfig::default());
        assert!(engine.leader_producer().is_some());
        assert!(engine.leader_producer().is_none());
    }
}
