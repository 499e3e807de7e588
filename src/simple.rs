//! Blocking convenience facade
//!
//! [`SimpleDevice`] wraps the async client in a synchronous API: a dedicated
//! worker thread owns a single-threaded tokio runtime running the control
//! client, the status mirror, and any sensor streams. Each facade method
//! posts a command to the worker and blocks on its reply.
//!
//! Sensor streams are opened lazily on the first `receive_*` call that needs
//! them (or eagerly via [`streaming_start`](SimpleDevice::streaming_start))
//! and keep running until [`streaming_stop`](SimpleDevice::streaming_stop)
//! or [`close`](SimpleDevice::close).

use crate::config::{MatchingConfig, StreamingConfig};
use crate::control::{ControlClient, DeviceErrorEntry, Event};
use crate::discovery::DiscoveredDevice;
use crate::error::{Error, Result};
use crate::matching::{MatchingEngine, SampleProducer, StreamSample, TimedSample};
use crate::model::{
    BatteryState, Calibration, MemoryState, Status, Template, TemplateResponses,
};
use crate::notifier::StatusNotifier;
use crate::streaming::{
    EyeEvent, EyeEventStream, GazeSample, GazeStream, ImuFrame, ImuStream, Timestamped,
    VideoFrame, VideoStream,
};
use crate::time_echo::{TimeEchoEstimate, TimeOffsetEstimator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A scene frame with its temporally closest gaze sample
#[derive(Debug, Clone)]
pub struct MatchedSceneGaze {
    /// Scene camera access unit
    pub frame: Timestamped<VideoFrame>,
    /// Closest gaze sample
    pub gaze: Timestamped<GazeSample>,
}

/// A scene frame with the closest eyes frame and gaze sample
#[derive(Debug, Clone)]
pub struct MatchedSceneEyesGaze {
    /// Scene camera access unit
    pub scene: Timestamped<VideoFrame>,
    /// Closest eye cameras access unit
    pub eyes: Timestamped<VideoFrame>,
    /// Closest gaze sample
    pub gaze: Timestamped<GazeSample>,
}

enum Command {
    RecordingStart(oneshot::Sender<Result<String>>),
    RecordingStopAndSave(oneshot::Sender<Result<()>>),
    RecordingCancel(oneshot::Sender<Result<()>>),
    SendEvent {
        name: String,
        timestamp_unix_ns: Option<i64>,
        reply: oneshot::Sender<Result<Event>>,
    },
    GetTemplate(oneshot::Sender<Result<Template>>),
    GetTemplateData(oneshot::Sender<Result<TemplateResponses>>),
    PostTemplateData {
        answers: TemplateResponses,
        reply: oneshot::Sender<Result<()>>,
    },
    GetCalibration(oneshot::Sender<Result<Calibration>>),
    GetErrors(oneshot::Sender<Result<Vec<DeviceErrorEntry>>>),
    EstimateTimeOffset(oneshot::Sender<Result<TimeEchoEstimate>>),
    StreamingStart(oneshot::Sender<Result<()>>),
    StreamingStop(oneshot::Sender<Result<()>>),
    ReceiveGaze(Duration, oneshot::Sender<Result<Option<Timestamped<GazeSample>>>>),
    ReceiveSceneFrame(Duration, oneshot::Sender<Result<Option<Timestamped<VideoFrame>>>>),
    ReceiveEyesFrame(Duration, oneshot::Sender<Result<Option<Timestamped<VideoFrame>>>>),
    ReceiveImu(Duration, oneshot::Sender<Result<Option<Timestamped<ImuFrame>>>>),
    ReceiveEyeEvent(Duration, oneshot::Sender<Result<Option<Timestamped<EyeEvent>>>>),
    ReceiveMatchedSceneGaze(Duration, oneshot::Sender<Result<Option<MatchedSceneGaze>>>),
    ReceiveMatchedSceneEyesGaze(
        Duration,
        oneshot::Sender<Result<Option<MatchedSceneEyesGaze>>>,
    ),
    Close(oneshot::Sender<()>),
}

/// Blocking, auto-connecting device handle
///
/// Connecting fetches the initial [`Status`] and starts the status mirror;
/// the cached status backs all property accessors without further I/O.
pub struct SimpleDevice {
    host: String,
    port: u16,
    command_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<Arc<Status>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl SimpleDevice {
    /// Connect to a device's control API and start the background worker
    pub fn connect(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        let (command_tx, command_rx) = mpsc::channel(32);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let worker_host = host.clone();
        let worker = std::thread::Builder::new()
            .name("pupil-realtime-worker".to_string())
            .spawn(move || worker_main(worker_host, port, command_rx, ready_tx))
            .map_err(Error::Io)?;

        let status_rx = ready_rx
            .recv()
            .map_err(|_| Error::StreamClosed)??;

        Ok(Self {
            host,
            port,
            command_tx,
            status_rx,
            worker: Some(worker),
        })
    }

    /// Connect using a discovery record
    pub fn from_discovered(device: &DiscoveredDevice) -> Result<Self> {
        Self::connect(device.address(), device.port)
    }

    /// Device host address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Control API port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current mirrored status snapshot
    pub fn status(&self) -> Arc<Status> {
        self.status_rx.borrow().clone()
    }

    /// Phone name from the cached status
    pub fn phone_name(&self) -> String {
        self.status().phone.device_name.clone()
    }

    /// Phone id from the cached status
    pub fn phone_id(&self) -> String {
        self.status().phone.device_id.clone()
    }

    /// Phone IP address from the cached status
    pub fn phone_ip(&self) -> String {
        self.status().phone.ip.clone()
    }

    /// Battery level in percent from the cached status
    pub fn battery_level_percent(&self) -> u8 {
        self.status().phone.battery_level
    }

    /// Battery state from the cached status
    pub fn battery_state(&self) -> BatteryState {
        self.status().phone.battery_state
    }

    /// Free storage in bytes from the cached status
    pub fn memory_num_free_bytes(&self) -> u64 {
        self.status().phone.memory
    }

    /// Storage state from the cached status
    pub fn memory_state(&self) -> MemoryState {
        self.status().phone.memory_state
    }

    /// Glasses hardware version from the cached status
    pub fn version_glasses(&self) -> String {
        self.status().hardware.version.clone()
    }

    /// Module serial from the cached status
    pub fn module_serial(&self) -> String {
        self.status().hardware.module_serial.clone()
    }

    /// Glasses serial from the cached status
    pub fn serial_number_glasses(&self) -> String {
        self.status().hardware.glasses_serial.clone()
    }

    /// Scene camera serial from the cached status
    pub fn serial_number_scene_cam(&self) -> String {
        self.status().hardware.world_camera_serial.clone()
    }

    fn roundtrip<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .blocking_send(build(reply_tx))
            .map_err(|_| Error::StreamClosed)?;
        reply_rx.blocking_recv().map_err(|_| Error::StreamClosed)?
    }

    /// Start a recording; returns the new recording id
    pub fn recording_start(&self) -> Result<String> {
        self.roundtrip(Command::RecordingStart)
    }

    /// Stop the running recording and save it
    pub fn recording_stop_and_save(&self) -> Result<()> {
        self.roundtrip(Command::RecordingStopAndSave)
    }

    /// Cancel the running recording
    pub fn recording_cancel(&self) -> Result<()> {
        self.roundtrip(Command::RecordingCancel)
    }

    /// Send a named event; `timestamp_unix_ns: None` lets the device stamp it
    pub fn send_event(&self, name: &str, timestamp_unix_ns: Option<i64>) -> Result<Event> {
        let name = name.to_string();
        self.roundtrip(|reply| Command::SendEvent {
            name,
            timestamp_unix_ns,
            reply,
        })
    }

    /// Fetch the currently selected template
    pub fn get_template(&self) -> Result<Template> {
        self.roundtrip(Command::GetTemplate)
    }

    /// Fetch the template answers entered on the device
    pub fn get_template_data(&self) -> Result<TemplateResponses> {
        self.roundtrip(Command::GetTemplateData)
    }

    /// Validate and post template answers
    pub fn post_template_data(&self, answers: TemplateResponses) -> Result<()> {
        self.roundtrip(|reply| Command::PostTemplateData { answers, reply })
    }

    /// Fetch and parse the factory calibration
    pub fn get_calibration(&self) -> Result<Calibration> {
        self.roundtrip(Command::GetCalibration)
    }

    /// Fetch pending device-side error reports
    pub fn get_errors(&self) -> Result<Vec<DeviceErrorEntry>> {
        self.roundtrip(Command::GetErrors)
    }

    /// Estimate the clock offset between this machine and the device
    pub fn estimate_time_offset(&self) -> Result<TimeEchoEstimate> {
        self.roundtrip(Command::EstimateTimeOffset)
    }

    /// Eagerly open all available sensor streams
    pub fn streaming_start(&self) -> Result<()> {
        self.roundtrip(Command::StreamingStart)
    }

    /// Close all sensor streams
    pub fn streaming_stop(&self) -> Result<()> {
        self.roundtrip(Command::StreamingStop)
    }

    /// Receive the next gaze sample; `Ok(None)` on timeout
    pub fn receive_gaze_datum(
        &self,
        timeout: Duration,
    ) -> Result<Option<Timestamped<GazeSample>>> {
        self.roundtrip(|reply| Command::ReceiveGaze(timeout, reply))
    }

    /// Receive the next scene camera frame; `Ok(None)` on timeout
    pub fn receive_scene_video_frame(
        &self,
        timeout: Duration,
    ) -> Result<Option<Timestamped<VideoFrame>>> {
        self.roundtrip(|reply| Command::ReceiveSceneFrame(timeout, reply))
    }

    /// Receive the next eye cameras frame; `Ok(None)` on timeout
    pub fn receive_eyes_video_frame(
        &self,
        timeout: Duration,
    ) -> Result<Option<Timestamped<VideoFrame>>> {
        self.roundtrip(|reply| Command::ReceiveEyesFrame(timeout, reply))
    }

    /// Receive the next IMU frame; `Ok(None)` on timeout
    pub fn receive_imu_datum(&self, timeout: Duration) -> Result<Option<Timestamped<ImuFrame>>> {
        self.roundtrip(|reply| Command::ReceiveImu(timeout, reply))
    }

    /// Receive the next eye event; `Ok(None)` on timeout
    pub fn receive_eye_event(&self, timeout: Duration) -> Result<Option<Timestamped<EyeEvent>>> {
        self.roundtrip(|reply| Command::ReceiveEyeEvent(timeout, reply))
    }

    /// Receive the next scene frame matched with its closest gaze sample;
    /// `Ok(None)` on timeout
    pub fn receive_matched_scene_video_frame_and_gaze(
        &self,
        timeout: Duration,
    ) -> Result<Option<MatchedSceneGaze>> {
        self.roundtrip(|reply| Command::ReceiveMatchedSceneGaze(timeout, reply))
    }

    /// Receive the next scene frame matched with the closest eyes frame and
    /// gaze sample; `Ok(None)` on timeout
    pub fn receive_matched_scene_and_eyes_video_frames_and_gaze(
        &self,
        timeout: Duration,
    ) -> Result<Option<MatchedSceneEyesGaze>> {
        self.roundtrip(|reply| Command::ReceiveMatchedSceneEyesGaze(timeout, reply))
    }

    /// Shut down streams, the status mirror, and the worker thread
    pub fn close(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        if let Some(worker) = self.worker.take() {
            let (reply_tx, reply_rx) = oneshot::channel();
            if self.command_tx.blocking_send(Command::Close(reply_tx)).is_ok() {
                let _ = reply_rx.blocking_recv();
            }
            let _ = worker.join();
        }
    }
}

impl Drop for SimpleDevice {
    fn drop(&mut self) {
        self.close_inner();
    }
}

fn worker_main(
    host: String,
    port: u16,
    command_rx: mpsc::Receiver<Command>,
    ready_tx: std::sync::mpsc::Sender<Result<watch::Receiver<Arc<Status>>>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready_tx.send(Err(Error::Io(e)));
            return;
        }
    };

    runtime.block_on(async move {
        let setup = async {
            let control = ControlClient::new(&host, port)?;
            let status = control.get_status().await?;
            let notifier = StatusNotifier::connect(&host, port, status).await?;
            Ok::<_, Error>((control, notifier))
        };
        let (control, notifier) = match setup.await {
            Ok(parts) => parts,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        let _ = ready_tx.send(Ok(notifier.status_watch()));

        let ctx = Arc::new(WorkerCtx {
            host: host.clone(),
            control,
            status_rx: notifier.status_watch(),
            hub: StreamHub::new(notifier.status_watch()),
        });

        let mut command_rx = command_rx;
        let mut handlers: Vec<JoinHandle<()>> = Vec::new();
        while let Some(command) = command_rx.recv().await {
            match command {
                Command::Close(reply) => {
                    let _ = reply.send(());
                    break;
                }
                command => {
                    let ctx = ctx.clone();
                    handlers.retain(|h| !h.is_finished());
                    handlers.push(tokio::spawn(handle_command(ctx, command)));
                }
            }
        }

        for handler in handlers {
            handler.abort();
        }
        ctx.hub.stop().await;
        notifier.close().await;
        debug!("Device worker stopped");
    });
}

struct WorkerCtx {
    host: String,
    control: ControlClient,
    status_rx: watch::Receiver<Arc<Status>>,
    hub: StreamHub,
}

async fn handle_command(ctx: Arc<WorkerCtx>, command: Command) {
    match command {
        Command::RecordingStart(reply) => {
            let _ = reply.send(ctx.control.recording_start().await);
        }
        Command::RecordingStopAndSave(reply) => {
            let _ = reply.send(ctx.control.recording_stop_and_save().await);
        }
        Command::RecordingCancel(reply) => {
            let _ = reply.send(ctx.control.recording_cancel().await);
        }
        Command::SendEvent {
            name,
            timestamp_unix_ns,
            reply,
        } => {
            let _ = reply.send(ctx.control.send_event(&name, timestamp_unix_ns).await);
        }
        Command::GetTemplate(reply) => {
            let _ = reply.send(ctx.control.get_template().await);
        }
        Command::GetTemplateData(reply) => {
            let _ = reply.send(ctx.control.get_template_data().await);
        }
        Command::PostTemplateData { answers, reply } => {
            let _ = reply.send(ctx.control.post_template_data(answers).await);
        }
        Command::GetCalibration(reply) => {
            let _ = reply.send(ctx.control.get_calibration().await);
        }
        Command::GetErrors(reply) => {
            let _ = reply.send(ctx.control.get_errors().await);
        }
        Command::EstimateTimeOffset(reply) => {
            let time_echo_port = ctx.status_rx.borrow().phone.time_echo_port;
            let result = match time_echo_port {
                None => Err(Error::TimeEchoNotSupported),
                Some(port) => {
                    TimeOffsetEstimator::new(ctx.host.clone(), port)
                        .estimate()
                        .await
                }
            };
            let _ = reply.send(result);
        }
        Command::StreamingStart(reply) => {
            let _ = reply.send(ctx.hub.start_all().await);
        }
        Command::StreamingStop(reply) => {
            ctx.hub.stop().await;
            let _ = reply.send(Ok(()));
        }
        Command::ReceiveGaze(timeout, reply) => {
            let result = async {
                let rx = ctx.hub.gaze().await?;
                recv_with_timeout(rx, timeout).await
            }
            .await;
            let _ = reply.send(result);
        }
        Command::ReceiveSceneFrame(timeout, reply) => {
            let result = async {
                let rx = ctx.hub.scene().await?;
                recv_with_timeout(rx, timeout).await
            }
            .await;
            let _ = reply.send(result);
        }
        Command::ReceiveEyesFrame(timeout, reply) => {
            let result = async {
                let rx = ctx.hub.eyes().await?;
                recv_with_timeout(rx, timeout).await
            }
            .await;
            let _ = reply.send(result);
        }
        Command::ReceiveImu(timeout, reply) => {
            let result = async {
                let rx = ctx.hub.imu().await?;
                recv_with_timeout(rx, timeout).await
            }
            .await;
            let _ = reply.send(result);
        }
        Command::ReceiveEyeEvent(timeout, reply) => {
            let result = async {
                let rx = ctx.hub.eye_events().await?;
                recv_with_timeout(rx, timeout).await
            }
            .await;
            let _ = reply.send(result);
        }
        Command::ReceiveMatchedSceneGaze(timeout, reply) => {
            let result = async {
                let rx = ctx.hub.matched_pair().await?;
                recv_with_timeout(rx, timeout).await
            }
            .await;
            let _ = reply.send(result);
        }
        Command::ReceiveMatchedSceneEyesGaze(timeout, reply) => {
            let result = async {
                let rx = ctx.hub.matched_triple().await?;
                recv_with_timeout(rx, timeout).await
            }
            .await;
            let _ = reply.send(result);
        }
        Command::Close(_) => unreachable!("handled in the worker loop"),
    }
}

async fn recv_with_timeout<T: Clone>(
    mut rx: broadcast::Receiver<T>,
    timeout: Duration,
) -> Result<Option<T>> {
    let next = async {
        loop {
            match rx.recv().await {
                Ok(item) => return Ok(Some(item)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Receiver lagged; skipped {skipped} samples");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::StreamClosed),
            }
        }
    };
    match tokio::time::timeout(timeout, next).await {
        Ok(result) => result,
        Err(_) => Ok(None),
    }
}

const FANOUT_DEPTH: usize = 64;

struct HubInner {
    gaze: Option<broadcast::Sender<Timestamped<GazeSample>>>,
    scene: Option<broadcast::Sender<Timestamped<VideoFrame>>>,
    eyes: Option<broadcast::Sender<Timestamped<VideoFrame>>>,
    imu: Option<broadcast::Sender<Timestamped<ImuFrame>>>,
    eye_events: Option<broadcast::Sender<Timestamped<EyeEvent>>>,
    matched_pair: Option<broadcast::Sender<MatchedSceneGaze>>,
    matched_triple: Option<broadcast::Sender<MatchedSceneEyesGaze>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Lazily started sensor streams fanned out to broadcast channels
struct StreamHub {
    status_rx: watch::Receiver<Arc<Status>>,
    streaming_config: StreamingConfig,
    matching_config: MatchingConfig,
    inner: Mutex<HubInner>,
}

impl StreamHub {
    fn new(status_rx: watch::Receiver<Arc<Status>>) -> Self {
        Self {
            status_rx,
            streaming_config: StreamingConfig::default(),
            matching_config: MatchingConfig::default(),
            inner: Mutex::new(HubInner {
                gaze: None,
                scene: None,
                eyes: None,
                imu: None,
                eye_events: None,
                matched_pair: None,
                matched_triple: None,
                tasks: Vec::new(),
            }),
        }
    }

    fn sensor_url(&self, pick: impl Fn(&Status) -> Option<String>, name: &str) -> Result<String> {
        pick(&self.status_rx.borrow())
            .ok_or_else(|| Error::Rtsp(format!("{name} sensor is not connected")))
    }

    async fn gaze(&self) -> Result<broadcast::Receiver<Timestamped<GazeSample>>> {
        let mut inner = self.inner.lock().await;
        if let Some(tx) = &inner.gaze {
            return Ok(tx.subscribe());
        }
        let url = self.sensor_url(|s| s.direct_gaze_sensor().and_then(|x| x.url()), "gaze")?;
        let mut stream = GazeStream::connect(&url, self.streaming_config.clone()).await?;
        let (tx, rx) = broadcast::channel(FANOUT_DEPTH);
        let pump_tx = tx.clone();
        inner.tasks.push(tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Ok(Some(sample)) => {
                        let _ = pump_tx.send(sample);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Gaze stream ended: {e}");
                        break;
                    }
                }
            }
        }));
        inner.gaze = Some(tx);
        Ok(rx)
    }

    async fn video(
        &self,
        pick_eyes: bool,
    ) -> Result<broadcast::Receiver<Timestamped<VideoFrame>>> {
        let mut inner = self.inner.lock().await;
        let slot = if pick_eyes { &inner.eyes } else { &inner.scene };
        if let Some(tx) = slot {
            return Ok(tx.subscribe());
        }
        let (url, label) = if pick_eyes {
            (
                self.sensor_url(|s| s.direct_eyes_sensor().and_then(|x| x.url()), "eyes")?,
                "eyes",
            )
        } else {
            (
                self.sensor_url(|s| s.direct_world_sensor().and_then(|x| x.url()), "world")?,
                "world",
            )
        };
        let mut stream = VideoStream::connect(&url, self.streaming_config.clone()).await?;
        let (tx, rx) = broadcast::channel(FANOUT_DEPTH);
        let pump_tx = tx.clone();
        inner.tasks.push(tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Ok(Some(frame)) => {
                        let _ = pump_tx.send(frame);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("{label} video stream ended: {e}");
                        break;
                    }
                }
            }
        }));
        if pick_eyes {
            inner.eyes = Some(tx);
        } else {
            inner.scene = Some(tx);
        }
        Ok(rx)
    }

    async fn scene(&self) -> Result<broadcast::Receiver<Timestamped<VideoFrame>>> {
        self.video(false).await
    }

    async fn eyes(&self) -> Result<broadcast::Receiver<Timestamped<VideoFrame>>> {
        self.video(true).await
    }

    async fn imu(&self) -> Result<broadcast::Receiver<Timestamped<ImuFrame>>> {
        let mut inner = self.inner.lock().await;
        if let Some(tx) = &inner.imu {
            return Ok(tx.subscribe());
        }
        let url = self.sensor_url(|s| s.direct_imu_sensor().and_then(|x| x.url()), "imu")?;
        let mut stream = ImuStream::connect(&url, self.streaming_config.clone()).await?;
        let (tx, rx) = broadcast::channel(FANOUT_DEPTH);
        let pump_tx = tx.clone();
        inner.tasks.push(tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Ok(Some(frame)) => {
                        let _ = pump_tx.send(frame);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("IMU stream ended: {e}");
                        break;
                    }
                }
            }
        }));
        inner.imu = Some(tx);
        Ok(rx)
    }

    async fn eye_events(&self) -> Result<broadcast::Receiver<Timestamped<EyeEvent>>> {
        let mut inner = self.inner.lock().await;
        if let Some(tx) = &inner.eye_events {
            return Ok(tx.subscribe());
        }
        let url = self.sensor_url(
            |s| s.direct_eye_events_sensor().and_then(|x| x.url()),
            "eye_events",
        )?;
        let mut stream = EyeEventStream::connect(&url, self.streaming_config.clone()).await?;
        let (tx, rx) = broadcast::channel(FANOUT_DEPTH);
        let pump_tx = tx.clone();
        inner.tasks.push(tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Ok(Some(event)) => {
                        let _ = pump_tx.send(event);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Eye event stream ended: {e}");
                        break;
                    }
                }
            }
        }));
        inner.eye_events = Some(tx);
        Ok(rx)
    }

    async fn matched_pair(&self) -> Result<broadcast::Receiver<MatchedSceneGaze>> {
        {
            let inner = self.inner.lock().await;
            if let Some(tx) = &inner.matched_pair {
                return Ok(tx.subscribe());
            }
        }

        let scene_rx = self.scene().await?;
        let gaze_rx = self.gaze().await?;

        let mut engine = MatchingEngine::new(self.matching_config.clone());
        let leader = engine.leader_producer().expect("fresh engine");
        let gaze_producer = engine.add_follower(None);

        let (tx, rx) = broadcast::channel(FANOUT_DEPTH);
        let out_tx = tx.clone();

        let mut inner = self.inner.lock().await;
        inner
            .tasks
            .push(tokio::spawn(pump_frames_into(scene_rx, leader, true)));
        inner
            .tasks
            .push(tokio::spawn(pump_gaze_into(gaze_rx, gaze_producer)));
        inner.tasks.push(tokio::spawn(async move {
            while let Some(matched) = engine.next_matched().await {
                let Some(pair) = to_matched_pair(&matched) else {
                    continue;
                };
                let _ = out_tx.send(pair);
            }
        }));
        inner.matched_pair = Some(tx);
        Ok(rx)
    }

    async fn matched_triple(&self) -> Result<broadcast::Receiver<MatchedSceneEyesGaze>> {
        {
            let inner = self.inner.lock().await;
            if let Some(tx) = &inner.matched_triple {
                return Ok(tx.subscribe());
            }
        }

        let scene_rx = self.scene().await?;
        let eyes_rx = self.eyes().await?;
        let gaze_rx = self.gaze().await?;

        let mut engine = MatchingEngine::new(self.matching_config.clone());
        let leader = engine.leader_producer().expect("fresh engine");
        let eyes_producer = engine.add_follower(None);
        let gaze_producer = engine.add_follower(None);

        let (tx, rx) = broadcast::channel(FANOUT_DEPTH);
        let out_tx = tx.clone();

        let mut inner = self.inner.lock().await;
        inner
            .tasks
            .push(tokio::spawn(pump_frames_into(scene_rx, leader, true)));
        inner
            .tasks
            .push(tokio::spawn(pump_frames_into(eyes_rx, eyes_producer, false)));
        inner
            .tasks
            .push(tokio::spawn(pump_gaze_into(gaze_rx, gaze_producer)));
        inner.tasks.push(tokio::spawn(async move {
            while let Some(matched) = engine.next_matched().await {
                let Some(triple) = to_matched_triple(&matched) else {
                    continue;
                };
                let _ = out_tx.send(triple);
            }
        }));
        inner.matched_triple = Some(tx);
        Ok(rx)
    }

    /// Open every stream the current status advertises
    async fn start_all(&self) -> Result<()> {
        let status = self.status_rx.borrow().clone();
        if status.direct_gaze_sensor().and_then(|s| s.url()).is_some() {
            self.gaze().await?;
        }
        if status.direct_world_sensor().and_then(|s| s.url()).is_some() {
            self.scene().await?;
        }
        if status.direct_eyes_sensor().and_then(|s| s.url()).is_some() {
            self.eyes().await?;
        }
        if status.direct_imu_sensor().and_then(|s| s.url()).is_some() {
            self.imu().await?;
        }
        if status
            .direct_eye_events_sensor()
            .and_then(|s| s.url())
            .is_some()
        {
            self.eye_events().await?;
        }
        Ok(())
    }

    async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        for task in inner.tasks.drain(..) {
            task.abort();
        }
        inner.gaze = None;
        inner.scene = None;
        inner.eyes = None;
        inner.imu = None;
        inner.eye_events = None;
        inner.matched_pair = None;
        inner.matched_triple = None;
    }
}

async fn pump_frames_into(
    mut rx: broadcast::Receiver<Timestamped<VideoFrame>>,
    producer: SampleProducer,
    leader: bool,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                let Some(wall_clock_ns) = frame.wall_clock_ns else {
                    debug!("Skipping frame without wall clock for matching");
                    continue;
                };
                let sample = TimedSample {
                    wall_clock_ns,
                    sample: if leader {
                        StreamSample::SceneFrame(frame.value)
                    } else {
                        StreamSample::EyesFrame(frame.value)
                    },
                };
                if let Err(e) = producer.push(sample) {
                    warn!("Matching queue rejected frame: {e}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn pump_gaze_into(
    mut rx: broadcast::Receiver<Timestamped<GazeSample>>,
    producer: SampleProducer,
) {
    loop {
        match rx.recv().await {
            Ok(sample) => {
                let Some(wall_clock_ns) = sample.wall_clock_ns else {
                    continue;
                };
                let sample = TimedSample {
                    wall_clock_ns,
                    sample: StreamSample::Gaze(sample.value),
                };
                if let Err(e) = producer.push(sample) {
                    warn!("Matching queue rejected gaze sample: {e}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn timed_to_frame(sample: &TimedSample) -> Option<Timestamped<VideoFrame>> {
    match &sample.sample {
        StreamSample::SceneFrame(frame) | StreamSample::EyesFrame(frame) => Some(Timestamped {
            value: frame.clone(),
            wall_clock_ns: Some(sample.wall_clock_ns),
        }),
        _ => None,
    }
}

fn timed_to_gaze(sample: &TimedSample) -> Option<Timestamped<GazeSample>> {
    match &sample.sample {
        StreamSample::Gaze(gaze) => Some(Timestamped {
            value: *gaze,
            wall_clock_ns: Some(sample.wall_clock_ns),
        }),
        _ => None,
    }
}

fn to_matched_pair(matched: &crate::matching::MatchedSample) -> Option<MatchedSceneGaze> {
    Some(MatchedSceneGaze {
        frame: timed_to_frame(&matched.leader)?,
        gaze: timed_to_gaze(matched.followers.first()?.as_ref()?)?,
    })
}

fn to_matched_triple(matched: &crate::matching::MatchedSample) -> Option<MatchedSceneEyesGaze> {
    Some(MatchedSceneEyesGaze {
        scene: timed_to_frame(&matched.leader)?,
        eyes: timed_to_frame(matched.followers.first()?.as_ref()?)?,
        gaze: timed_to_gaze(matched.followers.get(1)?.as_ref()?)?,
    })
}
