//! Status model: device components, wire parsing, and the status reducer
//!
//! The device describes itself as a list of tagged components, both in the
//! `GET /api/status` response and in every WebSocket push message. Each wire
//! component is a `{"model": ..., "data": {...}}` object; [`parse_component`]
//! turns it into a [`Component`] and [`Status::apply`] folds it into the
//! aggregate [`Status`].

mod calibration;
mod template;

pub use calibration::{CameraCalibration, Calibration};
pub use template::{
    InputType, Template, TemplateItem, TemplateItemError, TemplateResponses, WidgetType,
};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

fn default_unknown() -> String {
    "unknown".to_string()
}

fn default_protocol() -> String {
    "rtsp".to_string()
}

/// Battery charge classification reported by the companion phone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatteryState {
    /// Sufficient charge
    #[default]
    Ok,
    /// Charge is running low
    Low,
    /// No battery detected
    NoBattery,
}

/// Storage classification reported by the companion phone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryState {
    /// Sufficient free storage
    #[default]
    Ok,
    /// Free storage is running low
    Low,
    /// Free storage is critically low; recordings may fail
    Critical,
}

/// The companion phone running the device app
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Phone {
    /// Stable device identifier
    pub device_id: String,
    /// Human-readable device name
    pub device_name: String,
    /// Battery level in percent (0..=100)
    pub battery_level: u8,
    /// Battery charge classification
    #[serde(default)]
    pub battery_state: BatteryState,
    /// IP address of the phone on the local network
    pub ip: String,
    /// Free storage in bytes
    pub memory: u64,
    /// Storage classification
    #[serde(default)]
    pub memory_state: MemoryState,
    /// UDP port of the time echo service, if the app exposes one
    #[serde(default)]
    pub time_echo_port: Option<u16>,
}

/// The connected glasses hardware
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hardware {
    /// Hardware generation
    #[serde(default = "default_unknown")]
    pub version: String,
    /// Serial of the attached module
    #[serde(default = "default_unknown")]
    pub module_serial: String,
    /// Serial of the glasses frame
    #[serde(default = "default_unknown")]
    pub glasses_serial: String,
    /// Serial of the scene camera
    #[serde(default = "default_unknown")]
    pub world_camera_serial: String,
}

impl Default for Hardware {
    fn default() -> Self {
        Self {
            version: default_unknown(),
            module_serial: default_unknown(),
            glasses_serial: default_unknown(),
            world_camera_serial: default_unknown(),
        }
    }
}

/// Kinds of sensor streams the device can publish
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SensorName {
    /// Scene ("world") camera video
    World,
    /// Eye cameras video
    Eyes,
    /// Gaze data
    Gaze,
    /// Inertial measurement unit
    Imu,
    /// Audio
    Audio,
    /// Fixation/saccade/blink events
    EyeEvents,
}

/// How a sensor stream is delivered
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionType {
    /// Streamed directly over RTSP
    Direct,
    /// Relayed over the WebSocket channel
    Websocket,
}

/// One sensor stream endpoint
///
/// A sensor is uniquely keyed by `(sensor, connection)`; status updates
/// upsert on that key and never remove entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    /// Which sensor this entry describes
    pub sensor: SensorName,
    /// Delivery channel
    #[serde(rename = "conn_type")]
    pub connection: ConnectionType,
    /// Whether the stream is currently available
    #[serde(default)]
    pub connected: bool,
    /// Stream host address
    #[serde(default)]
    pub ip: Option<String>,
    /// Stream port
    #[serde(default)]
    pub port: Option<u16>,
    /// Stream protocol (always `rtsp` for direct connections)
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Query parameters to append to the stream URL
    #[serde(default)]
    pub params: Option<String>,
    /// Whether the device reported a fault on this stream
    #[serde(default)]
    pub stream_error: bool,
}

impl Sensor {
    /// Unique key of this sensor entry
    pub fn key(&self) -> (SensorName, ConnectionType) {
        (self.sensor, self.connection)
    }

    /// Stream URL (`rtsp://<ip>:<port>/?<params>`), available while connected
    pub fn url(&self) -> Option<String> {
        if !self.connected {
            return None;
        }
        let ip = self.ip.as_deref()?;
        let port = self.port?;
        let params = self.params.as_deref().unwrap_or("");
        Some(format!("{}://{}:{}/?{}", self.protocol, ip, port, params))
    }
}

/// Recording lifecycle actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingAction {
    /// A recording has started
    Start,
    /// The recording stopped
    Stop,
    /// The recording was stopped and saved
    Save,
    /// The recording was discarded
    Cancel,
    /// The recording failed
    Error,
}

/// The active (or just-finished) recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// Recording identifier
    pub id: Uuid,
    /// Latest lifecycle action
    pub action: RecordingAction,
    /// Device-side status message
    #[serde(default)]
    pub message: String,
    /// Elapsed duration in nanoseconds
    #[serde(default)]
    pub rec_duration_ns: u64,
}

impl Recording {
    /// Elapsed duration in seconds
    pub fn duration_seconds(&self) -> f64 {
        self.rec_duration_ns as f64 / 1e9
    }
}

/// Another API host visible on the network, reported via the status channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDevice {
    /// Full advertised instance name
    pub name: String,
    /// DNS host name
    #[serde(default)]
    pub host: String,
    /// IPv4 address, if resolved
    #[serde(default)]
    pub ipv4: Option<String>,
    /// Service port
    #[serde(default)]
    pub port: Option<u16>,
    /// Advertised TXT records
    #[serde(default)]
    pub txt_records: BTreeMap<String, String>,
}

/// A single parsed status component
#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    /// Companion phone state
    Phone(Phone),
    /// Glasses hardware state
    Hardware(Hardware),
    /// One sensor stream endpoint
    Sensor(Sensor),
    /// Recording lifecycle update
    Recording(Recording),
    /// Network peer update
    NetworkDevice(NetworkDevice),
    /// Template descriptor update
    Template(Template),
}

impl Component {
    /// The wire `model` tag of this component
    pub fn model(&self) -> &'static str {
        match self {
            Component::Phone(_) => "Phone",
            Component::Hardware(_) => "Hardware",
            Component::Sensor(_) => "Sensor",
            Component::Recording(_) => "Recording",
            Component::NetworkDevice(_) => "NetworkDevice",
            Component::Template(_) => "Template",
        }
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(model: &str, data: serde_json::Value) -> Result<T> {
    serde_json::from_value(data).map_err(|source| Error::MalformedComponent {
        model: model.to_string(),
        source,
    })
}

/// Parse a wire `{"model": ..., "data": {...}}` object into a [`Component`]
///
/// Dispatches on the `model` tag. Unrecognized tags fail with
/// [`Error::UnknownComponent`]; callers mirroring a status feed should drop
/// such components with a warning instead of aborting the whole update.
pub fn parse_component(raw: &serde_json::Value) -> Result<Component> {
    let model = raw
        .get("model")
        .and_then(|m| m.as_str())
        .ok_or_else(|| Error::UnknownComponent("<missing model tag>".to_string()))?;
    let data = raw.get("data").cloned().unwrap_or(serde_json::Value::Null);
    match model {
        "Phone" => Ok(Component::Phone(parse_data(model, data)?)),
        "Hardware" => Ok(Component::Hardware(parse_data(model, data)?)),
        "Sensor" => Ok(Component::Sensor(parse_data(model, data)?)),
        "Recording" => Ok(Component::Recording(parse_data(model, data)?)),
        "NetworkDevice" => Ok(Component::NetworkDevice(parse_data(model, data)?)),
        "Template" => Ok(Component::Template(parse_data(model, data)?)),
        other => Err(Error::UnknownComponent(other.to_string())),
    }
}

/// Serialize a [`Component`] back into its wire representation
pub fn serialize_component(component: &Component) -> serde_json::Value {
    let data = match component {
        Component::Phone(c) => serde_json::to_value(c),
        Component::Hardware(c) => serde_json::to_value(c),
        Component::Sensor(c) => serde_json::to_value(c),
        Component::Recording(c) => serde_json::to_value(c),
        Component::NetworkDevice(c) => serde_json::to_value(c),
        Component::Template(c) => serde_json::to_value(c),
    }
    .expect("component serialization is infallible");
    serde_json::json!({ "model": component.model(), "data": data })
}

/// Aggregate device state mirrored from the status API
///
/// Exactly one phone and one hardware entry exist at any time; sensors form a
/// set keyed by `(sensor, connection)`; at most one recording is active.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Status {
    /// Companion phone state
    pub phone: Phone,
    /// Glasses hardware state
    pub hardware: Hardware,
    /// Known sensor stream endpoints
    pub sensors: Vec<Sensor>,
    /// Active recording, if any
    pub recording: Option<Recording>,
    /// Other API hosts on the network
    pub network_devices: Vec<NetworkDevice>,
    /// Currently selected template
    pub template: Option<Template>,
    /// API version tag advertised with the status response
    pub api_version: Option<String>,
}

impl Status {
    /// Build a status from the raw component list of a `GET /status` response
    ///
    /// Unknown components are dropped with a warning.
    pub fn from_components(raw_components: &[serde_json::Value]) -> Self {
        let mut status = Status::default();
        for raw in raw_components {
            match parse_component(raw) {
                Ok(component) => status.apply(component),
                Err(err) => warn!("Dropping status component: {err}"),
            }
        }
        status
            .sensors
            .sort_by_key(|s| (!s.connected, s.connection, s.sensor));
        status
    }

    /// Fold one component delta into the aggregate
    pub fn apply(&mut self, component: Component) {
        match component {
            Component::Phone(phone) => self.phone = phone,
            Component::Hardware(hardware) => self.hardware = hardware,
            Component::Sensor(sensor) => {
                match self.sensors.iter_mut().find(|s| s.key() == sensor.key()) {
                    Some(existing) => *existing = sensor,
                    None => self.sensors.push(sensor),
                }
            }
            Component::Recording(recording) => match recording.action {
                RecordingAction::Stop | RecordingAction::Save | RecordingAction::Cancel => {
                    self.recording = None;
                }
                RecordingAction::Start | RecordingAction::Error => {
                    self.recording = Some(recording);
                }
            },
            Component::NetworkDevice(device) => {
                match self
                    .network_devices
                    .iter_mut()
                    .find(|d| d.name == device.name)
                {
                    Some(existing) => *existing = device,
                    None => self.network_devices.push(device),
                }
            }
            Component::Template(template) => self.template = Some(template),
        }
    }

    fn direct_sensor(&self, name: SensorName) -> Option<&Sensor> {
        self.sensors
            .iter()
            .find(|s| s.sensor == name && s.connection == ConnectionType::Direct)
    }

    /// The directly-streamed scene camera sensor, if known
    pub fn direct_world_sensor(&self) -> Option<&Sensor> {
        self.direct_sensor(SensorName::World)
    }

    /// The directly-streamed gaze sensor, if known
    pub fn direct_gaze_sensor(&self) -> Option<&Sensor> {
        self.direct_sensor(SensorName::Gaze)
    }

    /// The directly-streamed eye cameras sensor, if known
    pub fn direct_eyes_sensor(&self) -> Option<&Sensor> {
        self.direct_sensor(SensorName::Eyes)
    }

    /// The directly-streamed IMU sensor, if known
    pub fn direct_imu_sensor(&self) -> Option<&Sensor> {
        self.direct_sensor(SensorName::Imu)
    }

    /// The directly-streamed eye events sensor, if known
    pub fn direct_eye_events_sensor(&self) -> Option<&Sensor> {
        self.direct_sensor(SensorName::EyeEvents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn phone_component(battery_level: u8) -> serde_json::Value {
        json!({
            "model": "Phone",
            "data": {
                "device_id": "1ab2",
                "device_name": "OnePlus 8",
                "battery_level": battery_level,
                "battery_state": "OK",
                "ip": "192.168.1.21",
                "memory": 42_000_000_000u64,
                "memory_state": "OK",
                "time_echo_port": 12321,
            }
        })
    }

    fn gaze_sensor_component(connected: bool) -> serde_json::Value {
        json!({
            "model": "Sensor",
            "data": {
                "sensor": "gaze",
                "conn_type": "DIRECT",
                "connected": connected,
                "ip": "192.168.1.21",
                "port": 8086,
                "protocol": "rtsp",
                "params": "camera=gaze",
                "stream_error": false,
            }
        })
    }

    #[test]
    fn test_parse_phone_component() {
        let component = parse_component(&phone_component(80)).unwrap();
        match component {
            Component::Phone(phone) => {
                assert_eq!(phone.battery_level, 80);
                assert_eq!(phone.battery_state, BatteryState::Ok);
                assert_eq!(phone.time_echo_port, Some(12321));
            }
            other => panic!("expected Phone, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_model_fails() {
        let raw = json!({"model": "Gizmo", "data": {}});
        match parse_component(&raw) {
            Err(Error::UnknownComponent(model)) => assert_eq!(model, "Gizmo"),
            other => panic!("expected UnknownComponent, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_component_reports_model() {
        let raw = json!({"model": "Phone", "data": {"device_id": 7}});
        match parse_component(&raw) {
            Err(Error::MalformedComponent { model, .. }) => assert_eq!(model, "Phone"),
            other => panic!("expected MalformedComponent, got {other:?}"),
        }
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let components = vec![
            parse_component(&phone_component(63)).unwrap(),
            parse_component(&gaze_sensor_component(true)).unwrap(),
            Component::Hardware(Hardware::default()),
            Component::Recording(Recording {
                id: Uuid::nil(),
                action: RecordingAction::Start,
                message: String::new(),
                rec_duration_ns: 1_500_000_000,
            }),
            Component::NetworkDevice(NetworkDevice {
                name: "PI monitor:Ava:1ab2".to_string(),
                host: "pi.local.".to_string(),
                ipv4: Some("192.168.1.22".to_string()),
                port: Some(8080),
                txt_records: BTreeMap::new(),
            }),
        ];
        for component in components {
            let wire = serialize_component(&component);
            let parsed = parse_component(&wire).unwrap();
            assert_eq!(parsed, component);
        }
    }

    #[test]
    fn test_status_mirror_single_field_transition() {
        // Seed with battery at 80, push an update at 79: exactly that field moves.
        let mut status = Status::from_components(&[phone_component(80)]);
        assert_eq!(status.phone.battery_level, 80);
        let before = status.clone();

        status.apply(parse_component(&phone_component(79)).unwrap());
        assert_eq!(status.phone.battery_level, 79);
        assert_eq!(status.phone.device_name, before.phone.device_name);
        assert_eq!(status.sensors, before.sensors);
        assert_eq!(status.recording, before.recording);
    }

    #[test]
    fn test_sensor_upsert_keeps_disconnected_entry() {
        let mut status = Status::from_components(&[gaze_sensor_component(true)]);
        assert_eq!(status.sensors.len(), 1);
        assert!(status.direct_gaze_sensor().unwrap().connected);

        status.apply(parse_component(&gaze_sensor_component(false)).unwrap());
        assert_eq!(status.sensors.len(), 1);
        assert!(!status.direct_gaze_sensor().unwrap().connected);
        assert!(status.direct_gaze_sensor().unwrap().url().is_none());
    }

    #[test]
    fn test_sensor_url_while_connected() {
        let status = Status::from_components(&[gaze_sensor_component(true)]);
        assert_eq!(
            status.direct_gaze_sensor().unwrap().url().unwrap(),
            "rtsp://192.168.1.21:8086/?camera=gaze"
        );
    }

    #[test]
    fn test_recording_actions_clear_or_set() {
        let mut status = Status::default();
        let start = Recording {
            id: Uuid::nil(),
            action: RecordingAction::Start,
            message: String::new(),
            rec_duration_ns: 0,
        };
        status.apply(Component::Recording(start.clone()));
        assert!(status.recording.is_some());

        let save = Recording {
            action: RecordingAction::Save,
            ..start
        };
        status.apply(Component::Recording(save));
        assert!(status.recording.is_none());
    }

    #[test]
    fn test_distinct_singletons_commute() {
        let phone = parse_component(&phone_component(50)).unwrap();
        let hardware = Component::Hardware(Hardware {
            version: "neon".to_string(),
            ..Hardware::default()
        });

        let mut a = Status::default();
        a.apply(phone.clone());
        a.apply(hardware.clone());

        let mut b = Status::default();
        b.apply(hardware);
        b.apply(phone);

        assert_eq!(a, b);
    }

    #[test]
    fn test_same_key_last_write_wins() {
        let mut status = Status::default();
        status.apply(parse_component(&gaze_sensor_component(false)).unwrap());
        status.apply(parse_component(&gaze_sensor_component(true)).unwrap());
        assert_eq!(status.sensors.len(), 1);
        assert!(status.sensors[0].connected);
    }
}
