//! HTTP control client for the device REST API
//!
//! All control endpoints live under `http://<host>:<port>/api`. Successful
//! responses wrap their payload in `{"result": ...}`; failures carry
//! `{"message": ...}` with a 4xx status. The client parses both shapes and
//! maps device refusals onto the typed error taxonomy.

use crate::discovery::DiscoveredDevice;
use crate::error::{Error, Result};
use crate::model::{Calibration, Status, Template, TemplateResponses};
use crate::time_echo::local_now_ns;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Why the device refused to start a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingStartReason {
    /// The selected template has unanswered required items
    Template,
    /// Phone battery too low
    LowBattery,
    /// Phone storage too low
    LowStorage,
    /// No wearer selected in the companion app
    NoWearer,
    /// No workspace selected in the companion app
    NoWorkspace,
    /// Companion app setup is incomplete
    SetupIncomplete,
    /// A recording is already running
    AlreadyRunning,
    /// Anything else; see the message
    Other,
}

fn classify_start_refusal(message: &str) -> RecordingStartReason {
    let lower = message.to_lowercase();
    if lower.contains("template") {
        RecordingStartReason::Template
    } else if lower.contains("battery") {
        RecordingStartReason::LowBattery
    } else if lower.contains("storage") || lower.contains("memory") {
        RecordingStartReason::LowStorage
    } else if lower.contains("wearer") {
        RecordingStartReason::NoWearer
    } else if lower.contains("workspace") {
        RecordingStartReason::NoWorkspace
    } else if lower.contains("setup") {
        RecordingStartReason::SetupIncomplete
    } else if lower.contains("already") {
        RecordingStartReason::AlreadyRunning
    } else {
        RecordingStartReason::Other
    }
}

/// An event acknowledged by the device
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Event {
    /// Event label
    pub name: Option<String>,
    /// Recording the event was attached to, if one was running
    #[serde(default)]
    pub recording_id: Option<String>,
    /// Authoritative device timestamp in nanoseconds since the Unix epoch
    #[serde(rename = "timestamp")]
    pub timestamp_unix_ns: i64,
}

/// A device-side error report from `GET /api/errors`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceErrorEntry {
    /// Error description
    pub message: String,
    /// Component the error originated from, if attributed
    #[serde(default)]
    pub component: Option<String>,
}

fn device_message(body: &serde_json::Value) -> String {
    body.get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("no error message")
        .to_string()
}

/// Extract `result` from a response, mapping non-2xx onto [`Error::Device`]
fn expect_result(status: u16, body: serde_json::Value) -> Result<serde_json::Value> {
    if !(200..300).contains(&status) {
        return Err(Error::Device {
            status,
            message: device_message(&body),
        });
    }
    Ok(body.get("result").cloned().unwrap_or(serde_json::Value::Null))
}

/// HTTP client for recording, event, template, and calibration commands
///
/// Cheap to clone; all clones share one connection pool. Dropping the last
/// clone releases the pool.
#[derive(Debug, Clone)]
pub struct ControlClient {
    base_url: String,
    client: reqwest::Client,
}

impl ControlClient {
    /// Create a client for the control API at `host:port`
    pub fn new(host: impl AsRef<str>, port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: format!("http://{}:{}/api", host.as_ref(), port),
            client,
        })
    }

    /// Create a client from a discovery record
    pub fn from_discovered(device: &DiscoveredDevice) -> Result<Self> {
        Self::new(device.address(), device.port)
    }

    /// Base URL of the control API (`http://<host>:<port>/api`)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json(&self, path: &str) -> Result<(u16, serde_json::Value)> {
        let response = self.client.get(format!("{}{path}", self.base_url)).send().await?;
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(serde_json::Value::Null);
        Ok((status, body))
    }

    async fn post_json(
        &self,
        path: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<(u16, serde_json::Value)> {
        let mut request = self.client.post(format!("{}{path}", self.base_url));
        if let Some(payload) = payload {
            request = request.json(&payload);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(serde_json::Value::Null);
        Ok((status, body))
    }

    /// Fetch the full device status
    pub async fn get_status(&self) -> Result<Status> {
        let (status, body) = self.get_json("/status").await?;
        let api_version = body
            .get("api_version")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let result = expect_result(status, body)?;
        let components = result
            .as_array()
            .cloned()
            .ok_or_else(|| Error::Device {
                status,
                message: "status result is not a component list".to_string(),
            })?;
        debug!("Received status with {} components", components.len());
        let mut parsed = Status::from_components(&components);
        parsed.api_version = api_version;
        Ok(parsed)
    }

    /// Start a recording; returns the new recording id
    ///
    /// Refusals (unanswered template, low battery, low storage, no wearer,
    /// no workspace, incomplete setup) surface as [`Error::RecordingStart`]
    /// with the device's message.
    pub async fn recording_start(&self) -> Result<String> {
        let (status, body) = self.post_json("/recording:start", None).await?;
        if !(200..300).contains(&status) {
            let message = device_message(&body);
            return Err(Error::RecordingStart {
                reason: classify_start_refusal(&message),
                message,
            });
        }
        body.get("result")
            .and_then(|r| r.get("id"))
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Device {
                status,
                message: "recording:start response carries no id".to_string(),
            })
    }

    /// Stop the running recording and save it
    pub async fn recording_stop_and_save(&self) -> Result<()> {
        let (status, body) = self.post_json("/recording:stop_and_save", None).await?;
        if !(200..300).contains(&status) {
            return Err(Error::RecordingStop(device_message(&body)));
        }
        Ok(())
    }

    /// Cancel the running recording, discarding its data
    pub async fn recording_cancel(&self) -> Result<()> {
        let (status, body) = self.post_json("/recording:cancel", None).await?;
        if !(200..300).contains(&status) {
            return Err(Error::RecordingStop(device_message(&body)));
        }
        Ok(())
    }

    /// Send a named event, stamped by the device on arrival
    ///
    /// Pass `timestamp_unix_ns` to stamp the event with a local clock reading
    /// instead. The response always carries the authoritative timestamp.
    pub async fn send_event(
        &self,
        name: &str,
        timestamp_unix_ns: Option<i64>,
    ) -> Result<Event> {
        let mut payload = json!({ "name": name });
        if let Some(timestamp) = timestamp_unix_ns {
            payload["timestamp"] = json!(timestamp);
        }
        let (status, body) = self.post_json("/event", Some(payload)).await?;
        let result = expect_result(status, body)?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a named event stamped with the local clock shifted into the
    /// device clock domain by a pre-computed offset (see
    /// [`TimeOffsetEstimator`](crate::time_echo::TimeOffsetEstimator))
    pub async fn send_event_with_offset(&self, name: &str, offset_ns: i64) -> Result<Event> {
        self.send_event(name, Some(local_now_ns() + offset_ns)).await
    }

    /// Fetch the template currently selected on the device
    pub async fn get_template(&self) -> Result<Template> {
        let (status, body) = self.get_json("/template").await?;
        let result = expect_result(status, body)?;
        Ok(serde_json::from_value(result)?)
    }

    /// Fetch the template answers currently entered on the device
    pub async fn get_template_data(&self) -> Result<TemplateResponses> {
        let (status, body) = self.get_json("/template/data").await?;
        let result = expect_result(status, body)?;
        Ok(serde_json::from_value(result)?)
    }

    /// Validate and post template answers
    ///
    /// Answers are merged over the data already entered on the device and
    /// validated against the current template before posting; validation
    /// failures surface as [`Error::InvalidTemplateAnswers`] without touching
    /// the device. The server's acknowledgement body is structurally empty
    /// and is not inspected.
    pub async fn post_template_data(&self, answers: TemplateResponses) -> Result<()> {
        let template = self.get_template().await?;
        let mut merged = self.get_template_data().await.unwrap_or_default();
        merged.extend(answers.clone());
        if let Err(errors) = template.validate(&merged) {
            return Err(Error::InvalidTemplateAnswers(errors));
        }

        // The API rejects empty answer lists; it expects [""] instead.
        let payload: TemplateResponses = answers
            .into_iter()
            .map(|(id, values)| {
                if values.is_empty() {
                    (id, vec![String::new()])
                } else {
                    (id, values)
                }
            })
            .collect();

        let (status, body) = self
            .post_json("/template/data", Some(serde_json::to_value(payload)?))
            .await?;
        expect_result(status, body)?;
        Ok(())
    }

    /// Fetch and parse the factory calibration blob
    pub async fn get_calibration(&self) -> Result<Calibration> {
        let response = self
            .client
            .get(format!("{}/calibration", self.base_url))
            .send()
            .await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(Error::Device {
                status,
                message: "failed to fetch calibration".to_string(),
            });
        }
        let blob = response.bytes().await?;
        Calibration::parse(&blob)
    }

    /// Fetch pending device-side error reports
    pub async fn get_errors(&self) -> Result<Vec<DeviceErrorEntry>> {
        let (status, body) = self.get_json("/errors").await?;
        let result = expect_result(status, body)?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_start_refusal() {
        assert_eq!(
            classify_start_refusal("Template has required fields"),
            RecordingStartReason::Template
        );
        assert_eq!(
            classify_start_refusal("Battery too low"),
            RecordingStartReason::LowBattery
        );
        assert_eq!(
            classify_start_refusal("Not enough storage"),
            RecordingStartReason::LowStorage
        );
        assert_eq!(
            classify_start_refusal("No wearer selected"),
            RecordingStartReason::NoWearer
        );
        assert_eq!(
            classify_start_refusal("Recording already running"),
            RecordingStartReason::AlreadyRunning
        );
        assert_eq!(
            classify_start_refusal("mysterious"),
            RecordingStartReason::Other
        );
    }

    #[test]
    fn test_expect_result_success() {
        let body = json!({"result": {"id": "R1"}});
        let result = expect_result(200, body).unwrap();
        assert_eq!(result["id"], "R1");
    }

    #[test]
    fn test_expect_result_device_error() {
        let body = json!({"message": "Recording not running"});
        match expect_result(400, body) {
            Err(Error::Device { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "Recording not running");
            }
            other => panic!("expected Device error, got {other:?}"),
        }
    }

    #[test]
    fn test_event_parsing() {
        let result = json!({
            "name": "mark",
            "recording_id": "R1",
            "timestamp": 1_700_000_000_000_000_000i64,
        });
        let event: Event = serde_json::from_value(result).unwrap();
        assert_eq!(event.name.as_deref(), Some("mark"));
        assert_eq!(event.recording_id.as_deref(), Some("R1"));
        assert_eq!(event.timestamp_unix_ns, 1_700_000_000_000_000_000);
    }

    #[test]
    fn test_event_without_recording() {
        let event: Event =
            serde_json::from_value(json!({"name": "mark", "timestamp": 12})).unwrap();
        assert_eq!(event.recording_id, None);
    }

    #[test]
    fn test_base_url() {
        let client = ControlClient::new("192.168.1.21", 8080).unwrap();
        assert_eq!(client.base_url(), "http://192.168.1.21:8080/api");
    }
}
