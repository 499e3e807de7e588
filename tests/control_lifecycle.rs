//! Recording lifecycle and template gating against a loopback HTTP stub

use pupil_realtime::{ControlClient, Error, RecordingStartReason};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Initialize test logging (call once per test)
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,pupil_realtime=debug")
        .try_init();
}

/// Device stub state shared across requests
#[derive(Default)]
struct StubState {
    template_answers: serde_json::Map<String, serde_json::Value>,
    recording_id: Option<String>,
}

impl StubState {
    fn template_complete(&self) -> bool {
        self.template_answers
            .get("q1")
            .and_then(|answers| answers.as_array())
            .map(|answers| answers.iter().any(|a| a.as_str() != Some("")))
            .unwrap_or(false)
    }
}

fn respond(state: &Arc<Mutex<StubState>>, method: &str, path: &str, body: &str) -> (u16, String) {
    let mut state = state.lock().unwrap();
    match (method, path) {
        ("GET", "/api/status") => {
            let components = json!([
                {
                    "model": "Phone",
                    "data": {
                        "device_id": "1ab2",
                        "device_name": "Ava's phone",
                        "battery_level": 80,
                        "battery_state": "OK",
                        "ip": "127.0.0.1",
                        "memory": 42_000_000_000u64,
                        "memory_state": "OK",
                    }
                },
                {
                    "model": "Hardware",
                    "data": {
                        "version": "neon",
                        "module_serial": "844425",
                        "glasses_serial": "7h1s1s",
                        "world_camera_serial": "s3r14l",
                    }
                },
            ]);
            (200, json!({"result": components}).to_string())
        }
        ("GET", "/api/template") => {
            let template = json!({
                "id": "tpl-1",
                "name": "Study intake",
                "items": [{
                    "id": "q1",
                    "title": "Participant id",
                    "widget_type": "TEXT",
                    "input_type": "any",
                    "required": true,
                    "choices": [],
                    "help_text": "",
                    "hidden": false,
                }],
                "recording_name_format": [],
            });
            (200, json!({"result": template}).to_string())
        }
        ("GET", "/api/template/data") => {
            (200, json!({"result": state.template_answers}).to_string())
        }
        ("POST", "/api/template/data") => {
            let answers: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(body).unwrap_or_default();
            state.template_answers.extend(answers);
            // The acknowledgement is structurally empty.
            (200, json!({"result": null}).to_string())
        }
        ("POST", "/api/recording:start") => {
            if !state.template_complete() {
                (400, json!({"message": "Template has required fields"}).to_string())
            } else if state.recording_id.is_some() {
                (400, json!({"message": "Recording already running"}).to_string())
            } else {
                state.recording_id = Some("R1".to_string());
                (200, json!({"result": {"id": "R1"}}).to_string())
            }
        }
        ("POST", "/api/recording:stop_and_save") => match state.recording_id.take() {
            Some(_) => (200, json!({"result": null}).to_string()),
            None => (400, json!({"message": "Recording not running"}).to_string()),
        },
        ("POST", "/api/event") => {
            let event: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
            let mut result = json!({
                "name": event.get("name"),
                "timestamp": event.get("timestamp").cloned()
                    .unwrap_or(json!(1_700_000_000_000_000_000i64)),
            });
            if let Some(id) = &state.recording_id {
                result["recording_id"] = json!(id);
            }
            (200, json!({"result": result}).to_string())
        }
        ("GET", "/api/errors") => (
            200,
            json!({"result": [{"message": "Stream backpressure", "component": "world"}]})
                .to_string(),
        ),
        _ => (404, json!({"message": "unknown endpoint"}).to_string()),
    }
}

/// One-connection-per-request HTTP stub
async fn spawn_http_stub(state: Arc<Mutex<StubState>>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let state = state.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);

                let mut request_line = String::new();
                if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                    return;
                }
                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or_default().to_string();
                let path = parts.next().unwrap_or_default().to_string();

                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let line = line.trim_end();
                    if line.is_empty() {
                        break;
                    }
                    if let Some(value) = line
                        .to_lowercase()
                        .strip_prefix("content-length:")
                        .map(str::trim)
                    {
                        content_length = value.parse().unwrap_or(0);
                    }
                }
                let mut body = vec![0u8; content_length];
                if content_length > 0 {
                    let _ = reader.read_exact(&mut body).await;
                }

                let (status, response_body) =
                    respond(&state, &method, &path, &String::from_utf8_lossy(&body));
                let response = format!(
                    "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{response_body}",
                    if status == 200 { "OK" } else { "Bad Request" },
                    response_body.len(),
                );
                let _ = write_half.write_all(response.as_bytes()).await;
            });
        }
    });

    port
}

#[tokio::test]
async fn test_get_status() {
    init_logging();
    let port = spawn_http_stub(Arc::default()).await;
    let client = ControlClient::new("127.0.0.1", port).unwrap();

    let status = client.get_status().await.unwrap();
    assert_eq!(status.phone.battery_level, 80);
    assert_eq!(status.hardware.glasses_serial, "7h1s1s");
}

#[tokio::test]
async fn test_template_gates_recording_start() {
    init_logging();
    let port = spawn_http_stub(Arc::default()).await;
    let client = ControlClient::new("127.0.0.1", port).unwrap();

    // Required item unanswered: the device refuses with a template reason.
    match client.recording_start().await {
        Err(Error::RecordingStart { reason, .. }) => {
            assert_eq!(reason, RecordingStartReason::Template);
        }
        other => panic!("expected RecordingStart error, got {other:?}"),
    }

    // Locally-validated invalid answers never reach the device.
    let empty = [("q1".to_string(), vec![String::new()])].into_iter().collect();
    match client.post_template_data(empty).await {
        Err(Error::InvalidTemplateAnswers(errors)) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].item_id, "q1");
        }
        other => panic!("expected InvalidTemplateAnswers, got {other:?}"),
    }

    // Valid answers unlock the recording.
    let answers = [("q1".to_string(), vec!["p-07".to_string()])]
        .into_iter()
        .collect();
    client.post_template_data(answers).await.unwrap();
    let recording_id = client.recording_start().await.unwrap();
    assert_eq!(recording_id, "R1");
}

#[tokio::test]
async fn test_recording_lifecycle_with_events() {
    init_logging();
    let state = Arc::new(Mutex::new(StubState::default()));
    state
        .lock()
        .unwrap()
        .template_answers
        .insert("q1".to_string(), json!(["p-07"]));
    let port = spawn_http_stub(state).await;
    let client = ControlClient::new("127.0.0.1", port).unwrap();

    let recording_id = client.recording_start().await.unwrap();
    assert_eq!(recording_id, "R1");

    // Events sent during a recording carry its id.
    let event = client.send_event("mark", None).await.unwrap();
    assert_eq!(event.name.as_deref(), Some("mark"));
    assert_eq!(event.recording_id.as_deref(), Some("R1"));

    // A client-stamped event echoes the submitted timestamp.
    let stamped = client.send_event("stimulus", Some(1_234)).await.unwrap();
    assert_eq!(stamped.timestamp_unix_ns, 1_234);

    client.recording_stop_and_save().await.unwrap();
    match client.recording_stop_and_save().await {
        Err(Error::RecordingStop(message)) => assert!(message.contains("not running")),
        other => panic!("expected RecordingStop, got {other:?}"),
    }

    // Starting again is allowed once stopped.
    assert_eq!(client.recording_start().await.unwrap(), "R1");
}

#[tokio::test]
async fn test_get_errors() {
    init_logging();
    let port = spawn_http_stub(Arc::default()).await;
    let client = ControlClient::new("127.0.0.1", port).unwrap();

    let errors = client.get_errors().await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].component.as_deref(), Some("world"));
}
