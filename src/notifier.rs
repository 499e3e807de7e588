//! WebSocket status mirror
//!
//! The device pushes one status component per WebSocket text message on
//! `ws://<host>:<port>/api/status`, reusing the HTTP status representation.
//! The notifier parses each message, folds it into a cached [`Status`], and
//! publishes both the raw component and the updated snapshot.
//!
//! Readers never lock: the current snapshot lives in a watch cell as an
//! `Arc<Status>` that is atomically swapped by the notifier task, which is
//! the only writer.

use crate::error::{Error, Result};
use crate::model::{parse_component, Component, Status};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Notification fanned out to subscribers
#[derive(Debug, Clone)]
pub enum NotifierEvent {
    /// A component delta was applied to the cached status
    Component(Component),
    /// The WebSocket closed; no further updates will arrive
    ///
    /// Reconnecting is the caller's responsibility.
    Closed,
}

/// Subscribes to the status WebSocket and keeps a [`Status`] mirror current
pub struct StatusNotifier {
    status_rx: watch::Receiver<Arc<Status>>,
    events_tx: broadcast::Sender<NotifierEvent>,
    task: Option<JoinHandle<()>>,
}

impl StatusNotifier {
    /// Connect to the status channel, seeding the mirror with `initial`
    ///
    /// `initial` is normally the result of
    /// [`ControlClient::get_status`](crate::control::ControlClient::get_status)
    /// so the mirror starts complete rather than empty.
    pub async fn connect(host: &str, port: u16, initial: Status) -> Result<Self> {
        let url = format!("ws://{host}:{port}/api/status");
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocket(format!("connect {url}: {e}")))?;
        debug!("Status channel connected: {url}");

        let (status_tx, status_rx) = watch::channel(Arc::new(initial.clone()));
        let (events_tx, _) = broadcast::channel(64);
        let task_events_tx = events_tx.clone();
        let task = tokio::spawn(receiver_task(ws, initial, status_tx, task_events_tx));

        Ok(Self {
            status_rx,
            events_tx,
            task: Some(task),
        })
    }

    /// Current status snapshot, without locking or I/O
    pub fn status(&self) -> Arc<Status> {
        self.status_rx.borrow().clone()
    }

    /// A watch handle on the status snapshot, for `changed()`-style waiting
    pub fn status_watch(&self) -> watch::Receiver<Arc<Status>> {
        self.status_rx.clone()
    }

    /// Subscribe to component deltas and the terminal close event
    pub fn subscribe(&self) -> broadcast::Receiver<NotifierEvent> {
        self.events_tx.subscribe()
    }

    /// Whether the notifier task is still mirroring
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop mirroring and release the socket
    pub async fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for StatusNotifier {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn receiver_task(
    ws: WsStream,
    mut status: Status,
    status_tx: watch::Sender<Arc<Status>>,
    events_tx: broadcast::Sender<NotifierEvent>,
) {
    let (mut write, mut read) = ws.split();

    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let raw: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!("Dropping undecodable status message: {e}");
                        continue;
                    }
                };
                match parse_component(&raw) {
                    Ok(component) => {
                        status.apply(component.clone());
                        status_tx.send_replace(Arc::new(status.clone()));
                        let _ = events_tx.send(NotifierEvent::Component(component));
                    }
                    Err(Error::UnknownComponent(model)) => {
                        warn!(model, "Dropping unknown status component");
                    }
                    Err(e) => warn!("Dropping malformed status component: {e}"),
                }
            }
            Ok(Message::Ping(payload)) => {
                if write.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                debug!("Status channel closed by device");
                break;
            }
            Err(e) => {
                warn!("Status channel error: {e}");
                break;
            }
            Ok(_) => {}
        }
    }

    let _ = events_tx.send(NotifierEvent::Closed);
}
