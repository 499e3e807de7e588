//! Device discovery over mDNS/DNS-SD
//!
//! Devices advertise their control API as `_http._tcp.local.` services with
//! instance names of the form `<product>:<phone name>:<phone id>`. Discovery
//! browses that service type, filters for device instances, and maintains a
//! live set with `Added`/`Removed` events.

use crate::error::{Error, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Service type browsed for device advertisements
pub const SERVICE_TYPE: &str = "_http._tcp.local.";

/// Known instance-name prefixes of device companion apps
const DEVICE_NAME_PREFIXES: &[&str] = &["PI monitor", "Neon Companion"];

/// An addressable device resolved from an mDNS advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Full instance name (`<product>:<phone name>:<phone id>`)
    pub name: String,
    /// Advertised DNS host name
    pub host: String,
    /// Resolved IPv4 address, if any
    pub ipv4: Option<Ipv4Addr>,
    /// Control API port
    pub port: u16,
    /// Advertised TXT records
    pub txt_records: BTreeMap<String, String>,
}

impl DiscoveredDevice {
    /// Best address to reach the control API: the IPv4 if resolved, else the
    /// advertised host name
    pub fn address(&self) -> String {
        match self.ipv4 {
            Some(ip) => ip.to_string(),
            None => self.host.trim_end_matches('.').to_string(),
        }
    }

    /// Phone name segment of the instance name, if present
    pub fn phone_name(&self) -> Option<&str> {
        self.name.split(':').nth(1)
    }

    /// Phone id segment of the instance name, if present
    pub fn phone_id(&self) -> Option<&str> {
        self.name.split(':').nth(2)
    }
}

/// Change notification for the live device set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A device appeared (or was re-resolved)
    Added(DiscoveredDevice),
    /// The named device disappeared
    Removed(String),
}

/// Extract the device instance name from an mDNS fullname, filtering out
/// non-device `_http._tcp` services
fn device_instance_name(fullname: &str) -> Option<String> {
    let instance = fullname.strip_suffix(&format!(".{SERVICE_TYPE}"))?;
    let prefix = instance.split(':').next()?;
    if instance.split(':').count() >= 3 && DEVICE_NAME_PREFIXES.contains(&prefix) {
        Some(instance.to_string())
    } else {
        None
    }
}

/// First-seen-ordered registry of live devices
#[derive(Debug, Default)]
struct DeviceRegistry {
    devices: Vec<DiscoveredDevice>,
}

impl DeviceRegistry {
    /// Upsert a device, preserving first-seen order
    fn add(&mut self, device: DiscoveredDevice) {
        match self.devices.iter_mut().find(|d| d.name == device.name) {
            Some(existing) => *existing = device,
            None => self.devices.push(device),
        }
    }

    fn remove(&mut self, name: &str) -> bool {
        let before = self.devices.len();
        self.devices.retain(|d| d.name != name);
        self.devices.len() != before
    }

    fn snapshot(&self) -> Vec<DiscoveredDevice> {
        self.devices.clone()
    }
}

/// Browses the network for devices and exposes a live set with change events
pub struct DeviceDiscovery {
    daemon: ServiceDaemon,
    events_rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
    registry: Arc<Mutex<DeviceRegistry>>,
    bridge: JoinHandle<()>,
}

impl DeviceDiscovery {
    /// Start browsing `_http._tcp.local.` for device advertisements
    pub fn new() -> Result<Self> {
        let daemon =
            ServiceDaemon::new().map_err(|e| Error::Discovery(format!("mdns daemon: {e}")))?;
        let browse_rx = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| Error::Discovery(format!("mdns browse: {e}")))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Mutex::new(DeviceRegistry::default()));
        let task_registry = registry.clone();

        let bridge = tokio::spawn(async move {
            while let Ok(event) = browse_rx.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let Some(name) = device_instance_name(info.get_fullname()) else {
                            debug!("Ignoring non-device service: {}", info.get_fullname());
                            continue;
                        };
                        let txt_records = info
                            .get_properties()
                            .iter()
                            .map(|p| (p.key().to_string(), p.val_str().to_string()))
                            .collect();
                        let device = DiscoveredDevice {
                            name,
                            host: info.get_hostname().to_string(),
                            ipv4: info.get_addresses_v4().into_iter().next().copied(),
                            port: info.get_port(),
                            txt_records,
                        };
                        debug!("Discovered device {} at {}", device.name, device.address());
                        task_registry.lock().unwrap().add(device.clone());
                        if events_tx.send(DiscoveryEvent::Added(device)).is_err() {
                            break;
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        let Some(name) = device_instance_name(&fullname) else {
                            continue;
                        };
                        let removed = task_registry.lock().unwrap().remove(&name);
                        if removed && events_tx.send(DiscoveryEvent::Removed(name)).is_err() {
                            break;
                        }
                    }
                    other => debug!("mdns event: {other:?}"),
                }
            }
        });

        Ok(Self {
            daemon,
            events_rx,
            registry,
            bridge,
        })
    }

    /// Receive the next change event; `None` once discovery has shut down
    pub async fn next_event(&mut self) -> Option<DiscoveryEvent> {
        self.events_rx.recv().await
    }

    /// Snapshot of the live device set, ordered by first appearance
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.registry.lock().unwrap().snapshot()
    }

    /// Wait for the first device to appear
    ///
    /// Returns immediately if one is already known; fails with
    /// [`Error::DeviceNotFound`] when the deadline passes without a device.
    pub async fn wait_first(&mut self, deadline: Duration) -> Result<DiscoveredDevice> {
        if let Some(device) = self.devices().into_iter().next() {
            return Ok(device);
        }
        let wait = async {
            while let Some(event) = self.next_event().await {
                if let DiscoveryEvent::Added(device) = event {
                    return Some(device);
                }
            }
            None
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(Some(device)) => Ok(device),
            Ok(None) => Err(Error::Discovery("mdns browse terminated".to_string())),
            Err(_) => Err(Error::DeviceNotFound),
        }
    }

    /// Stop browsing and release the mDNS daemon
    pub fn close(self) {
        if let Err(e) = self.daemon.shutdown() {
            warn!("mdns daemon shutdown: {e}");
        }
        self.bridge.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_instance_name_filtering() {
        assert_eq!(
            device_instance_name("PI monitor:Ava:1ab2._http._tcp.local."),
            Some("PI monitor:Ava:1ab2".to_string())
        );
        assert_eq!(
            device_instance_name("Neon Companion:Kai:9xy8._http._tcp.local."),
            Some("Neon Companion:Kai:9xy8".to_string())
        );
        // Wrong prefix
        assert_eq!(device_instance_name("printer:lobby:3._http._tcp.local."), None);
        // Too few segments
        assert_eq!(device_instance_name("PI monitor._http._tcp.local."), None);
        // Wrong service type
        assert_eq!(device_instance_name("PI monitor:Ava:1ab2._rtsp._tcp.local."), None);
    }

    #[test]
    fn test_registry_first_seen_order_and_upsert() {
        let mut registry = DeviceRegistry::default();
        let mk = |name: &str, port: u16| DiscoveredDevice {
            name: name.to_string(),
            host: "device.local.".to_string(),
            ipv4: None,
            port,
            txt_records: BTreeMap::new(),
        };

        registry.add(mk("PI monitor:Ava:1", 8080));
        registry.add(mk("PI monitor:Kai:2", 8080));
        registry.add(mk("PI monitor:Ava:1", 8081)); // re-resolve, same identity

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "PI monitor:Ava:1");
        assert_eq!(snapshot[0].port, 8081);
        assert_eq!(snapshot[1].name, "PI monitor:Kai:2");

        assert!(registry.remove("PI monitor:Ava:1"));
        assert!(!registry.remove("PI monitor:Ava:1"));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_device_address_prefers_ipv4() {
        let mut device = DiscoveredDevice {
            name: "PI monitor:Ava:1ab2".to_string(),
            host: "ava.local.".to_string(),
            ipv4: None,
            port: 8080,
            txt_records: BTreeMap::new(),
        };
        assert_eq!(device.address(), "ava.local");
        device.ipv4 = Some(Ipv4Addr::new(192, 168, 1, 21));
        assert_eq!(device.address(), "192.168.1.21");
        assert_eq!(device.phone_name(), Some("Ava"));
        assert_eq!(device.phone_id(), Some("1ab2"));
    }
}
