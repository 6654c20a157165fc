//! Device discovery via multicast search and advertisements.
//!
//! Devices answer an `M-SEARCH` and also announce themselves with periodic
//! `NOTIFY` messages. Both are HTTP-header-like text blocks:
//!
//! ```text
//! HTTP/1.1 200 OK
//! Cache-Control: max-age=3600
//! Location: yeelight://192.168.1.239:55443
//! id: 0x000000000015243f
//! model: color
//! fw_ver: 18
//! support: get_prop set_default set_power toggle set_bright start_cf stop_cf
//! power: on
//! bright: 100
//! color_mode: 2
//! ct: 4000
//! ```

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;
use futures::StreamExt;
use futures::channel::mpsc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::config::{DEFAULT_CONTROL_PORT, DiscoveryConfig};
use crate::errors::{DeviceId, Error};
use crate::events::{DeviceEvent, EventBus};
use crate::lock;
use crate::runtime::{self, AsyncUdpSocket, Instant, UdpSocket};
use crate::state::StatePatch;
use crate::types::Capabilities;

type Result<T> = std::result::Result<T, Error>;

/// Properties an advertisement may carry as seed state.
const SEED_PROPERTIES: &[&str] = &[
    "power",
    "bright",
    "color_mode",
    "ct",
    "rgb",
    "hue",
    "sat",
    "name",
];

/// What a device says about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    /// Control address from the `Location` header.
    pub address: SocketAddr,
    pub model: String,
    pub fw_version: Option<String>,
    pub capabilities: Capabilities,
    pub name: Option<String>,
    /// Advertised property values, used to seed state before the first
    /// command round trip.
    pub properties: Map<String, Value>,
}

impl DeviceDescriptor {
    /// Describe a device known only by identity and address.
    pub fn new(id: &str, address: SocketAddr) -> Self {
        DeviceDescriptor {
            id: id.to_string(),
            address,
            model: String::new(),
            fw_version: None,
            capabilities: Capabilities::default(),
            name: None,
            properties: Map::new(),
        }
    }

    /// The advertised properties as a state patch.
    pub fn seed(&self) -> StatePatch {
        StatePatch::from_props(&self.properties)
    }

    /// Parse one advertisement or search reply.
    ///
    /// # Examples
    ///
    /// ```
    /// use yeelight_lan_rs::{DeviceDescriptor, Method};
    ///
    /// let text = "HTTP/1.1 200 OK\r\n\
    ///     Location: yeelight://192.168.1.239:55443\r\n\
    ///     id: 0x000000000015243f\r\n\
    ///     model: color\r\n\
    ///     support: get_prop set_power\r\n\
    ///     bright: 100\r\n\r\n";
    /// let device = DeviceDescriptor::parse(text).unwrap();
    /// assert_eq!(device.id, "0x000000000015243f");
    /// assert_eq!(device.address.to_string(), "192.168.1.239:55443");
    /// assert!(device.capabilities.supports(Method::SetPower));
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let start = lines.next().unwrap_or_default().trim();
        if !(start.starts_with("HTTP/1.1 200") || start.starts_with("NOTIFY")) {
            return Err(Error::Malformed(format!("not an advertisement: {start:?}")));
        }

        let mut headers: HashMap<String, String> = HashMap::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let id = headers
            .get("id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Malformed("advertisement without id".into()))?;
        let location = headers
            .get("location")
            .ok_or_else(|| Error::Malformed(format!("advertisement of {id} without location")))?;
        let address = parse_location(location)?;

        let properties = SEED_PROPERTIES
            .iter()
            .filter_map(|key| {
                let value = headers.get(*key).filter(|v| !v.is_empty())?;
                Some((key.to_string(), Value::String(value.clone())))
            })
            .collect();

        Ok(DeviceDescriptor {
            id: id.clone(),
            address,
            model: headers.get("model").cloned().unwrap_or_default(),
            fw_version: headers.get("fw_ver").cloned(),
            capabilities: headers
                .get("support")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            name: headers.get("name").filter(|n| !n.is_empty()).cloned(),
            properties,
        })
    }
}

fn parse_location(location: &str) -> Result<SocketAddr> {
    let hostport = location
        .split_once("://")
        .map_or(location, |(_, rest)| rest)
        .trim_end_matches('/');
    let with_port = if hostport.contains(':') {
        hostport.to_string()
    } else {
        format!("{hostport}:{DEFAULT_CONTROL_PORT}")
    };
    with_port
        .parse()
        .map_err(|e| Error::Malformed(format!("bad location {location:?}: {e}")))
}

/// The search request sent to the multicast group.
pub fn search_request(config: &DiscoveryConfig) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\nHOST: {}\r\nMAN: \"ssdp:discover\"\r\nST: {}\r\n",
        config.multicast_addr, config.search_target
    )
}

/// Whether an observation introduced a device or refreshed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    New,
    Updated,
}

/// Devices seen recently, keyed by identity.
#[derive(Debug, Default)]
pub struct DiscoveryRegistry {
    entries: HashMap<DeviceId, (DeviceDescriptor, std::time::Instant)>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an advertisement. A later advertisement replaces the stored
    /// descriptor wholesale.
    pub fn observe(&mut self, descriptor: DeviceDescriptor) -> Observation {
        let now = std::time::Instant::now();
        match self.entries.insert(descriptor.id.clone(), (descriptor, now)) {
            Some(_) => Observation::Updated,
            None => Observation::New,
        }
    }

    /// Drop devices not seen within `window` and return their identities.
    pub fn evict_stale(&mut self, window: Duration) -> Vec<DeviceId> {
        let mut stale = Vec::new();
        self.entries.retain(|id, (_, seen)| {
            let keep = seen.elapsed() <= window;
            if !keep {
                stale.push(id.clone());
            }
            keep
        });
        stale
    }

    pub fn get(&self, id: &str) -> Option<&DeviceDescriptor> {
        self.entries.get(id).map(|(d, _)| d)
    }

    pub fn remove(&mut self, id: &str) -> Option<DeviceDescriptor> {
        self.entries.remove(id).map(|(d, _)| d)
    }

    pub fn list(&self) -> Vec<DeviceDescriptor> {
        self.entries.values().map(|(d, _)| d.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Stream of `Discovered`, `Updated` and `Stale` events from a running
/// discovery.
///
/// Ends when the discovery window closes or discovery is stopped.
pub struct DiscoveryStream {
    rx: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl DiscoveryStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<DeviceEvent>) -> Self {
        DiscoveryStream { rx }
    }
}

impl Stream for DiscoveryStream {
    type Item = DeviceEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.rx).poll_next(cx)
    }
}

/// Shared by the listener tasks of one discovery run.
struct Listener {
    registry: Arc<Mutex<DiscoveryRegistry>>,
    events: EventBus,
    tx: mpsc::UnboundedSender<DeviceEvent>,
    running: Arc<AtomicBool>,
    config: DiscoveryConfig,
}

impl Listener {
    fn handle(&self, bytes: &[u8], from: SocketAddr) {
        let text = String::from_utf8_lossy(bytes);
        if text.starts_with("M-SEARCH") {
            return;
        }
        let descriptor = match DeviceDescriptor::parse(&text) {
            Ok(d) => d,
            Err(e) => {
                debug!("Ignoring datagram from {from}: {e}");
                return;
            }
        };

        let observation = lock(&self.registry).observe(descriptor.clone());
        let event = match observation {
            Observation::New => {
                info!("Discovered {} ({}) at {}", descriptor.id, descriptor.model, descriptor.address);
                DeviceEvent::Discovered(descriptor)
            }
            Observation::Updated => DeviceEvent::Updated(descriptor),
        };
        self.events.publish(event.clone());
        let _ = self.tx.unbounded_send(event);
    }

    async fn run(self: Arc<Self>, socket: UdpSocket, deadline: Option<Duration>) {
        let start = Instant::now();
        let mut buffer = [0u8; 2048];

        while self.running.load(Ordering::SeqCst)
            && deadline.is_none_or(|limit| start.elapsed() < limit)
        {
            match runtime::timeout(self.config.poll_interval, socket.recv_from(&mut buffer)).await {
                Ok(Ok((size, from))) => self.handle(&buffer[..size], from),
                Ok(Err(e)) => {
                    warn!("Discovery socket error: {e}");
                    runtime::sleep(self.config.poll_interval).await;
                }
                // Poll interval elapsed; check the stop conditions again
                Err(_) => {}
            }
            for id in evict_silent(&self.registry, self.config.silence_window, &self.events) {
                let _ = self.tx.unbounded_send(DeviceEvent::Stale(id));
            }
        }
    }
}

/// Drop devices silent for longer than `window` and announce them.
fn evict_silent(
    registry: &Mutex<DiscoveryRegistry>,
    window: Duration,
    events: &EventBus,
) -> Vec<DeviceId> {
    let stale = lock(registry).evict_stale(window);
    for id in &stale {
        info!("Device {id} went silent");
        events.publish(DeviceEvent::Stale(id.clone()));
    }
    stale
}

/// Multicast discovery service.
pub struct Discovery {
    config: DiscoveryConfig,
    registry: Arc<Mutex<DiscoveryRegistry>>,
    events: EventBus,
    running: Mutex<Option<Arc<AtomicBool>>>,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig, events: EventBus) -> Self {
        Discovery {
            config,
            registry: Arc::default(),
            events,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .is_some_and(|r| r.load(Ordering::SeqCst))
    }

    /// Send a search and listen for replies and advertisements.
    ///
    /// With `timeout` set, listening ends after that long; otherwise it
    /// continues until [`Discovery::stop`]. Starting again stops the
    /// previous run first.
    pub async fn start(&self, timeout: Option<Duration>) -> Result<DiscoveryStream> {
        self.stop();

        let search = UdpSocket::bind(&format!("{}:0", self.config.interface))
            .await
            .map_err(|e| Error::socket("bind", e))?;
        search
            .send_to(
                search_request(&self.config).as_bytes(),
                SocketAddr::V4(self.config.multicast_addr),
            )
            .await
            .map_err(|e| Error::socket("send_to", e))?;
        debug!("Search sent to {}", self.config.multicast_addr);

        let advertisements = if self.config.listen_for_advertisements {
            match multicast_socket(&self.config) {
                Ok(socket) => Some(socket),
                Err(e) => {
                    warn!("Not listening for advertisements: {e}");
                    None
                }
            }
        } else {
            None
        };

        let running = Arc::new(AtomicBool::new(true));
        *lock(&self.running) = Some(Arc::clone(&running));

        let (tx, rx) = mpsc::unbounded();
        let listener = Arc::new(Listener {
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            tx,
            running,
            config: self.config.clone(),
        });

        runtime::spawn(Arc::clone(&listener).run(search, timeout));
        if let Some(socket) = advertisements {
            runtime::spawn(Arc::clone(&listener).run(socket, timeout));
        }

        Ok(DiscoveryStream::new(rx))
    }

    /// Stop listening. Devices already found stay in the registry.
    pub fn stop(&self) {
        if let Some(running) = lock(&self.running).take() {
            running.store(false, Ordering::SeqCst);
        }
    }

    /// Run a bounded discovery and return every device that answered.
    ///
    /// No answer is not an error, only an empty list.
    pub async fn discover(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
        let mut stream = self.start(Some(timeout)).await?;
        let mut found: HashMap<DeviceId, DeviceDescriptor> = HashMap::new();
        while let Some(event) = stream.next().await {
            if let DeviceEvent::Discovered(d) | DeviceEvent::Updated(d) = event {
                found.insert(d.id.clone(), d);
            }
        }
        Ok(found.into_values().collect())
    }

    /// Drop devices silent for longer than the silence window. A running
    /// discovery does this on every poll.
    pub fn evict_stale(&self) -> Vec<DeviceId> {
        evict_silent(&self.registry, self.config.silence_window, &self.events)
    }

    pub fn get(&self, id: &str) -> Option<DeviceDescriptor> {
        lock(&self.registry).get(id).cloned()
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        lock(&self.registry).list()
    }

    pub(crate) fn forget(&self, id: &str) {
        lock(&self.registry).remove(id);
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A socket on the multicast port that shares it with other listeners.
fn multicast_socket(config: &DiscoveryConfig) -> Result<UdpSocket> {
    let group = *config.multicast_addr.ip();
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::socket("create multicast socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::socket("set_reuse_address", e))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| Error::socket("set_reuse_port", e))?;
    socket
        .bind(&SockAddr::from(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            config.multicast_addr.port(),
        )))
        .map_err(|e| Error::socket("bind multicast socket", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::socket("set_nonblocking", e))?;

    let socket = UdpSocket::from_std(socket.into()).map_err(|e| Error::socket("register", e))?;
    socket
        .join_multicast_v4(group, config.interface)
        .map_err(|e| Error::socket("join_multicast_v4", e))?;
    Ok(socket)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const REPLY: &str = "HTTP/1.1 200 OK\r\n\
        Cache-Control: max-age=3600\r\n\
        Date: \r\n\
        Ext: \r\n\
        Location: yeelight://192.168.1.239:55443\r\n\
        Server: POSIX UPnP/1.0 YGLC/1\r\n\
        id: 0x000000000015243f\r\n\
        model: color\r\n\
        fw_ver: 18\r\n\
        support: get_prop set_default set_power toggle set_bright start_cf stop_cf set_scene cron_add cron_get cron_del set_ct_abx set_rgb\r\n\
        power: on\r\n\
        bright: 100\r\n\
        color_mode: 2\r\n\
        ct: 4000\r\n\
        rgb: 16711680\r\n\
        hue: 100\r\n\
        sat: 35\r\n\
        name: my_bulb\r\n\r\n";

    #[test]
    fn test_parse_search_reply() {
        let device = DeviceDescriptor::parse(REPLY).unwrap();
        assert_eq!(device.model, "color");
        assert_eq!(device.fw_version.as_deref(), Some("18"));
        assert_eq!(device.name.as_deref(), Some("my_bulb"));
        assert!(device.capabilities.supports(crate::types::Method::StartCf));
        assert!(!device.capabilities.supports(crate::types::Method::SetHsv));
        assert_eq!(device.properties.len(), 8);

        let seed = device.seed();
        assert_eq!(seed.power, Some(crate::types::PowerMode::On));
        assert_eq!(seed.temperature.map(|k| k.kelvin()), Some(4000));
    }

    #[test]
    fn test_parse_notify_with_default_port() {
        let text = "NOTIFY * HTTP/1.1\r\nHost: 239.255.255.250:1982\r\n\
            Location: yeelight://10.0.0.7\r\nID: 0xabc\r\n\r\n";
        let device = DeviceDescriptor::parse(text).unwrap();
        assert_eq!(device.id, "0xabc");
        assert_eq!(device.address, "10.0.0.7:55443".parse().unwrap());
        assert!(device.capabilities.is_unknown());
    }

    #[test]
    fn test_parse_rejects_incomplete() {
        assert!(DeviceDescriptor::parse("M-SEARCH * HTTP/1.1\r\nST: wifi_bulb\r\n").is_err());
        assert!(DeviceDescriptor::parse("HTTP/1.1 200 OK\r\nid: 0x1\r\n").is_err());
        assert!(DeviceDescriptor::parse("HTTP/1.1 200 OK\r\nLocation: yeelight://1.2.3.4:1\r\n").is_err());
        assert!(
            DeviceDescriptor::parse("HTTP/1.1 200 OK\r\nid: 0x1\r\nLocation: yeelight://nowhere:x\r\n")
                .is_err()
        );
    }

    #[test]
    fn test_second_advertisement_updates() {
        let mut registry = DiscoveryRegistry::new();
        let first = DeviceDescriptor::parse(REPLY).unwrap();
        let mut moved = first.clone();
        moved.address = "192.168.1.240:55443".parse().unwrap();
        moved.capabilities = "get_prop set_power".parse().unwrap();

        assert_eq!(registry.observe(first), Observation::New);
        assert_eq!(registry.observe(moved.clone()), Observation::Updated);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&moved.id), Some(&moved));
    }

    #[test]
    fn test_eviction() {
        let mut registry = DiscoveryRegistry::new();
        registry.observe(DeviceDescriptor::new("0x1", "10.0.0.1:55443".parse().unwrap()));
        assert!(registry.evict_stale(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.evict_stale(Duration::ZERO), vec!["0x1".to_string()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_search_request() {
        let request = search_request(&DiscoveryConfig::default());
        assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(request.contains("HOST: 239.255.255.250:1982\r\n"));
        assert!(request.contains("ST: wifi_bulb\r\n"));
    }

    #[cfg(feature = "runtime-tokio")]
    pub(crate) async fn loopback() -> (tokio::net::UdpSocket, DiscoveryConfig) {
        let device = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(target) = device.local_addr().unwrap() else {
            unreachable!()
        };
        let config = DiscoveryConfig::default()
            .with_interface(Ipv4Addr::LOCALHOST)
            .with_multicast_addr(target)
            .with_advertisements(false)
            .with_poll_interval(Duration::from_millis(20));
        (device, config)
    }

    /// Answer the next search with a `NOTIFY` for `id` at `location`.
    #[cfg(feature = "runtime-tokio")]
    pub(crate) async fn announce(device: &tokio::net::UdpSocket, id: &str, location: SocketAddr) {
        let mut buffer = [0u8; 1024];
        let (size, searcher) = device.recv_from(&mut buffer).await.unwrap();
        assert!(buffer[..size].starts_with(b"M-SEARCH"));
        let notify = format!("NOTIFY * HTTP/1.1\r\nLocation: yeelight://{location}\r\nid: {id}\r\n\r\n");
        device.send_to(notify.as_bytes(), searcher).await.unwrap();
    }

    #[cfg(feature = "runtime-tokio")]
    #[tokio::test]
    async fn test_start_and_stop() {
        let (device, config) = loopback().await;
        let events = EventBus::new();
        let mut bus = events.subscribe();
        let discovery = Discovery::new(config, events);

        let mut stream = discovery.start(None).await.unwrap();
        announce(&device, "0x7", "127.0.0.1:55443".parse().unwrap()).await;

        let Some(DeviceEvent::Discovered(found)) = stream.next().await else {
            panic!("expected a discovered device");
        };
        assert_eq!(found.id, "0x7");
        assert!(matches!(bus.next().await, Some(DeviceEvent::Discovered(_))));
        assert!(discovery.is_running());

        discovery.stop();
        assert!(!discovery.is_running());
        let end = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
        assert_eq!(discovery.get("0x7").map(|d| d.address.port()), Some(55443));
    }

    #[cfg(feature = "runtime-tokio")]
    #[tokio::test]
    async fn test_silent_device_is_evicted_while_running() {
        let (device, config) = loopback().await;
        let discovery = Discovery::new(
            config.with_silence_window(Duration::from_millis(100)),
            EventBus::new(),
        );

        let mut stream = discovery.start(None).await.unwrap();
        announce(&device, "0x7", "127.0.0.1:55443".parse().unwrap()).await;
        assert!(matches!(stream.next().await, Some(DeviceEvent::Discovered(_))));

        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(matches!(next, Some(DeviceEvent::Stale(id)) if id == "0x7"));
        assert!(discovery.devices().is_empty());
        discovery.stop();
    }

    #[test]
    fn test_listener_dedupes() {
        let (tx, mut rx) = mpsc::unbounded();
        let listener = Listener {
            registry: Arc::default(),
            events: EventBus::new(),
            tx,
            running: Arc::new(AtomicBool::new(true)),
            config: DiscoveryConfig::default(),
        };
        let from: SocketAddr = "192.168.1.239:1982".parse().unwrap();
        listener.handle(REPLY.as_bytes(), from);
        listener.handle(REPLY.as_bytes(), from);
        listener.handle(b"garbage", from);

        assert!(matches!(rx.try_next(), Ok(Some(DeviceEvent::Discovered(_)))));
        assert!(matches!(rx.try_next(), Ok(Some(DeviceEvent::Updated(_)))));
        assert!(rx.try_next().is_err());
        assert_eq!(lock(&listener.registry).len(), 1);
    }
}
