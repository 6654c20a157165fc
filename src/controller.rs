//! The caller-facing entry point tying discovery, connections and state
//! together.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::channel::mpsc;
use log::debug;
use serde_json::Value;

use crate::codec::{Command, Response};
use crate::config::EngineConfig;
use crate::discovery::{DeviceDescriptor, Discovery, DiscoveryStream};
use crate::errors::{DeviceId, Error};
use crate::events::{DeviceEvent, EventBus, Subscription};
use crate::flow::FlowSpec;
use crate::light::Light;
use crate::pool::{DeviceInfo, DevicePool};
use crate::reconciler::Reconciler;
use crate::runtime;
use crate::state::DeviceState;

type Result<T> = std::result::Result<T, Error>;

/// Discovers devices, keeps one connection per device, and exposes their
/// state.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use yeelight_lan_rs::{Controller, EngineConfig};
///
/// # async fn run() -> Result<(), yeelight_lan_rs::Error> {
/// let controller = Controller::new(EngineConfig::default());
/// for device in controller.discover(Duration::from_secs(3)).await? {
///     let light = controller.connect(&device.id)?;
///     light.toggle().await?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct Controller {
    config: EngineConfig,
    events: EventBus,
    reconciler: Reconciler,
    discovery: Discovery,
    pool: Arc<DevicePool>,
}

impl Controller {
    pub fn new(config: EngineConfig) -> Self {
        let events = EventBus::new();
        let reconciler = Reconciler::new(events.clone());
        Controller {
            discovery: Discovery::new(config.discovery.clone(), events.clone()),
            pool: Arc::new(DevicePool::new(
                config.connection.clone(),
                reconciler.clone(),
                events.clone(),
            )),
            config,
            events,
            reconciler,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start discovering. Pooled devices that re-advertise at a new
    /// address are moved there as the advertisements arrive.
    pub async fn start_discovery(&self, timeout: Option<Duration>) -> Result<DiscoveryStream> {
        let mut inner = self.discovery.start(timeout).await?;
        let (tx, rx) = mpsc::unbounded();
        let pool = Arc::clone(&self.pool);
        runtime::spawn(async move {
            while let Some(event) = inner.next().await {
                if let DeviceEvent::Discovered(d) | DeviceEvent::Updated(d) = &event
                    && pool.contains(&d.id)
                {
                    pool.add_or_update(d.clone());
                }
                if tx.unbounded_send(event).is_err() {
                    debug!("Discovery stream dropped by caller");
                }
            }
        });
        Ok(DiscoveryStream::new(rx))
    }

    pub fn stop_discovery(&self) {
        self.discovery.stop();
    }

    /// Discover for `timeout` and return every device that answered.
    pub async fn discover(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
        let stream = self.start_discovery(Some(timeout)).await?;
        let mut found: Vec<DeviceDescriptor> = Vec::new();
        stream
            .for_each(|event| {
                if let DeviceEvent::Discovered(d) | DeviceEvent::Updated(d) = event {
                    found.retain(|f| f.id != d.id);
                    found.push(d);
                }
                futures::future::ready(())
            })
            .await;
        Ok(found)
    }

    /// Open (or reuse) the connection to a discovered device. Devices
    /// silent for longer than the silence window count as unknown.
    pub fn connect(&self, id: &str) -> Result<Light> {
        if !self.pool.contains(id) {
            self.discovery.evict_stale();
            let descriptor = self
                .discovery
                .get(id)
                .ok_or_else(|| Error::UnknownDevice(id.to_string()))?;
            self.pool.add_or_update(descriptor);
        }
        self.pool.light(id)
    }

    /// Connect to a device known by other means, e.g. a static address.
    pub fn connect_to(&self, descriptor: DeviceDescriptor) -> Result<Light> {
        let id = descriptor.id.clone();
        self.pool.add_or_update(descriptor);
        self.pool.light(&id)
    }

    pub fn light(&self, id: &str) -> Result<Light> {
        self.pool.light(id)
    }

    /// Send a raw method call to a connected device.
    pub async fn send(&self, id: &str, method: &str, params: Vec<Value>) -> Result<Response> {
        self.light(id)?.send(Command::raw(method, params)).await
    }

    pub fn state(&self, id: &str) -> Result<DeviceState> {
        self.reconciler
            .snapshot(id)
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))
    }

    pub async fn start_flow(&self, id: &str, spec: &FlowSpec) -> Result<Response> {
        self.light(id)?.start_flow(spec).await
    }

    pub async fn stop_flow(&self, id: &str) -> Result<Response> {
        self.light(id)?.stop_flow().await
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn list(&self) -> Vec<DeviceInfo> {
        self.pool.list()
    }

    /// Devices seen by discovery, connected or not.
    pub fn discovered(&self) -> Vec<DeviceDescriptor> {
        self.discovery.devices()
    }

    /// Disconnect a device and forget everything about it until it is
    /// discovered again.
    pub fn remove(&self, id: &str) -> Option<DeviceDescriptor> {
        self.discovery.forget(id);
        self.pool.remove(id)
    }

    /// Drop silent devices from the discovery registry. Their connections,
    /// if any, are left alone.
    pub fn evict_stale(&self) -> Vec<DeviceId> {
        self.discovery.evict_stale()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.discovery.stop();
        self.pool.clear();
    }
}
