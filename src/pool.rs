//! The set of live device connections, keyed by device identity.

use std::collections::HashMap;
use std::sync::Mutex;

use log::info;
use serde::{Deserialize, Serialize};

use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionStatus};
use crate::discovery::DeviceDescriptor;
use crate::errors::{DeviceId, Error};
use crate::events::{DeviceEvent, EventBus};
use crate::light::Light;
use crate::lock;
use crate::reconciler::Reconciler;
use crate::state::DeviceState;

type Result<T> = std::result::Result<T, Error>;

/// One row of [`DevicePool::list`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub descriptor: DeviceDescriptor,
    pub state: DeviceState,
    pub status: ConnectionStatus,
}

struct Entry {
    descriptor: DeviceDescriptor,
    connection: Connection,
}

/// Owns one [`Connection`] per device identity.
pub struct DevicePool {
    entries: Mutex<HashMap<DeviceId, Entry>>,
    config: ConnectionConfig,
    reconciler: Reconciler,
    events: EventBus,
}

impl DevicePool {
    pub fn new(config: ConnectionConfig, reconciler: Reconciler, events: EventBus) -> Self {
        DevicePool {
            entries: Mutex::new(HashMap::new()),
            config,
            reconciler,
            events,
        }
    }

    /// Connect to a new device, or refresh a known one.
    ///
    /// A known identity keeps its connection: a changed address moves the
    /// existing session instead of opening a second one. Advertised
    /// properties seed the state of a new device only.
    ///
    /// Must be called within a runtime.
    pub fn add_or_update(&self, descriptor: DeviceDescriptor) -> Connection {
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get_mut(&descriptor.id) {
            entry.connection.readdress(descriptor.address);
            entry.descriptor = descriptor;
            return entry.connection.clone();
        }

        info!("Adding device {} at {}", descriptor.id, descriptor.address);
        self.reconciler.apply_patch(&descriptor.id, &descriptor.seed());
        let connection = Connection::open(
            &descriptor.id,
            descriptor.address,
            self.config.clone(),
            self.reconciler.clone(),
            self.events.clone(),
        );
        entries.insert(
            descriptor.id.clone(),
            Entry {
                descriptor,
                connection: connection.clone(),
            },
        );
        connection
    }

    pub fn get(&self, id: &str) -> Option<Connection> {
        lock(&self.entries).get(id).map(|e| e.connection.clone())
    }

    pub fn descriptor(&self, id: &str) -> Option<DeviceDescriptor> {
        lock(&self.entries).get(id).map(|e| e.descriptor.clone())
    }

    /// A typed handle for a pooled device.
    pub fn light(&self, id: &str) -> Result<Light> {
        let entries = lock(&self.entries);
        let entry = entries
            .get(id)
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))?;
        Ok(Light::new(
            entry.connection.clone(),
            entry.descriptor.clone(),
            self.reconciler.clone(),
        ))
    }

    /// Close the device's connection and forget its state.
    pub fn remove(&self, id: &str) -> Option<DeviceDescriptor> {
        let entry = lock(&self.entries).remove(id)?;
        entry.connection.close();
        self.reconciler.remove(id);
        info!("Removed device {id}");
        self.events.publish(DeviceEvent::Removed(id.to_string()));
        Some(entry.descriptor)
    }

    pub fn list(&self) -> Vec<DeviceInfo> {
        let entries = lock(&self.entries);
        let mut devices: Vec<DeviceInfo> = entries
            .values()
            .map(|e| DeviceInfo {
                descriptor: e.descriptor.clone(),
                state: self.reconciler.snapshot(&e.descriptor.id).unwrap_or_default(),
                status: e.connection.status(),
            })
            .collect();
        devices.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        devices
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.entries).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Close every connection.
    pub fn clear(&self) {
        let ids: Vec<DeviceId> = lock(&self.entries).keys().cloned().collect();
        for id in ids {
            self.remove(&id);
        }
    }
}

impl Drop for DevicePool {
    fn drop(&mut self) {
        for entry in lock(&self.entries).values() {
            entry.connection.close();
        }
    }
}

#[cfg(all(test, feature = "runtime-tokio"))]
mod tests {
    use super::*;
    use crate::connection::tests::FakeDevice;
    use crate::types::PowerMode;
    use serde_json::json;
    use std::time::Duration;

    fn pool() -> DevicePool {
        DevicePool::new(
            ConnectionConfig::default().with_keepalive(None),
            Reconciler::default(),
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn test_same_identity_is_not_duplicated() {
        let old = FakeDevice::bind().await;
        let new = FakeDevice::bind().await;
        let pool = pool();

        let mut descriptor = DeviceDescriptor::new("0x1", old.address());
        descriptor.properties.insert("power".into(), json!("on"));
        pool.add_or_update(descriptor.clone());
        let _first = old.accept().await;

        descriptor.address = new.address();
        descriptor.model = "stripe".into();
        pool.add_or_update(descriptor);
        let _second = new.accept().await;

        assert_eq!(pool.len(), 1);
        let info = &pool.list()[0];
        assert_eq!(info.descriptor.address, new.address());
        assert_eq!(info.descriptor.model, "stripe");
        assert_eq!(info.state.power(), Some(PowerMode::On));
        assert_eq!(pool.get("0x1").unwrap().address(), new.address());
    }

    #[tokio::test]
    async fn test_remove_closes_and_purges() {
        let device = FakeDevice::bind().await;
        let events = EventBus::new();
        let mut sub = events.subscribe();
        let reconciler = Reconciler::default();
        let pool = DevicePool::new(
            ConnectionConfig::default().with_keepalive(None),
            reconciler.clone(),
            events,
        );

        let mut descriptor = DeviceDescriptor::new("0x1", device.address());
        descriptor.properties.insert("bright".into(), json!("10"));
        let connection = pool.add_or_update(descriptor);
        let _session = device.accept().await;

        assert!(pool.remove("0x1").is_some());
        assert!(pool.remove("0x1").is_none());
        assert!(!pool.contains("0x1"));
        assert!(!reconciler.contains("0x1"));
        assert_eq!(connection.status(), ConnectionStatus::Closed);
        assert!(matches!(pool.light("0x1"), Err(Error::UnknownDevice(_))));

        use futures::StreamExt;
        let removed = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(event) = sub.next().await {
                if let DeviceEvent::Removed(id) = event {
                    return id;
                }
            }
            String::new()
        })
        .await
        .unwrap();
        assert_eq!(removed, "0x1");
    }
}
