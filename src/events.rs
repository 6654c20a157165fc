//! Fan-out of engine events to any number of subscribers.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use futures::channel::mpsc;
use log::debug;
use uuid::Uuid;

use crate::connection::ConnectionStatus;
use crate::discovery::DeviceDescriptor;
use crate::errors::DeviceId;
use crate::lock;
use crate::state::DeviceState;

/// Something observable happened to a device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// First advertisement from an identity.
    Discovered(DeviceDescriptor),
    /// A known identity advertised again, possibly at a new address.
    Updated(DeviceDescriptor),
    /// No advertisement within the silence window.
    Stale(DeviceId),
    StateChanged { id: DeviceId, state: DeviceState },
    ConnectionChanged { id: DeviceId, status: ConnectionStatus },
    /// The device was removed from the pool.
    Removed(DeviceId),
}

impl DeviceEvent {
    pub fn device_id(&self) -> &str {
        match self {
            DeviceEvent::Discovered(d) | DeviceEvent::Updated(d) => &d.id,
            DeviceEvent::Stale(id) | DeviceEvent::Removed(id) => id,
            DeviceEvent::StateChanged { id, .. } | DeviceEvent::ConnectionChanged { id, .. } => id,
        }
    }
}

type Subscribers = HashMap<Uuid, mpsc::UnboundedSender<DeviceEvent>>;

/// Cloneable handle publishing to every live [`Subscription`].
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded();
        let id = Uuid::new_v4();
        lock(&self.subscribers).insert(id, tx);
        debug!("Subscriber {id} registered");
        Subscription {
            id,
            rx,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Deliver an event; subscribers that went away are pruned.
    pub fn publish(&self, event: DeviceEvent) {
        lock(&self.subscribers).retain(|_, tx| tx.unbounded_send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

/// A stream of [`DeviceEvent`]s. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<DeviceEvent>,
    subscribers: Arc<Mutex<Subscribers>>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Stream for Subscription {
    type Item = DeviceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        lock(&self.subscribers).remove(&self.id);
    }
}
