//! Authoritative per-device state.
//!
//! Command acknowledgements and pushed notifications both end up here. Each
//! device has its own lock, so devices never contend with each other, and
//! updates for one device are applied in the order they were read off its
//! stream, which makes every field last-write-wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::codec::{Command, Notification, Response};
use crate::errors::DeviceId;
use crate::events::{DeviceEvent, EventBus};
use crate::lock;
use crate::state::{DeviceState, StatePatch};

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    devices: Arc<Mutex<HashMap<DeviceId, Arc<Mutex<DeviceState>>>>>,
    events: EventBus,
}

impl Reconciler {
    pub fn new(events: EventBus) -> Self {
        Reconciler {
            devices: Arc::default(),
            events,
        }
    }

    /// Start tracking a device. Responses, notifications and connectivity
    /// changes for untracked devices are dropped, so a removed device stays
    /// removed even if its connection still delivers a line.
    pub fn track(&self, id: &str) {
        lock(&self.devices).entry(id.to_string()).or_default();
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut DeviceState) -> bool) -> Option<DeviceState> {
        let Some(device) = lock(&self.devices).get(id).cloned() else {
            debug!("Dropping update for untracked device {id}");
            return None;
        };
        let snapshot = {
            let mut state = lock(&device);
            if !f(&mut state) {
                return None;
            }
            state.clone()
        };
        debug!("State of {id} is now {snapshot:?}");
        self.events.publish(DeviceEvent::StateChanged {
            id: id.to_string(),
            state: snapshot.clone(),
        });
        Some(snapshot)
    }

    /// Merge an arbitrary patch, e.g. the property values from an
    /// advertisement. Starts tracking the device if needed.
    pub fn apply_patch(&self, id: &str, patch: &StatePatch) -> Option<DeviceState> {
        self.track(id);
        if patch.is_empty() {
            return None;
        }
        self.update(id, |state| state.apply(patch))
    }

    /// Reflect a successful response in the fields its command affects.
    ///
    /// Error responses change nothing. Returns the new snapshot if anything
    /// changed.
    ///
    /// # Examples
    ///
    /// ```
    /// use serde_json::json;
    /// use yeelight_lan_rs::{EventBus, PowerMode, Reconciler};
    /// use yeelight_lan_rs::codec::{Command, Response};
    ///
    /// let reconciler = Reconciler::new(EventBus::new());
    /// reconciler.track("0x1");
    /// let cmd = Command::raw("set_power", vec![json!("on"), json!("smooth"), json!(500)]);
    /// reconciler.apply_response("0x1", &cmd, &Response::ok(1, vec![json!("ok")]));
    /// assert_eq!(reconciler.snapshot("0x1").unwrap().power(), Some(PowerMode::On));
    /// ```
    pub fn apply_response(
        &self,
        id: &str,
        command: &Command,
        response: &Response,
    ) -> Option<DeviceState> {
        let result = response.result()?;
        let patch = StatePatch::from_command(command, result);
        self.update(id, |state| state.apply(&patch))
    }

    pub fn apply_notification(&self, id: &str, notification: &Notification) -> Option<DeviceState> {
        let patch = StatePatch::from_props(&notification.params);
        self.update(id, |state| state.apply(&patch))
    }

    pub fn set_online(&self, id: &str, online: bool) -> Option<DeviceState> {
        self.update(id, |state| state.set_online(online))
    }

    /// A copy of the current state.
    pub fn snapshot(&self, id: &str) -> Option<DeviceState> {
        let device = lock(&self.devices).get(id).cloned()?;
        let state = lock(&device).clone();
        Some(state)
    }

    pub fn remove(&self, id: &str) -> Option<DeviceState> {
        let device = lock(&self.devices).remove(id)?;
        let state = lock(&device).clone();
        Some(state)
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.devices).contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Brightness, PowerMode};
    use futures::StreamExt;
    use serde_json::json;

    fn notification(params: serde_json::Value) -> Notification {
        Notification {
            params: params.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_response_updates_only_affected_fields() {
        let reconciler = Reconciler::default();
        reconciler.track("a");
        reconciler.apply_notification("a", &notification(json!({"power": "off", "bright": "70"})));

        let cmd = Command::raw("set_power", vec![json!("on"), json!("smooth"), json!(500)]);
        reconciler.apply_response("a", &cmd, &Response::ok(4, vec![json!("ok")]));

        let state = reconciler.snapshot("a").unwrap();
        assert_eq!(state.power(), Some(PowerMode::On));
        assert_eq!(state.brightness(), Brightness::create(70));
    }

    #[test]
    fn test_error_response_changes_nothing() {
        let reconciler = Reconciler::default();
        let cmd = Command::raw("set_bright", vec![json!(10)]);
        let failed = crate::codec::Response {
            id: 1,
            outcome: Err(crate::codec::ErrorObject {
                code: -1,
                message: "client quota exceeded".into(),
            }),
        };
        assert!(reconciler.apply_response("a", &cmd, &failed).is_none());
        assert!(reconciler.snapshot("a").is_none());
    }

    #[test]
    fn test_interleaved_updates_keep_untouched_fields() {
        let reconciler = Reconciler::default();
        reconciler.track("a");
        reconciler.apply_notification(
            "a",
            &notification(json!({"power": "on", "bright": "50", "ct": "3000", "color_mode": "2"})),
        );
        reconciler.apply_response(
            "a",
            &Command::raw("set_bright", vec![json!(90), json!("sudden"), json!(0)]),
            &Response::ok(1, vec![json!("ok")]),
        );
        reconciler.apply_notification("a", &notification(json!({"power": "off"})));

        let state = reconciler.snapshot("a").unwrap();
        assert_eq!(state.power(), Some(PowerMode::Off));
        assert_eq!(state.brightness(), Brightness::create(90));
        assert!(state.color_mode().is_some());
    }

    #[test]
    fn test_removed_device_is_not_revived() {
        let reconciler = Reconciler::default();
        reconciler.track("a");
        reconciler.apply_notification("a", &notification(json!({"bright": "30"})));
        assert!(reconciler.remove("a").is_some());

        reconciler.apply_notification("a", &notification(json!({"bright": "40"})));
        reconciler.apply_response(
            "a",
            &Command::raw("toggle", vec![]),
            &Response::ok(2, vec![json!("ok")]),
        );
        assert!(reconciler.set_online("a", false).is_none());
        assert!(!reconciler.contains("a"));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let reconciler = Reconciler::default();
        reconciler.track("a");
        reconciler.apply_notification("a", &notification(json!({"bright": "30"})));
        let before = reconciler.snapshot("a").unwrap();
        reconciler.apply_notification("a", &notification(json!({"bright": "31"})));
        assert_eq!(before.brightness(), Brightness::create(30));
    }

    #[tokio::test]
    async fn test_changes_are_published() {
        let events = EventBus::new();
        let mut sub = events.subscribe();
        let reconciler = Reconciler::new(events);
        reconciler.track("a");

        reconciler.apply_notification("a", &notification(json!({"bright": "30"})));
        // Repeating the same value is not a change.
        reconciler.apply_notification("a", &notification(json!({"bright": "30"})));
        reconciler.set_online("a", true);

        let Some(DeviceEvent::StateChanged { state, .. }) = sub.next().await else {
            panic!("expected a state change");
        };
        assert_eq!(state.brightness(), Brightness::create(30));
        let Some(DeviceEvent::StateChanged { state, .. }) = sub.next().await else {
            panic!("expected a state change");
        };
        assert!(state.online());
    }
}
