//! Typed control of a single device.

use serde_json::{Value, json};

use crate::codec::{Command, Response};
use crate::connection::{Connection, ConnectionStatus};
use crate::discovery::DeviceDescriptor;
use crate::errors::Error;
use crate::flow::{self, FlowSpec};
use crate::history::MessageHistory;
use crate::reconciler::Reconciler;
use crate::state::DeviceState;
use crate::types::{
    Brightness, Capabilities, Color, Effect, HueSaturation, Kelvin, Method, PowerMode, Scene,
};

type Result<T> = std::result::Result<T, Error>;

/// Properties read back by [`Light::refresh`].
pub const TRACKED_PROPERTIES: &[&str] = &[
    "power",
    "bright",
    "color_mode",
    "ct",
    "rgb",
    "hue",
    "sat",
    "flowing",
    "name",
];

/// Timer type of the sleep timer in `cron_*` commands.
const SLEEP_TIMER: u8 = 0;

/// A typed handle to one pooled device.
///
/// Every method checks the device's declared [`Capabilities`] before
/// sending, validates its arguments, and returns once the device has
/// acknowledged the command. The acknowledged change is already reflected
/// in [`Light::state`] by then.
#[derive(Debug, Clone)]
pub struct Light {
    connection: Connection,
    descriptor: DeviceDescriptor,
    reconciler: Reconciler,
}

impl Light {
    pub fn new(connection: Connection, descriptor: DeviceDescriptor, reconciler: Reconciler) -> Self {
        Light {
            connection,
            descriptor,
            reconciler,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.descriptor.capabilities
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// A copy of the last known state.
    pub fn state(&self) -> DeviceState {
        self.reconciler.snapshot(self.id()).unwrap_or_default()
    }

    fn command(&self, method: Method, params: Vec<Value>) -> Result<Command> {
        if !self.capabilities().supports(method) {
            return Err(Error::unsupported(self.id(), method));
        }
        Ok(Command::new(method, params))
    }

    async fn call(&self, method: Method, params: Vec<Value>) -> Result<Response> {
        let command = self.command(method, params)?;
        self.connection.send(command).await
    }

    /// Send a command as is. Known methods are still checked against the
    /// declared capabilities.
    pub async fn send(&self, command: Command) -> Result<Response> {
        if let Some(method) = command.known_method()
            && !self.capabilities().supports(method)
        {
            return Err(Error::unsupported(self.id(), method));
        }
        self.connection.send(command).await
    }

    pub async fn set_power(&self, power: PowerMode, effect: Effect) -> Result<Response> {
        let mut params = vec![json!(power.as_ref())];
        params.extend(effect.params()?);
        self.call(Method::SetPower, params).await
    }

    pub async fn toggle(&self) -> Result<Response> {
        self.call(Method::Toggle, Vec::new()).await
    }

    pub async fn set_brightness(&self, brightness: Brightness, effect: Effect) -> Result<Response> {
        let mut params = vec![json!(brightness.value())];
        params.extend(effect.params()?);
        self.call(Method::SetBright, params).await
    }

    pub async fn set_rgb(&self, color: Color, effect: Effect) -> Result<Response> {
        let mut params = vec![json!(color.packed())];
        params.extend(effect.params()?);
        self.call(Method::SetRgb, params).await
    }

    pub async fn set_hsv(&self, hsv: HueSaturation, effect: Effect) -> Result<Response> {
        let mut params = vec![json!(hsv.hue()), json!(hsv.saturation())];
        params.extend(effect.params()?);
        self.call(Method::SetHsv, params).await
    }

    pub async fn set_color_temperature(&self, kelvin: Kelvin, effect: Effect) -> Result<Response> {
        let mut params = vec![json!(kelvin.kelvin())];
        params.extend(effect.params()?);
        self.call(Method::SetCtAbx, params).await
    }

    pub async fn set_name(&self, name: &str) -> Result<Response> {
        if name.trim().is_empty() {
            return Err(Error::validation("device name is empty"));
        }
        self.call(Method::SetName, vec![json!(name)]).await
    }

    /// Save the current state as the power-on default.
    pub async fn set_default(&self) -> Result<Response> {
        self.call(Method::SetDefault, Vec::new()).await
    }

    pub async fn set_scene(&self, scene: &Scene) -> Result<Response> {
        let params = scene.params()?;
        self.call(Method::SetScene, params).await
    }

    pub async fn start_flow(&self, spec: &FlowSpec) -> Result<Response> {
        let command = spec.start_command()?;
        self.send(command).await
    }

    pub async fn stop_flow(&self) -> Result<Response> {
        self.send(flow::stop_command()).await
    }

    /// Switch the light off after `minutes`.
    pub async fn sleep_timer(&self, minutes: u32) -> Result<Response> {
        if minutes == 0 {
            return Err(Error::validation("sleep timer needs at least one minute"));
        }
        self.call(Method::CronAdd, vec![json!(SLEEP_TIMER), json!(minutes)])
            .await
    }

    /// Minutes left on the sleep timer, if one is set.
    pub async fn sleep_timer_remaining(&self) -> Result<Option<u32>> {
        let response = self.call(Method::CronGet, vec![json!(SLEEP_TIMER)]).await?;
        Ok(response
            .result()
            .and_then(|r| r.first())
            .and_then(|timer| timer.get("delay"))
            .and_then(Value::as_u64)
            .and_then(|d| u32::try_from(d).ok()))
    }

    pub async fn cancel_sleep_timer(&self) -> Result<Response> {
        self.call(Method::CronDel, vec![json!(SLEEP_TIMER)]).await
    }

    /// Read every tracked property back from the device.
    pub async fn refresh(&self) -> Result<DeviceState> {
        let params = TRACKED_PROPERTIES.iter().map(|p| json!(p)).collect();
        self.call(Method::GetProp, params).await?;
        Ok(self.state())
    }

    pub fn history(&self) -> MessageHistory {
        self.connection.history()
    }

    /// Returns diagnostics including state, connection and history.
    pub fn diagnostics(&self) -> Value {
        json!({
            "descriptor": &self.descriptor,
            "state": self.state(),
            "connection": self.connection.diagnostics(),
        })
    }
}
