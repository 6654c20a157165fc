//! Device state snapshots and the partial patches merged into them.

use std::time::SystemTime;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::Command;
use crate::types::{Brightness, Color, HueSaturation, Kelvin, Method, PowerMode};

/// Which color channel is driving the light.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Rgb(Color),
    Temperature(Kelvin),
    Hsv(HueSaturation),
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
enum ModeKind {
    Rgb,
    Temperature,
    Hsv,
}

impl ModeKind {
    fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ModeKind::Rgb),
            2 => Some(ModeKind::Temperature),
            3 => Some(ModeKind::Hsv),
            _ => None,
        }
    }
}

/// Last known properties of one device.
///
/// Only the reconciler mutates a state; everyone else holds copies.
/// The last value seen on each color channel is remembered, but only the
/// channel named by the active mode is reported by [`DeviceState::color_mode`],
/// so RGB and temperature are never current at the same time.
#[serde_with::skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct DeviceState {
    power: Option<PowerMode>,
    brightness: Option<Brightness>,
    mode: Option<ModeKind>,
    rgb: Option<Color>,
    temperature: Option<Kelvin>,
    hsv: Option<HueSaturation>,
    flowing: bool,
    online: bool,
    name: Option<String>,
    updated_at: Option<SystemTime>,
}

impl DeviceState {
    pub fn power(&self) -> Option<PowerMode> {
        self.power
    }

    pub fn brightness(&self) -> Option<Brightness> {
        self.brightness
    }

    /// The active color channel and its value.
    pub fn color_mode(&self) -> Option<ColorMode> {
        match self.mode? {
            ModeKind::Rgb => self.rgb.map(ColorMode::Rgb),
            ModeKind::Temperature => self.temperature.map(ColorMode::Temperature),
            ModeKind::Hsv => self.hsv.map(ColorMode::Hsv),
        }
    }

    /// Whether a color flow is running.
    pub fn flowing(&self) -> bool {
        self.flowing
    }

    pub fn online(&self) -> bool {
        self.online
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn updated_at(&self) -> Option<SystemTime> {
        self.updated_at
    }

    /// Merge a patch field by field. Returns whether anything changed.
    ///
    /// # Examples
    ///
    /// ```
    /// use serde_json::json;
    /// use yeelight_lan_rs::{DeviceState, PowerMode, StatePatch};
    ///
    /// let mut state = DeviceState::default();
    /// state.apply(&StatePatch::from_props(json!({"power": "on", "bright": "80"}).as_object().unwrap()));
    /// state.apply(&StatePatch::from_props(json!({"bright": "30"}).as_object().unwrap()));
    /// assert_eq!(state.power(), Some(PowerMode::On));
    /// assert_eq!(state.brightness().unwrap().value(), 30);
    /// ```
    pub fn apply(&mut self, patch: &StatePatch) -> bool {
        let before = self.clone();

        if let Some(power) = patch.power {
            self.power = Some(power);
        }
        if patch.toggle_power
            && let Some(power) = self.power
        {
            self.power = Some(power.toggled());
        }
        if let Some(bright) = patch.brightness {
            self.brightness = Some(bright);
        }
        if let Some(rgb) = patch.rgb {
            self.rgb = Some(rgb);
        }
        if let Some(ct) = patch.temperature {
            self.temperature = Some(ct);
        }
        if let Some(hsv) = patch.hsv {
            self.hsv = Some(hsv);
        } else if patch.hue.is_some() || patch.saturation.is_some() {
            let current = self.hsv.unwrap_or_default();
            self.hsv = HueSaturation::create(
                patch.hue.unwrap_or(current.hue()),
                patch.saturation.unwrap_or(current.saturation()),
            );
        }
        if let Some(mode) = patch.mode {
            self.mode = Some(mode);
        } else if let Some(implied) = patch.implied_mode() {
            self.mode = Some(implied);
        }
        if let Some(flowing) = patch.flowing {
            self.flowing = flowing;
        }
        if let Some(name) = &patch.name {
            self.name = Some(name.clone());
        }

        let changed = *self != before;
        if changed {
            self.touch();
        }
        changed
    }

    pub(crate) fn set_online(&mut self, online: bool) -> bool {
        if self.online == online {
            return false;
        }
        self.online = online;
        self.touch();
        true
    }

    fn touch(&mut self) {
        self.updated_at = Some(SystemTime::now());
    }
}

/// A partial update: every `None` field leaves the state untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub power: Option<PowerMode>,
    toggle_power: bool,
    pub brightness: Option<Brightness>,
    pub rgb: Option<Color>,
    pub temperature: Option<Kelvin>,
    pub hsv: Option<HueSaturation>,
    hue: Option<u16>,
    saturation: Option<u8>,
    mode: Option<ModeKind>,
    pub flowing: Option<bool>,
    pub name: Option<String>,
}

impl StatePatch {
    pub fn is_empty(&self) -> bool {
        *self == StatePatch::default()
    }

    /// Build a patch from device property names and values, as pushed in
    /// notifications, returned by `get_prop`, or advertised in discovery.
    ///
    /// Unknown properties and out-of-range values are skipped.
    pub fn from_props(props: &Map<String, Value>) -> Self {
        let mut patch = StatePatch::default();
        for (key, value) in props {
            patch.set_prop(key, value);
        }
        patch
    }

    pub(crate) fn set_prop(&mut self, key: &str, value: &Value) {
        match key {
            "power" => self.power = as_str(value).and_then(|s| s.parse().ok()),
            "bright" => self.brightness = as_int(value).and_then(|b| u8::try_from(b).ok()).and_then(Brightness::create),
            "ct" => self.temperature = as_int(value).and_then(|k| u16::try_from(k).ok()).and_then(Kelvin::create),
            "rgb" => self.rgb = as_int(value).and_then(|v| u32::try_from(v).ok()).and_then(Color::from_packed),
            "hue" => self.hue = as_int(value).and_then(|h| u16::try_from(h).ok()).filter(|h| *h < 360),
            "sat" => self.saturation = as_int(value).and_then(|s| u8::try_from(s).ok()).filter(|s| *s <= 100),
            "color_mode" => self.mode = as_int(value).and_then(ModeKind::from_code),
            "flowing" => self.flowing = as_int(value).map(|f| f != 0),
            "name" => self.name = as_str(value).map(String::from),
            _ => debug!("Ignoring property {key}={value}"),
        }
    }

    /// The fields a successful command is known to change.
    ///
    /// `result` is the success payload, which only matters for `get_prop`.
    pub fn from_command(command: &Command, result: &[Value]) -> Self {
        let params = command.params();
        let mut patch = StatePatch::default();
        let Some(method) = command.known_method() else {
            return patch;
        };

        match method {
            Method::SetPower => {
                patch.power = params.first().and_then(as_str).and_then(|s| s.parse().ok())
            }
            Method::Toggle => patch.toggle_power = true,
            Method::SetBright => patch.set_prop("bright", param(params, 0)),
            Method::SetRgb => {
                patch.set_prop("rgb", param(params, 0));
                patch.mode = patch.rgb.map(|_| ModeKind::Rgb);
            }
            Method::SetCtAbx => {
                patch.set_prop("ct", param(params, 0));
                patch.mode = patch.temperature.map(|_| ModeKind::Temperature);
            }
            Method::SetHsv => {
                patch.hsv = match (as_int(param(params, 0)), as_int(param(params, 1))) {
                    (Some(h), Some(s)) => u16::try_from(h)
                        .ok()
                        .zip(u8::try_from(s).ok())
                        .and_then(|(h, s)| HueSaturation::create(h, s)),
                    _ => None,
                };
                patch.mode = patch.hsv.map(|_| ModeKind::Hsv);
            }
            Method::StartCf => patch.flowing = Some(true),
            Method::StopCf => patch.flowing = Some(false),
            Method::SetName => patch.set_prop("name", param(params, 0)),
            Method::SetScene => patch.apply_scene(params),
            Method::GetProp => {
                for (key, value) in params.iter().zip(result) {
                    // Properties the device cannot report come back empty.
                    if let Some(key) = key.as_str()
                        && value.as_str() != Some("")
                    {
                        patch.set_prop(key, value);
                    }
                }
            }
            _ => {}
        }
        patch
    }

    fn apply_scene(&mut self, params: &[Value]) {
        self.power = Some(PowerMode::On);
        match params.first().and_then(as_str) {
            Some("color") => {
                self.set_prop("rgb", param(params, 1));
                self.set_prop("bright", param(params, 2));
                self.mode = self.rgb.map(|_| ModeKind::Rgb);
            }
            Some("hsv") => {
                self.set_prop("hue", param(params, 1));
                self.set_prop("sat", param(params, 2));
                self.set_prop("bright", param(params, 3));
                self.mode = Some(ModeKind::Hsv);
            }
            Some("ct") => {
                self.set_prop("ct", param(params, 1));
                self.set_prop("bright", param(params, 2));
                self.mode = self.temperature.map(|_| ModeKind::Temperature);
            }
            Some("cf") => self.flowing = Some(true),
            Some("auto_delay_off") => self.set_prop("bright", param(params, 1)),
            _ => {}
        }
    }

    fn implied_mode(&self) -> Option<ModeKind> {
        match (
            self.rgb,
            self.temperature,
            self.hsv.is_some() || self.hue.is_some() || self.saturation.is_some(),
        ) {
            (Some(_), None, false) => Some(ModeKind::Rgb),
            (None, Some(_), false) => Some(ModeKind::Temperature),
            (None, None, true) => Some(ModeKind::Hsv),
            _ => None,
        }
    }
}

fn param(params: &[Value], index: usize) -> &Value {
    params.get(index).unwrap_or(&Value::Null)
}

fn as_str(value: &Value) -> Option<&str> {
    value.as_str()
}

/// Devices report numbers either as JSON numbers or as decimal strings.
fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_notification_patch_leaves_other_fields() {
        let mut state = DeviceState::default();
        state.apply(&StatePatch::from_props(&props(json!({"power": "on", "bright": 80}))));
        assert!(state.apply(&StatePatch::from_props(&props(json!({"bright": "30"})))));
        assert_eq!(state.brightness(), Brightness::create(30));
        assert_eq!(state.power(), Some(PowerMode::On));
    }

    #[test]
    fn test_unknown_and_invalid_props_are_ignored() {
        let patch = StatePatch::from_props(&props(json!({
            "bright": "0",
            "music_on": "1",
            "bg_power": "on",
            "ct": "abc",
        })));
        assert!(patch.is_empty());
    }

    #[test]
    fn test_color_modes_are_exclusive() {
        let mut state = DeviceState::default();
        state.apply(&StatePatch::from_props(&props(json!({"rgb": "16711680", "color_mode": "1"}))));
        assert_eq!(state.color_mode(), Some(ColorMode::Rgb(Color::rgb(255, 0, 0))));

        state.apply(&StatePatch::from_props(&props(json!({"ct": "2700"}))));
        assert_eq!(
            state.color_mode(),
            Some(ColorMode::Temperature(Kelvin::create(2700).unwrap()))
        );

        // Both channels reported: the explicit mode decides.
        state.apply(&StatePatch::from_props(&props(
            json!({"rgb": "255", "ct": "4000", "color_mode": "1"}),
        )));
        assert_eq!(state.color_mode(), Some(ColorMode::Rgb(Color::rgb(0, 0, 255))));
    }

    #[test]
    fn test_set_power_patch_only_touches_power() {
        let cmd = Command::raw("set_power", vec![json!("on"), json!("smooth"), json!(500)]);
        let patch = StatePatch::from_command(&cmd, &[json!("ok")]);
        assert_eq!(
            patch,
            StatePatch {
                power: Some(PowerMode::On),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_get_prop_patch_zips_names_and_values() {
        let cmd = Command::raw("get_prop", vec![json!("power"), json!("bright"), json!("ct")]);
        let patch = StatePatch::from_command(&cmd, &[json!("off"), json!("42"), json!("")]);
        assert_eq!(patch.power, Some(PowerMode::Off));
        assert_eq!(patch.brightness, Brightness::create(42));
        assert_eq!(patch.temperature, None);
    }

    #[test]
    fn test_toggle_without_known_power_is_a_no_op() {
        let mut state = DeviceState::default();
        let toggle = StatePatch::from_command(&Command::raw("toggle", vec![]), &[json!("ok")]);
        assert!(!state.apply(&toggle));

        state.apply(&StatePatch {
            power: Some(PowerMode::On),
            ..Default::default()
        });
        assert!(state.apply(&toggle));
        assert_eq!(state.power(), Some(PowerMode::Off));
    }

    #[test]
    fn test_scene_patch_powers_on() {
        let cmd = Command::raw("set_scene", vec![json!("ct"), json!(3000), json!(20)]);
        let mut state = DeviceState::default();
        state.apply(&StatePatch::from_command(&cmd, &[json!("ok")]));
        assert_eq!(state.power(), Some(PowerMode::On));
        assert_eq!(state.brightness(), Brightness::create(20));
        assert_eq!(
            state.color_mode(),
            Some(ColorMode::Temperature(Kelvin::create(3000).unwrap()))
        );
    }
}
