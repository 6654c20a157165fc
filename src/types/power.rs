//! Power mode for light control.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Power state for a light, spelled `"on"` / `"off"` on the wire.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PowerMode {
    /// Turn the light on
    On,
    /// Turn the light off
    Off,
}

impl PowerMode {
    pub fn is_on(&self) -> bool {
        matches!(self, PowerMode::On)
    }

    /// The opposite state.
    pub fn toggled(&self) -> Self {
        match self {
            PowerMode::On => PowerMode::Off,
            PowerMode::Off => PowerMode::On,
        }
    }
}

impl From<bool> for PowerMode {
    fn from(on: bool) -> Self {
        if on { PowerMode::On } else { PowerMode::Off }
    }
}
