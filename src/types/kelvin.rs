//! Color temperature control.

use serde::{Deserialize, Serialize};

/// Color temperature in Kelvin, with valid values from 1700K to 6500K.
///
/// Lower values produce warmer (more yellow/orange) light, while higher
/// values produce cooler (more blue) light.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "u16", into = "u16")]
pub struct Kelvin {
    pub(crate) kelvin: u16,
}

impl Kelvin {
    pub const MIN: u16 = 1700;
    pub const MAX: u16 = 6500;

    /// Create a new Kelvin with a neutral white (4000K).
    ///
    /// # Examples
    ///
    /// ```
    /// use yeelight_lan_rs::Kelvin;
    ///
    /// assert_eq!(Kelvin::new().kelvin(), 4000);
    /// ```
    pub fn new() -> Self {
        Kelvin { kelvin: 4000 }
    }

    /// Get the kelvin value.
    pub fn kelvin(&self) -> u16 {
        self.kelvin
    }

    /// Create a new Kelvin with the given value.
    ///
    /// Returns `None` if value is outside the valid range (1700-6500).
    ///
    /// # Examples
    ///
    /// ```
    /// use yeelight_lan_rs::Kelvin;
    ///
    /// assert!(Kelvin::create(1699).is_none());
    /// assert!(Kelvin::create(1700).is_some());
    /// assert!(Kelvin::create(6500).is_some());
    /// assert!(Kelvin::create(6501).is_none());
    /// ```
    pub fn create(kelvin: u16) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&kelvin) {
            Some(Kelvin { kelvin })
        } else {
            None
        }
    }
}

impl Default for Kelvin {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<u16> for Kelvin {
    type Error = String;

    fn try_from(kelvin: u16) -> Result<Self, String> {
        Kelvin::create(kelvin).ok_or_else(|| format!("color temperature {kelvin}K outside 1700-6500"))
    }
}

impl From<Kelvin> for u16 {
    fn from(kelvin: Kelvin) -> u16 {
        kelvin.kelvin
    }
}
