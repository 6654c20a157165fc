//! Brightness control.

use serde::{Deserialize, Serialize};

/// Brightness level from 1 to 100 percent.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "u8", into = "u8")]
pub struct Brightness {
    pub(crate) value: u8,
}

impl Brightness {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 100;

    /// Full brightness.
    pub fn new() -> Self {
        Brightness { value: Self::MAX }
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    /// Returns None if value is outside valid range (1-100).
    ///
    /// # Examples
    ///
    /// ```
    /// use yeelight_lan_rs::Brightness;
    ///
    /// assert!(Brightness::create(0).is_none());
    /// assert!(Brightness::create(1).is_some());
    /// assert!(Brightness::create(100).is_some());
    /// assert!(Brightness::create(101).is_none());
    /// ```
    pub fn create(value: u8) -> Option<Self> {
        if Self::is_valid(value) {
            Some(Brightness { value })
        } else {
            None
        }
    }

    pub(crate) fn is_valid(value: u8) -> bool {
        (Self::MIN..=Self::MAX).contains(&value)
    }
}

impl Default for Brightness {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<u8> for Brightness {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        Brightness::create(value).ok_or_else(|| format!("brightness {value} outside 1-100"))
    }
}

impl From<Brightness> for u8 {
    fn from(brightness: Brightness) -> u8 {
        brightness.value
    }
}
