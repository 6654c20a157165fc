//! Hue and Saturation color representation.

use serde::{Deserialize, Serialize};

/// Hue and Saturation color representation, as taken by `set_hsv`.
///
/// - Hue: The color angle on the color wheel (0-359 degrees)
/// - Saturation: The intensity of the color (0-100 percent)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HueSaturation {
    hue: u16,
    saturation: u8,
}

impl HueSaturation {
    /// Create a new HueSaturation with the given values.
    ///
    /// Returns `None` if values are outside valid ranges.
    ///
    /// # Examples
    ///
    /// ```
    /// use yeelight_lan_rs::HueSaturation;
    ///
    /// assert!(HueSaturation::create(0, 100).is_some());
    /// assert!(HueSaturation::create(359, 50).is_some());
    /// assert!(HueSaturation::create(360, 50).is_none());
    /// assert!(HueSaturation::create(180, 101).is_none());
    /// ```
    pub fn create(hue: u16, saturation: u8) -> Option<Self> {
        if hue < 360 && saturation <= 100 {
            Some(HueSaturation { hue, saturation })
        } else {
            None
        }
    }

    /// Get the hue value.
    pub fn hue(&self) -> u16 {
        self.hue
    }

    /// Get the saturation value.
    pub fn saturation(&self) -> u8 {
        self.saturation
    }
}
