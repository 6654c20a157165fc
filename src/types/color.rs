//! RGB color representation.

use serde::{Deserialize, Serialize};

/// An RGB color with red, green, and blue components (0-255 each).
///
/// On the wire a color travels as a single integer `0xRRGGBB`.
#[derive(Default, Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub(crate) red: u8,
    pub(crate) green: u8,
    pub(crate) blue: u8,
}

impl Color {
    /// Largest packed value.
    pub const MAX_PACKED: u32 = 0xFF_FF_FF;

    /// Create a color with the given RGB values.
    pub fn rgb(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    pub fn red(&self) -> u8 {
        self.red
    }

    pub fn green(&self) -> u8 {
        self.green
    }

    pub fn blue(&self) -> u8 {
        self.blue
    }

    /// Pack into the protocol's 24-bit integer.
    ///
    /// # Examples
    ///
    /// ```
    /// use yeelight_lan_rs::Color;
    ///
    /// assert_eq!(Color::rgb(255, 0, 0).packed(), 16711680);
    /// assert_eq!(Color::from_packed(65280), Some(Color::rgb(0, 255, 0)));
    /// ```
    pub fn packed(&self) -> u32 {
        (self.red as u32) << 16 | (self.green as u32) << 8 | self.blue as u32
    }

    /// Unpack a 24-bit integer. Returns `None` above `0xFFFFFF`.
    pub fn from_packed(value: u32) -> Option<Self> {
        if value > Self::MAX_PACKED {
            return None;
        }
        Some(Self::rgb(
            (value >> 16 & 0xFF) as u8,
            (value >> 8 & 0xFF) as u8,
            (value & 0xFF) as u8,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_limits() {
        assert_eq!(Color::rgb(255, 255, 255).packed(), Color::MAX_PACKED);
        assert!(Color::from_packed(Color::MAX_PACKED + 1).is_none());
    }
}
