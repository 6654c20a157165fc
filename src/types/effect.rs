//! Transition effect for property changes.

use std::time::Duration;

use serde_json::{Value, json};

use crate::errors::Error;

/// How a property change is applied by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Effect {
    /// Jump straight to the target value.
    Sudden,
    /// Fade to the target value over the given duration.
    Smooth(Duration),
    /// Fade with the default 500 ms.
    #[default]
    Default,
}

impl Effect {
    /// Shortest fade the firmware accepts.
    pub const MIN_SMOOTH: Duration = Duration::from_millis(30);
    const DEFAULT_SMOOTH_MS: u64 = 500;

    /// The `(effect, duration)` parameter pair.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use serde_json::json;
    /// use yeelight_lan_rs::Effect;
    ///
    /// let params = Effect::Smooth(Duration::from_millis(300)).params().unwrap();
    /// assert_eq!(params, vec![json!("smooth"), json!(300)]);
    /// assert!(Effect::Smooth(Duration::from_millis(10)).params().is_err());
    /// ```
    pub fn params(&self) -> Result<Vec<Value>, Error> {
        match self {
            Effect::Sudden => Ok(vec![json!("sudden"), json!(0)]),
            Effect::Default => Ok(vec![json!("smooth"), json!(Self::DEFAULT_SMOOTH_MS)]),
            Effect::Smooth(duration) => {
                if *duration < Self::MIN_SMOOTH {
                    return Err(Error::validation(format!(
                        "smooth duration {}ms is below {}ms",
                        duration.as_millis(),
                        Self::MIN_SMOOTH.as_millis()
                    )));
                }
                Ok(vec![json!("smooth"), json!(duration.as_millis() as u64)])
            }
        }
    }
}
