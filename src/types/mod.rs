//! Value types for light control parameters.

mod brightness;
mod color;
mod effect;
mod hue_saturation;
mod kelvin;
mod method;
mod power;
mod scene;

pub use brightness::Brightness;
pub use color::Color;
pub use effect::Effect;
pub use hue_saturation::HueSaturation;
pub use kelvin::Kelvin;
pub use method::{Capabilities, Method};
pub use power::PowerMode;
pub use scene::Scene;
