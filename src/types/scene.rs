//! Direct-to-state scenes applied with `set_scene`.

use serde_json::{Value, json};

use super::{Brightness, Color, HueSaturation, Kelvin};
use crate::errors::Error;
use crate::flow::FlowSpec;

/// A target state the device jumps to in one command, powering on if needed.
#[derive(Debug, Clone, PartialEq)]
pub enum Scene {
    Color(Color, Brightness),
    Hsv(HueSaturation, Brightness),
    ColorTemperature(Kelvin, Brightness),
    Flow(FlowSpec),
    /// Turn on at the given brightness and switch off after `minutes`.
    AutoDelayOff(Brightness, u32),
}

impl Scene {
    /// The `set_scene` parameter list.
    pub fn params(&self) -> Result<Vec<Value>, Error> {
        Ok(match self {
            Scene::Color(color, bright) => {
                vec![json!("color"), json!(color.packed()), json!(bright.value())]
            }
            Scene::Hsv(hs, bright) => vec![
                json!("hsv"),
                json!(hs.hue()),
                json!(hs.saturation()),
                json!(bright.value()),
            ],
            Scene::ColorTemperature(kelvin, bright) => {
                vec![json!("ct"), json!(kelvin.kelvin()), json!(bright.value())]
            }
            Scene::Flow(spec) => {
                let expression = spec.encode()?;
                vec![
                    json!("cf"),
                    json!(spec.count()),
                    json!(spec.action().code()),
                    json!(expression),
                ]
            }
            Scene::AutoDelayOff(bright, minutes) => {
                if *minutes == 0 {
                    return Err(Error::validation("auto delay off needs at least one minute"));
                }
                vec![json!("auto_delay_off"), json!(bright.value()), json!(minutes)]
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_scene_params() {
        let scene = Scene::Color(Color::rgb(255, 0, 0), Brightness::create(40).unwrap());
        assert_eq!(
            scene.params().unwrap(),
            vec![json!("color"), json!(16711680), json!(40)]
        );
    }

    #[test]
    fn test_auto_delay_off_rejects_zero_minutes() {
        let scene = Scene::AutoDelayOff(Brightness::new(), 0);
        assert!(matches!(scene.params(), Err(Error::Validation(_))));
    }
}
