//! Color flow encoding.
//!
//! A flow is a device-side animation: the device walks through a list of
//! transitions on its own after a single `start_cf` command. Each transition
//! travels as the tuple `duration,mode,value,brightness`, and tuples are
//! joined with commas into one flow expression.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::codec::Command;
use crate::errors::Error;
use crate::types::{Brightness, Color, Kelvin, Method};

type Result<T> = std::result::Result<T, Error>;

/// What a transition changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionMode {
    /// `value` is a packed RGB color.
    Color,
    /// `value` is a color temperature in Kelvin.
    Temperature,
    /// Hold the current state; `value` and `brightness` are ignored.
    Sleep,
}

impl TransitionMode {
    /// Numeric mode code used in the flow expression.
    pub fn code(&self) -> u8 {
        match self {
            TransitionMode::Color => 1,
            TransitionMode::Temperature => 2,
            TransitionMode::Sleep => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(TransitionMode::Color),
            2 => Some(TransitionMode::Temperature),
            7 => Some(TransitionMode::Sleep),
            _ => None,
        }
    }
}

/// What the device does once the flow ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlowAction {
    /// Return to the state before the flow started.
    #[default]
    Recover,
    /// Stay at the last transition.
    Stay,
    /// Power off.
    TurnOff,
}

impl FlowAction {
    pub fn code(&self) -> u8 {
        match self {
            FlowAction::Recover => 0,
            FlowAction::Stay => 1,
            FlowAction::TurnOff => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(FlowAction::Recover),
            1 => Some(FlowAction::Stay),
            2 => Some(FlowAction::TurnOff),
            _ => None,
        }
    }
}

/// One step of a flow.
///
/// Fields are kept raw so that specs can be deserialized from caller data;
/// everything is checked by [`FlowSpec::encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub duration_ms: u32,
    pub mode: TransitionMode,
    pub value: u32,
    /// `None` keeps the current brightness (encoded as `-1`).
    pub brightness: Option<u8>,
}

impl Transition {
    /// Shortest transition the firmware accepts.
    pub const MIN_DURATION_MS: u32 = 50;

    pub fn new(duration_ms: u32, mode: TransitionMode, value: u32, brightness: Option<u8>) -> Self {
        Transition {
            duration_ms,
            mode,
            value,
            brightness,
        }
    }

    /// Fade to an RGB color.
    pub fn color(duration: Duration, color: Color, brightness: Option<Brightness>) -> Self {
        Self::new(
            duration_ms(duration),
            TransitionMode::Color,
            color.packed(),
            brightness.map(|b| b.value()),
        )
    }

    /// Fade to a color temperature.
    pub fn temperature(duration: Duration, kelvin: Kelvin, brightness: Option<Brightness>) -> Self {
        Self::new(
            duration_ms(duration),
            TransitionMode::Temperature,
            kelvin.kelvin() as u32,
            brightness.map(|b| b.value()),
        )
    }

    /// Hold for a while.
    pub fn sleep(duration: Duration) -> Self {
        Self::new(duration_ms(duration), TransitionMode::Sleep, 0, None)
    }

    fn validate(&self, index: usize) -> Result<()> {
        if self.duration_ms < Self::MIN_DURATION_MS {
            return Err(Error::validation(format!(
                "transition {index}: duration {}ms is below {}ms",
                self.duration_ms,
                Self::MIN_DURATION_MS
            )));
        }
        match self.mode {
            TransitionMode::Color if self.value > Color::MAX_PACKED => {
                return Err(Error::validation(format!(
                    "transition {index}: color {:#x} is not a 24-bit rgb value",
                    self.value
                )));
            }
            TransitionMode::Temperature
                if u16::try_from(self.value).ok().and_then(Kelvin::create).is_none() =>
            {
                return Err(Error::validation(format!(
                    "transition {index}: temperature {}K outside {}-{}K",
                    self.value,
                    Kelvin::MIN,
                    Kelvin::MAX
                )));
            }
            TransitionMode::Sleep if self.value != 0 || self.brightness.is_some() => {
                return Err(Error::validation(format!(
                    "transition {index}: a sleep carries no value or brightness"
                )));
            }
            _ => {}
        }
        if let Some(bright) = self.brightness
            && !Brightness::is_valid(bright)
        {
            return Err(Error::validation(format!(
                "transition {index}: brightness {bright} outside {}-{}",
                Brightness::MIN,
                Brightness::MAX
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, brightness) = match self.mode {
            TransitionMode::Sleep => (0, 0),
            _ => (self.value, self.brightness.map_or(-1, i16::from)),
        };
        write!(
            f,
            "{},{},{},{}",
            self.duration_ms,
            self.mode.code(),
            value,
            brightness
        )
    }
}

fn duration_ms(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// An ordered list of transitions with a repeat count and a final action.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use yeelight_lan_rs::{Brightness, Color, Kelvin};
/// use yeelight_lan_rs::flow::{FlowAction, FlowSpec, Transition};
///
/// let spec = FlowSpec::new(
///     vec![
///         Transition::temperature(Duration::from_millis(1000), Kelvin::create(2700).unwrap(), Brightness::create(100)),
///         Transition::color(Duration::from_millis(500), Color::rgb(255, 0, 0), Brightness::create(10)),
///     ],
///     3,
///     FlowAction::Stay,
/// );
/// assert_eq!(spec.encode().unwrap(), "1000,2,2700,100,500,1,16711680,10");
/// assert_eq!(spec.count(), 6);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSpec {
    transitions: Vec<Transition>,
    repeat: u32,
    action: FlowAction,
}

impl FlowSpec {
    /// Upper bound on transitions per flow.
    pub const MAX_TRANSITIONS: usize = 100;

    /// `repeat` is the number of passes through the list; 0 loops forever.
    pub fn new(transitions: Vec<Transition>, repeat: u32, action: FlowAction) -> Self {
        FlowSpec {
            transitions,
            repeat,
            action,
        }
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn repeat(&self) -> u32 {
        self.repeat
    }

    pub fn action(&self) -> FlowAction {
        self.action
    }

    /// The device-side `count`: total visible state changes before stopping.
    pub fn count(&self) -> u32 {
        self.repeat
            .saturating_mul(u32::try_from(self.transitions.len()).unwrap_or(u32::MAX))
    }

    /// Check every bound without encoding.
    pub fn validate(&self) -> Result<()> {
        if self.transitions.is_empty() {
            return Err(Error::validation("flow has no transitions"));
        }
        if self.transitions.len() > Self::MAX_TRANSITIONS {
            return Err(Error::validation(format!(
                "flow has {} transitions, at most {} allowed",
                self.transitions.len(),
                Self::MAX_TRANSITIONS
            )));
        }
        self.transitions
            .iter()
            .enumerate()
            .try_for_each(|(i, t)| t.validate(i))
    }

    /// Produce the flow expression.
    pub fn encode(&self) -> Result<String> {
        self.validate()?;
        Ok(self
            .transitions
            .iter()
            .map(Transition::to_string)
            .collect::<Vec<_>>()
            .join(","))
    }

    /// The `start_cf` command for this flow.
    pub fn start_command(&self) -> Result<Command> {
        let expression = self.encode()?;
        Ok(Command::new(
            Method::StartCf,
            vec![json!(self.count()), json!(self.action.code()), json!(expression)],
        ))
    }
}

/// The `stop_cf` command.
pub fn stop_command() -> Command {
    Command::new(Method::StopCf, Vec::new())
}

/// Parse a flow expression back into transitions.
///
/// Sleep transitions come back with `value` 0 and no brightness, and
/// a brightness of `-1` comes back as `None`.
pub fn decode(expression: &str) -> Result<Vec<Transition>> {
    let fields: Vec<&str> = expression.split(',').map(str::trim).collect();
    if fields.len() % 4 != 0 || expression.trim().is_empty() {
        return Err(Error::Malformed(format!(
            "flow expression has {} fields, expected a multiple of 4",
            fields.len()
        )));
    }

    fields
        .chunks(4)
        .map(|tuple| {
            let parse = |s: &str| {
                s.parse::<i64>()
                    .map_err(|e| Error::Malformed(format!("flow field {s:?}: {e}")))
            };
            let duration = u32::try_from(parse(tuple[0])?)
                .map_err(|_| Error::Malformed(format!("flow duration {}", tuple[0])))?;
            let mode = u8::try_from(parse(tuple[1])?)
                .ok()
                .and_then(TransitionMode::from_code)
                .ok_or_else(|| Error::Malformed(format!("flow mode {}", tuple[1])))?;
            let value = u32::try_from(parse(tuple[2])?)
                .map_err(|_| Error::Malformed(format!("flow value {}", tuple[2])))?;
            let brightness = match (mode, parse(tuple[3])?) {
                (TransitionMode::Sleep, _) | (_, -1) => None,
                (_, b) => Some(
                    u8::try_from(b)
                        .map_err(|_| Error::Malformed(format!("flow brightness {b}")))?,
                ),
            };
            Ok(Transition::new(duration, mode, value, brightness))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Transition> {
        vec![
            Transition::new(1000, TransitionMode::Temperature, 2700, Some(100)),
            Transition::new(500, TransitionMode::Color, 0x00FF00, None),
            Transition::sleep(Duration::from_secs(2)),
            Transition::new(50, TransitionMode::Color, 255, Some(1)),
        ]
    }

    #[test]
    fn test_encode_decode_preserves_order() {
        let spec = FlowSpec::new(sample(), 0, FlowAction::Recover);
        let expression = spec.encode().unwrap();
        assert_eq!(
            expression,
            "1000,2,2700,100,500,1,65280,-1,2000,7,0,0,50,1,255,1"
        );
        assert_eq!(decode(&expression).unwrap(), sample());
    }

    #[test]
    fn test_sleep_with_payload_is_rejected() {
        let with_value = Transition::new(100, TransitionMode::Sleep, 5, None);
        let with_brightness = Transition::new(100, TransitionMode::Sleep, 0, Some(3));
        for sleep in [with_value, with_brightness] {
            let spec = FlowSpec::new(vec![sleep], 1, FlowAction::Stay);
            assert!(matches!(spec.encode(), Err(Error::Validation(_))));
        }

        let sleep = Transition::sleep(Duration::from_millis(100));
        let spec = FlowSpec::new(vec![sleep], 1, FlowAction::Stay);
        assert_eq!(decode(&spec.encode().unwrap()).unwrap(), vec![sleep]);
    }

    #[test]
    fn test_empty_flow_is_rejected() {
        let spec = FlowSpec::new(Vec::new(), 1, FlowAction::Stay);
        assert!(matches!(spec.encode(), Err(Error::Validation(_))));
        assert!(matches!(spec.start_command(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_bounds_are_checked() {
        let too_short = Transition::new(49, TransitionMode::Color, 0, Some(50));
        let bad_ct = Transition::new(100, TransitionMode::Temperature, 9000, Some(50));
        let bad_color = Transition::new(100, TransitionMode::Color, 0x1_000_000, Some(50));
        let bad_bright = Transition::new(100, TransitionMode::Color, 0, Some(0));
        for t in [too_short, bad_ct, bad_color, bad_bright] {
            let spec = FlowSpec::new(vec![t], 1, FlowAction::Stay);
            assert!(matches!(spec.validate(), Err(Error::Validation(_))), "{t:?}");
        }

        let many = vec![Transition::sleep(Duration::from_secs(1)); FlowSpec::MAX_TRANSITIONS + 1];
        assert!(FlowSpec::new(many, 1, FlowAction::Stay).validate().is_err());
    }

    #[test]
    fn test_start_command_params() {
        let spec = FlowSpec::new(sample(), 2, FlowAction::TurnOff);
        let cmd = spec.start_command().unwrap();
        assert_eq!(cmd.method(), "start_cf");
        assert_eq!(cmd.params()[0], json!(8));
        assert_eq!(cmd.params()[1], json!(2));
        assert_eq!(cmd.params()[2], json!(spec.encode().unwrap()));
        assert_eq!(stop_command().method(), "stop_cf");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("").is_err());
        assert!(decode("1000,2,2700").is_err());
        assert!(decode("1000,9,2700,100").is_err());
        assert!(decode("1000,2,abc,100").is_err());
    }
}
