//! Protocol methods and per-device capability sets.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Control methods understood by the devices.
///
/// Models declare the subset they implement in the `support:` header of
/// their advertisement; see [`Capabilities`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Method {
    GetProp,
    SetCtAbx,
    SetRgb,
    SetHsv,
    SetBright,
    SetPower,
    Toggle,
    SetDefault,
    StartCf,
    StopCf,
    SetScene,
    CronAdd,
    CronGet,
    CronDel,
    SetAdjust,
    SetMusic,
    SetName,
    AdjustBright,
    AdjustCt,
    AdjustColor,
}

/// The set of methods a device declared support for.
///
/// An empty set means the device never told us, in which case every method
/// is allowed and the device itself is left to reject what it lacks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    methods: BTreeSet<Method>,
    /// Declared methods this engine has no typed name for.
    unrecognized: BTreeSet<String>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the device may be sent `method`.
    pub fn supports(&self, method: Method) -> bool {
        self.is_unknown() || self.methods.contains(&method)
    }

    /// True when nothing was declared.
    pub fn is_unknown(&self) -> bool {
        self.methods.is_empty() && self.unrecognized.is_empty()
    }

    pub fn methods(&self) -> impl Iterator<Item = Method> + '_ {
        self.methods.iter().copied()
    }

    pub fn unrecognized(&self) -> impl Iterator<Item = &str> {
        self.unrecognized.iter().map(String::as_str)
    }

    pub fn insert(&mut self, method: Method) {
        self.methods.insert(method);
    }
}

impl FromStr for Capabilities {
    type Err = std::convert::Infallible;

    /// Parse a whitespace separated method list.
    ///
    /// # Examples
    ///
    /// ```
    /// use yeelight_lan_rs::{Capabilities, Method};
    ///
    /// let caps: Capabilities = "get_prop set_power bg_set_rgb".parse().unwrap();
    /// assert!(caps.supports(Method::SetPower));
    /// assert!(!caps.supports(Method::StartCf));
    /// assert_eq!(caps.unrecognized().collect::<Vec<_>>(), vec!["bg_set_rgb"]);
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut caps = Capabilities::new();
        for token in s.split_whitespace() {
            match Method::from_str(token) {
                Ok(method) => {
                    caps.methods.insert(method);
                }
                Err(_) => {
                    caps.unrecognized.insert(token.to_string());
                }
            }
        }
        Ok(caps)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .methods
            .iter()
            .map(|m| m.as_ref())
            .chain(self.unrecognized.iter().map(String::as_str))
            .collect();
        write!(f, "{}", names.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_method_names_round_trip() {
        for method in Method::iter() {
            assert_eq!(Method::from_str(method.as_ref()), Ok(method));
        }
        assert_eq!(Method::SetCtAbx.as_ref(), "set_ct_abx");
        assert_eq!(Method::StartCf.to_string(), "start_cf");
    }

    #[test]
    fn test_unknown_capabilities_allow_everything() {
        let caps = Capabilities::new();
        assert!(caps.is_unknown());
        assert!(caps.supports(Method::SetMusic));
    }
}
