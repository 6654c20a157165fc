//! # yeelight_lan_rs
//!
//! An async Rust engine for discovering and controlling Yeelight lights on
//! the local network.
//!
//! This crate provides a **runtime-agnostic** async API. It finds devices
//! by multicast discovery, keeps one persistent TCP connection per device,
//! pipelines commands over it, and tracks each device's state from command
//! results and unsolicited notifications.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use yeelight_lan_rs::{Brightness, Color, Controller, Effect, EngineConfig};
//!
//! async fn control_lights() -> Result<(), Box<dyn std::error::Error>> {
//!     let controller = Controller::new(EngineConfig::default());
//!
//!     for device in controller.discover(Duration::from_secs(3)).await? {
//!         let light = controller.connect(&device.id)?;
//!         light.set_rgb(Color::rgb(0, 0, 255), Effect::Smooth(Duration::from_millis(500))).await?;
//!         light.set_brightness(Brightness::create(60).unwrap(), Effect::Sudden).await?;
//!         println!("{}: {:?}", light.id(), light.state());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Runtime Agnostic**: Works with tokio, async-std, or smol async runtimes
//! - **Discovery**: Search and passive advertisements via [`Controller::start_discovery`]
//! - **Pipelined Connections**: Many commands in flight per device, matched by id
//! - **Reconnect**: Exponential [`BackoffPolicy`] with jitter and an offline state
//! - **State Tracking**: A live [`DeviceState`] per device, merged from results and notifications
//! - **Color Flows**: Build and validate `start_cf` animations with [`flow::FlowSpec`]
//! - **Events**: Subscribe to discovery, state and connection changes with [`Controller::subscribe`]
//!
//! ## Communication
//!
//! Discovery uses SSDP-style messages on the multicast group
//! `239.255.255.250:1982`. Control uses newline-delimited JSON over TCP,
//! by default on port 55443. LAN control must be enabled on each device.
//!
//! ## Runtime Selection
//!
//! This library is runtime-agnostic. Select your preferred runtime using feature flags:
//!
//! ### Using tokio (default)
//!
//! ```toml
//! [dependencies]
//! yeelight-lan-rs = "0.1"
//! tokio = { version = "1", features = ["rt-multi-thread", "macros"] }
//! ```
//!
//! ### Using async-std
//!
//! ```toml
//! [dependencies]
//! yeelight-lan-rs = { version = "0.1", default-features = false, features = ["runtime-async-std"] }
//! async-std = { version = "1.12", features = ["attributes"] }
//! ```
//!
//! ### Using smol
//!
//! ```toml
//! [dependencies]
//! yeelight-lan-rs = { version = "0.1", default-features = false, features = ["runtime-smol"] }
//! smol = "2"
//! ```
//!
//! ## Feature Flags
//!
//! - `runtime-tokio` (default): Use the tokio async runtime
//! - `runtime-async-std`: Use the async-std runtime
//! - `runtime-smol`: Use the smol runtime

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod codec;
mod config;
mod connection;
mod controller;
mod discovery;
mod errors;
mod events;
pub mod flow;
mod history;
mod light;
mod pending;
mod pool;
mod reconciler;
pub mod runtime;
mod state;
mod types;

// Re-export public API
pub use config::{
    BackoffPolicy, ConnectionConfig, DEFAULT_CONTROL_PORT, DiscoveryConfig, EngineConfig,
    MULTICAST_ADDR, OfflinePolicy,
};
pub use connection::{Connection, ConnectionDiagnostics, ConnectionStatus};
pub use controller::Controller;
pub use discovery::{
    DeviceDescriptor, Discovery, DiscoveryRegistry, DiscoveryStream, Observation, search_request,
};
pub use errors::{DeviceId, Error};
pub use events::{DeviceEvent, EventBus, Subscription};
pub use history::{HistoryEntry, HistorySummary, MessageHistory, MessageType};
pub use light::{Light, TRACKED_PROPERTIES};
pub use pool::{DeviceInfo, DevicePool};
pub use reconciler::Reconciler;
pub use state::{ColorMode, DeviceState, StatePatch};
pub use types::{
    Brightness, Capabilities, Color, Effect, HueSaturation, Kelvin, Method, PowerMode, Scene,
};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
