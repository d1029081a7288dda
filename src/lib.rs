//! Bridge Shelly energy meters onto a Venus style bus
//!
//! A Shelly device is asked for its identity, the role and VRM instance of
//! each meter are negotiated with the local settings, and the meter items are
//! kept current from the device's status notifications.

pub mod bridge;
pub mod config;
pub mod metering_shelly;
pub mod models;
pub mod mqtt;
pub mod service;
pub mod settings;

// Re-export common types for easier access
pub use bridge::{Bridge, BridgeContext, BridgeEvent, BridgeState, StartError};
pub use config::Config;
pub use metering_shelly::ShellyManager;
pub use models::{DeviceIdentity, DeviceKind, Role, RoleInstance};
pub use mqtt::{MqttManager, MqttSink};
pub use settings::{LocalSettings, SettingsNegotiator};
