use std::time::Duration;
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::time::timeout;
use crate::models::{
    position_valid, DeviceIdentity, DeviceKind, Role, RoleInstance, DEFAULT_ROLE_INSTANCE,
    POSITION_MAX, POSITION_MIN, PRIMARY_SUFFIX,
};
use super::{LocalSettings, Setting, SettingsChange};

pub const SETTINGS_TIMEOUT: Duration = Duration::from_secs(5);

const INSTANCE: &str = "ClassAndVrmInstance";
const POSITION: &str = "Position";
const DEVICE_TYPE: &str = "DeviceType";

/// What was agreed with the settings authority for one published meter
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedSettings {
    pub prefix: String,
    pub role_instance: RoleInstance,
    pub position: i64,
    pub kind: DeviceKind,
}

pub struct SettingsNegotiator {
    settings: LocalSettings,
    timeout: Duration,
    watched: Vec<String>,
}

impl SettingsNegotiator {
    pub fn new(settings: LocalSettings, timeout: Duration) -> Self {
        return SettingsNegotiator {
            settings,
            timeout,
            watched: Vec::new(),
        };
    }

    pub fn prefix(identity: &DeviceIdentity, suffix: u8) -> String {
        return format!("/Settings/Devices/shelly_{}{}", identity.mac, suffix);
    }

    /// Wait for the authority and make sure our settings exist. None means the
    /// authority did not show up in time.
    ///
    /// The device type belongs to the physical device, so it is only kept under
    /// the primary prefix and sub meters report what the primary has.
    pub async fn resolve(&mut self, identity: &DeviceIdentity, suffix: u8) -> Option<NegotiatedSettings> {
        match timeout(self.timeout, self.settings.wait_online()).await {
            Ok(true) => {}
            _ => return None,
        }

        let prefix = SettingsNegotiator::prefix(identity, suffix);
        let mut wanted = vec![
            Setting::new(format!("{prefix}/{INSTANCE}"), DEFAULT_ROLE_INSTANCE, 0, 0),
            Setting::new(format!("{prefix}/{POSITION}"), 0, POSITION_MIN, POSITION_MAX),
        ];
        let mut watch = vec![format!("{prefix}/{INSTANCE}")];
        if suffix == PRIMARY_SUFFIX {
            wanted.push(Setting::new(format!("{prefix}/{DEVICE_TYPE}"), "em", 0, 0));
            watch.push(format!("{prefix}/{DEVICE_TYPE}"));
        }
        self.settings.add_settings(&wanted);

        let stored = self.settings.get_value(&format!("{prefix}/{INSTANCE}"));
        let role_instance = match stored.as_ref().and_then(|v| v.as_str()).and_then(RoleInstance::parse) {
            Some(ri) => ri,
            None => {
                warn!("{prefix}: unusable role/instance {stored:?}, using {DEFAULT_ROLE_INSTANCE}");
                RoleInstance::default()
            }
        };

        let position = self.settings.get_value(&format!("{prefix}/{POSITION}"))
            .and_then(|v| v.as_i64())
            .filter(|p| position_valid(*p))
            .unwrap_or(0);

        let primary = SettingsNegotiator::prefix(identity, PRIMARY_SUFFIX);
        let kind = self.settings.get_value(&format!("{primary}/{DEVICE_TYPE}"))
            .and_then(|v| v.as_str().and_then(DeviceKind::from_str))
            .unwrap_or(DeviceKind::Em);

        for path in watch {
            if !self.watched.contains(&path) {
                self.watched.push(path);
            }
        }

        info!("{prefix}: {} position {position} kind {}", role_instance.to_setting(), kind.to_string());
        return Some(NegotiatedSettings { prefix, role_instance, position, kind });
    }

    /// Store a new role, the instance number stays what it was
    pub fn set_role_instance(&self, prefix: &str, role: &str) -> bool {
        let role = match Role::from_str(role) {
            Some(r) => r,
            None => {
                debug!("{prefix}: refusing role {role}");
                return false;
            }
        };

        let path = format!("{prefix}/{INSTANCE}");
        let instance = self.settings.get_value(&path)
            .and_then(|v| v.as_str().and_then(RoleInstance::parse))
            .unwrap_or_default()
            .instance;

        return self.settings.set_value(&path, RoleInstance { role, instance }.to_setting());
    }

    pub fn set_position(&self, prefix: &str, position: i64) -> bool {
        if !position_valid(position) {
            debug!("{prefix}: refusing position {position}");
            return false;
        }

        return self.settings.set_value(&format!("{prefix}/{POSITION}"), position);
    }

    pub fn set_device_kind(&self, prefix: &str, kind: &str) -> bool {
        let kind = match DeviceKind::from_str(kind) {
            Some(k) => k,
            None => {
                debug!("{prefix}: refusing device type {kind}");
                return false;
            }
        };

        return self.settings.set_value(&format!("{prefix}/{DEVICE_TYPE}"), kind.to_string());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        return self.settings.subscribe();
    }

    /// True if the change touches the role, instance or device type of one of our meters
    pub fn is_topology_change(&self, change: &SettingsChange) -> bool {
        return self.watched.contains(&change.path);
    }

}
