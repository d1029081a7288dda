use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ALLOWED_ROLES: [&str; 4] = ["grid", "pvinverter", "genset", "acload"];
pub const ALLOWED_DEVICE_KINDS: [&str; 2] = ["em", "pm"];
pub const DEFAULT_ROLE_INSTANCE: &str = "grid:40";
pub const POSITION_MIN: i64 = 0;
pub const POSITION_MAX: i64 = 2;

/* Meters of one device are told apart by a suffix on the mac, 1 is the device itself */
pub const PRIMARY_SUFFIX: u8 = 1;
pub const SUB_METER_SUFFIXES: [u8; 3] = [2, 3, 4];

/// Identity of the metering device as reported by the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub mac: String,
    pub firmware: String,
}

impl DeviceIdentity {
    /// Extract mac and firmware id from a `{"result": {"mac": .., "fw_id": ..}}` reply.
    /// On failure the name of the missing key is returned.
    pub fn from_handshake(data: &Value) -> Result<Self, &'static str> {
        let result = data.get("result").ok_or("result")?;
        let mac = result.get("mac").and_then(|v| v.as_str()).ok_or("mac")?;
        let fw = result.get("fw_id").and_then(|v| v.as_str()).ok_or("fw_id")?;

        return Ok(DeviceIdentity {
            mac: mac.to_string(),
            firmware: fw.to_string(),
        });
    }
}

/// The role a meter takes in the Venus system
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    Grid,
    PvInverter,
    Genset,
    AcLoad,
}

impl Role {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "grid" => Some(Role::Grid),
            "pvinverter" => Some(Role::PvInverter),
            "genset" => Some(Role::Genset),
            "acload" => Some(Role::AcLoad),
            _ => None,
        }
    }

    pub fn to_string(&self) -> String {
        match self {
            Role::Grid => "grid".to_string(),
            Role::PvInverter => "pvinverter".to_string(),
            Role::Genset => "genset".to_string(),
            Role::AcLoad => "acload".to_string(),
        }
    }
}

/// Which Shelly product family produces the telemetry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceKind {
    /// Three phase energy meter (Pro 3EM and friends)
    Em,
    /// Switches with power metering, fanned out to one meter per channel
    Pm,
}

impl DeviceKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "em" => Some(DeviceKind::Em),
            "pm" => Some(DeviceKind::Pm),
            _ => None,
        }
    }

    pub fn to_string(&self) -> String {
        match self {
            DeviceKind::Em => "em".to_string(),
            DeviceKind::Pm => "pm".to_string(),
        }
    }
}

/// Role and VRM instance, stored together as `"<role>:<instance>"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleInstance {
    pub role: Role,
    pub instance: u32,
}

impl RoleInstance {
    pub fn parse(value: &str) -> Option<Self> {
        let (role, instance) = value.split_once(':')?;
        let role = Role::from_str(role)?;
        let instance = instance.trim().parse::<u32>().ok()?;
        return Some(RoleInstance { role, instance });
    }

    pub fn to_setting(&self) -> String {
        return format!("{}:{}", self.role.to_string(), self.instance);
    }
}

impl Default for RoleInstance {
    fn default() -> Self {
        return RoleInstance { role: Role::Grid, instance: 40 };
    }
}

pub fn position_valid(value: i64) -> bool {
    return (POSITION_MIN..=POSITION_MAX).contains(&value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_from_handshake() {
        let data = json!({"result": {"mac": "AABBCCDDEEFF", "fw_id": "20240101-000000/1.2.0"}});
        let id = DeviceIdentity::from_handshake(&data).unwrap();
        assert_eq!(id.mac, "AABBCCDDEEFF");
        assert_eq!(id.firmware, "20240101-000000/1.2.0");
    }

    #[test]
    fn test_identity_missing_keys() {
        assert_eq!(DeviceIdentity::from_handshake(&json!({"result": {"mac": "AA"}})), Err("fw_id"));
        assert_eq!(DeviceIdentity::from_handshake(&json!({"result": {"fw_id": "x"}})), Err("mac"));
        assert_eq!(DeviceIdentity::from_handshake(&json!({"error": {}})), Err("result"));
    }

    #[test]
    fn test_role_names() {
        for name in ALLOWED_ROLES {
            assert_eq!(Role::from_str(name).unwrap().to_string(), name);
        }
        assert!(Role::from_str("battery").is_none());
        assert!(Role::from_str("Grid").is_none());
    }

    #[test]
    fn test_role_instance_parse() {
        let ri = RoleInstance::parse("pvinverter:42").unwrap();
        assert_eq!(ri.role, Role::PvInverter);
        assert_eq!(ri.instance, 42);
        assert_eq!(ri.to_setting(), "pvinverter:42");

        assert!(RoleInstance::parse("grid").is_none());
        assert!(RoleInstance::parse("grid:-1").is_none());
        assert!(RoleInstance::parse("tank:1").is_none());
        assert_eq!(RoleInstance::parse(DEFAULT_ROLE_INSTANCE), Some(RoleInstance::default()));
    }

    #[test]
    fn test_position_range() {
        assert!(position_valid(0));
        assert!(position_valid(2));
        assert!(!position_valid(3));
        assert!(!position_valid(-1));
    }
}
