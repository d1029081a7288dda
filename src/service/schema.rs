use std::sync::Arc;
use crate::models::{DeviceKind, Role, ALLOWED_DEVICE_KINDS, ALLOWED_ROLES};
use super::{units, Item, ItemSink, Service, WriteHandler};

pub const PRODUCT_ID: i64 = 0xB034;
pub const REFRESH_TIME: i64 = 100;

/// Everything needed to build the item tree of one meter
#[derive(Debug, Clone)]
pub struct MeterParams {
    pub service_name: String,
    pub process_name: String,
    pub process_version: String,
    pub connection: String,
    pub device_instance: u32,
    pub product_name: String,
    pub firmware: String,
    pub role: Role,
    pub kind: DeviceKind,
    pub position: i64,
}

pub fn service_name(role: Role, mac: &str, suffix: u8) -> String {
    return format!("com.victronenergy.{}.shelly_{}{}", role.to_string(), mac, suffix);
}

/// Publish a fresh meter service. Measurements start out as null.
pub fn build_meter(params: &MeterParams, sink: Arc<dyn ItemSink>) -> Service {
    let mut s = Service::new(params.service_name.clone(), sink);

    s.add_item(Item::text("/Mgmt/ProcessName", &params.process_name));
    s.add_item(Item::text("/Mgmt/ProcessVersion", &params.process_version));
    s.add_item(Item::text("/Mgmt/Connection", &params.connection));
    s.add_item(Item::integer("/DeviceInstance", params.device_instance as i64));
    s.add_item(Item::integer("/ProductId", PRODUCT_ID).with_text(units::product_id));
    s.add_item(Item::text("/ProductName", &params.product_name));
    s.add_item(Item::text("/FirmwareVersion", &params.firmware));
    s.add_item(Item::integer("/Connected", 1));
    s.add_item(Item::integer("/RefreshTime", REFRESH_TIME));

    s.add_item(Item::text_array("/AllowedRoles", &ALLOWED_ROLES));
    s.add_item(Item::text("/Role", &params.role.to_string()).writeable(WriteHandler::Role));
    s.add_item(Item::text_array("/AllowedDevices", &ALLOWED_DEVICE_KINDS));
    s.add_item(Item::text("/DeviceType", &params.kind.to_string()).writeable(WriteHandler::DeviceType));

    /* Position only means something for PV inverters */
    if params.role == Role::PvInverter {
        s.add_item(Item::integer("/Position", params.position).writeable(WriteHandler::Position));
    }

    s.add_item(Item::double("/Ac/Energy/Forward").with_text(units::kwh));
    s.add_item(Item::double("/Ac/Energy/Reverse").with_text(units::kwh));
    s.add_item(Item::double("/Ac/Power").with_text(units::watt));
    for p in 1..=3 {
        let prefix = format!("/Ac/L{p}");
        s.add_item(Item::double(&format!("{prefix}/Voltage")).with_text(units::volt));
        s.add_item(Item::double(&format!("{prefix}/Current")).with_text(units::amp));
        s.add_item(Item::double(&format!("{prefix}/Power")).with_text(units::watt));
        s.add_item(Item::double(&format!("{prefix}/Energy/Forward")).with_text(units::kwh));
        s.add_item(Item::double(&format!("{prefix}/Energy/Reverse")).with_text(units::kwh));
    }

    return s;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::RecordingSink;
    use serde_json::{json, Value};

    fn params(role: Role) -> MeterParams {
        return MeterParams {
            service_name: service_name(role, "aabbcc", 1),
            process_name: "shelly2venus".to_string(),
            process_version: "0.1.0".to_string(),
            connection: "MQTT localhost:1883".to_string(),
            device_instance: 40,
            product_name: "Shelly energy meter + 1".to_string(),
            firmware: "1.2.0".to_string(),
            role,
            kind: DeviceKind::Em,
            position: 1,
        };
    }

    #[test]
    fn test_grid_meter_items() {
        let s = build_meter(&params(Role::Grid), RecordingSink::new());
        assert_eq!(s.name(), "com.victronenergy.grid.shelly_aabbcc1");
        assert_eq!(s.get("/DeviceInstance"), Some(&json!(40)));
        assert_eq!(s.item("/ProductId").unwrap().display(), "0xB034");
        assert_eq!(s.get("/DeviceType"), Some(&json!("em")));
        assert_eq!(s.get("/Ac/L3/Energy/Reverse"), Some(&Value::Null));
        assert!(s.get("/Position").is_none());
        assert_eq!(s.handler_for("/Role"), Some(WriteHandler::Role));
        assert_eq!(s.handler_for("/Ac/Power"), None);
    }

    #[test]
    fn test_pvinverter_has_position() {
        let s = build_meter(&params(Role::PvInverter), RecordingSink::new());
        assert_eq!(s.get("/Position"), Some(&json!(1)));
        assert_eq!(s.handler_for("/Position"), Some(WriteHandler::Position));
    }
}
