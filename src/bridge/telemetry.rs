/*
    Map Shelly NotifyStatus payloads onto meter items.

    Shelly only sends what changed, so groups and fields come and go. A group
    that misses a field we need is skipped as a whole for the em devices, the
    pm devices skip single fields. Nothing here ever fails.
*/

use log::debug;
use serde_json::Value;
use crate::service::Service;

const PHASES: [(&str, u8); 3] = [("a", 1), ("b", 2), ("c", 3)];

fn number(group: &Value, key: &str) -> Option<f64> {
    return group.get(key).and_then(|v| v.as_f64());
}

/// Shelly counts Wh, the bus wants kWh with one decimal
pub fn wh_to_kwh(v: f64) -> f64 {
    return (v / 1000.0 * 10.0).round() / 10.0;
}

struct PhaseReading {
    voltage: f64,
    current: f64,
    power: f64,
}

fn read_em_phases(group: &Value) -> Option<[PhaseReading; 3]> {
    let phase = |p: &str| -> Option<PhaseReading> {
        return Some(PhaseReading {
            voltage: number(group, &format!("{p}_voltage"))?,
            current: number(group, &format!("{p}_current"))?,
            power: number(group, &format!("{p}_act_power"))?,
        });
    };

    return Some([phase("a")?, phase("b")?, phase("c")?]);
}

struct EnergyReading {
    forward: f64,
    reverse: f64,
    phases: [(f64, f64); 3],
}

fn read_em_energy(group: &Value) -> Option<EnergyReading> {
    let phase = |p: &str| -> Option<(f64, f64)> {
        return Some((
            number(group, &format!("{p}_total_act_energy"))?,
            number(group, &format!("{p}_total_act_ret_energy"))?,
        ));
    };

    return Some(EnergyReading {
        forward: number(group, "total_act")?,
        reverse: number(group, "total_act_ret")?,
        phases: [phase("a")?, phase("b")?, phase("c")?],
    });
}

/// Three phase energy meter, everything goes to the primary service
pub fn apply_em(service: &mut Service, params: &Value) {
    match params.get("em:0") {
        None => {}
        Some(group) => match read_em_phases(group) {
            None => debug!("{}: incomplete em:0 group, skipping", service.name()),
            Some(phases) => {
                let mut total = 0.0;
                for (reading, (_, n)) in phases.iter().zip(PHASES) {
                    service.set(&format!("/Ac/L{n}/Voltage"), reading.voltage);
                    service.set(&format!("/Ac/L{n}/Current"), reading.current);
                    service.set(&format!("/Ac/L{n}/Power"), reading.power);
                    total += reading.power;
                }
                service.set("/Ac/Power", total);
            }
        },
    }

    match params.get("emdata:0") {
        None => {}
        Some(group) => match read_em_energy(group) {
            None => debug!("{}: incomplete emdata:0 group, skipping", service.name()),
            Some(energy) => {
                service.set("/Ac/Energy/Forward", wh_to_kwh(energy.forward));
                service.set("/Ac/Energy/Reverse", wh_to_kwh(energy.reverse));
                for ((forward, reverse), (_, n)) in energy.phases.iter().zip(PHASES) {
                    service.set(&format!("/Ac/L{n}/Energy/Forward"), wh_to_kwh(*forward));
                    service.set(&format!("/Ac/L{n}/Energy/Reverse"), wh_to_kwh(*reverse));
                }
            }
        },
    }
}

/// One switch channel onto one single phase sub meter
pub fn apply_pm_channel(service: &mut Service, channel: usize, params: &Value) {
    let group = match params.get(format!("switch:{channel}")) {
        Some(g) => g,
        None => return,
    };

    if let Some(v) = number(group, "avoltage") {
        service.set("/Ac/L1/Voltage", v);
    }

    if let Some(v) = number(group, "acurrent") {
        service.set("/Ac/L1/Current", v);
    }

    if let Some(v) = number(group, "apower") {
        service.set("/Ac/L1/Power", v);
        service.set("/Ac/Power", v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::RecordingSink;
    use crate::service::Item;
    use serde_json::json;

    fn meter() -> Service {
        let mut s = Service::new("svc".to_string(), RecordingSink::new());
        s.add_item(Item::double("/Ac/Power"));
        s.add_item(Item::double("/Ac/Energy/Forward"));
        s.add_item(Item::double("/Ac/Energy/Reverse"));
        for p in 1..=3 {
            for k in ["Voltage", "Current", "Power", "Energy/Forward", "Energy/Reverse"] {
                s.add_item(Item::double(&format!("/Ac/L{p}/{k}")));
            }
        }
        return s;
    }

    fn em_group() -> Value {
        return json!({
            "a_voltage": 230.1, "b_voltage": 231.2, "c_voltage": 229.9,
            "a_current": 0.5, "b_current": 1.0, "c_current": 1.5,
            "a_act_power": 100, "b_act_power": 200, "c_act_power": 300
        });
    }

    #[test]
    fn test_wh_to_kwh() {
        assert_eq!(wh_to_kwh(1234.0), 1.2);
        assert_eq!(wh_to_kwh(1250.0), 1.3);
        assert_eq!(wh_to_kwh(0.0), 0.0);
    }

    #[test]
    fn test_em_phases_and_total() {
        let mut s = meter();
        apply_em(&mut s, &json!({"em:0": em_group()}));
        assert_eq!(s.get("/Ac/Power"), Some(&json!(600.0)));
        assert_eq!(s.get("/Ac/L2/Voltage"), Some(&json!(231.2)));
        assert_eq!(s.get("/Ac/L3/Current"), Some(&json!(1.5)));
        assert_eq!(s.get("/Ac/Energy/Forward"), Some(&Value::Null));
    }

    #[test]
    fn test_em_energy() {
        let mut s = meter();
        apply_em(&mut s, &json!({"emdata:0": {
            "total_act": 1234, "total_act_ret": 56,
            "a_total_act_energy": 400, "a_total_act_ret_energy": 10,
            "b_total_act_energy": 500, "b_total_act_ret_energy": 20,
            "c_total_act_energy": 334, "c_total_act_ret_energy": 26
        }}));
        assert_eq!(s.get("/Ac/Energy/Forward"), Some(&json!(1.2)));
        assert_eq!(s.get("/Ac/Energy/Reverse"), Some(&json!(0.1)));
        assert_eq!(s.get("/Ac/L2/Energy/Forward"), Some(&json!(0.5)));
        assert_eq!(s.get("/Ac/Power"), Some(&Value::Null));
    }

    #[test]
    fn test_em_incomplete_group_is_skipped() {
        let mut s = meter();
        let mut group = em_group();
        group.as_object_mut().unwrap().remove("c_act_power");
        apply_em(&mut s, &json!({"em:0": group, "emdata:0": {"total_act": 1000}}));
        assert_eq!(s.get("/Ac/L1/Voltage"), Some(&Value::Null));
        assert_eq!(s.get("/Ac/Power"), Some(&Value::Null));
        assert_eq!(s.get("/Ac/Energy/Forward"), Some(&Value::Null));
    }

    #[test]
    fn test_pm_channel_skips_missing_fields() {
        let mut s = meter();
        apply_pm_channel(&mut s, 2, &json!({"switch:2": {"apower": 42.5, "avoltage": 230.0}}));
        assert_eq!(s.get("/Ac/L1/Power"), Some(&json!(42.5)));
        assert_eq!(s.get("/Ac/Power"), Some(&json!(42.5)));
        assert_eq!(s.get("/Ac/L1/Voltage"), Some(&json!(230.0)));
        assert_eq!(s.get("/Ac/L1/Current"), Some(&Value::Null));

        apply_pm_channel(&mut s, 3, &json!({"switch:2": {"apower": 1.0}}));
        assert_eq!(s.get("/Ac/Power"), Some(&json!(42.5)));
    }
}
