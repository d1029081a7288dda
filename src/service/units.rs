// Display text for published values, the stored values stay unrounded

pub fn watt(v: f64) -> String {
    return format!("{:.0}W", v);
}

pub fn volt(v: f64) -> String {
    return format!("{:.1}V", v);
}

pub fn amp(v: f64) -> String {
    return format!("{:.1}A", v);
}

pub fn kwh(v: f64) -> String {
    return format!("{:.2}kWh", v);
}

pub fn product_id(v: f64) -> String {
    return format!("0x{:X}", v as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units() {
        assert_eq!(watt(1234.4), "1234W");
        assert_eq!(volt(230.04), "230.0V");
        assert_eq!(amp(1.26), "1.3A");
        assert_eq!(kwh(1.2), "1.20kWh");
        assert_eq!(product_id(45108.0), "0xB034");
    }
}
