use chrono::NaiveDateTime;

pub fn format_speed(kmh: f64) -> String {
    format!("{:.1} km/h", kmh)
}

pub fn format_elevation(meters: f64) -> String {
    if meters.abs() >= 1000.0 {
        format!("{:.0} m", meters)
    } else {
        format!("{:.1} m", meters)
    }
}

/// Decimal degrees with 6 places (~0.1 m)
pub fn format_coordinate(degrees: f64) -> String {
    format!("{:.6}°", degrees)
}

pub fn format_time(time: Option<&NaiveDateTime>) -> String {
    match time {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(23.456), "23.5 km/h");
        assert_eq!(format_speed(0.0), "0.0 km/h");
    }

    #[test]
    fn test_format_elevation() {
        assert_eq!(format_elevation(512.34), "512.3 m");
        assert_eq!(format_elevation(1523.7), "1524 m");
    }

    #[test]
    fn test_format_coordinate() {
        assert_eq!(format_coordinate(-104.0446988), "-104.044699°");
    }

    #[test]
    fn test_format_time() {
        let t = NaiveDateTime::parse_from_str("2024-02-15 08:30:12", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(format_time(Some(&t)), "2024-02-15 08:30:12");
        assert_eq!(format_time(None), "-");
    }
}
