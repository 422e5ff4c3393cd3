use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ViewerError};

/// WGS84 semi-major axis in meters
const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening
const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// UTM scale factor on the central meridian
const K0: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

const MIN_EASTING: f64 = 100_000.0;
const MAX_EASTING: f64 = 1_000_000.0;
const MAX_NORTHING: f64 = 10_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hemisphere {
    North,
    South,
}

/// A UTM zone number (1-60) plus the hemisphere needed to invert northings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UtmZone {
    number: u8,
    hemisphere: Hemisphere,
}

impl UtmZone {
    pub fn new(number: u8, hemisphere: Hemisphere) -> Result<Self> {
        if !(1..=60).contains(&number) {
            return Err(ViewerError::Coordinate(format!(
                "UTM zone {} is outside 1..=60",
                number
            )));
        }
        Ok(UtmZone { number, hemisphere })
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn hemisphere(&self) -> Hemisphere {
        self.hemisphere
    }

    pub fn is_north(&self) -> bool {
        self.hemisphere == Hemisphere::North
    }

    /// Longitude of the zone's central meridian in degrees
    pub fn central_meridian(&self) -> f64 {
        self.number as f64 * 6.0 - 183.0
    }

    /// PROJ definition string for this zone on WGS84
    pub fn proj_string(&self) -> String {
        let south = if self.is_north() { "" } else { " +south" };
        format!(
            "+proj=utm +zone={}{} +datum=WGS84 +units=m +no_defs",
            self.number, south
        )
    }
}

impl fmt::Display for UtmZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let band = if self.is_north() { 'N' } else { 'S' };
        write!(f, "{}{}", self.number, band)
    }
}

impl FromStr for UtmZone {
    type Err = ViewerError;

    /// Parses "13N", "13 n" or "45S"
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
        let rest = trimmed[digits.len()..].trim();

        let number = digits
            .parse::<u8>()
            .map_err(|_| ViewerError::Coordinate(format!("Invalid UTM zone '{}'", s)))?;
        let hemisphere = match rest.to_ascii_uppercase().as_str() {
            "N" | "NORTH" => Hemisphere::North,
            "S" | "SOUTH" => Hemisphere::South,
            _ => {
                return Err(ViewerError::Coordinate(format!(
                    "UTM zone '{}' needs a hemisphere suffix (N or S)",
                    s
                )))
            }
        };

        UtmZone::new(number, hemisphere)
    }
}

/// Series coefficients of the Krüger transverse Mercator expansion (third order in n).
struct KruegerSeries {
    /// k0 * rectifying radius
    k0_a: f64,
    alpha: [f64; 3],
    beta: [f64; 3],
    delta: [f64; 3],
    /// 2 * sqrt(n) / (1 + n), used by the conformal latitude
    c: f64,
}

impl KruegerSeries {
    fn wgs84() -> Self {
        let n = WGS84_F / (2.0 - WGS84_F);
        let n2 = n * n;
        let n3 = n2 * n;
        let rectifying_radius = WGS84_A / (1.0 + n) * (1.0 + n2 / 4.0 + n2 * n2 / 64.0);

        KruegerSeries {
            k0_a: K0 * rectifying_radius,
            alpha: [
                n / 2.0 - 2.0 / 3.0 * n2 + 5.0 / 16.0 * n3,
                13.0 / 48.0 * n2 - 3.0 / 5.0 * n3,
                61.0 / 240.0 * n3,
            ],
            beta: [
                n / 2.0 - 2.0 / 3.0 * n2 + 37.0 / 96.0 * n3,
                1.0 / 48.0 * n2 + 1.0 / 15.0 * n3,
                17.0 / 480.0 * n3,
            ],
            delta: [
                2.0 * n - 2.0 / 3.0 * n2 - 2.0 * n3,
                7.0 / 3.0 * n2 - 8.0 / 5.0 * n3,
                56.0 / 15.0 * n3,
            ],
            c: 2.0 * n.sqrt() / (1.0 + n),
        }
    }
}

/// Convert UTM easting/northing (meters) to WGS84 latitude/longitude in degrees.
///
/// Coordinates outside the band a UTM grid can represent are rejected instead
/// of extrapolated.
pub fn to_latlon(easting: f64, northing: f64, zone: UtmZone) -> Result<(f64, f64)> {
    if !easting.is_finite() || !(MIN_EASTING..MAX_EASTING).contains(&easting) {
        return Err(ViewerError::Coordinate(format!(
            "easting {} out of range [{}, {})",
            easting, MIN_EASTING, MAX_EASTING
        )));
    }
    if !northing.is_finite() || !(0.0..=MAX_NORTHING).contains(&northing) {
        return Err(ViewerError::Coordinate(format!(
            "northing {} out of range [0, {}]",
            northing, MAX_NORTHING
        )));
    }

    let s = KruegerSeries::wgs84();
    let false_northing = if zone.is_north() { 0.0 } else { FALSE_NORTHING_SOUTH };

    let xi = (northing - false_northing) / s.k0_a;
    let eta = (easting - FALSE_EASTING) / s.k0_a;

    let mut xi_p = xi;
    let mut eta_p = eta;
    for (j, beta) in s.beta.iter().enumerate() {
        let k = 2.0 * (j + 1) as f64;
        xi_p -= beta * (k * xi).sin() * (k * eta).cosh();
        eta_p -= beta * (k * xi).cos() * (k * eta).sinh();
    }

    let chi = (xi_p.sin() / eta_p.cosh()).asin();
    let mut phi = chi;
    for (j, delta) in s.delta.iter().enumerate() {
        phi += delta * (2.0 * (j + 1) as f64 * chi).sin();
    }

    let lambda = zone.central_meridian().to_radians() + eta_p.sinh().atan2(xi_p.cos());

    Ok((phi.to_degrees(), lambda.to_degrees()))
}

/// Convert WGS84 latitude/longitude in degrees to UTM easting/northing in the given zone.
pub fn from_latlon(latitude: f64, longitude: f64, zone: UtmZone) -> Result<(f64, f64)> {
    if !(-80.0..=84.0).contains(&latitude) {
        return Err(ViewerError::Coordinate(format!(
            "latitude {} out of UTM range [-80, 84]",
            latitude
        )));
    }

    let s = KruegerSeries::wgs84();
    let phi = latitude.to_radians();
    let d_lambda = (longitude - zone.central_meridian()).to_radians();

    let sin_phi = phi.sin();
    let t = (sin_phi.atanh() - s.c * (s.c * sin_phi).atanh()).sinh();
    let xi_p = (t / d_lambda.cos()).atan();
    let eta_p = (d_lambda.sin() / (1.0 + t * t).sqrt()).atanh();

    let mut easting = eta_p;
    let mut northing = xi_p;
    for (j, alpha) in s.alpha.iter().enumerate() {
        let k = 2.0 * (j + 1) as f64;
        easting += alpha * (k * xi_p).cos() * (k * eta_p).sinh();
        northing += alpha * (k * xi_p).sin() * (k * eta_p).cosh();
    }

    let false_northing = if zone.is_north() { 0.0 } else { FALSE_NORTHING_SOUTH };
    Ok((
        FALSE_EASTING + s.k0_a * easting,
        false_northing + s.k0_a * northing,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn zone_13n() -> UtmZone {
        UtmZone::new(13, Hemisphere::North).unwrap()
    }

    #[test]
    fn test_central_meridian_maps_to_zone_longitude() {
        let (lat, lon) = to_latlon(500_000.0, 2_212_000.0, zone_13n()).unwrap();
        assert_abs_diff_eq!(lat, 20.004_687_26, epsilon = 1e-7);
        assert_abs_diff_eq!(lon, -105.0, epsilon = 1e-9);
    }

    #[test]
    fn test_off_meridian_point() {
        let (lat, lon) = to_latlon(600_000.0, 2_200_000.0, zone_13n()).unwrap();
        assert_abs_diff_eq!(lat, 19.893_682_73, epsilon = 1e-7);
        assert_abs_diff_eq!(lon, -104.044_698_83, epsilon = 1e-7);
    }

    #[test]
    fn test_southern_hemisphere_mirrors_north() {
        let south = UtmZone::new(13, Hemisphere::South).unwrap();
        let (lat, lon) = to_latlon(500_000.0, 10_000_000.0 - 2_212_000.0, south).unwrap();
        assert_abs_diff_eq!(lat, -20.004_687_26, epsilon = 1e-7);
        assert_abs_diff_eq!(lon, -105.0, epsilon = 1e-9);
    }

    #[test]
    fn test_forward_then_inverse_recovers_position() {
        let zone = zone_13n();
        let (e, n) = from_latlon(19.5, -104.2, zone).unwrap();
        assert_abs_diff_eq!(e, 583_947.367, epsilon = 1e-2);
        assert_abs_diff_eq!(n, 2_156_348.494, epsilon = 1e-2);

        let (lat, lon) = to_latlon(e, n, zone).unwrap();
        assert_abs_diff_eq!(lat, 19.5, epsilon = 1e-8);
        assert_abs_diff_eq!(lon, -104.2, epsilon = 1e-8);
    }

    #[test]
    fn test_out_of_range_easting_is_rejected() {
        assert!(to_latlon(50_000.0, 2_200_000.0, zone_13n()).is_err());
        assert!(to_latlon(1_000_000.0, 2_200_000.0, zone_13n()).is_err());
        assert!(to_latlon(f64::NAN, 2_200_000.0, zone_13n()).is_err());
    }

    #[test]
    fn test_out_of_range_northing_is_rejected() {
        assert!(to_latlon(500_000.0, -1.0, zone_13n()).is_err());
        assert!(to_latlon(500_000.0, 10_000_001.0, zone_13n()).is_err());
    }

    #[test]
    fn test_zone_parsing() {
        assert_eq!("13N".parse::<UtmZone>().unwrap(), zone_13n());
        assert_eq!(
            " 45 s ".parse::<UtmZone>().unwrap(),
            UtmZone::new(45, Hemisphere::South).unwrap()
        );
        assert!("13".parse::<UtmZone>().is_err());
        assert!("61N".parse::<UtmZone>().is_err());
        assert!("0N".parse::<UtmZone>().is_err());
        assert_eq!(zone_13n().to_string(), "13N");
    }

    #[test]
    fn test_proj_string_marks_southern_zones() {
        assert_eq!(
            zone_13n().proj_string(),
            "+proj=utm +zone=13 +datum=WGS84 +units=m +no_defs"
        );
        let south = UtmZone::new(34, Hemisphere::South).unwrap();
        assert!(south.proj_string().contains("+south"));
    }
}
