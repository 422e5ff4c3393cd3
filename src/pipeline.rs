use geo::{coord, Intersects, Point, Rect};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::FilterConfig;
use crate::readings::{GeoReading, SensorReading};
use crate::utm::{self, UtmZone};

/// Readings with coordinates, plus the number that could not be converted.
#[derive(Debug, Clone)]
pub struct Georeferenced {
    pub rows: Vec<GeoReading>,
    pub failed: usize,
}

/// Convert every reading's UTM position to latitude/longitude.
///
/// Rows with a missing or out-of-range easting/northing cannot land inside
/// any latitude window, so they are counted and dropped here.
pub fn georeference(readings: Vec<SensorReading>, zone: UtmZone) -> Georeferenced {
    let mut rows = Vec::with_capacity(readings.len());
    let mut failed = 0;

    for reading in readings {
        let (easting, northing) = match (reading.easting, reading.northing) {
            (Some(e), Some(n)) => (e, n),
            _ => {
                failed += 1;
                continue;
            }
        };

        match utm::to_latlon(easting, northing, zone) {
            Ok((lat, lon)) => rows.push(GeoReading::new(reading, lat, lon)),
            Err(e) => {
                debug!("Skipping reading: {}", e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        warn!(
            dropped = failed,
            kept = rows.len(),
            zone = %zone,
            "Dropped readings without a usable UTM position"
        );
    }

    Georeferenced { rows, failed }
}

/// Inclusive range predicates applied to georeferenced readings.
#[derive(Debug, Clone)]
pub struct FilterCriteria {
    window: Rect<f64>,
    max_speed: f64,
}

/// How many rows each filter stage removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterReport {
    pub input: usize,
    pub outside_window: usize,
    pub incomplete: usize,
    pub too_fast: usize,
    pub kept: usize,
}

impl FilterCriteria {
    /// Window from (min, max) latitude and longitude pairs.
    ///
    /// Bounds are normalised: a pair given as (max, min) selects the same
    /// window as (min, max). Reject inverted input before this point if it
    /// should be an error, as `ViewerConfig::validate` does.
    pub fn new(latitude: (f64, f64), longitude: (f64, f64), max_speed: f64) -> Self {
        let window = Rect::new(
            coord! { x: longitude.0, y: latitude.0 },
            coord! { x: longitude.1, y: latitude.1 },
        );
        FilterCriteria { window, max_speed }
    }

    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(
            (config.latitude_min, config.latitude_max),
            (config.longitude_min, config.longitude_max),
            config.max_speed_kmh,
        )
    }

    /// Window check; bounds count as inside
    pub fn in_window(&self, latitude: f64, longitude: f64) -> bool {
        Point::new(longitude, latitude).intersects(&self.window)
    }

    /// Apply the window, completeness and speed filters in that order.
    pub fn apply(&self, rows: Vec<GeoReading>) -> (Vec<GeoReading>, FilterReport) {
        let mut report = FilterReport {
            input: rows.len(),
            ..FilterReport::default()
        };

        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            if !self.in_window(row.latitude, row.longitude) {
                report.outside_window += 1;
            } else if !row.is_complete() {
                report.incomplete += 1;
            } else if !row.reading.speed.map_or(false, |s| s <= self.max_speed) {
                report.too_fast += 1;
            } else {
                kept.push(row);
            }
        }

        report.kept = kept.len();
        (kept, report)
    }
}

/// Summary of the readings that will be plotted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedStats {
    pub count: usize,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
    /// Readings whose alarm column is set to something other than 0/false/empty
    pub alarms: usize,
}

impl SpeedStats {
    pub fn from_rows(rows: &[GeoReading]) -> Option<Self> {
        let speeds: Vec<f64> = rows.iter().filter_map(|r| r.reading.speed).collect();
        if speeds.is_empty() {
            return None;
        }

        let min = speeds.iter().copied().fold(f64::INFINITY, f64::min);
        let max = speeds.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = speeds.iter().sum::<f64>() / speeds.len() as f64;
        let alarms = rows
            .iter()
            .filter(|r| r.reading.alarm.as_deref().map_or(false, is_alarm_active))
            .count();

        Some(SpeedStats {
            count: speeds.len(),
            min,
            mean,
            max,
            alarms,
        })
    }
}

fn is_alarm_active(alarm: &str) -> bool {
    !matches!(
        alarm.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "none"
    )
}
