use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// One row of the sensor table as it comes out of the store.
///
/// Every column is optional: the table allows NULLs and rows with gaps
/// are only discarded during filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub time: Option<NaiveDateTime>,
    /// UTM northing in meters
    pub northing: Option<f64>,
    /// UTM easting in meters
    pub easting: Option<f64>,
    /// Elevation in meters
    pub elevation: Option<f64>,
    /// Ground speed in km/h
    pub speed: Option<f64>,
    pub full_name: Option<String>,
    pub alarm: Option<String>,
}

/// A reading with its position converted to WGS84 degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoReading {
    pub reading: SensorReading,
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoReading {
    pub fn new(reading: SensorReading, latitude: f64, longitude: f64) -> Self {
        GeoReading {
            reading,
            latitude,
            longitude,
        }
    }

    /// True when every column the plot needs is present and finite
    pub fn is_complete(&self) -> bool {
        let finite = |v: Option<f64>| v.map_or(false, f64::is_finite);
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && finite(self.reading.speed)
            && finite(self.reading.elevation)
            && self.reading.alarm.is_some()
    }
}
