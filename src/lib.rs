//! Sensor readings over terrain.
//!
//! Fetches geolocated sensor readings from SQL Server, converts their UTM
//! positions to latitude/longitude, filters implausible rows, downsamples a
//! GeoTIFF elevation model and renders both as a 3D plotly.js page.

pub mod config;
pub mod dem_processor;
pub mod error;
pub mod format;
pub mod pipeline;
pub mod readings;
pub mod render;
pub mod store;
pub mod terrain;
pub mod utm;

pub use config::ViewerConfig;
pub use dem_processor::{DEMProcessor, DemInfo, GeoTransform, RasterCrs};
pub use error::{Result, ViewerError};
pub use pipeline::{georeference, FilterCriteria, FilterReport, Georeferenced, SpeedStats};
pub use readings::{GeoReading, SensorReading};
pub use render::{build_figure, Figure};
pub use store::{SensorQuery, SqlServerStore};
pub use terrain::TerrainGrid;
pub use utm::{Hemisphere, UtmZone};
