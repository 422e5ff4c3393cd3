use std::fmt;
use std::path::{Path, PathBuf};

use config as cfg;
use serde::Deserialize;

use crate::error::{Result, ViewerError};
use crate::utm::{Hemisphere, UtmZone};

/// Environment variables override file values, e.g. `SENSORVIEW__DATABASE__PASSWORD`.
pub const ENV_PREFIX: &str = "SENSORVIEW";

pub const DEFAULT_PLOTLY_SRC: &str = "https://cdn.plot.ly/plotly-2.35.2.min.js";

/// Complete runtime configuration.
///
/// Sources are layered in this order, later ones winning:
/// 1. Built-in defaults
/// 2. An optional TOML/YAML/JSON file
/// 3. Environment variables (`SENSORVIEW__<SECTION>__<KEY>`)
///
/// Command-line flags are applied by the binary on top of the result.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub database: DatabaseConfig,
    pub projection: ProjectionConfig,
    pub filter: FilterConfig,
    pub terrain: TerrainConfig,
    pub render: RenderConfig,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// ADO.NET style connection string; overrides the discrete fields when set
    pub connection_string: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub trust_cert: bool,
    /// Table or view holding the readings, `[schema].[table]` or `db.schema.table`
    pub table: String,
    /// Maximum rows fetched per run
    pub limit: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            connection_string: None,
            host: "localhost".to_string(),
            port: 1433,
            database: "jmineops".to_string(),
            username: None,
            password: None,
            trust_cert: true,
            table: "dbo.T_sensors_speed_coord".to_string(),
            limit: 500,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field(
                "connection_string",
                &self.connection_string.as_ref().map(|_| "<redacted>"),
            )
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("trust_cert", &self.trust_cert)
            .field("table", &self.table)
            .field("limit", &self.limit)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// UTM zone the sensor northings/eastings are expressed in
    pub utm_zone: u8,
    pub hemisphere: Hemisphere,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        ProjectionConfig {
            utm_zone: 13,
            hemisphere: Hemisphere::North,
        }
    }
}

impl ProjectionConfig {
    pub fn zone(&self) -> Result<UtmZone> {
        UtmZone::new(self.utm_zone, self.hemisphere)
    }
}

/// Inclusive plausibility window for readings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub latitude_min: f64,
    pub latitude_max: f64,
    pub longitude_min: f64,
    pub longitude_max: f64,
    /// Readings faster than this (km/h) are discarded as GPS noise
    pub max_speed_kmh: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            latitude_min: 18.0,
            latitude_max: 22.0,
            longitude_min: -107.0,
            longitude_max: -100.0,
            max_speed_kmh: 50.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    /// GeoTIFF elevation model (DSM/DEM)
    pub path: Option<PathBuf>,
    /// Block size for average downsampling
    pub scale_factor: usize,
    /// Forces the raster CRS: `geographic` or `utm:13N`
    pub crs: Option<String>,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        TerrainConfig {
            path: None,
            scale_factor: 20,
            crs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    /// Upper end of the speed colour scale (km/h)
    pub speed_cmax: f64,
    pub surface_opacity: f64,
    pub marker_size: f64,
    pub marker_opacity: f64,
    /// Where to write the HTML page; a temp file is used when unset
    pub output: Option<PathBuf>,
    pub open_browser: bool,
    pub plotly_src: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            title: "Visualización 3D de Elevación y Velocidad".to_string(),
            width: 1000,
            height: 700,
            speed_cmax: 50.0,
            surface_opacity: 0.8,
            marker_size: 5.0,
            marker_opacity: 0.7,
            output: None,
            open_browser: true,
            plotly_src: DEFAULT_PLOTLY_SRC.to_string(),
        }
    }
}

impl ViewerConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env_prefix(path, ENV_PREFIX)
    }

    fn load_with_env_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = cfg::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(cfg::File::from(path).required(true));
        }
        builder = builder.add_source(cfg::Environment::with_prefix(prefix).separator("__"));

        let config: ViewerConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let f = &self.filter;
        if !(f.latitude_min <= f.latitude_max) {
            return Err(ViewerError::Config(format!(
                "filter.latitude_min ({}) must not exceed filter.latitude_max ({})",
                f.latitude_min, f.latitude_max
            )));
        }
        if !(f.longitude_min <= f.longitude_max) {
            return Err(ViewerError::Config(format!(
                "filter.longitude_min ({}) must not exceed filter.longitude_max ({})",
                f.longitude_min, f.longitude_max
            )));
        }
        if !f.max_speed_kmh.is_finite() {
            return Err(ViewerError::Config(
                "filter.max_speed_kmh must be a finite number".to_string(),
            ));
        }
        if self.terrain.scale_factor == 0 {
            return Err(ViewerError::Config(
                "terrain.scale_factor must be at least 1".to_string(),
            ));
        }
        if self.database.limit == 0 {
            return Err(ViewerError::Config("database.limit must be at least 1".to_string()));
        }
        self.projection.zone()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_field_survey_setup() {
        let config = ViewerConfig::default();
        assert_eq!(config.database.limit, 500);
        assert_eq!(config.projection.zone().unwrap().to_string(), "13N");
        assert_eq!(config.filter.latitude_min, 18.0);
        assert_eq!(config.filter.longitude_max, -100.0);
        assert_eq!(config.filter.max_speed_kmh, 50.0);
        assert_eq!(config.terrain.scale_factor, 20);
        assert_eq!((config.render.width, config.render.height), (1000, 700));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
host = "10.0.0.5"
username = "reader"
password = "secret"
limit = 1200

[projection]
utm_zone = 14
hemisphere = "north"

[terrain]
path = "dsm.tif"
scale_factor = 8
"#
        )
        .unwrap();

        let config = ViewerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.database.host, "10.0.0.5");
        assert_eq!(config.database.limit, 1200);
        assert_eq!(config.database.port, 1433);
        assert_eq!(config.projection.zone().unwrap().to_string(), "14N");
        assert_eq!(config.terrain.path, Some(PathBuf::from("dsm.tif")));
        assert_eq!(config.terrain.scale_factor, 8);
        // Untouched sections keep their defaults
        assert_eq!(config.filter.max_speed_kmh, 50.0);
    }

    #[test]
    fn test_environment_overrides_file() {
        // Own prefix so parallel tests loading SENSORVIEW__* are unaffected
        const PREFIX: &str = "SENSORVIEW_ENVTEST";
        let vars = [
            ("SENSORVIEW_ENVTEST__DATABASE__LIMIT", "42"),
            ("SENSORVIEW_ENVTEST__PROJECTION__UTM_ZONE", "14"),
            ("SENSORVIEW_ENVTEST__PROJECTION__HEMISPHERE", "south"),
            ("SENSORVIEW_ENVTEST__FILTER__MAX_SPEED_KMH", "30.5"),
        ];

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
host = "10.0.0.5"
limit = 1200

[filter]
max_speed_kmh = 80.0
"#
        )
        .unwrap();

        for (key, value) in vars {
            std::env::set_var(key, value);
        }
        let loaded = ViewerConfig::load_with_env_prefix(Some(file.path()), PREFIX);
        for (key, _) in vars {
            std::env::remove_var(key);
        }

        let config = loaded.unwrap();
        assert_eq!(config.database.limit, 42);
        assert_eq!(config.projection.zone().unwrap().to_string(), "14S");
        assert_eq!(config.filter.max_speed_kmh, 30.5);
        // File values the environment does not touch survive
        assert_eq!(config.database.host, "10.0.0.5");
        // Defaults fill the rest
        assert_eq!(config.terrain.scale_factor, 20);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let result = ViewerConfig::load(Some(Path::new("/nonexistent/viewer.toml")));
        assert!(matches!(result, Err(ViewerError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_window() {
        let mut config = ViewerConfig::default();
        config.filter.latitude_min = 30.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_scale_factor() {
        let mut config = ViewerConfig::default();
        config.terrain.scale_factor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_zone() {
        let mut config = ViewerConfig::default();
        config.projection.utm_zone = 61;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut config = DatabaseConfig::default();
        config.password = Some("hunter2".to_string());
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
