use ndarray::{Array2, Zip};
use proj4rs::Proj;
use tracing::{debug, info};

use crate::dem_processor::RasterCrs;
use crate::error::{Result, ViewerError};

/// Downsampled elevation surface with the world coordinates of every cell centre.
#[derive(Debug, Clone)]
pub struct TerrainGrid {
    elevation: Array2<f32>,
    x: Array2<f64>,
    y: Array2<f64>,
}

impl TerrainGrid {
    pub fn new(elevation: Array2<f32>, x: Array2<f64>, y: Array2<f64>) -> Result<Self> {
        if elevation.dim() != x.dim() || elevation.dim() != y.dim() {
            return Err(ViewerError::Raster(format!(
                "grid shapes differ: elevation {:?}, x {:?}, y {:?}",
                elevation.dim(),
                x.dim(),
                y.dim()
            )));
        }
        Ok(TerrainGrid { elevation, x, y })
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.elevation.dim()
    }

    pub fn elevation(&self) -> &Array2<f32> {
        &self.elevation
    }

    pub fn x(&self) -> &Array2<f64> {
        &self.x
    }

    pub fn y(&self) -> &Array2<f64> {
        &self.y
    }

    /// Min/max over cells that hold data; `None` when the grid is all nodata
    pub fn elevation_range(&self) -> Option<(f32, f32)> {
        self.elevation
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(None, |range, v| match range {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    /// Express the x/y mesh as longitude/latitude degrees so the surface
    /// shares axes with the georeferenced readings.
    pub fn to_geographic(self, crs: &RasterCrs) -> Result<Self> {
        if crs.is_geographic() {
            debug!("Terrain grid already geographic");
            return Ok(self);
        }

        info!(crs = %crs, "Reprojecting terrain grid to WGS84");
        let source = Proj::from_proj_string(&crs.proj_string()).map_err(|e| {
            ViewerError::Projection(format!("Failed to create raster projection: {:?}", e))
        })?;
        let wgs84 = Proj::from_proj_string(&RasterCrs::Geographic.proj_string()).map_err(|e| {
            ViewerError::Projection(format!("Failed to create WGS84 projection: {:?}", e))
        })?;

        let mut lon = Array2::<f64>::zeros(self.x.dim());
        let mut lat = Array2::<f64>::zeros(self.y.dim());
        let mut failure = None;

        Zip::from(&mut lon)
            .and(&mut lat)
            .and(&self.x)
            .and(&self.y)
            .for_each(|lon, lat, &x, &y| {
                match transform_point(&source, &wgs84, x, y) {
                    Ok((x_out, y_out)) => {
                        *lon = x_out;
                        *lat = y_out;
                    }
                    Err(e) => {
                        *lon = f64::NAN;
                        *lat = f64::NAN;
                        failure.get_or_insert_with(|| format!("({}, {}): {}", x, y, e));
                    }
                }
            });

        if let Some(first) = failure {
            return Err(ViewerError::Projection(format!(
                "Failed to reproject terrain grid at {}",
                first
            )));
        }

        TerrainGrid::new(self.elevation, lon, lat)
    }
}

/// Move one point between two PROJ definitions.
///
/// Lat/long systems are read and written in degrees, everything else in
/// the definition's native units.
pub(crate) fn transform_point(
    source: &Proj,
    target: &Proj,
    x: f64,
    y: f64,
) -> std::result::Result<(f64, f64), String> {
    let mut point = if source.is_latlong() {
        (x.to_radians(), y.to_radians(), 0.0)
    } else {
        (x, y, 0.0)
    };
    proj4rs::transform::transform(source, target, &mut point).map_err(|e| format!("{:?}", e))?;

    if target.is_latlong() {
        Ok((point.0.to_degrees(), point.1.to_degrees()))
    } else {
        Ok((point.0, point.1))
    }
}
