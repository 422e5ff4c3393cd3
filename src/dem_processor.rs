use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nalgebra::{Matrix3, Vector3};
use ndarray::{s, Array2};
use num_traits::AsPrimitive;
use proj4rs::Proj;
use serde::Serialize;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tracing::{debug, info, warn};

use crate::error::{Result, ViewerError};
use crate::readings::GeoReading;
use crate::terrain::{transform_point, TerrainGrid};
use crate::utm::{self, Hemisphere, UtmZone};

// GeoTIFF tag IDs
const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

// GeoKey IDs
const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;

const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_POINT: u16 = 2;

const PLANAR_SEPARATE: u32 = 2;

/// Affine transformation from pixel (col, row) to world (x, y)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoTransform {
    /// X-coordinate of the upper-left corner of the upper-left pixel
    pub origin_x: f64,
    /// Y-coordinate of the upper-left corner of the upper-left pixel
    pub origin_y: f64,
    /// Pixel width in world units
    pub pixel_width: f64,
    /// Pixel height in world units (typically negative)
    pub pixel_height: f64,
    /// Row term of x (usually 0)
    pub rotation_x: f64,
    /// Column term of y (usually 0)
    pub rotation_y: f64,
}

impl GeoTransform {
    fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.pixel_width, self.rotation_x, self.origin_x,
            self.rotation_y, self.pixel_height, self.origin_y,
            0.0, 0.0, 1.0,
        )
    }

    pub fn pixel_to_geo(&self, col: f64, row: f64) -> (f64, f64) {
        let x = self.origin_x + col * self.pixel_width + row * self.rotation_x;
        let y = self.origin_y + col * self.rotation_y + row * self.pixel_height;
        (x, y)
    }

    /// Inverse of [`pixel_to_geo`](Self::pixel_to_geo); `None` for a degenerate transform
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let inverse = self.matrix().try_inverse()?;
        let pixel = inverse * Vector3::new(x, y, 1.0);
        Some((pixel.x, pixel.y))
    }

    /// Parse a six-line world file (.tfw): A, D, B, E, C, F
    pub fn from_world_file(content: &str) -> Result<Self> {
        let values = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| {
                l.parse::<f64>()
                    .map_err(|e| ViewerError::Raster(format!("World file value '{}': {}", l, e)))
            })
            .collect::<Result<Vec<f64>>>()?;

        if values.len() != 6 {
            return Err(ViewerError::Raster(format!(
                "World file must contain 6 values, found {}",
                values.len()
            )));
        }

        // World files reference the centre of the upper-left pixel
        let (a, d, b, e, c, f) = (values[0], values[1], values[2], values[3], values[4], values[5]);
        Ok(GeoTransform {
            origin_x: c - 0.5 * a - 0.5 * b,
            origin_y: f - 0.5 * d - 0.5 * e,
            pixel_width: a,
            pixel_height: e,
            rotation_x: b,
            rotation_y: d,
        })
    }

    fn shift_half_pixel(&mut self) {
        self.origin_x -= 0.5 * self.pixel_width + 0.5 * self.rotation_x;
        self.origin_y -= 0.5 * self.rotation_y + 0.5 * self.pixel_height;
    }
}

/// Coordinate reference system of the raster's world coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum RasterCrs {
    /// Longitude/latitude degrees on WGS84 (or close enough to it)
    Geographic,
    Utm(UtmZone),
    /// Any other projection, as a PROJ definition string
    Proj(String),
}

impl RasterCrs {
    pub fn is_geographic(&self) -> bool {
        matches!(self, RasterCrs::Geographic)
    }

    pub fn proj_string(&self) -> String {
        match self {
            RasterCrs::Geographic => "+proj=longlat +datum=WGS84 +no_defs".to_string(),
            RasterCrs::Utm(zone) => zone.proj_string(),
            RasterCrs::Proj(def) => def.clone(),
        }
    }

    /// Map an EPSG code to a CRS this crate can handle
    pub fn from_epsg(code: u16) -> Option<Self> {
        match code {
            4326 | 4269 | 4258 => Some(RasterCrs::Geographic),
            32601..=32660 => UtmZone::new((code - 32600) as u8, Hemisphere::North)
                .ok()
                .map(RasterCrs::Utm),
            32701..=32760 => UtmZone::new((code - 32700) as u8, Hemisphere::South)
                .ok()
                .map(RasterCrs::Utm),
            // NAD83 / UTM zones 1N-23N, treated as WGS84 (sub-meter difference)
            26901..=26923 => UtmZone::new((code - 26900) as u8, Hemisphere::North)
                .ok()
                .map(RasterCrs::Utm),
            _ => None,
        }
    }

    /// Detect the CRS from a WKT `.prj` document
    pub fn from_wkt(wkt: &str) -> Option<Self> {
        let upper = wkt.to_uppercase();

        if let Some(zone) = utm_zone_from_wkt(&upper) {
            return Some(RasterCrs::Utm(zone));
        }

        if upper.contains("TRANSVERSE_MERCATOR") {
            let tm = TransverseMercator::from_wkt(&upper)?;
            if let Some(zone) = tm.as_utm_zone() {
                return Some(RasterCrs::Utm(zone));
            }
            return Some(RasterCrs::Proj(tm.proj_string()));
        }

        if upper.starts_with("GEOGCS") || upper.starts_with("GEOGCRS") {
            return Some(RasterCrs::Geographic);
        }

        None
    }
}

impl fmt::Display for RasterCrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RasterCrs::Geographic => write!(f, "geographic"),
            RasterCrs::Utm(zone) => write!(f, "utm:{}", zone),
            RasterCrs::Proj(def) => write!(f, "{}", def),
        }
    }
}

impl FromStr for RasterCrs {
    type Err = ViewerError;

    /// Accepts `geographic`, `utm:13N`, `epsg:32613` or a `+proj=` string
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let lower = trimmed.to_ascii_lowercase();

        if lower == "geographic" || lower == "wgs84" {
            return Ok(RasterCrs::Geographic);
        }
        if let Some(zone) = lower.strip_prefix("utm:") {
            return Ok(RasterCrs::Utm(zone.parse()?));
        }
        if let Some(code) = lower.strip_prefix("epsg:") {
            let code: u16 = code
                .parse()
                .map_err(|_| ViewerError::Config(format!("Invalid EPSG code '{}'", s)))?;
            return RasterCrs::from_epsg(code)
                .ok_or_else(|| ViewerError::Config(format!("Unsupported EPSG code {}", code)));
        }
        if trimmed.starts_with("+proj=") {
            return Ok(RasterCrs::Proj(trimmed.to_string()));
        }

        Err(ViewerError::Config(format!(
            "Unrecognised raster CRS '{}' (expected geographic, utm:<zone><N|S>, epsg:<code> or +proj=...)",
            s
        )))
    }
}

fn utm_zone_from_wkt(upper: &str) -> Option<UtmZone> {
    let idx = upper.find("UTM")?;
    let after_utm = &upper[idx..];
    let zone_idx = after_utm.find("ZONE")?;
    let after_zone = &after_utm[zone_idx + 4..];

    let digits: String = after_zone
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let number: u8 = digits.parse().ok()?;

    let suffix = after_zone
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .skip_while(|c| c.is_ascii_digit())
        .next();
    let hemisphere = if suffix == Some('S') {
        Hemisphere::South
    } else {
        Hemisphere::North
    };

    UtmZone::new(number, hemisphere).ok()
}

#[derive(Debug, Clone, PartialEq)]
struct TransverseMercator {
    central_meridian: f64,
    false_easting: f64,
    false_northing: f64,
    scale_factor: f64,
    latitude_of_origin: f64,
}

impl TransverseMercator {
    fn from_wkt(upper: &str) -> Option<Self> {
        Some(TransverseMercator {
            central_meridian: wkt_parameter(upper, "CENTRAL_MERIDIAN")?,
            false_easting: wkt_parameter(upper, "FALSE_EASTING").unwrap_or(0.0),
            false_northing: wkt_parameter(upper, "FALSE_NORTHING").unwrap_or(0.0),
            scale_factor: wkt_parameter(upper, "SCALE_FACTOR").unwrap_or(1.0),
            latitude_of_origin: wkt_parameter(upper, "LATITUDE_OF_ORIGIN").unwrap_or(0.0),
        })
    }

    /// A TM with UTM parameters on a zone's central meridian is that UTM zone
    fn as_utm_zone(&self) -> Option<UtmZone> {
        let utm_like = (self.false_easting - 500_000.0).abs() < 1.0
            && (self.scale_factor - 0.9996).abs() < 1e-4
            && self.latitude_of_origin.abs() < 1e-9;
        if !utm_like {
            return None;
        }

        let number = ((self.central_meridian + 183.0) / 6.0).round();
        if (number * 6.0 - 183.0 - self.central_meridian).abs() > 1e-6 {
            return None;
        }
        let hemisphere = if (self.false_northing - 10_000_000.0).abs() < 1.0 {
            Hemisphere::South
        } else {
            Hemisphere::North
        };
        UtmZone::new(number as u8, hemisphere).ok()
    }

    fn proj_string(&self) -> String {
        format!(
            "+proj=tmerc +lat_0={} +lon_0={} +k={} +x_0={} +y_0={} +datum=WGS84 +units=m +no_defs",
            self.latitude_of_origin,
            self.central_meridian,
            self.scale_factor,
            self.false_easting,
            self.false_northing
        )
    }
}

/// Value of `PARAMETER["name",value]` in upper-cased WKT
fn wkt_parameter(upper: &str, name: &str) -> Option<f64> {
    let pattern = format!("PARAMETER[\"{}\"", name);
    let idx = upper.find(&pattern)?;
    let after = &upper[idx + pattern.len()..];
    let after_comma = &after[after.find(',')? + 1..];

    let number: String = after_comma
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'E'))
        .collect();
    number.parse().ok()
}

/// Metadata summary printed by `dem-info`
#[derive(Debug, Clone, Serialize)]
pub struct DemInfo {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub sample_type: &'static str,
    /// [min_x, min_y, max_x, max_y] in raster CRS units
    pub bounds: [f64; 4],
    pub transform: GeoTransform,
    pub nodata: Option<f64>,
    pub crs: Option<String>,
    pub valid_pixels: usize,
    pub elevation_min: Option<f32>,
    pub elevation_max: Option<f32>,
}

/// Band 1 of a GeoTIFF elevation model, held fully in memory.
pub struct DEMProcessor {
    path: PathBuf,
    width: u32,
    height: u32,
    transform: GeoTransform,
    nodata_value: Option<f64>,
    data: Array2<f32>,
    crs: Option<RasterCrs>,
    sample_type: &'static str,
}

impl DEMProcessor {
    /// Read a GeoTIFF (plus `.tfw`/`.prj` sidecars when the file lacks tags).
    pub fn open(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "Reading GeoTIFF");
        let file = File::open(path)?;
        let mut decoder = Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited());

        let (width, height) = decoder.dimensions()?;
        let samples = decoder.get_tag_u32(Tag::SamplesPerPixel).unwrap_or(1).max(1) as usize;
        let layout = if decoder.get_tag_u32(Tag::PlanarConfiguration).ok() == Some(PLANAR_SEPARATE) {
            SampleLayout::Planar {
                pixels: width as usize * height as usize,
            }
        } else {
            SampleLayout::Chunky { samples }
        };
        debug!(samples, ?layout, "Sample layout");

        let geo_keys = read_geo_keys(&mut decoder);
        let mut transform = match parse_geotiff_tags(&mut decoder) {
            Some(t) => t,
            None => read_world_file(path)?,
        };
        if geo_keys.get(&GT_RASTER_TYPE) == Some(&RASTER_PIXEL_IS_POINT) {
            debug!("Raster is PixelIsPoint, shifting origin by half a pixel");
            transform.shift_half_pixel();
        }

        let nodata_value = parse_nodata(&mut decoder);
        let crs = crs_from_geo_keys(&geo_keys).or_else(|| read_prj_file(path));

        let image = decoder.read_image()?;
        let sample_type = sample_type_name(&image);
        if matches!(image, DecodingResult::U8(_)) {
            warn!("8-bit DEM detected; elevations are limited to 0-255");
        }

        let values = band_one(image, layout);
        let data = Array2::from_shape_vec((height as usize, width as usize), values).map_err(|e| {
            ViewerError::Raster(format!(
                "Decoded samples do not match {}x{} raster: {}",
                width, height, e
            ))
        })?;

        info!(
            width,
            height,
            sample_type,
            nodata = ?nodata_value,
            crs = ?crs.as_ref().map(|c| c.to_string()),
            "GeoTIFF loaded"
        );

        Ok(DEMProcessor {
            path: path.to_path_buf(),
            width,
            height,
            transform,
            nodata_value,
            data,
            crs,
            sample_type,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn nodata(&self) -> Option<f64> {
        self.nodata_value
    }

    /// CRS found in the file's GeoKeys or a `.prj` sidecar
    pub fn embedded_crs(&self) -> Option<&RasterCrs> {
        self.crs.as_ref()
    }

    /// Pick the raster CRS: explicit override, then embedded metadata,
    /// then a guess from the magnitude of the origin.
    pub fn resolve_crs(&self, override_crs: Option<&RasterCrs>, sensor_zone: UtmZone) -> RasterCrs {
        if let Some(crs) = override_crs {
            return crs.clone();
        }
        if let Some(crs) = &self.crs {
            return crs.clone();
        }

        let t = &self.transform;
        if t.origin_x.abs() > 1000.0 || t.origin_y.abs() > 1000.0 {
            warn!(
                zone = %sensor_zone,
                "Raster has no CRS metadata but projected coordinates; assuming the sensor UTM zone"
            );
            RasterCrs::Utm(sensor_zone)
        } else {
            warn!("Raster has no CRS metadata; assuming geographic coordinates");
            RasterCrs::Geographic
        }
    }

    /// Number of readings whose position falls on the raster footprint.
    pub fn coverage(&self, crs: &RasterCrs, rows: &[GeoReading]) -> Result<usize> {
        let to_world: Box<dyn Fn(f64, f64) -> Option<(f64, f64)>> = match crs {
            RasterCrs::Geographic => Box::new(|lat: f64, lon: f64| Some((lon, lat))),
            RasterCrs::Utm(zone) => {
                let zone = *zone;
                Box::new(move |lat: f64, lon: f64| utm::from_latlon(lat, lon, zone).ok())
            }
            RasterCrs::Proj(_) => {
                let wgs84 = Proj::from_proj_string(&RasterCrs::Geographic.proj_string())
                    .map_err(|e| ViewerError::Projection(format!("{:?}", e)))?;
                let target = Proj::from_proj_string(&crs.proj_string())
                    .map_err(|e| ViewerError::Projection(format!("{:?}", e)))?;
                Box::new(move |lat: f64, lon: f64| transform_point(&wgs84, &target, lon, lat).ok())
            }
        };

        let (width, height) = (self.width as f64, self.height as f64);
        let covered = rows
            .iter()
            .filter_map(|r| to_world(r.latitude, r.longitude))
            .filter_map(|(x, y)| self.transform.geo_to_pixel(x, y))
            .filter(|&(col, row)| (0.0..width).contains(&col) && (0.0..height).contains(&row))
            .count();
        Ok(covered)
    }

    fn is_nodata(&self, value: f32) -> bool {
        if value.is_nan() {
            return true;
        }
        match self.nodata_value {
            Some(nodata) if nodata.is_nan() => false,
            Some(nodata) => (value as f64 - nodata).abs() < 1e-6 * nodata.abs().max(1.0),
            None => false,
        }
    }

    /// Block-average the raster by `scale_factor` in both directions.
    ///
    /// Partial blocks on the right and bottom edges are dropped. Nodata
    /// pixels do not contribute; a block with no valid pixels is NaN.
    pub fn downsample(&self, scale_factor: usize) -> Result<TerrainGrid> {
        if scale_factor == 0 {
            return Err(ViewerError::Raster("scale factor must be at least 1".to_string()));
        }

        let out_rows = self.height as usize / scale_factor;
        let out_cols = self.width as usize / scale_factor;
        if out_rows == 0 || out_cols == 0 {
            return Err(ViewerError::Raster(format!(
                "scale factor {} leaves nothing of a {}x{} raster",
                scale_factor, self.width, self.height
            )));
        }

        let f = scale_factor;
        let elevation = Array2::from_shape_fn((out_rows, out_cols), |(i, j)| {
            let block = self.data.slice(s![i * f..(i + 1) * f, j * f..(j + 1) * f]);
            let (sum, count) = block
                .iter()
                .filter(|v| !self.is_nodata(**v))
                .fold((0.0f64, 0usize), |(sum, count), v| (sum + *v as f64, count + 1));
            if count == 0 {
                f32::NAN
            } else {
                (sum / count as f64) as f32
            }
        });

        // Block centres in source pixel space
        let half = f as f64 / 2.0;
        let centre = |i: usize, j: usize| {
            self.transform
                .pixel_to_geo((j * f) as f64 + half, (i * f) as f64 + half)
        };
        let x = Array2::from_shape_fn((out_rows, out_cols), |(i, j)| centre(i, j).0);
        let y = Array2::from_shape_fn((out_rows, out_cols), |(i, j)| centre(i, j).1);

        debug!(
            rows = out_rows,
            cols = out_cols,
            scale_factor,
            "Raster downsampled"
        );

        TerrainGrid::new(elevation, x, y)
    }

    pub fn bounds(&self) -> [f64; 4] {
        let corners = [
            self.transform.pixel_to_geo(0.0, 0.0),
            self.transform.pixel_to_geo(self.width as f64, 0.0),
            self.transform.pixel_to_geo(0.0, self.height as f64),
            self.transform.pixel_to_geo(self.width as f64, self.height as f64),
        ];
        let min_x = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min);
        let max_x = corners.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max);
        let min_y = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min);
        let max_y = corners.iter().map(|c| c.1).fold(f64::NEG_INFINITY, f64::max);
        [min_x, min_y, max_x, max_y]
    }

    pub fn info(&self) -> DemInfo {
        let valid: Vec<f32> = self
            .data
            .iter()
            .copied()
            .filter(|v| !self.is_nodata(*v))
            .collect();
        let elevation_min = valid.iter().copied().reduce(f32::min);
        let elevation_max = valid.iter().copied().reduce(f32::max);

        DemInfo {
            path: self.path.clone(),
            width: self.width,
            height: self.height,
            sample_type: self.sample_type,
            bounds: self.bounds(),
            transform: self.transform.clone(),
            nodata: self.nodata_value,
            crs: self.crs.as_ref().map(|c| c.to_string()),
            valid_pixels: valid.len(),
            elevation_min,
            elevation_max,
        }
    }
}

fn geotiff_tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

fn parse_geotiff_tags<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    if let Ok(m) = decoder.get_tag_f64_vec(geotiff_tag(MODEL_TRANSFORMATION)) {
        if m.len() == 16 {
            debug!(matrix = ?m, "Using ModelTransformationTag");
            // Row-major 4x4: x = m0*col + m1*row + m3, y = m4*col + m5*row + m7
            return Some(GeoTransform {
                origin_x: m[3],
                origin_y: m[7],
                pixel_width: m[0],
                pixel_height: m[5],
                rotation_x: m[1],
                rotation_y: m[4],
            });
        }
    }

    let scale = decoder
        .get_tag_f64_vec(geotiff_tag(MODEL_PIXEL_SCALE))
        .ok()
        .filter(|s| s.len() >= 2)?;
    let tiepoint = decoder
        .get_tag_f64_vec(geotiff_tag(MODEL_TIEPOINT))
        .ok()
        .filter(|t| t.len() >= 6)?;

    // Tiepoint [I, J, K, X, Y, Z] ties pixel (I, J) to world (X, Y)
    let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
    debug!(?scale, ?tiepoint, "Using ModelPixelScale + ModelTiepoint");

    Some(GeoTransform {
        origin_x: x - i * scale[0],
        origin_y: y + j * scale[1],
        pixel_width: scale[0],
        pixel_height: -scale[1],
        rotation_x: 0.0,
        rotation_y: 0.0,
    })
}

fn read_world_file(path: &Path) -> Result<GeoTransform> {
    for ext in ["tfw", "tifw", "tiffw", "wld"] {
        let candidate = path.with_extension(ext);
        if candidate.is_file() {
            debug!(path = %candidate.display(), "Using world file");
            return GeoTransform::from_world_file(&fs::read_to_string(&candidate)?);
        }
    }
    Err(ViewerError::Raster(format!(
        "{} has no GeoTIFF georeferencing tags and no world file (.tfw)",
        path.display()
    )))
}

fn read_prj_file(path: &Path) -> Option<RasterCrs> {
    let prj = path.with_extension("prj");
    let wkt = fs::read_to_string(&prj).ok()?;
    let crs = RasterCrs::from_wkt(&wkt);
    if crs.is_none() {
        warn!(path = %prj.display(), "Could not understand projection file");
    }
    crs
}

/// Inline (SHORT) GeoKeys from the GeoKeyDirectoryTag
fn read_geo_keys<R: Read + Seek>(decoder: &mut Decoder<R>) -> HashMap<u16, u16> {
    match decoder.get_tag_u16_vec(geotiff_tag(GEO_KEY_DIRECTORY)) {
        Ok(directory) => parse_geo_key_directory(&directory),
        Err(_) => HashMap::new(),
    }
}

fn parse_geo_key_directory(directory: &[u16]) -> HashMap<u16, u16> {
    let mut keys = HashMap::new();
    if directory.len() < 4 {
        return keys;
    }

    let count = directory[3] as usize;
    for entry in directory[4..].chunks_exact(4).take(count) {
        let (key, location, value) = (entry[0], entry[1], entry[3]);
        // location 0 means the value is stored inline
        if location == 0 {
            keys.insert(key, value);
        }
    }
    keys
}

fn crs_from_geo_keys(keys: &HashMap<u16, u16>) -> Option<RasterCrs> {
    match keys.get(&GT_MODEL_TYPE).copied() {
        Some(MODEL_TYPE_PROJECTED) => keys
            .get(&PROJECTED_CS_TYPE)
            .and_then(|code| RasterCrs::from_epsg(*code)),
        Some(MODEL_TYPE_GEOGRAPHIC) => Some(
            keys.get(&GEOGRAPHIC_TYPE)
                .and_then(|code| RasterCrs::from_epsg(*code))
                .unwrap_or(RasterCrs::Geographic),
        ),
        _ => keys
            .get(&PROJECTED_CS_TYPE)
            .and_then(|code| RasterCrs::from_epsg(*code)),
    }
}

fn parse_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    let text = decoder.get_tag_ascii_string(geotiff_tag(GDAL_NODATA)).ok()?;
    let value = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    match value.parse::<f64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(value, "Ignoring unparseable GDAL_NODATA tag");
            None
        }
    }
}

/// Where band 1 sits in the decoded sample buffer
#[derive(Debug, Clone, Copy, PartialEq)]
enum SampleLayout {
    /// Samples of a pixel are interleaved
    Chunky { samples: usize },
    /// Each band is a contiguous plane; band 1 comes first
    Planar { pixels: usize },
}

fn widen<T: AsPrimitive<f32>>(values: Vec<T>, layout: SampleLayout) -> Vec<f32> {
    match layout {
        SampleLayout::Chunky { samples } => {
            values.into_iter().step_by(samples.max(1)).map(|v| v.as_()).collect()
        }
        SampleLayout::Planar { pixels } => values.into_iter().take(pixels).map(|v| v.as_()).collect(),
    }
}

/// First sample of every pixel, as f32
fn band_one(image: DecodingResult, layout: SampleLayout) -> Vec<f32> {
    match image {
        DecodingResult::U8(v) => widen(v, layout),
        DecodingResult::U16(v) => widen(v, layout),
        DecodingResult::U32(v) => widen(v, layout),
        DecodingResult::U64(v) => widen(v, layout),
        DecodingResult::I8(v) => widen(v, layout),
        DecodingResult::I16(v) => widen(v, layout),
        DecodingResult::I32(v) => widen(v, layout),
        DecodingResult::I64(v) => widen(v, layout),
        DecodingResult::F32(v) => widen(v, layout),
        DecodingResult::F64(v) => widen(v, layout),
    }
}

fn sample_type_name(image: &DecodingResult) -> &'static str {
    match image {
        DecodingResult::U8(_) => "u8",
        DecodingResult::U16(_) => "u16",
        DecodingResult::U32(_) => "u32",
        DecodingResult::U64(_) => "u64",
        DecodingResult::I8(_) => "i8",
        DecodingResult::I16(_) => "i16",
        DecodingResult::I32(_) => "i32",
        DecodingResult::I64(_) => "i64",
        DecodingResult::F32(_) => "f32",
        DecodingResult::F64(_) => "f64",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tiff::encoder::{colortype, TiffEncoder};

    const ORIGIN_X: f64 = 640_000.0;
    const ORIGIN_Y: f64 = 2_120_000.0;

    /// Write a 6x4 float GeoTIFF in UTM 13N with 10 m pixels
    fn write_fixture(path: &Path, values: &[f32], nodata: Option<&str>, geo_keys: bool) {
        write_fixture_at(path, (ORIGIN_X, ORIGIN_Y), 10.0, values, nodata, geo_keys);
    }

    fn write_fixture_at(
        path: &Path,
        origin: (f64, f64),
        pixel: f64,
        values: &[f32],
        nodata: Option<&str>,
        geo_keys: bool,
    ) {
        let file = File::create(path).unwrap();
        let mut tiff = TiffEncoder::new(file).unwrap();
        let mut image = tiff.new_image::<colortype::Gray32Float>(6, 4).unwrap();
        {
            let dir = image.encoder();
            dir.write_tag(geotiff_tag(MODEL_PIXEL_SCALE), &[pixel, pixel, 0.0][..])
                .unwrap();
            dir.write_tag(
                geotiff_tag(MODEL_TIEPOINT),
                &[0.0f64, 0.0, 0.0, origin.0, origin.1, 0.0][..],
            )
            .unwrap();
            if let Some(nodata) = nodata {
                dir.write_tag(geotiff_tag(GDAL_NODATA), nodata).unwrap();
            }
            if geo_keys {
                let keys: [u16; 16] = [
                    1, 1, 0, 3,
                    GT_MODEL_TYPE, 0, 1, MODEL_TYPE_PROJECTED,
                    GT_RASTER_TYPE, 0, 1, 1,
                    PROJECTED_CS_TYPE, 0, 1, 32613,
                ];
                dir.write_tag(geotiff_tag(GEO_KEY_DIRECTORY), &keys[..]).unwrap();
            }
        }
        image.write_data(values).unwrap();
    }

    fn ramp() -> Vec<f32> {
        (0..24).map(|v| v as f32).collect()
    }

    #[test]
    fn test_geotransform() {
        let transform = GeoTransform {
            origin_x: 0.0,
            origin_y: 100.0,
            pixel_width: 1.0,
            pixel_height: -1.0,
            rotation_x: 0.0,
            rotation_y: 0.0,
        };

        let (x, y) = transform.pixel_to_geo(10.0, 20.0);
        assert_eq!(x, 10.0);
        assert_eq!(y, 80.0);

        let (col, row) = transform.geo_to_pixel(10.0, 80.0).unwrap();
        assert_abs_diff_eq!(col, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(row, 20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_transform_has_no_inverse() {
        let transform = GeoTransform {
            origin_x: 0.0,
            origin_y: 0.0,
            pixel_width: 0.0,
            pixel_height: 0.0,
            rotation_x: 0.0,
            rotation_y: 0.0,
        };
        assert!(transform.geo_to_pixel(1.0, 1.0).is_none());
    }

    #[test]
    fn test_world_file_references_pixel_centre() {
        let tfw = "10.0\n0.0\n0.0\n-10.0\n640005.0\n2119995.0\n";
        let transform = GeoTransform::from_world_file(tfw).unwrap();
        assert_abs_diff_eq!(transform.origin_x, 640_000.0);
        assert_abs_diff_eq!(transform.origin_y, 2_120_000.0);
        assert!(GeoTransform::from_world_file("1.0\n2.0\n").is_err());
    }

    #[test]
    fn test_open_reads_tags_keys_and_nodata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsm.tif");
        write_fixture(&path, &ramp(), Some("-9999"), true);

        let dem = DEMProcessor::open(&path).unwrap();
        assert_eq!((dem.width(), dem.height()), (6, 4));
        assert_eq!(dem.nodata(), Some(-9999.0));
        assert_abs_diff_eq!(dem.transform().origin_x, ORIGIN_X);
        assert_abs_diff_eq!(dem.transform().pixel_height, -10.0);

        let zone = UtmZone::new(13, Hemisphere::North).unwrap();
        assert_eq!(dem.embedded_crs(), Some(&RasterCrs::Utm(zone)));

        let info = dem.info();
        assert_eq!(info.bounds, [ORIGIN_X, ORIGIN_Y - 40.0, ORIGIN_X + 60.0, ORIGIN_Y]);
        assert_eq!(info.valid_pixels, 24);
        assert_eq!(info.elevation_min, Some(0.0));
        assert_eq!(info.elevation_max, Some(23.0));
    }

    #[test]
    fn test_downsample_averages_blocks_and_drops_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsm.tif");
        write_fixture(&path, &ramp(), None, false);

        let dem = DEMProcessor::open(&path).unwrap();
        // 6x4 by 4 -> 1x1: mean of rows 0..4, cols 0..4
        let grid = dem.downsample(4).unwrap();
        assert_eq!(grid.shape(), (1, 1));
        let expected = [0, 1, 2, 3, 6, 7, 8, 9, 12, 13, 14, 15, 18, 19, 20, 21]
            .iter()
            .sum::<i32>() as f32
            / 16.0;
        assert_abs_diff_eq!(grid.elevation()[[0, 0]], expected);

        let grid = dem.downsample(2).unwrap();
        assert_eq!(grid.shape(), (2, 3));
        assert_abs_diff_eq!(grid.elevation()[[0, 0]], (0.0 + 1.0 + 6.0 + 7.0) / 4.0);
        assert_abs_diff_eq!(grid.elevation()[[1, 2]], (16.0 + 17.0 + 22.0 + 23.0) / 4.0);
        // Cell centres sit in the middle of each 20 m block
        assert_abs_diff_eq!(grid.x()[[0, 0]], ORIGIN_X + 10.0);
        assert_abs_diff_eq!(grid.y()[[0, 0]], ORIGIN_Y - 10.0);
        assert_abs_diff_eq!(grid.x()[[1, 2]], ORIGIN_X + 50.0);
        assert_abs_diff_eq!(grid.y()[[1, 2]], ORIGIN_Y - 30.0);
    }

    #[test]
    fn test_downsample_skips_nodata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsm.tif");
        let mut values = ramp();
        values[0] = -9999.0;
        values[1] = -9999.0;
        values[6] = -9999.0;
        values[7] = -9999.0;
        values[8] = -9999.0;
        write_fixture(&path, &values, Some("-9999"), false);

        let grid = DEMProcessor::open(&path).unwrap().downsample(2).unwrap();
        assert!(grid.elevation()[[0, 0]].is_nan());
        assert_abs_diff_eq!(grid.elevation()[[0, 1]], (2.0 + 3.0 + 9.0) / 3.0);
        assert_eq!(grid.elevation_range(), Some(((14.0f64 / 3.0) as f32, 19.5)));
    }

    #[test]
    fn test_downsample_rejects_oversized_factor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsm.tif");
        write_fixture(&path, &ramp(), None, false);

        let dem = DEMProcessor::open(&path).unwrap();
        assert!(dem.downsample(5).is_err());
        assert!(dem.downsample(0).is_err());
        assert_eq!(dem.downsample(1).unwrap().shape(), (4, 6));
    }

    #[test]
    fn test_missing_file_propagates_io_error() {
        let result = DEMProcessor::open(Path::new("/nonexistent/dsm.tif"));
        assert!(matches!(result, Err(ViewerError::Io(_))));
    }

    #[test]
    fn test_prj_sidecar_sets_crs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsm.tif");
        write_fixture(&path, &ramp(), None, false);
        fs::write(
            dir.path().join("dsm.prj"),
            r#"PROJCS["WGS 84 / UTM zone 14N",GEOGCS["WGS 84"],PROJECTION["Transverse_Mercator"]]"#,
        )
        .unwrap();

        let dem = DEMProcessor::open(&path).unwrap();
        let zone = UtmZone::new(14, Hemisphere::North).unwrap();
        assert_eq!(dem.embedded_crs(), Some(&RasterCrs::Utm(zone)));
    }

    #[test]
    fn test_resolve_crs_falls_back_to_sensor_zone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsm.tif");
        write_fixture(&path, &ramp(), None, false);

        let dem = DEMProcessor::open(&path).unwrap();
        let zone = UtmZone::new(13, Hemisphere::North).unwrap();
        assert_eq!(dem.resolve_crs(None, zone), RasterCrs::Utm(zone));
        assert_eq!(
            dem.resolve_crs(Some(&RasterCrs::Geographic), zone),
            RasterCrs::Geographic
        );
    }

    #[test]
    fn test_coverage_counts_readings_on_the_raster() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsm.tif");
        write_fixture(&path, &ramp(), None, true);
        let dem = DEMProcessor::open(&path).unwrap();
        let zone = UtmZone::new(13, Hemisphere::North).unwrap();

        let at = |easting: f64, northing: f64| {
            let (lat, lon) = utm::to_latlon(easting, northing, zone).unwrap();
            GeoReading::new(Default::default(), lat, lon)
        };
        let rows = vec![
            at(ORIGIN_X + 5.0, ORIGIN_Y - 5.0),
            at(ORIGIN_X + 55.0, ORIGIN_Y - 35.0),
            at(ORIGIN_X + 65.0, ORIGIN_Y - 5.0),
            at(ORIGIN_X - 500.0, ORIGIN_Y + 500.0),
        ];

        assert_eq!(dem.coverage(&RasterCrs::Utm(zone), &rows).unwrap(), 2);
        // Same positions read as degrees land nowhere near the footprint
        assert_eq!(dem.coverage(&RasterCrs::Geographic, &rows).unwrap(), 0);
    }

    #[test]
    fn test_coverage_through_proj_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsm.tif");
        write_fixture(&path, &ramp(), None, true);
        let dem = DEMProcessor::open(&path).unwrap();
        let zone = UtmZone::new(13, Hemisphere::North).unwrap();

        let (lat, lon) = utm::to_latlon(ORIGIN_X + 25.0, ORIGIN_Y - 15.0, zone).unwrap();
        let rows = vec![GeoReading::new(Default::default(), lat, lon)];

        let utm_def: RasterCrs = "+proj=utm +zone=13 +datum=WGS84 +units=m +no_defs"
            .parse()
            .unwrap();
        assert_eq!(dem.coverage(&utm_def, &rows).unwrap(), 1);

        let geographic_path = dir.path().join("dsm_deg.tif");
        write_fixture_at(&geographic_path, (-104.0, 20.0), 0.01, &ramp(), None, false);
        let geographic = DEMProcessor::open(&geographic_path).unwrap();
        let inside = vec![GeoReading::new(Default::default(), 19.985, -103.975)];

        let longlat: RasterCrs = "+proj=longlat +datum=WGS84 +no_defs".parse().unwrap();
        assert_eq!(geographic.coverage(&longlat, &inside).unwrap(), 1);
        assert_eq!(geographic.coverage(&RasterCrs::Geographic, &inside).unwrap(), 1);
    }

    #[test]
    fn test_band_one_reads_first_sample_for_both_layouts() {
        let chunky = DecodingResult::U16(vec![1, 100, 2, 200, 3, 300]);
        assert_eq!(
            band_one(chunky, SampleLayout::Chunky { samples: 2 }),
            vec![1.0, 2.0, 3.0]
        );

        let planar = DecodingResult::U16(vec![1, 2, 3, 100, 200, 300]);
        assert_eq!(
            band_one(planar, SampleLayout::Planar { pixels: 3 }),
            vec![1.0, 2.0, 3.0]
        );

        let single = DecodingResult::F32(vec![4.5, 5.5]);
        assert_eq!(band_one(single, SampleLayout::Chunky { samples: 1 }), vec![4.5, 5.5]);
    }

    #[test]
    fn test_wkt_transverse_mercator_parameters() {
        let utm_like = r#"PROJCS["Custom",PROJECTION["Transverse_Mercator"],
            PARAMETER["latitude_of_origin",0],PARAMETER["central_meridian",-105],
            PARAMETER["scale_factor",0.9996],PARAMETER["false_easting",500000],
            PARAMETER["false_northing",0],UNIT["metre",1]]"#;
        let zone = UtmZone::new(13, Hemisphere::North).unwrap();
        assert_eq!(RasterCrs::from_wkt(utm_like), Some(RasterCrs::Utm(zone)));

        let local = r#"PROJCS["Mine grid",PROJECTION["Transverse_Mercator"],
            PARAMETER["latitude_of_origin",0],PARAMETER["central_meridian",-104.5],
            PARAMETER["scale_factor",1],PARAMETER["false_easting",250000],
            PARAMETER["false_northing",0]]"#;
        match RasterCrs::from_wkt(local) {
            Some(RasterCrs::Proj(def)) => {
                assert!(def.starts_with("+proj=tmerc"));
                assert!(def.contains("+lon_0=-104.5"));
                assert!(def.contains("+x_0=250000"));
            }
            other => panic!("unexpected CRS {:?}", other),
        }
    }

    #[test]
    fn test_crs_from_str() {
        assert_eq!("geographic".parse::<RasterCrs>().unwrap(), RasterCrs::Geographic);
        let zone = UtmZone::new(13, Hemisphere::North).unwrap();
        assert_eq!("utm:13N".parse::<RasterCrs>().unwrap(), RasterCrs::Utm(zone));
        assert_eq!("EPSG:32613".parse::<RasterCrs>().unwrap(), RasterCrs::Utm(zone));
        assert!("mercator".parse::<RasterCrs>().is_err());
    }

    #[test]
    fn test_geo_key_directory_skips_indirect_values() {
        let directory = [1, 1, 0, 2, 1024, 0, 1, 1, 3072, 34736, 1, 0];
        let keys = parse_geo_key_directory(&directory);
        assert_eq!(keys.get(&1024), Some(&1));
        assert_eq!(keys.get(&3072), None);
    }
}
