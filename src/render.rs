use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RenderConfig;
use crate::error::Result;
use crate::format::{format_elevation, format_speed, format_time};
use crate::readings::GeoReading;
use crate::terrain::TerrainGrid;

pub const SCATTER_NAME: &str = "Puntos de velocidad";
pub const SPEED_COLORBAR_TITLE: &str = "Velocidad (km/h)";

/// A plotly.js figure: `{"data": [...], "layout": {...}}`
#[derive(Debug, Clone, Serialize)]
pub struct Figure {
    pub data: Vec<Trace>,
    pub layout: Layout,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Trace {
    Surface(SurfaceTrace),
    Scatter3d(Scatter3dTrace),
}

#[derive(Debug, Clone, Serialize)]
pub struct SurfaceTrace {
    /// Row-major elevations; `null` marks nodata cells
    pub z: Vec<Vec<Option<f32>>>,
    pub x: Vec<Vec<f64>>,
    pub y: Vec<Vec<f64>>,
    pub colorscale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmin: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmax: Option<f32>,
    pub opacity: f64,
    pub showscale: bool,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Scatter3dTrace {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub mode: String,
    pub marker: Marker,
    pub name: String,
    pub text: Vec<String>,
    pub hoverinfo: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Marker {
    pub size: f64,
    pub color: Vec<f64>,
    pub colorscale: String,
    pub cmin: f64,
    pub cmax: f64,
    pub opacity: f64,
    pub colorbar: ColorBar,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColorBar {
    pub title: Title,
}

#[derive(Debug, Clone, Serialize)]
pub struct Title {
    pub text: String,
}

impl Title {
    fn new(text: &str) -> Self {
        Title {
            text: text.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Layout {
    pub title: Title,
    pub scene: Scene,
    pub width: u32,
    pub height: u32,
    pub margin: Margin,
}

#[derive(Debug, Clone, Serialize)]
pub struct Scene {
    pub xaxis: Axis,
    pub yaxis: Axis,
    pub zaxis: Axis,
    pub aspectratio: AspectRatio,
}

#[derive(Debug, Clone, Serialize)]
pub struct Axis {
    pub title: Title,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<[f32; 2]>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AspectRatio {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Margin {
    pub l: u32,
    pub r: u32,
    pub b: u32,
    pub t: u32,
}

fn surface_trace(grid: &TerrainGrid, range: Option<(f32, f32)>, config: &RenderConfig) -> SurfaceTrace {
    let z = grid
        .elevation()
        .rows()
        .into_iter()
        .map(|row| row.iter().map(|v| v.is_finite().then_some(*v)).collect())
        .collect();
    let to_rows = |a: &ndarray::Array2<f64>| -> Vec<Vec<f64>> {
        a.rows().into_iter().map(|row| row.to_vec()).collect()
    };

    SurfaceTrace {
        z,
        x: to_rows(grid.x()),
        y: to_rows(grid.y()),
        colorscale: "Viridis".to_string(),
        cmin: range.map(|r| r.0),
        cmax: range.map(|r| r.1),
        opacity: config.surface_opacity,
        showscale: false,
        name: "Terreno".to_string(),
    }
}

fn hover_text(row: &GeoReading) -> String {
    let r = &row.reading;
    format!(
        "{}<br>{}<br>Velocidad: {}<br>Elevación: {}<br>Alarma: {}",
        r.full_name.as_deref().unwrap_or("-"),
        format_time(r.time.as_ref()),
        r.speed.map(format_speed).unwrap_or_else(|| "-".to_string()),
        r.elevation.map(format_elevation).unwrap_or_else(|| "-".to_string()),
        r.alarm.as_deref().unwrap_or("-"),
    )
}

fn scatter_trace(rows: &[GeoReading], config: &RenderConfig) -> Scatter3dTrace {
    Scatter3dTrace {
        x: rows.iter().map(|r| r.longitude).collect(),
        y: rows.iter().map(|r| r.latitude).collect(),
        z: rows.iter().map(|r| r.reading.elevation.unwrap_or(f64::NAN)).collect(),
        mode: "markers".to_string(),
        marker: Marker {
            size: config.marker_size,
            color: rows.iter().map(|r| r.reading.speed.unwrap_or(f64::NAN)).collect(),
            colorscale: "Reds".to_string(),
            cmin: 0.0,
            cmax: config.speed_cmax,
            opacity: config.marker_opacity,
            colorbar: ColorBar {
                title: Title::new(SPEED_COLORBAR_TITLE),
            },
        },
        name: SCATTER_NAME.to_string(),
        text: rows.iter().map(hover_text).collect(),
        hoverinfo: "text".to_string(),
    }
}

/// Terrain surface plus speed-coloured reading markers.
///
/// `grid` must already be in longitude/latitude so both traces share axes.
pub fn build_figure(grid: &TerrainGrid, rows: &[GeoReading], config: &RenderConfig) -> Figure {
    let range = grid.elevation_range();

    Figure {
        data: vec![
            Trace::Surface(surface_trace(grid, range, config)),
            Trace::Scatter3d(scatter_trace(rows, config)),
        ],
        layout: Layout {
            title: Title::new(&config.title),
            scene: Scene {
                xaxis: Axis {
                    title: Title::new("Longitud"),
                    range: None,
                },
                yaxis: Axis {
                    title: Title::new("Latitud"),
                    range: None,
                },
                zaxis: Axis {
                    title: Title::new("Elevación"),
                    range: range.map(|(lo, hi)| [lo, hi]),
                },
                aspectratio: AspectRatio { x: 1.0, y: 1.0, z: 0.5 },
            },
            width: config.width,
            height: config.height,
            margin: Margin { l: 0, r: 0, b: 0, t: 50 },
        },
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn is_remote(src: &str) -> bool {
    ["http://", "https://", "//"].iter().any(|p| src.starts_with(p))
}

/// Script element for plotly.js: a `src` reference for URLs, or the file
/// contents inlined for a local path so the page works offline.
fn plotly_script(plotly_src: &str) -> Result<String> {
    if is_remote(plotly_src) {
        return Ok(format!(r#"<script src="{}"></script>"#, escape_html(plotly_src)));
    }

    debug!(path = plotly_src, "Inlining plotly.js");
    let source = fs::read_to_string(plotly_src)?;
    Ok(format!(
        "<script>\n{}\n</script>",
        source.replace("</script", "<\\/script")
    ))
}

/// Page that draws the inlined figure with plotly.js, either loaded from
/// a URL or inlined from a local copy.
pub fn to_html(figure: &Figure, plotly_src: &str) -> Result<String> {
    // "</" inside a string literal would close the script element
    let json = serde_json::to_string(figure)?.replace("</", "<\\/");

    Ok(format!(
        r#"<!DOCTYPE html>
<html lang="es">
<head>
<meta charset="utf-8">
<title>{title}</title>
{plotly}
</head>
<body style="margin:0">
<div id="figure"></div>
<script>
const figure = {json};
Plotly.newPlot("figure", figure.data, figure.layout);
</script>
</body>
</html>
"#,
        title = escape_html(&figure.layout.title.text),
        plotly = plotly_script(plotly_src)?,
        json = json,
    ))
}

pub fn write_html(figure: &Figure, path: &Path, plotly_src: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, to_html(figure, plotly_src)?)?;
    info!(path = %path.display(), "Visualization written");
    Ok(())
}

/// Fresh file in the system temp directory
pub fn default_output_path() -> PathBuf {
    std::env::temp_dir().join(format!("sensor-terrain-{}.html", Uuid::new_v4()))
}

pub fn open_in_browser(path: &Path) -> Result<()> {
    info!(path = %path.display(), "Opening visualization in the browser");
    webbrowser::open(&path.to_string_lossy())?;
    Ok(())
}
