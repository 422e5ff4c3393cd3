use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sensor_terrain_viewer::format::format_speed;
use sensor_terrain_viewer::{
    build_figure, georeference, render, DEMProcessor, FilterCriteria, RasterCrs, SensorQuery,
    SpeedStats, SqlServerStore, UtmZone, ViewerConfig,
};

#[derive(Parser)]
#[command(name = "sensor-terrain-viewer")]
#[command(about = "3D view of sensor speed readings over a GeoTIFF terrain model", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "SENSORVIEW_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch readings, build the terrain view and open it (default)
    Render(RenderArgs),

    /// Print GeoTIFF metadata as JSON
    DemInfo {
        /// GeoTIFF file
        path: PathBuf,
    },
}

#[derive(Args, Default)]
struct RenderArgs {
    /// GeoTIFF elevation model
    #[arg(long)]
    dem: Option<PathBuf>,

    /// Block size for average downsampling of the raster
    #[arg(long)]
    scale_factor: Option<usize>,

    /// Maximum number of readings to fetch
    #[arg(long)]
    limit: Option<u32>,

    /// UTM zone of the readings, e.g. 13N
    #[arg(long, value_parser = parse_zone)]
    zone: Option<UtmZone>,

    /// Raster CRS override: geographic, utm:13N, epsg:32613 or +proj=...
    #[arg(long)]
    raster_crs: Option<String>,

    /// Discard readings faster than this (km/h)
    #[arg(long)]
    max_speed: Option<f64>,

    /// Where to write the HTML page
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write the page without opening a browser
    #[arg(long)]
    no_open: bool,
}

impl Cli {
    /// `render` runs when no subcommand is given
    fn command_or_default(self) -> Commands {
        self.command
            .unwrap_or_else(|| Commands::Render(RenderArgs::default()))
    }
}

impl RenderArgs {
    fn apply(self, config: &mut ViewerConfig) {
        if let Some(dem) = self.dem {
            config.terrain.path = Some(dem);
        }
        if let Some(scale_factor) = self.scale_factor {
            config.terrain.scale_factor = scale_factor;
        }
        if let Some(limit) = self.limit {
            config.database.limit = limit;
        }
        if let Some(zone) = self.zone {
            config.projection.utm_zone = zone.number();
            config.projection.hemisphere = zone.hemisphere();
        }
        if let Some(crs) = self.raster_crs {
            config.terrain.crs = Some(crs);
        }
        if let Some(max_speed) = self.max_speed {
            config.filter.max_speed_kmh = max_speed;
        }
        if let Some(output) = self.output {
            config.render.output = Some(output);
        }
        if self.no_open {
            config.render.open_browser = false;
        }
    }
}

fn parse_zone(s: &str) -> std::result::Result<UtmZone, String> {
    s.parse::<UtmZone>().map_err(|e| e.to_string())
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "sensor_terrain_viewer=debug,info"
    } else {
        "sensor_terrain_viewer=info,warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli.config.clone();
    match cli.command_or_default() {
        Commands::Render(args) => {
            let mut config =
                ViewerConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
            args.apply(&mut config);
            config.validate().context("Invalid configuration")?;
            run_render(config).await
        }
        Commands::DemInfo { path } => {
            let dem = DEMProcessor::open(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&dem.info())?);
            Ok(())
        }
    }
}

async fn run_render(config: ViewerConfig) -> Result<()> {
    let zone = config.projection.zone()?;
    let dem_path = match config.terrain.path.clone() {
        Some(path) => path,
        None => bail!("No GeoTIFF given; pass --dem or set terrain.path"),
    };
    let raster_crs = config
        .terrain
        .crs
        .as_deref()
        .map(str::parse::<RasterCrs>)
        .transpose()
        .context("Invalid terrain.crs")?;

    // Fetch
    info!("Starting SQL query");
    let query = SensorQuery::new(&config.database.table, config.database.limit)?;
    let mut store = SqlServerStore::connect(&config.database)
        .await
        .context("Failed to connect to SQL Server")?;
    let readings = store.fetch(&query).await.context("Sensor query failed")?;
    info!(rows = readings.len(), "SQL query completed");

    // Transform + filter
    let georeferenced = georeference(readings, zone);
    let criteria = FilterCriteria::from_config(&config.filter);
    let (rows, report) = criteria.apply(georeferenced.rows);
    info!(
        kept = report.kept,
        outside_window = report.outside_window,
        incomplete = report.incomplete,
        too_fast = report.too_fast,
        "Readings filtered"
    );
    match SpeedStats::from_rows(&rows) {
        Some(stats) => info!(
            min = %format_speed(stats.min),
            mean = %format_speed(stats.mean),
            max = %format_speed(stats.max),
            alarms = stats.alarms,
            "Speed summary"
        ),
        None => warn!("No readings survived filtering; the plot will only show terrain"),
    }

    // Raster
    let dem = DEMProcessor::open(&dem_path)
        .with_context(|| format!("Failed to read {}", dem_path.display()))?;
    let grid = dem
        .downsample(config.terrain.scale_factor)
        .context("Failed to downsample terrain")?;
    let crs = dem.resolve_crs(raster_crs.as_ref(), zone);
    let covered = dem.coverage(&crs, &rows).context("Failed to locate readings on terrain")?;
    if covered < rows.len() {
        warn!(
            covered,
            total = rows.len(),
            crs = %crs,
            "Some readings fall outside the terrain footprint"
        );
    }
    let grid = grid
        .to_geographic(&crs)
        .context("Failed to reproject terrain")?;
    match grid.elevation_range() {
        Some((lo, hi)) => info!(min = lo, max = hi, "Elevation range"),
        None => warn!("Terrain grid has no valid elevation cells"),
    }

    // Render
    info!("Building 3D figure");
    let figure = build_figure(&grid, &rows, &config.render);
    let output = config
        .render
        .output
        .clone()
        .unwrap_or_else(render::default_output_path);
    render::write_html(&figure, &output, &config.render.plotly_src)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    if config.render.open_browser {
        render::open_in_browser(&output).context("Failed to open browser")?;
    } else {
        println!("{}", output.display());
    }

    Ok(())
}
