use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

use derelict::commands;
use derelict::config::DetectionConfig;
use derelict::engine::AnalysisError;

#[derive(Parser)]
#[command(
    name = "derelict",
    about = "Abandoned-vehicle detection from multi-year aerial orthophotos",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compare two years of imagery over a window and update the store
    Analyze {
        /// Center latitude (WGS84); requires --lon
        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,
        /// Center longitude (WGS84); requires --lat
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,
        /// Free-form address, geocoded when --lat/--lon are absent
        #[arg(long, conflicts_with_all = ["lat", "lon"])]
        address: Option<String>,
        /// Capture year of the older imagery source
        #[arg(long)]
        year1: i32,
        /// Capture year of the newer imagery source
        #[arg(long)]
        year2: i32,
        /// Web-Mercator zoom level (default 17)
        #[arg(long)]
        zoom: Option<u8>,
        /// Tile radius; stitches a (2r+1)^2 block (default 1)
        #[arg(long)]
        radius: Option<u32>,
        /// Per-run similarity threshold override
        #[arg(long)]
        threshold: Option<f64>,
        /// Human-readable label stored in the analysis log
        #[arg(long)]
        region_label: Option<String>,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        district: Option<String>,
    },
    /// On-disk tile cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    /// Inspect and manage vehicle records
    Vehicles {
        #[command(subcommand)]
        command: VehiclesCommand,
    },
    /// CCTV registry lookups
    Cctv {
        #[command(subcommand)]
        command: CctvCommand,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Request/hit counters and on-disk footprint
    Stats,
    /// Remove entries older than the TTL
    Cleanup,
    /// Remove every entry
    Clear,
}

#[derive(Subcommand)]
enum VehiclesCommand {
    /// List records, optionally filtered
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        risk: Option<String>,
        #[arg(long)]
        city: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        /// Emit JSON instead of the table
        #[arg(long)]
        json: bool,
    },
    /// Move a record through the review state machine
    UpdateStatus {
        vehicle_id: String,
        /// DETECTED, INVESTIGATING, VERIFIED, RESOLVED or FALSE_POSITIVE
        status: String,
        #[arg(long)]
        note: Option<String>,
    },
}

#[derive(Subcommand)]
enum CctvCommand {
    /// k-nearest registered cameras to a point
    Nearest {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        #[arg(short, default_value_t = 5)]
        k: usize,
    },
}

const EXIT_INVALID_ARGS: u8 = 1;
const EXIT_UPSTREAM: u8 = 2;
const EXIT_STORE: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version are normal exits, not argument errors.
            let is_error = e.use_stderr();
            let _ = e.print();
            return if is_error {
                ExitCode::from(EXIT_INVALID_ARGS)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config = match DetectionConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(EXIT_INVALID_ARGS);
        }
    };

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

async fn run(cli: Cli, config: DetectionConfig) -> Result<(), u8> {
    match cli.command {
        Command::Analyze {
            lat,
            lon,
            address,
            year1,
            year2,
            zoom,
            radius,
            threshold,
            region_label,
            city,
            district,
        } => commands::handle_analyze(
            config,
            lat,
            lon,
            address,
            year1,
            year2,
            zoom,
            radius,
            threshold,
            region_label,
            city,
            district,
        )
        .await
        .map_err(|e| {
            error!("analysis failed: {e}");
            match e {
                AnalysisError::Input(_) => EXIT_INVALID_ARGS,
                AnalysisError::Upstream(_) | AnalysisError::Timeout(_) => EXIT_UPSTREAM,
                AnalysisError::Cancelled => EXIT_UPSTREAM,
                AnalysisError::Store(_) | AnalysisError::Internal(_) => EXIT_STORE,
            }
        }),
        Command::Cache { command } => {
            let result = match command {
                CacheCommand::Stats => commands::handle_cache_stats(&config).await,
                CacheCommand::Cleanup => commands::handle_cache_cleanup(&config).await,
                CacheCommand::Clear => commands::handle_cache_clear(&config).await,
            };
            result.map_err(|e| {
                error!("cache command failed: {e}");
                EXIT_STORE
            })
        }
        Command::Vehicles { command } => {
            let result = match command {
                VehiclesCommand::List {
                    status,
                    risk,
                    city,
                    limit,
                    json,
                } => commands::handle_vehicles_list(status, risk, city, limit, json).await,
                VehiclesCommand::UpdateStatus {
                    vehicle_id,
                    status,
                    note,
                } => commands::handle_vehicles_update_status(vehicle_id, status, note).await,
            };
            result.map_err(|e| {
                error!("vehicles command failed: {e}");
                EXIT_STORE
            })
        }
        Command::Cctv { command } => match command {
            CctvCommand::Nearest { lat, lon, k } => {
                commands::handle_cctv_nearest(&config, lat, lon, k)
                    .await
                    .map_err(|e| {
                        error!("cctv command failed: {e}");
                        EXIT_INVALID_ARGS
                    })
            }
        },
    }
}
