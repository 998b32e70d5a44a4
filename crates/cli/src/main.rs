//! Terraflow CLI - out-of-core DEM routing

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use terraflow_routing::{
    delineate_watersheds, distance_to_channel_d8, distance_to_channel_mfd, fill_pits,
    flow_accumulation_d8, flow_accumulation_mfd, flow_dir_d8, flow_dir_mfd,
};

#[derive(Parser)]
#[command(name = "terraflow")]
#[command(author, version, about = "Hydrological routing for large DEMs", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory for scratch files (system temp when omitted)
    #[arg(long, global = true)]
    working_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fill undrained depressions in a DEM
    FillPits {
        /// Input DEM file
        dem: PathBuf,
        /// Output filled DEM
        output: PathBuf,
        /// Band of the input DEM
        #[arg(short, long, default_value = "1")]
        band: usize,
    },
    /// Compute D8 flow direction from a filled DEM
    FlowDirD8 {
        /// Input filled DEM
        dem: PathBuf,
        /// Output flow direction raster (uint8, nodata 128)
        output: PathBuf,
        #[arg(short, long, default_value = "1")]
        band: usize,
    },
    /// Compute MFD flow direction from a filled DEM
    FlowDirMfd {
        /// Input filled DEM
        dem: PathBuf,
        /// Output flow direction raster (int32 packed weights)
        output: PathBuf,
        #[arg(short, long, default_value = "1")]
        band: usize,
    },
    /// Accumulate upstream flow over a D8 flow direction raster
    FlowAccumulationD8 {
        /// Input D8 flow direction raster
        flow_dir: PathBuf,
        /// Output accumulation raster (float64, nodata -1)
        output: PathBuf,
        #[arg(short, long, default_value = "1")]
        band: usize,
        /// Optional per-pixel weight raster
        #[arg(short, long)]
        weight: Option<PathBuf>,
        #[arg(long, default_value = "1")]
        weight_band: usize,
    },
    /// Accumulate upstream flow over an MFD flow direction raster
    FlowAccumulationMfd {
        /// Input MFD flow direction raster
        flow_dir: PathBuf,
        /// Output accumulation raster (float64, nodata -1)
        output: PathBuf,
        #[arg(short, long, default_value = "1")]
        band: usize,
        /// Optional per-pixel weight raster
        #[arg(short, long)]
        weight: Option<PathBuf>,
        #[arg(long, default_value = "1")]
        weight_band: usize,
    },
    /// Distance along D8 flow paths to the nearest channel pixel
    DistanceToChannelD8 {
        /// Input D8 flow direction raster
        flow_dir: PathBuf,
        /// Channel mask raster (1 = channel)
        channel: PathBuf,
        /// Output distance raster (float64, nodata -1)
        output: PathBuf,
        #[arg(short, long, default_value = "1")]
        band: usize,
        #[arg(long, default_value = "1")]
        channel_band: usize,
        /// Optional per-pixel cost raster
        #[arg(short, long)]
        weight: Option<PathBuf>,
        #[arg(long, default_value = "1")]
        weight_band: usize,
    },
    /// Distance along MFD flow paths to the nearest channel pixel
    DistanceToChannelMfd {
        /// Input MFD flow direction raster
        flow_dir: PathBuf,
        /// Channel mask raster (1 = channel)
        channel: PathBuf,
        /// Output distance raster (float64, nodata -1)
        output: PathBuf,
        #[arg(short, long, default_value = "1")]
        band: usize,
        #[arg(long, default_value = "1")]
        channel_band: usize,
        /// Optional per-pixel cost raster
        #[arg(short, long)]
        weight: Option<PathBuf>,
        #[arg(long, default_value = "1")]
        weight_band: usize,
    },
    /// Delineate watershed fragments upstream of outflow points
    DelineateWatersheds {
        /// Input D8 flow direction raster
        flow_dir: PathBuf,
        /// Outflow point vector (any OGR-readable point layer)
        outflows: PathBuf,
        /// Output fragment polygons (GeoPackage)
        output: PathBuf,
        #[arg(short, long, default_value = "1")]
        band: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting tracing subscriber failed")?;

    let started = Instant::now();
    let working_dir = cli.working_dir.as_deref();

    match &cli.command {
        Commands::FillPits { dem, output, band } => {
            fill_pits((dem.as_path(), *band), output, working_dir)
                .with_context(|| format!("filling pits of {}", dem.display()))?;
        }
        Commands::FlowDirD8 { dem, output, band } => {
            flow_dir_d8((dem.as_path(), *band), output, working_dir)
                .with_context(|| format!("computing D8 flow direction of {}", dem.display()))?;
        }
        Commands::FlowDirMfd { dem, output, band } => {
            flow_dir_mfd((dem.as_path(), *band), output, working_dir)
                .with_context(|| format!("computing MFD flow direction of {}", dem.display()))?;
        }
        Commands::FlowAccumulationD8 {
            flow_dir,
            output,
            band,
            weight,
            weight_band,
        } => {
            let weight = weight.as_deref().map(|path| (path, *weight_band));
            flow_accumulation_d8((flow_dir.as_path(), *band), output, weight)
                .with_context(|| format!("accumulating flow of {}", flow_dir.display()))?;
        }
        Commands::FlowAccumulationMfd {
            flow_dir,
            output,
            band,
            weight,
            weight_band,
        } => {
            let weight = weight.as_deref().map(|path| (path, *weight_band));
            flow_accumulation_mfd((flow_dir.as_path(), *band), output, weight)
                .with_context(|| format!("accumulating flow of {}", flow_dir.display()))?;
        }
        Commands::DistanceToChannelD8 {
            flow_dir,
            channel,
            output,
            band,
            channel_band,
            weight,
            weight_band,
        } => {
            let weight = weight.as_deref().map(|path| (path, *weight_band));
            distance_to_channel_d8(
                (flow_dir.as_path(), *band),
                (channel.as_path(), *channel_band),
                output,
                weight,
            )
            .with_context(|| format!("computing distances over {}", flow_dir.display()))?;
        }
        Commands::DistanceToChannelMfd {
            flow_dir,
            channel,
            output,
            band,
            channel_band,
            weight,
            weight_band,
        } => {
            let weight = weight.as_deref().map(|path| (path, *weight_band));
            distance_to_channel_mfd(
                (flow_dir.as_path(), *band),
                (channel.as_path(), *channel_band),
                output,
                weight,
            )
            .with_context(|| format!("computing distances over {}", flow_dir.display()))?;
        }
        Commands::DelineateWatersheds {
            flow_dir,
            outflows,
            output,
            band,
        } => {
            delineate_watersheds((flow_dir.as_path(), *band), outflows, output, working_dir)
                .with_context(|| format!("delineating watersheds of {}", flow_dir.display()))?;
        }
    }

    info!("done in {:.2?}", started.elapsed());
    Ok(())
}
