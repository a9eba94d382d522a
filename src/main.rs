#![warn(clippy::all, rust_2018_idioms)]

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ParallelProgressIterator, ProgressStyle};
use log::warn;
use n5_cellcache::{CacheConfig, ImageLoader, N5Reader, TypedBuffer};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "n5-cellcache")]
#[command(about = "Inspect and export multi-resolution N5 containers", long_about = None)]
struct Cli {
    /// Path to the N5 container
    container: PathBuf,

    /// Number of fetcher threads
    #[arg(short, long)]
    threads: Option<usize>,

    /// Cache configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show setups, timepoints and resolution levels
    Info,

    /// Write one resolution level as raw little-endian voxels (x fastest)
    Export {
        #[arg(short, long, default_value_t = 0)]
        setup: u32,

        #[arg(short, long, default_value_t = 0)]
        timepoint: u32,

        #[arg(short, long, default_value_t = 0)]
        level: u32,

        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init(); // Log to stderr (if you run with `RUST_LOG=debug`).

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => CacheConfig::from_json_file(path)?,
        None => CacheConfig::default(),
    };
    if cli.threads.is_some() {
        config.num_fetcher_threads = cli.threads;
    }

    match cli.command {
        Commands::Info => info(&cli.container, config),
        Commands::Export {
            setup,
            timepoint,
            level,
            output,
        } => export(&cli.container, config, setup, timepoint, level, &output),
    }
}

fn info(container: &Path, config: CacheConfig) -> Result<()> {
    let reader = N5Reader::open(container).with_context(|| format!("Failed to open {}", container.display()))?;
    let loader = ImageLoader::n5(container, config);
    for setup in loader.setup_ids()? {
        let setup_loader = loader.setup_loader(setup)?;
        println!("setup {} ({:?})", setup, setup_loader.data_type());
        for timepoint in reader.list_timepoints(setup)? {
            println!("  timepoint {}", timepoint);
            for (level, factors) in setup_loader.mipmap_resolutions().iter().enumerate() {
                let level = level as u32;
                match (
                    setup_loader.image_size(timepoint, level),
                    setup_loader.cell_dimensions(timepoint, level),
                ) {
                    (Some(size), Some(cells)) => {
                        println!("    s{} {:?} dimensions {:?} blocks {:?}", level, factors, size, cells)
                    }
                    _ => println!("    s{} {:?} unavailable", level, factors),
                }
            }
        }
    }
    loader.close();
    Ok(())
}

fn export(
    container: &Path,
    config: CacheConfig,
    setup: u32,
    timepoint: u32,
    level: u32,
    output: &Path,
) -> Result<()> {
    let loader = ImageLoader::n5(container, config);
    let setup_loader = loader.setup_loader(setup)?;
    let image = setup_loader.image(timepoint, level)?;
    if image.is_constant() {
        bail!("Level s{} of setup {} at timepoint {} cannot be read", level, setup, timepoint);
    }
    let grid = image.grid().ok_or_else(|| anyhow!("No cell grid"))?.clone();

    let style = ProgressStyle::with_template("[{elapsed_precise}] {bar:80.cyan/blue} {pos}/{len} ({eta}) {msg}")?;
    let positions: Vec<Vec<u64>> = grid.grid_positions().collect();
    let cells = positions
        .into_par_iter()
        .progress_with_style(style)
        .with_message("Loading cells")
        .map(|g| -> Result<_> {
            let extent = grid.cell_extent(&g)?;
            let cell = image.cell(&g)?;
            if cell.is_none() {
                warn!("Cell {:?} failed to load, writing fill value", g);
            }
            Ok((extent, cell))
        })
        .collect::<Result<Vec<_>>>()?;

    let dimensions: Vec<usize> = grid.image_dimensions().iter().map(|&d| d as usize).collect();
    let cell_dimensions: Vec<usize> = grid.cell_dimensions().iter().map(|&c| c as usize).collect();
    let mut volume = TypedBuffer::filled(image.data_type(), dimensions.iter().product(), loader.config().fill_value);
    let origin = vec![0; dimensions.len()];
    for (extent, cell) in cells.iter() {
        let Some(cell) = cell else { continue };
        let offset: Vec<usize> = extent.offset.iter().map(|&o| o as usize).collect();
        let size: Vec<usize> = extent.size.iter().map(|&s| s as usize).collect();
        volume.copy_region_from(&cell.data, &cell_dimensions, &origin, &dimensions, &offset, &size);
    }

    std::fs::write(output, volume.to_le_bytes()).with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "Wrote {:?} {:?} voxels to {}",
        image.data_type(),
        grid.image_dimensions(),
        output.display()
    );
    loader.close();
    Ok(())
}
