use crate::model::{CacheKey, SetupId};
use thiserror::Error;

/// Failures of the backing container.
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid attributes: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Dataset {0} does not exist")]
    MissingDataset(String),

    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),

    #[error("Invalid dataset attributes: {0}")]
    InvalidAttributes(String),

    #[error("Invalid block header in {path}: {reason}")]
    InvalidBlockHeader { path: String, reason: String },

    #[error("Decompression failed: {0}")]
    Decompression(String),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to open container at {path}: {source}")]
    ContainerOpen { path: String, source: ContainerError },

    #[error("Failed to read block {key}: {source}")]
    BlockRead { key: CacheKey, source: ContainerError },

    #[error("Grid position {grid_position:?} out of range for grid {grid_dimensions:?}")]
    OutOfRange {
        grid_position: Vec<u64>,
        grid_dimensions: Vec<u64>,
    },

    #[error("Position {position:?} outside of image {dimensions:?}")]
    OutOfBounds { position: Vec<u64>, dimensions: Vec<u64> },

    #[error("Unknown setup {0}")]
    UnknownSetup(SetupId),

    #[error("Setup {setup} has no resolution level {level}")]
    UnknownLevel { setup: SetupId, level: u32 },

    #[error("Cell {0} failed to load")]
    CellFailed(CacheKey),

    #[error("Cache session is closed")]
    Closed,
}
