#![warn(clippy::all, rust_2018_idioms)]

pub mod cache;
pub mod cell;
pub mod config;
pub mod error;
pub mod image;
pub mod loader;
pub mod model;
pub mod n5;
pub mod transform;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheStats, CacheStore};
pub use cell::{CellGrid, TypedBuffer, Value};
pub use config::CacheConfig;
pub use error::{CacheError, ContainerError};
pub use image::{CellAccess, CellImage};
pub use loader::{CacheControl, ImageLoader, SessionState, SetupLoader};
pub use model::{CacheKey, LoadingStrategy, TileStatus, Volatile};
pub use n5::{BlockSource, DataType, N5Reader, SourceDescription};
