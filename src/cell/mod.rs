mod buffer;
mod grid;
mod loader;

pub use buffer::{nd_array_copy, Element, TypedBuffer, Value};
pub use grid::{CellExtent, CellGrid};
pub use loader::{CellLoader, N5CellLoader};

/// A loaded cell. Always sized to the nominal cell dimensions of its level.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub data: TypedBuffer,
    pub dimensions: Vec<u32>,
    /// The container had no block here and `data` is all fill value.
    pub absent: bool,
    /// Cache generation the cell was loaded in.
    pub generation: u64,
}
impl Cell {
    pub fn new(data: TypedBuffer, dimensions: &[u32], absent: bool) -> Self {
        Self {
            data,
            dimensions: dimensions.to_vec(),
            absent,
            generation: 0,
        }
    }
}
