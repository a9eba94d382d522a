use crate::error::{CacheError, ContainerError};
use itertools::Itertools;

/// Offset and actual size of one cell in voxel space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellExtent {
    pub offset: Vec<u64>,
    pub size: Vec<u32>,
}
impl CellExtent {
    pub fn num_elements(&self) -> usize {
        self.size.iter().map(|&s| s as usize).product()
    }
}

/// Partition of an image of `dimensions` into cells of `cell_dimensions`.
/// Cells at the far end of an axis may be smaller than nominal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellGrid {
    dimensions: Vec<u64>,
    cell_dimensions: Vec<u32>,
    grid_dimensions: Vec<u64>,
}
impl CellGrid {
    /// Panics on a rank mismatch or an empty cell dimension, see [`CellGrid::try_new`].
    pub fn new(dimensions: &[u64], cell_dimensions: &[u32]) -> Self {
        match Self::try_new(dimensions, cell_dimensions) {
            Ok(grid) => grid,
            Err(e) => panic!("{}", e),
        }
    }

    pub fn try_new(dimensions: &[u64], cell_dimensions: &[u32]) -> Result<Self, ContainerError> {
        if dimensions.len() != cell_dimensions.len() {
            return Err(ContainerError::InvalidAttributes(format!(
                "dimensions {:?} and block size {:?} differ in rank",
                dimensions, cell_dimensions
            )));
        }
        if cell_dimensions.contains(&0) {
            return Err(ContainerError::InvalidAttributes(format!(
                "empty block size {:?}",
                cell_dimensions
            )));
        }
        let grid_dimensions = dimensions
            .iter()
            .zip(cell_dimensions)
            .map(|(&d, &c)| (d + c as u64 - 1) / c as u64)
            .collect();
        Ok(Self {
            dimensions: dimensions.to_vec(),
            cell_dimensions: cell_dimensions.to_vec(),
            grid_dimensions,
        })
    }

    pub fn num_dimensions(&self) -> usize {
        self.dimensions.len()
    }
    pub fn image_dimensions(&self) -> &[u64] {
        &self.dimensions
    }
    pub fn cell_dimensions(&self) -> &[u32] {
        &self.cell_dimensions
    }
    pub fn grid_dimensions(&self) -> &[u64] {
        &self.grid_dimensions
    }
    pub fn num_cells(&self) -> u64 {
        self.grid_dimensions.iter().product()
    }
    /// Number of elements of a nominal (full size) cell.
    pub fn cell_num_elements(&self) -> usize {
        self.cell_dimensions.iter().map(|&c| c as usize).product()
    }

    pub fn contains_grid_position(&self, grid_position: &[u64]) -> bool {
        grid_position.len() == self.grid_dimensions.len()
            && grid_position.iter().zip(&self.grid_dimensions).all(|(&g, &n)| g < n)
    }

    pub fn contains(&self, position: &[u64]) -> bool {
        position.len() == self.dimensions.len() && position.iter().zip(&self.dimensions).all(|(&p, &n)| p < n)
    }

    /// Voxel offset and actual size of the cell at `grid_position`.
    pub fn cell_extent(&self, grid_position: &[u64]) -> Result<CellExtent, CacheError> {
        if !self.contains_grid_position(grid_position) {
            return Err(CacheError::OutOfRange {
                grid_position: grid_position.to_vec(),
                grid_dimensions: self.grid_dimensions.clone(),
            });
        }
        let offset: Vec<u64> = grid_position
            .iter()
            .zip(&self.cell_dimensions)
            .map(|(&g, &c)| g * c as u64)
            .collect();
        let size = offset
            .iter()
            .zip(&self.dimensions)
            .zip(&self.cell_dimensions)
            .map(|((&o, &d), &c)| (c as u64).min(d - o) as u32)
            .collect();
        Ok(CellExtent { offset, size })
    }

    /// Grid position of the cell containing the voxel at `position`.
    pub fn grid_position_of(&self, position: &[u64]) -> Vec<u64> {
        position
            .iter()
            .zip(&self.cell_dimensions)
            .map(|(&p, &c)| p / c as u64)
            .collect()
    }

    /// Flat index (axis 0 fastest) of `position` inside its nominal-size cell.
    pub fn index_in_cell(&self, position: &[u64]) -> usize {
        let mut index = 0;
        let mut stride = 1;
        for (&p, &c) in position.iter().zip(&self.cell_dimensions) {
            index += (p % c as u64) as usize * stride;
            stride *= c as usize;
        }
        index
    }

    /// Flattened cell index (axis 0 fastest) of a grid position.
    pub fn cell_index(&self, grid_position: &[u64]) -> Result<u64, CacheError> {
        if !self.contains_grid_position(grid_position) {
            return Err(CacheError::OutOfRange {
                grid_position: grid_position.to_vec(),
                grid_dimensions: self.grid_dimensions.clone(),
            });
        }
        Ok(grid_position
            .iter()
            .zip(&self.grid_dimensions)
            .rev()
            .fold(0, |acc, (&g, &n)| acc * n + g))
    }

    /// Inverse of [`CellGrid::cell_index`].
    pub fn grid_position(&self, cell_index: u64) -> Result<Vec<u64>, CacheError> {
        if cell_index >= self.num_cells() {
            return Err(CacheError::OutOfRange {
                grid_position: vec![cell_index],
                grid_dimensions: self.grid_dimensions.clone(),
            });
        }
        let mut rest = cell_index;
        Ok(self
            .grid_dimensions
            .iter()
            .map(|&n| {
                let g = rest % n;
                rest /= n;
                g
            })
            .collect())
    }

    /// All grid positions, axis 0 fastest.
    pub fn grid_positions(&self) -> impl Iterator<Item = Vec<u64>> + '_ {
        self.grid_dimensions
            .iter()
            .rev()
            .map(|&n| 0..n)
            .multi_cartesian_product()
            .map(|mut p| {
                p.reverse();
                p
            })
    }
}
