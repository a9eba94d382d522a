use super::{Cell, CellGrid, TypedBuffer};
use crate::error::ContainerError;
use crate::n5::{BlockSource, DataType, DatasetAttributes};
use log::debug;
use std::sync::Arc;

/// Loads the cells of one resolution level of one setup at one timepoint.
pub trait CellLoader: Send + Sync {
    fn grid(&self) -> &CellGrid;
    fn data_type(&self) -> DataType;
    fn fill_value(&self) -> f64;
    fn load(&self, grid_position: &[u64]) -> Result<Cell, ContainerError>;
}

/// Reads cells from a dataset of a [`BlockSource`], padding ragged blocks to the nominal cell size.
pub struct N5CellLoader {
    source: Arc<dyn BlockSource>,
    path_name: String,
    attributes: DatasetAttributes,
    grid: CellGrid,
    fill_value: f64,
}
impl N5CellLoader {
    /// Fails if the attributes do not describe a valid grid.
    pub fn new(
        source: Arc<dyn BlockSource>,
        path_name: String,
        attributes: DatasetAttributes,
        fill_value: f64,
    ) -> Result<Self, ContainerError> {
        let grid = CellGrid::try_new(&attributes.dimensions, &attributes.block_size)?;
        Ok(Self {
            source,
            path_name,
            attributes,
            grid,
            fill_value,
        })
    }

    pub fn path_name(&self) -> &str {
        &self.path_name
    }
}

impl CellLoader for N5CellLoader {
    fn grid(&self) -> &CellGrid {
        &self.grid
    }

    fn data_type(&self) -> DataType {
        self.attributes.data_type
    }

    fn fill_value(&self) -> f64 {
        self.fill_value
    }

    fn load(&self, grid_position: &[u64]) -> Result<Cell, ContainerError> {
        let cell_dims = self.grid.cell_dimensions();
        let nominal = self.grid.cell_num_elements();
        let data_type = self.attributes.data_type;

        let block = self
            .source
            .read_block(&self.path_name, &self.attributes, grid_position)?;
        let Some(block) = block else {
            debug!("{} {:?} is absent, using fill value", self.path_name, grid_position);
            return Ok(Cell::new(
                TypedBuffer::filled(data_type, nominal, self.fill_value),
                cell_dims,
                true,
            ));
        };

        if block.data.data_type() != data_type {
            return Err(ContainerError::InvalidBlockHeader {
                path: self.path_name.clone(),
                reason: format!(
                    "block holds {:?}, dataset is {:?}",
                    block.data.data_type(),
                    data_type
                ),
            });
        }

        if block.size == cell_dims && block.data.len() == nominal {
            return Ok(Cell::new(block.data, cell_dims, false));
        }

        let mut data = TypedBuffer::filled(data_type, nominal, self.fill_value);
        let src_dims: Vec<usize> = block.size.iter().map(|&s| s as usize).collect();
        let dest_dims: Vec<usize> = cell_dims.iter().map(|&c| c as usize).collect();
        let size: Vec<usize> = src_dims.iter().zip(&dest_dims).map(|(&s, &d)| s.min(d)).collect();
        let origin = vec![0; size.len()];
        data.copy_region_from(&block.data, &src_dims, &origin, &dest_dims, &origin, &size);
        Ok(Cell::new(data, cell_dims, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::n5::{Compression, N5Reader};
    use crate::testing::{write_attributes, write_block, MemorySource};

    #[test]
    fn ragged_block_is_padded() {
        let dir = tempfile::tempdir().unwrap();
        let attributes = DatasetAttributes::new(&[10, 10, 14], &[10, 10, 10], DataType::Uint16, Compression::named("gzip"));
        write_attributes(dir.path(), "s0", &attributes);
        let block: Vec<u16> = (1..=400).collect();
        write_block(dir.path(), "s0", &attributes, &[0, 0, 1], &[10, 10, 4], &TypedBuffer::Uint16(block.clone()));

        let reader: Arc<dyn BlockSource> = Arc::new(N5Reader::open(dir.path()).unwrap());
        let loader = N5CellLoader::new(reader, "s0".to_string(), attributes, 0.0).unwrap();
        let cell = loader.load(&[0, 0, 1]).unwrap();
        assert!(!cell.absent);
        assert_eq!(cell.dimensions, vec![10, 10, 10]);

        let data = cell.data.as_slice::<u16>().unwrap();
        assert_eq!(data.len(), 1000);
        assert_eq!(&data[..400], &block[..]);
        assert!(data[400..].iter().all(|&v| v == 0));
    }

    #[test]
    fn absent_block_is_filled() {
        let mut source = MemorySource::new();
        let attributes = DatasetAttributes::new(&[4, 4], &[2, 2], DataType::Float32, Compression::raw());
        source.add_dataset("s0", attributes.clone());
        let loader = N5CellLoader::new(Arc::new(source), "s0".to_string(), attributes, 3.5).unwrap();

        let cell = loader.load(&[1, 1]).unwrap();
        assert!(cell.absent);
        assert_eq!(cell.data, TypedBuffer::Float32(vec![3.5; 4]));
    }

    #[test]
    fn full_block_is_used_as_is() {
        let mut source = MemorySource::new();
        let attributes = DatasetAttributes::new(&[4, 2], &[2, 2], DataType::Int8, Compression::raw());
        source.add_block("s0", &[0, 0], &[2, 2], TypedBuffer::Int8(vec![1, -2, 3, -4]));
        source.add_dataset("s0", attributes.clone());
        let loader = N5CellLoader::new(Arc::new(source), "s0".to_string(), attributes, 0.0).unwrap();

        assert_eq!(loader.load(&[0, 0]).unwrap().data, TypedBuffer::Int8(vec![1, -2, 3, -4]));
    }

    #[test]
    fn read_errors_propagate() {
        let mut source = MemorySource::new();
        let attributes = DatasetAttributes::new(&[4], &[2], DataType::Uint8, Compression::raw());
        source.add_dataset("s0", attributes.clone());
        let source = Arc::new(source);
        source.fail("s0", &[0]);
        let loader = N5CellLoader::new(source, "s0".to_string(), attributes, 0.0).unwrap();
        assert!(loader.load(&[0]).is_err());
    }

    #[test]
    fn malformed_attributes_fail() {
        let attributes = DatasetAttributes::new(&[4, 4, 4], &[4, 4], DataType::Uint8, Compression::raw());
        let source: Arc<dyn BlockSource> = Arc::new(MemorySource::new());
        assert!(N5CellLoader::new(source, "s0".to_string(), attributes, 0.0).is_err());
    }
}
