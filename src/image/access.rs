use super::CellImage;
use crate::cell::{Cell, Value};
use crate::error::CacheError;
use crate::model::Volatile;
use std::sync::Arc;

/// Random access cursor into a [`CellImage`].
///
/// Remembers the last loaded cell, so runs of lookups inside one cell skip the cache.
/// The cell is dropped once the cache is cleared or closed.
pub struct CellAccess<'a> {
    image: &'a CellImage,
    last: Option<(Vec<u64>, Arc<Cell>)>,
}

impl<'a> CellAccess<'a> {
    pub(super) fn new(image: &'a CellImage) -> Self {
        Self { image, last: None }
    }

    pub fn image(&self) -> &'a CellImage {
        self.image
    }

    pub fn try_get(&mut self, position: &[u64]) -> Result<Volatile<Value>, CacheError> {
        let Some(grid) = self.image.grid() else {
            return self.image.try_get(position);
        };
        if !grid.contains(position) {
            return Err(CacheError::OutOfBounds {
                position: position.to_vec(),
                dimensions: grid.image_dimensions().to_vec(),
            });
        }
        let grid_position = grid.grid_position_of(position);
        let index = grid.index_in_cell(position);
        let image = self.image;
        if self.last.as_ref().is_some_and(|(_, cell)| !image.is_current(cell)) {
            self.last = None;
        }
        if let Some((last_position, cell)) = &self.last {
            if *last_position == grid_position {
                return Ok(Volatile::valid(cell.data.get(index)));
            }
        }
        match self.image.cell(&grid_position)? {
            Some(cell) => {
                let value = cell.data.get(index);
                self.last = Some((grid_position, cell));
                Ok(Volatile::valid(value))
            }
            None => Ok(self.image.placeholder(position)),
        }
    }

    /// Panics if `position` lies outside the image.
    pub fn get(&mut self, position: &[u64]) -> Volatile<Value> {
        match self.try_get(position) {
            Ok(value) => value,
            Err(CacheError::OutOfBounds { position, dimensions }) => {
                panic!("Position {:?} outside of image {:?}", position, dimensions)
            }
            Err(_) => self.image.fill(),
        }
    }

    /// Forgets the remembered cell.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
