mod access;

pub use access::CellAccess;

use crate::cache::CacheStore;
use crate::cell::{Cell, CellGrid, CellLoader, Value};
use crate::error::CacheError;
use crate::model::{CacheKey, LoadingStrategy, SetupId, TileStatus, TimepointId, Volatile};
use crate::n5::DataType;
use crate::transform::AffineTransform;
use std::sync::Arc;

/// A coarser level that may stand in for missing cells of a volatile image.
pub(crate) struct CoarserLevel {
    pub level: u32,
    pub loader: Arc<dyn CellLoader>,
    /// Maps voxel coordinates of the image level into this level.
    pub from_image: AffineTransform,
}

enum Backing {
    Cached {
        store: Arc<CacheStore>,
        loader: Arc<dyn CellLoader>,
        priority: usize,
        coarser: Vec<CoarserLevel>,
    },
    /// Used when the level could not be opened.
    Constant { dimensions: Vec<u64>, value: Value },
}

/// Cache backed view of one resolution level of one setup at one timepoint.
pub struct CellImage {
    setup: SetupId,
    timepoint: TimepointId,
    level: u32,
    strategy: LoadingStrategy,
    backing: Backing,
}

impl CellImage {
    pub(crate) fn cached(
        key: (SetupId, TimepointId, u32),
        strategy: LoadingStrategy,
        store: Arc<CacheStore>,
        loader: Arc<dyn CellLoader>,
        priority: usize,
        coarser: Vec<CoarserLevel>,
    ) -> Self {
        let (setup, timepoint, level) = key;
        Self {
            setup,
            timepoint,
            level,
            strategy,
            backing: Backing::Cached {
                store,
                loader,
                priority,
                coarser,
            },
        }
    }

    pub(crate) fn constant(
        key: (SetupId, TimepointId, u32),
        strategy: LoadingStrategy,
        num_dimensions: usize,
        data_type: DataType,
        fill_value: f64,
    ) -> Self {
        let (setup, timepoint, level) = key;
        Self {
            setup,
            timepoint,
            level,
            strategy,
            backing: Backing::Constant {
                dimensions: vec![1; num_dimensions],
                value: Value::fill(data_type, fill_value),
            },
        }
    }

    pub fn setup(&self) -> SetupId {
        self.setup
    }
    pub fn timepoint(&self) -> TimepointId {
        self.timepoint
    }
    pub fn level(&self) -> u32 {
        self.level
    }
    pub fn strategy(&self) -> LoadingStrategy {
        self.strategy
    }

    /// `true` for the degenerate single voxel image of a level that failed to open.
    pub fn is_constant(&self) -> bool {
        matches!(self.backing, Backing::Constant { .. })
    }

    pub fn dimensions(&self) -> &[u64] {
        match &self.backing {
            Backing::Cached { loader, .. } => loader.grid().image_dimensions(),
            Backing::Constant { dimensions, .. } => dimensions,
        }
    }

    pub fn grid(&self) -> Option<&CellGrid> {
        match &self.backing {
            Backing::Cached { loader, .. } => Some(loader.grid()),
            Backing::Constant { .. } => None,
        }
    }

    pub fn data_type(&self) -> DataType {
        match &self.backing {
            Backing::Cached { loader, .. } => loader.data_type(),
            Backing::Constant { value, .. } => value.data_type(),
        }
    }

    pub fn access(&self) -> CellAccess<'_> {
        CellAccess::new(self)
    }

    fn key(&self, grid_position: &[u64]) -> CacheKey {
        CacheKey::new(self.setup, self.timepoint, self.level, grid_position)
    }

    pub fn tile_status(&self, grid_position: &[u64]) -> TileStatus {
        match &self.backing {
            Backing::Cached { store, .. } => store.status(&self.key(grid_position)),
            Backing::Constant { .. } => TileStatus::Failed,
        }
    }

    /// The cell at `grid_position` under this image's strategy. `None` means not loaded
    /// yet (budgeted) or failed (blocking).
    pub fn cell(&self, grid_position: &[u64]) -> Result<Option<Arc<Cell>>, CacheError> {
        let Backing::Cached {
            store,
            loader,
            priority,
            ..
        } = &self.backing
        else {
            return Ok(None);
        };
        let key = self.key(grid_position);
        match self.strategy {
            LoadingStrategy::Budgeted => store.get_budgeted(&key, loader, *priority),
            LoadingStrategy::Blocking => match store.get_blocking(&key, loader) {
                Ok(cell) => Ok(Some(cell)),
                Err(CacheError::CellFailed(_)) => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    /// Whether `cell` still belongs to the live cache, i.e. no clear or close happened
    /// since it was loaded.
    pub(crate) fn is_current(&self, cell: &Cell) -> bool {
        match &self.backing {
            Backing::Cached { store, .. } => !store.is_closed() && cell.generation == store.generation(),
            Backing::Constant { .. } => false,
        }
    }

    fn check_bounds(&self, position: &[u64]) -> Result<(), CacheError> {
        let dimensions = self.dimensions();
        if position.len() == dimensions.len() && position.iter().zip(dimensions).all(|(p, d)| p < d) {
            Ok(())
        } else {
            Err(CacheError::OutOfBounds {
                position: position.to_vec(),
                dimensions: dimensions.to_vec(),
            })
        }
    }

    /// Voxel value at `position`. Voxels of cells that are not loaded come from the
    /// nearest loaded coarser level (budgeted only) or the fill value, flagged invalid.
    pub fn try_get(&self, position: &[u64]) -> Result<Volatile<Value>, CacheError> {
        self.check_bounds(position)?;
        let Backing::Cached { loader, .. } = &self.backing else {
            return Ok(self.fill());
        };
        let grid = loader.grid();
        match self.cell(&grid.grid_position_of(position))? {
            Some(cell) => Ok(Volatile::valid(cell.data.get(grid.index_in_cell(position)))),
            None => Ok(self.placeholder(position)),
        }
    }

    /// Like [`CellImage::try_get`], but panics if `position` lies outside the image.
    /// Other errors (a closed session) yield an invalid fill value.
    pub fn get(&self, position: &[u64]) -> Volatile<Value> {
        match self.try_get(position) {
            Ok(value) => value,
            Err(CacheError::OutOfBounds { position, dimensions }) => {
                panic!("Position {:?} outside of image {:?}", position, dimensions)
            }
            Err(_) => self.fill(),
        }
    }

    pub(crate) fn fill(&self) -> Volatile<Value> {
        match &self.backing {
            Backing::Cached { loader, .. } => Volatile::invalid(Value::fill(loader.data_type(), loader.fill_value())),
            Backing::Constant { value, .. } => Volatile::invalid(*value),
        }
    }

    /// Best value currently available without loading anything.
    pub(crate) fn placeholder(&self, position: &[u64]) -> Volatile<Value> {
        let Backing::Cached { store, coarser, .. } = &self.backing else {
            return self.fill();
        };
        if self.strategy == LoadingStrategy::Budgeted {
            for coarse in coarser {
                let grid = coarse.loader.grid();
                let coarse_position = map_position(position, &coarse.from_image, grid.image_dimensions());
                let key = CacheKey::new(
                    self.setup,
                    self.timepoint,
                    coarse.level,
                    &grid.grid_position_of(&coarse_position),
                );
                if let Some(cell) = store.peek(&key) {
                    return Volatile::invalid(cell.data.get(grid.index_in_cell(&coarse_position)));
                }
            }
        }
        self.fill()
    }
}

/// Maps the first three axes of `position` with `transform`, rounding to the nearest voxel
/// and clamping to `dimensions`. Further axes are only clamped.
fn map_position(position: &[u64], transform: &AffineTransform, dimensions: &[u64]) -> Vec<u64> {
    let mut point = [0.0; 3];
    for (p, &x) in point.iter_mut().zip(position) {
        *p = x as f64;
    }
    let mapped = transform.apply(point);
    position
        .iter()
        .zip(dimensions)
        .enumerate()
        .map(|(d, (&x, &max))| {
            let x = if d < 3 { mapped[d].round().max(0.0) as u64 } else { x };
            x.min(max.saturating_sub(1))
        })
        .collect()
}
