use std::fmt;

pub type SetupId = u32;
pub type TimepointId = u32;

/// Identifies one cell (tile) of one resolution level of one setup at one timepoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub setup: SetupId,
    pub timepoint: TimepointId,
    pub level: u32,
    pub grid_position: Box<[u64]>,
}
impl CacheKey {
    pub fn new(setup: SetupId, timepoint: TimepointId, level: u32, grid_position: &[u64]) -> Self {
        Self {
            setup,
            timepoint,
            level,
            grid_position: grid_position.into(),
        }
    }
}
impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "setup {} t{} s{} {:?}",
            self.setup, self.timepoint, self.level, &self.grid_position
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadingStrategy {
    /// Never blocks. Missing cells are enqueued and a placeholder is returned.
    Budgeted,
    /// Waits until the cell is loaded (or failed).
    Blocking,
}

/// A value together with the information whether it comes from fully loaded data.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Volatile<T> {
    pub value: T,
    pub valid: bool,
}
impl<T> Volatile<T> {
    pub fn valid(value: T) -> Self {
        Self { value, valid: true }
    }
    pub fn invalid(value: T) -> Self {
        Self { value, valid: false }
    }
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Volatile<U> {
        Volatile {
            value: f(self.value),
            valid: self.valid,
        }
    }
}

/// Externally visible state of a single cell.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TileStatus {
    Unrequested,
    Pending,
    Loaded,
    /// Loaded, but the container had no block at that position.
    Absent,
    Failed,
}
