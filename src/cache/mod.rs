mod fetcher;
mod queue;

pub use fetcher::FetcherPool;
pub use queue::FetchQueues;

use crate::cell::{Cell, CellLoader};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::model::{CacheKey, TileStatus};
use dashmap::DashMap;
use fxhash::FxBuildHasher;
use log::{debug, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Debug)]
enum CellState {
    Unrequested,
    /// Exactly one task for this slot is queued.
    Pending,
    /// A fetcher claimed the task and is reading.
    Loading,
    Loaded(Arc<Cell>),
    Failed,
    /// Detached from the map by a clear. Look the key up again.
    Invalidated,
}

struct CellSlot {
    state: Mutex<CellState>,
    changed: Condvar,
}
impl CellSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(CellState::Unrequested),
            changed: Condvar::new(),
        }
    }
    fn lock(&self) -> MutexGuard<'_, CellState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
    fn set(&self, state: &mut CellState, new_state: CellState) {
        *state = new_state;
        self.changed.notify_all();
    }
}

struct FetchTask {
    key: CacheKey,
    slot: Arc<CellSlot>,
    loader: Arc<dyn CellLoader>,
    generation: u64,
}

/// Counters over the lifetime of a [`CacheStore`].
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub enqueued: AtomicU64,
    pub rejected: AtomicU64,
    pub promoted: AtomicU64,
    pub loaded: AtomicU64,
    pub failed: AtomicU64,
    pub absent: AtomicU64,
}
impl CacheStats {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
    /// Queued fetches moved ahead because a blocking caller waits for them.
    pub fn promoted(&self) -> u64 {
        self.promoted.load(Ordering::Relaxed)
    }
    pub fn loaded(&self) -> u64 {
        self.loaded.load(Ordering::Relaxed)
    }
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
    pub fn absent(&self) -> u64 {
        self.absent.load(Ordering::Relaxed)
    }
}

/// Maps cache keys to cell states and owns the fetch queues and the fetcher pool.
///
/// All state transitions of a cell happen under its slot lock, and only the caller that
/// moves a cell out of `Unrequested` (or `Failed`) enqueues a fetch for it.
pub struct CacheStore {
    cells: DashMap<CacheKey, Arc<CellSlot>, FxBuildHasher>,
    queues: Arc<FetchQueues<FetchTask>>,
    fetchers: Mutex<Option<FetcherPool<FetchTask>>>,
    generation: AtomicU64,
    stats: Arc<CacheStats>,
}

impl CacheStore {
    pub fn new(num_priorities: usize, config: &CacheConfig, repaint: Option<Sender<()>>) -> Self {
        let queues = Arc::new(FetchQueues::new(
            num_priorities,
            config.max_queued_tasks,
            config.prefetch_capacity,
        ));
        let stats = Arc::new(CacheStats::default());
        let fetchers = {
            let stats = stats.clone();
            FetcherPool::start(
                config.fetcher_threads(),
                queues.clone(),
                move |task| run_task(task, &stats),
                repaint,
            )
        };
        debug!(
            "Cache store with {} priorities and {} fetchers",
            queues.num_priorities(),
            fetchers.num_threads()
        );
        Self {
            cells: DashMap::with_hasher(FxBuildHasher::default()),
            queues,
            fetchers: Mutex::new(Some(fetchers)),
            generation: AtomicU64::new(0),
            stats,
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn num_priorities(&self) -> usize {
        self.queues.num_priorities()
    }

    pub fn queued_tasks(&self) -> usize {
        self.queues.len()
    }

    pub fn is_closed(&self) -> bool {
        self.queues.is_shutdown()
    }

    fn slot(&self, key: &CacheKey) -> Arc<CellSlot> {
        if let Some(slot) = self.cells.get(key) {
            return slot.clone();
        }
        self.cells
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CellSlot::new()))
            .clone()
    }

    fn check_range(key: &CacheKey, loader: &dyn CellLoader) -> Result<(), CacheError> {
        let grid = loader.grid();
        if grid.contains_grid_position(&key.grid_position) {
            Ok(())
        } else {
            Err(CacheError::OutOfRange {
                grid_position: key.grid_position.to_vec(),
                grid_dimensions: grid.grid_dimensions().to_vec(),
            })
        }
    }

    /// Moves `state` to `Pending` and queues a fetch. Called with the slot lock held.
    /// On rejection the state is left as it was.
    fn enqueue(
        &self,
        slot: &Arc<CellSlot>,
        state: &mut CellState,
        key: &CacheKey,
        loader: &Arc<dyn CellLoader>,
        priority: usize,
        to_front: bool,
    ) -> bool {
        let task = FetchTask {
            key: key.clone(),
            slot: slot.clone(),
            loader: loader.clone(),
            generation: self.generation(),
        };
        if self.queues.put(task, priority, to_front) {
            CacheStats::inc(&self.stats.enqueued);
            *state = CellState::Pending;
            true
        } else {
            CacheStats::inc(&self.stats.rejected);
            false
        }
    }

    /// Non-blocking access. Returns the cell if it is loaded, otherwise makes sure
    /// a fetch is queued and returns `None`.
    pub fn get_budgeted(
        &self,
        key: &CacheKey,
        loader: &Arc<dyn CellLoader>,
        priority: usize,
    ) -> Result<Option<Arc<Cell>>, CacheError> {
        Self::check_range(key, loader.as_ref())?;
        if self.is_closed() {
            return Err(CacheError::Closed);
        }
        loop {
            let slot = self.slot(key);
            let mut state = slot.lock();
            match &*state {
                CellState::Loaded(cell) => {
                    CacheStats::inc(&self.stats.hits);
                    return Ok(Some(cell.clone()));
                }
                CellState::Pending | CellState::Loading => return Ok(None),
                CellState::Invalidated => continue,
                CellState::Unrequested | CellState::Failed => {
                    CacheStats::inc(&self.stats.misses);
                    self.enqueue(&slot, &mut state, key, loader, priority, false);
                    return Ok(None);
                }
            }
        }
    }

    /// Blocks until the cell is loaded. A cell found `Failed` is retried once;
    /// if that read fails too, [`CacheError::CellFailed`] is returned.
    ///
    /// The fetch always runs ahead of all budgeted work: a new one goes into the urgent
    /// lane and one already queued by a budgeted request is moved there.
    pub fn get_blocking(&self, key: &CacheKey, loader: &Arc<dyn CellLoader>) -> Result<Arc<Cell>, CacheError> {
        Self::check_range(key, loader.as_ref())?;
        if self.is_closed() {
            return Err(CacheError::Closed);
        }
        let mut requested = false;
        loop {
            let slot = self.slot(key);
            let mut promoted = false;
            let mut state = slot.lock();
            loop {
                match &*state {
                    CellState::Loaded(cell) => {
                        if !requested {
                            CacheStats::inc(&self.stats.hits);
                        }
                        return Ok(cell.clone());
                    }
                    CellState::Failed if requested => return Err(CacheError::CellFailed(key.clone())),
                    CellState::Invalidated => break,
                    CellState::Pending if !requested && !promoted => {
                        if self.queues.promote(|task| Arc::ptr_eq(&task.slot, &slot)) {
                            CacheStats::inc(&self.stats.promoted);
                        }
                        promoted = true;
                    }
                    CellState::Pending | CellState::Loading => {}
                    CellState::Unrequested | CellState::Failed => {
                        CacheStats::inc(&self.stats.misses);
                        if !self.enqueue(&slot, &mut state, key, loader, usize::MAX, true) {
                            return Err(CacheError::Closed);
                        }
                        requested = true;
                    }
                }
                state = slot.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
            drop(state);
            if self.is_closed() {
                return Err(CacheError::Closed);
            }
        }
    }

    /// Returns the cell if it is loaded, without requesting it.
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<Cell>> {
        let slot = self.cells.get(key)?.clone();
        let state = slot.lock();
        match &*state {
            CellState::Loaded(cell) => Some(cell.clone()),
            _ => None,
        }
    }

    pub fn status(&self, key: &CacheKey) -> TileStatus {
        let Some(slot) = self.cells.get(key).map(|s| s.clone()) else {
            return TileStatus::Unrequested;
        };
        let state = slot.lock();
        match &*state {
            CellState::Unrequested | CellState::Invalidated => TileStatus::Unrequested,
            CellState::Pending | CellState::Loading => TileStatus::Pending,
            CellState::Loaded(cell) if cell.absent => TileStatus::Absent,
            CellState::Loaded(_) => TileStatus::Loaded,
            CellState::Failed => TileStatus::Failed,
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Moves all queued fetches behind the ones requested from now on.
    pub fn prepare_next_frame(&self) {
        let dropped = self.queues.clear_to_prefetch();
        if !dropped.is_empty() {
            debug!("Dropping {} prefetch tasks", dropped.len());
        }
        for task in dropped {
            let mut state = task.slot.lock();
            if matches!(*state, CellState::Pending) {
                task.slot.set(&mut state, CellState::Unrequested);
            }
        }
    }

    /// Drops all cells and queued fetches and starts a new generation.
    /// Fetches in flight complete but their results are discarded.
    pub fn invalidate_all(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let dropped = self.queues.clear();
        self.cells.retain(|_, slot| {
            let mut state = slot.lock();
            slot.set(&mut state, CellState::Invalidated);
            false
        });
        debug!(
            "Invalidated cache, generation {}, dropped {} queued fetches",
            generation,
            dropped.len()
        );
    }

    /// Stops the fetchers (letting running reads finish) and drops all cells.
    /// Blocked callers return [`CacheError::Closed`].
    pub fn close(&self) {
        let fetchers = self
            .fetchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut fetchers) = fetchers {
            fetchers.shutdown();
        }
        self.invalidate_all();
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_task(task: FetchTask, stats: &CacheStats) -> bool {
    let FetchTask {
        key,
        slot,
        loader,
        generation,
    } = task;
    {
        let mut state = slot.lock();
        if !matches!(*state, CellState::Pending) {
            return false;
        }
        *state = CellState::Loading;
    }

    let result = catch_unwind(AssertUnwindSafe(|| loader.load(&key.grid_position)));

    let mut state = slot.lock();
    if !matches!(*state, CellState::Loading) {
        debug!("Discarding {} from generation {}", key, generation);
        return false;
    }
    match result {
        Ok(Ok(mut cell)) => {
            cell.generation = generation;
            if cell.absent {
                CacheStats::inc(&stats.absent);
            }
            CacheStats::inc(&stats.loaded);
            slot.set(&mut state, CellState::Loaded(Arc::new(cell)));
            true
        }
        Ok(Err(e)) => {
            warn!("{}", CacheError::BlockRead { key, source: e });
            CacheStats::inc(&stats.failed);
            slot.set(&mut state, CellState::Failed);
            true
        }
        Err(_) => {
            warn!("Loading {} panicked", key);
            CacheStats::inc(&stats.failed);
            slot.set(&mut state, CellState::Failed);
            true
        }
    }
}
