use crate::cache::{CacheStats, CacheStore};
use crate::cell::{CellLoader, N5CellLoader};
use crate::config::CacheConfig;
use crate::error::{CacheError, ContainerError};
use crate::image::{CellImage, CoarserLevel};
use crate::model::{LoadingStrategy, SetupId, TimepointId};
use crate::n5::{path_name, BlockSource, DataType, N5Reader, SourceDescription};
use crate::transform::AffineTransform;
use dashmap::DashMap;
use fxhash::{FxBuildHasher, FxHashMap};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

type Opener = dyn Fn() -> Result<(Arc<dyn BlockSource>, Vec<SourceDescription>), ContainerError> + Send + Sync;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Closed = 0,
    Opening = 1,
    Open = 2,
    Closing = 3,
}
impl SessionState {
    fn from_u8(state: u8) -> Self {
        match state {
            1 => SessionState::Opening,
            2 => SessionState::Open,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

struct Session {
    store: Arc<CacheStore>,
    setups: FxHashMap<SetupId, Arc<SetupLoader>>,
}

/// Entry point: opens a container lazily and hands out per setup loaders that share
/// one cache and one fetcher pool.
///
/// [`ImageLoader::close`] shuts the fetchers down and drops all cached data. Loaders and
/// images obtained before stop working; asking for new ones reopens the container.
pub struct ImageLoader {
    location: String,
    opener: Box<Opener>,
    config: CacheConfig,
    repaint: Mutex<Option<Sender<()>>>,
    state: AtomicU8,
    lifecycle: Mutex<()>,
    session: RwLock<Option<Arc<Session>>>,
}

impl ImageLoader {
    /// Loader for an N5 container on disk. Setups are discovered when the session opens.
    pub fn n5(base_path: impl Into<PathBuf>, config: CacheConfig) -> Self {
        let base_path = base_path.into();
        let location = base_path.display().to_string();
        Self::new(
            location,
            move || {
                let reader = N5Reader::open(&base_path)?;
                let sources = reader.describe_all()?;
                let reader: Arc<dyn BlockSource> = Arc::new(reader);
                Ok((reader, sources))
            },
            config,
        )
    }

    /// Loader for an already opened container and a fixed set of setups.
    pub fn with_source(source: Arc<dyn BlockSource>, sources: Vec<SourceDescription>, config: CacheConfig) -> Self {
        Self::new(source.location(), move || Ok((source.clone(), sources.clone())), config)
    }

    pub fn new<F>(location: String, opener: F, config: CacheConfig) -> Self
    where
        F: Fn() -> Result<(Arc<dyn BlockSource>, Vec<SourceDescription>), ContainerError> + Send + Sync + 'static,
    {
        Self {
            location,
            opener: Box::new(opener),
            config,
            repaint: Mutex::new(None),
            state: AtomicU8::new(SessionState::Closed as u8),
            lifecycle: Mutex::new(()),
            session: RwLock::new(None),
        }
    }

    /// Pinged by a fetcher whenever a cell was published. Takes effect on the next open.
    pub fn set_repaint(&self, repaint: Sender<()>) {
        *self.repaint.lock().unwrap_or_else(PoisonError::into_inner) = Some(repaint);
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn current(&self) -> Option<Arc<Session>> {
        if self.state() != SessionState::Open {
            return None;
        }
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn session(&self) -> Result<Arc<Session>, CacheError> {
        if let Some(session) = self.current() {
            return Ok(session);
        }
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = self.current() {
            return Ok(session);
        }

        self.state.store(SessionState::Opening as u8, Ordering::Release);
        let (source, descriptions) = match (self.opener)() {
            Ok(opened) => opened,
            Err(source) => {
                self.state.store(SessionState::Closed as u8, Ordering::Release);
                return Err(CacheError::ContainerOpen {
                    path: self.location.clone(),
                    source,
                });
            }
        };

        let num_priorities = descriptions.iter().map(|d| d.num_levels()).max().unwrap_or(1);
        let repaint = self.repaint.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let store = Arc::new(CacheStore::new(num_priorities, &self.config, repaint));
        let setups = descriptions
            .into_iter()
            .map(|description| {
                let setup = description.setup;
                let loader = SetupLoader::new(description, source.clone(), store.clone(), self.config.fill_value);
                (setup, Arc::new(loader))
            })
            .collect::<FxHashMap<_, _>>();
        info!("Opened {} with {} setups", self.location, setups.len());

        let session = Arc::new(Session { store, setups });
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        self.state.store(SessionState::Open as u8, Ordering::Release);
        Ok(session)
    }

    /// Opens the container if it is not open yet.
    pub fn open(&self) -> Result<(), CacheError> {
        self.session().map(|_| ())
    }

    pub fn setup_loader(&self, setup: SetupId) -> Result<Arc<SetupLoader>, CacheError> {
        self.session()?
            .setups
            .get(&setup)
            .cloned()
            .ok_or(CacheError::UnknownSetup(setup))
    }

    pub fn setup_ids(&self) -> Result<Vec<SetupId>, CacheError> {
        let mut ids: Vec<SetupId> = self.session()?.setups.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Control over the cache of the current session.
    pub fn cache_control(&self) -> Result<CacheControl, CacheError> {
        Ok(CacheControl {
            store: self.session()?.store.clone(),
        })
    }

    /// Stops the fetchers and drops all cached data. Does nothing if not open.
    pub fn close(&self) {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state() != SessionState::Open {
            return;
        }
        self.state.store(SessionState::Closing as u8, Ordering::Release);
        let session = self.session.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(session) = session {
            session.store.close();
            debug!("Closed {} ({} setups)", self.location, session.setups.len());
        }
        self.state.store(SessionState::Closed as u8, Ordering::Release);
    }
}

impl Drop for ImageLoader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cache operations for render loops.
#[derive(Clone)]
pub struct CacheControl {
    store: Arc<CacheStore>,
}
impl CacheControl {
    /// Call once per frame before requesting cells: pending fetches of the previous
    /// frame are served after the ones requested from now on.
    pub fn prepare_next_frame(&self) {
        self.store.prepare_next_frame();
    }

    /// Drops all cached cells and queued fetches.
    pub fn clear(&self) {
        self.store.invalidate_all();
    }

    pub fn stats(&self) -> &CacheStats {
        self.store.stats()
    }

    pub fn num_cells(&self) -> usize {
        self.store.len()
    }
}

/// Images of one setup, one per timepoint and resolution level.
pub struct SetupLoader {
    setup: SetupId,
    data_type: DataType,
    resolutions: Vec<Vec<f64>>,
    transforms: Vec<AffineTransform>,
    source: Arc<dyn BlockSource>,
    store: Arc<CacheStore>,
    fill_value: f64,
    /// `None` if the level could not be opened.
    levels: DashMap<(TimepointId, u32), Option<Arc<dyn CellLoader>>, FxBuildHasher>,
}

impl SetupLoader {
    fn new(description: SourceDescription, source: Arc<dyn BlockSource>, store: Arc<CacheStore>, fill_value: f64) -> Self {
        let transforms = description
            .downsampling_factors
            .iter()
            .map(|f| AffineTransform::mipmap_transform(f))
            .collect();
        Self {
            setup: description.setup,
            data_type: description.data_type,
            resolutions: description.downsampling_factors,
            transforms,
            source,
            store,
            fill_value,
            levels: DashMap::with_hasher(FxBuildHasher::default()),
        }
    }

    pub fn setup_id(&self) -> SetupId {
        self.setup
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn num_mipmap_levels(&self) -> usize {
        self.resolutions.len()
    }

    /// Downsampling factors of each level relative to level 0.
    pub fn mipmap_resolutions(&self) -> &[Vec<f64>] {
        &self.resolutions
    }

    /// Per level transforms from level voxel coordinates into level 0 coordinates.
    pub fn mipmap_transforms(&self) -> &[AffineTransform] {
        &self.transforms
    }

    fn level_loader(&self, timepoint: TimepointId, level: u32) -> Option<Arc<dyn CellLoader>> {
        if let Some(loader) = self.levels.get(&(timepoint, level)) {
            return loader.clone();
        }
        let path = path_name(self.setup, timepoint, level);
        let opened = self.source.dataset_attributes(&path).and_then(|attributes| {
            if attributes.data_type != self.data_type {
                warn!(
                    "{} holds {:?}, setup {} is {:?}",
                    path, attributes.data_type, self.setup, self.data_type
                );
            }
            N5CellLoader::new(self.source.clone(), path.clone(), attributes, self.fill_value)
        });
        let loader = match opened {
            Ok(loader) => Some(Arc::new(loader) as Arc<dyn CellLoader>),
            Err(e) => {
                warn!("Could not open {}: {}", path, e);
                None
            }
        };
        // a concurrent caller may have won the race, keep its loader
        self.levels.entry((timepoint, level)).or_insert(loader).clone()
    }

    fn check_level(&self, level: u32) -> Result<(), CacheError> {
        if (level as usize) < self.num_mipmap_levels() {
            Ok(())
        } else {
            Err(CacheError::UnknownLevel {
                setup: self.setup,
                level,
            })
        }
    }

    /// Dimensions of a level, `None` if its attributes cannot be read.
    pub fn image_size(&self, timepoint: TimepointId, level: u32) -> Option<Vec<u64>> {
        self.check_level(level).ok()?;
        self.level_loader(timepoint, level)
            .map(|l| l.grid().image_dimensions().to_vec())
    }

    pub fn cell_dimensions(&self, timepoint: TimepointId, level: u32) -> Option<Vec<u32>> {
        self.check_level(level).ok()?;
        self.level_loader(timepoint, level)
            .map(|l| l.grid().cell_dimensions().to_vec())
    }

    fn priority(&self, level: u32) -> usize {
        self.num_mipmap_levels().saturating_sub(1 + level as usize)
    }

    fn prepare_image(
        &self,
        timepoint: TimepointId,
        level: u32,
        strategy: LoadingStrategy,
    ) -> Result<CellImage, CacheError> {
        self.check_level(level)?;
        let key = (self.setup, timepoint, level);
        let Some(loader) = self.level_loader(timepoint, level) else {
            let num_dimensions = self.resolutions[level as usize].len().max(1);
            return Ok(CellImage::constant(
                key,
                strategy,
                num_dimensions,
                self.data_type,
                self.fill_value,
            ));
        };

        let mut coarser = vec![];
        if strategy == LoadingStrategy::Budgeted {
            for coarse_level in level + 1..self.num_mipmap_levels() as u32 {
                let Some(coarse_loader) = self.level_loader(timepoint, coarse_level) else {
                    continue;
                };
                match self.transforms[coarse_level as usize].invert() {
                    Ok(to_coarse) => coarser.push(CoarserLevel {
                        level: coarse_level,
                        loader: coarse_loader,
                        from_image: to_coarse.after(&self.transforms[level as usize]),
                    }),
                    Err(e) => debug!("No fallback to level {}: {}", coarse_level, e),
                }
            }
        }

        Ok(CellImage::cached(
            key,
            strategy,
            self.store.clone(),
            loader,
            self.priority(level),
            coarser,
        ))
    }

    /// Non-blocking image for interactive rendering.
    pub fn volatile_image(&self, timepoint: TimepointId, level: u32) -> Result<CellImage, CacheError> {
        self.prepare_image(timepoint, level, LoadingStrategy::Budgeted)
    }

    /// Image whose lookups wait until the data is loaded.
    pub fn image(&self, timepoint: TimepointId, level: u32) -> Result<CellImage, CacheError> {
        self.prepare_image(timepoint, level, LoadingStrategy::Blocking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Value;
    use crate::model::{TileStatus, Volatile};
    use crate::n5::{Compression, DatasetAttributes};
    use crate::testing::{write_volume, MemorySource};
    use std::thread;
    use std::time::{Duration, Instant};

    fn factors() -> Vec<Vec<f64>> {
        vec![vec![1.0, 1.0, 1.0], vec![2.0, 2.0, 1.0], vec![4.0, 4.0, 1.0]]
    }

    /// Levels of 16x16x4, 8x8x4 and 4x4x4 voxels in 4x4x4 blocks, every voxel of level `l` is `l + 1`.
    fn pyramid() -> Arc<MemorySource> {
        let mut source = MemorySource::new();
        source.add_constant_dataset(&path_name(0, 0, 0), &[16, 16, 4], &[4, 4, 4], 1);
        source.add_constant_dataset(&path_name(0, 0, 1), &[8, 8, 4], &[4, 4, 4], 2);
        source.add_constant_dataset(&path_name(0, 0, 2), &[4, 4, 4], &[4, 4, 4], 3);
        Arc::new(source)
    }

    fn loader(source: &Arc<MemorySource>) -> ImageLoader {
        let description = SourceDescription {
            setup: 0,
            data_type: DataType::Uint16,
            downsampling_factors: factors(),
        };
        let config = CacheConfig {
            num_fetcher_threads: Some(2),
            ..Default::default()
        };
        let source: Arc<dyn BlockSource> = source.clone();
        ImageLoader::with_source(source, vec![description], config)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(10), "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn budgeted_request_returns_fallback_then_data() {
        let source = pyramid();
        let loader = loader(&source);
        let setup = loader.setup_loader(0).unwrap();
        assert_eq!(setup.num_mipmap_levels(), 3);
        assert_eq!(setup.mipmap_resolutions()[2], vec![4.0, 4.0, 1.0]);

        let image = setup.volatile_image(0, 2).unwrap();
        source.close_gate();
        assert_eq!(image.get(&[1, 2, 3]), Volatile::invalid(Value::Uint16(0)));
        let control = loader.cache_control().unwrap();
        assert_eq!(control.stats().enqueued(), 1);
        source.open_gate();

        wait_for(|| image.tile_status(&[0, 0, 0]) == TileStatus::Loaded);
        assert_eq!(image.get(&[1, 2, 3]), Volatile::valid(Value::Uint16(3)));
        assert_eq!(control.stats().enqueued(), 1);
        assert_eq!(source.reads(), 1);
    }

    #[test]
    fn coarser_levels_stand_in_for_missing_cells() {
        let source = pyramid();
        let loader = loader(&source);
        let setup = loader.setup_loader(0).unwrap();
        assert_eq!(setup.image(0, 2).unwrap().get(&[3, 3, 0]), Volatile::valid(Value::Uint16(3)));

        source.close_gate();
        let image = setup.volatile_image(0, 0).unwrap();
        let mut access_fine = image.access();
        assert_eq!(access_fine.get(&[15, 15, 3]), Volatile::invalid(Value::Uint16(3)));
        assert_eq!(image.get(&[0, 0, 0]), Volatile::invalid(Value::Uint16(3)));
        source.open_gate();

        wait_for(|| image.tile_status(&[3, 3, 0]) == TileStatus::Loaded);
        assert_eq!(access_fine.get(&[15, 15, 3]), Volatile::valid(Value::Uint16(1)));
        assert_eq!(access_fine.get(&[12, 12, 0]), Volatile::valid(Value::Uint16(1)));
    }

    #[test]
    fn blocking_images_are_always_valid() {
        let source = pyramid();
        let loader = loader(&source);
        let setup = loader.setup_loader(0).unwrap();
        let image = setup.image(0, 1).unwrap();
        assert_eq!(image.dimensions(), &[8, 8, 4]);
        let mut access = image.access();
        for x in 0..8 {
            for y in 0..8 {
                assert_eq!(access.get(&[x, y, 2]), Volatile::valid(Value::Uint16(2)));
            }
        }
        assert_eq!(source.reads(), 4);
        assert!(matches!(
            image.try_get(&[8, 0, 0]),
            Err(CacheError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn close_and_reopen() {
        let source = pyramid();
        let loader = loader(&source);
        let setup = loader.setup_loader(0).unwrap();
        let image = setup.image(0, 2).unwrap();
        image.get(&[0, 0, 0]);
        assert_eq!(loader.state(), SessionState::Open);

        loader.close();
        assert_eq!(loader.state(), SessionState::Closed);
        assert!(matches!(image.try_get(&[0, 0, 0]), Err(CacheError::Closed)));

        let setup = loader.setup_loader(0).unwrap();
        assert_eq!(loader.state(), SessionState::Open);
        let control = loader.cache_control().unwrap();
        assert_eq!(control.num_cells(), 0);
        assert_eq!(setup.image(0, 2).unwrap().get(&[0, 0, 0]), Volatile::valid(Value::Uint16(3)));
        assert_eq!(control.stats().enqueued(), 1);
        assert_eq!(source.reads(), 2);
    }

    #[test]
    fn clear_keeps_the_session_alive() {
        let source = pyramid();
        let loader = loader(&source);
        let setup = loader.setup_loader(0).unwrap();
        let image = setup.image(0, 2).unwrap();
        image.get(&[0, 0, 0]);
        let control = loader.cache_control().unwrap();
        assert_eq!(control.num_cells(), 1);

        control.clear();
        assert_eq!(control.num_cells(), 0);
        assert_eq!(image.get(&[0, 0, 0]), Volatile::valid(Value::Uint16(3)));
        assert_eq!(source.reads(), 2);
        control.prepare_next_frame();
    }

    #[test]
    fn missing_levels_degrade_to_a_constant_image() {
        let source = pyramid();
        let loader = loader(&source);
        let setup = loader.setup_loader(0).unwrap();

        assert_eq!(setup.image_size(0, 1), Some(vec![8, 8, 4]));
        assert_eq!(setup.cell_dimensions(0, 1), Some(vec![4, 4, 4]));
        assert_eq!(setup.image_size(1, 0), None);
        assert_eq!(setup.image_size(0, 3), None);

        let image = setup.image(1, 0).unwrap();
        assert!(image.is_constant());
        assert_eq!(image.dimensions(), &[1, 1, 1]);
        assert_eq!(image.get(&[0, 0, 0]), Volatile::invalid(Value::Uint16(0)));
        assert!(matches!(setup.image(0, 3), Err(CacheError::UnknownLevel { level: 3, .. })));
    }

    #[test]
    fn malformed_level_attributes_degrade_to_a_constant_image() {
        let mut source = MemorySource::new();
        source.add_dataset(
            &path_name(0, 0, 0),
            DatasetAttributes::new(&[4, 4, 4], &[4, 4], DataType::Uint16, Compression::raw()),
        );
        let description = SourceDescription {
            setup: 0,
            data_type: DataType::Uint16,
            downsampling_factors: vec![vec![1.0, 1.0, 1.0]],
        };
        let source: Arc<dyn BlockSource> = Arc::new(source);
        let loader = ImageLoader::with_source(source, vec![description], CacheConfig::default());
        let setup = loader.setup_loader(0).unwrap();

        let image = setup.volatile_image(0, 0).unwrap();
        assert!(image.is_constant());
        assert_eq!(image.get(&[0, 0, 0]), Volatile::invalid(Value::Uint16(0)));
        assert!(setup.image(0, 0).unwrap().is_constant());
        assert_eq!(setup.image_size(0, 0), None);
    }

    #[test]
    fn level_loaders_are_opened_once() {
        let source = pyramid();
        let loader = loader(&source);
        let setup = loader.setup_loader(0).unwrap();

        let first = setup.level_loader(0, 1).unwrap();
        let levels: Vec<_> = (0..4)
            .map(|_| {
                let setup = setup.clone();
                thread::spawn(move || setup.level_loader(0, 1).unwrap())
            })
            .collect();
        for level in levels {
            assert!(Arc::ptr_eq(&first, &level.join().unwrap()));
        }
        assert!(setup.level_loader(7, 0).is_none());
        assert!(setup.levels.get(&(7, 0)).is_some());
    }

    #[test]
    fn cursors_notice_clear_and_close() {
        let source = pyramid();
        let loader = loader(&source);
        let setup = loader.setup_loader(0).unwrap();
        let image = setup.image(0, 2).unwrap();
        let mut access = image.access();
        assert_eq!(access.get(&[0, 0, 0]), Volatile::valid(Value::Uint16(3)));
        assert_eq!(access.get(&[1, 1, 1]), Volatile::valid(Value::Uint16(3)));
        assert_eq!(source.reads(), 1);

        loader.cache_control().unwrap().clear();
        assert_eq!(access.get(&[1, 1, 1]), Volatile::valid(Value::Uint16(3)));
        assert_eq!(source.reads(), 2);

        loader.close();
        assert!(matches!(access.try_get(&[1, 1, 1]), Err(CacheError::Closed)));
        assert_eq!(access.get(&[1, 1, 1]), Volatile::invalid(Value::Uint16(0)));

        let volatile = setup.volatile_image(0, 2).unwrap();
        assert!(matches!(volatile.try_get(&[0, 0, 0]), Err(CacheError::Closed)));
    }

    #[test]
    fn unknown_setup_and_failed_open() {
        let source = pyramid();
        let loader = loader(&source);
        assert_eq!(loader.setup_ids().unwrap(), vec![0]);
        assert!(matches!(loader.setup_loader(4), Err(CacheError::UnknownSetup(4))));

        let missing = ImageLoader::n5("/definitely/not/here", CacheConfig::default());
        assert!(matches!(missing.open(), Err(CacheError::ContainerOpen { .. })));
        assert_eq!(missing.state(), SessionState::Closed);
    }

    #[test]
    fn transforms_follow_downsampling_factors() {
        let source = pyramid();
        let loader = loader(&source);
        let setup = loader.setup_loader(0).unwrap();
        let transforms = setup.mipmap_transforms();
        assert_eq!(transforms.len(), 3);
        assert_eq!(transforms[2].apply([0.0, 0.0, 0.0]), [1.5, 1.5, 0.0]);
        assert_eq!(setup.priority(0), 2);
        assert_eq!(setup.priority(2), 0);
    }

    #[test]
    fn reads_an_n5_container() {
        let dir = tempfile::tempdir().unwrap();
        let levels = vec![
            (vec![10, 6, 3], vec![4, 4, 2], vec![1.0, 1.0, 1.0]),
            (vec![5, 3, 3], vec![4, 4, 2], vec![2.0, 2.0, 1.0]),
        ];
        write_volume(dir.path(), 2, &levels, |level, p| {
            (level as u64 * 1000 + p[0] + 10 * p[1] + 100 * p[2]) as u16
        });

        let (sender, receiver) = std::sync::mpsc::channel();
        let loader = ImageLoader::n5(dir.path(), CacheConfig::default());
        loader.set_repaint(sender);
        assert_eq!(loader.setup_ids().unwrap(), vec![2]);
        let setup = loader.setup_loader(2).unwrap();
        assert_eq!(setup.data_type(), DataType::Uint16);

        let image = setup.image(0, 0).unwrap();
        let mut access = image.access();
        for p in crate::testing::extent_positions(&[0, 0, 0], &[10, 6, 3]) {
            let expected = (p[0] + 10 * p[1] + 100 * p[2]) as u16;
            assert_eq!(access.get(&p), Volatile::valid(Value::Uint16(expected)));
        }
        let coarse = setup.image(0, 1).unwrap();
        assert_eq!(coarse.get(&[4, 2, 1]), Volatile::valid(Value::Uint16(1124)));
        receiver.recv_timeout(Duration::from_secs(10)).unwrap();
    }
}
