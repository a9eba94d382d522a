//! Fixtures shared by the unit tests: N5 trees on disk and an in-memory block source.

use crate::cell::TypedBuffer;
use crate::error::ContainerError;
use crate::n5::{path_name, setup_path_name, BlockSource, DataBlock, DataType, DatasetAttributes};
use flate2::write::{GzEncoder, ZlibEncoder};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

fn to_be_bytes(data: &TypedBuffer) -> Vec<u8> {
    let size = data.data_type().size_in_bytes();
    data.to_le_bytes()
        .chunks(size)
        .flat_map(|c| c.iter().rev().copied())
        .collect()
}

/// Serializes an uncompressed block. `varlength` writes mode 1 with that element count.
pub fn encode_block(size: &[u32], data: &TypedBuffer, varlength: Option<u32>) -> Vec<u8> {
    let mut bytes = vec![];
    bytes.extend_from_slice(&(varlength.is_some() as u16).to_be_bytes());
    bytes.extend_from_slice(&(size.len() as u16).to_be_bytes());
    for s in size {
        bytes.extend_from_slice(&s.to_be_bytes());
    }
    if let Some(n) = varlength {
        bytes.extend_from_slice(&n.to_be_bytes());
    }
    bytes.extend_from_slice(&to_be_bytes(data));
    bytes
}

pub fn write_attributes(base: &Path, path: &str, attributes: &DatasetAttributes) {
    let dir = base.join(path);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("attributes.json"), serde_json::to_string(attributes).unwrap()).unwrap();
}

pub fn write_setup(base: &Path, setup: u32, data_type: DataType, factors: &[Vec<f64>]) {
    let dir = base.join(setup_path_name(setup));
    std::fs::create_dir_all(&dir).unwrap();
    let json = serde_json::json!({ "dataType": data_type, "downsamplingFactors": factors });
    std::fs::write(dir.join("attributes.json"), json.to_string()).unwrap();
}

/// Writes one block file, compressed as `attributes.compression` says.
pub fn write_block(
    base: &Path,
    path: &str,
    attributes: &DatasetAttributes,
    grid_position: &[u64],
    size: &[u32],
    data: &TypedBuffer,
) {
    let raw = encode_block(size, data, None);
    let header_len = 4 + 4 * size.len();
    let (header, payload) = raw.split_at(header_len);
    let payload = match attributes.compression.kind.as_str() {
        "raw" => payload.to_vec(),
        "gzip" if attributes.compression.parameters.get("useZlib") == Some(&serde_json::Value::Bool(true)) => {
            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(payload).unwrap();
            encoder.finish().unwrap()
        }
        "gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(payload).unwrap();
            encoder.finish().unwrap()
        }
        other => panic!("cannot write {} blocks", other),
    };
    let mut file = base.join(path);
    for g in &grid_position[..grid_position.len() - 1] {
        file.push(g.to_string());
    }
    std::fs::create_dir_all(&file).unwrap();
    file.push(grid_position[grid_position.len() - 1].to_string());
    std::fs::write(file, [header, payload.as_slice()].concat()).unwrap();
}

/// Writes a complete single-timepoint setup whose voxel values are `f(level, position)`.
pub fn write_volume(
    base: &Path,
    setup: u32,
    levels: &[(Vec<u64>, Vec<u32>, Vec<f64>)],
    f: impl Fn(u32, &[u64]) -> u16,
) {
    let factors: Vec<Vec<f64>> = levels.iter().map(|(_, _, f)| f.clone()).collect();
    write_setup(base, setup, DataType::Uint16, &factors);
    for (level, (dimensions, block_size, _)) in levels.iter().enumerate() {
        let level = level as u32;
        let path = path_name(setup, 0, level);
        let attributes = DatasetAttributes::new(
            dimensions,
            block_size,
            DataType::Uint16,
            crate::n5::Compression::named("gzip"),
        );
        write_attributes(base, &path, &attributes);
        let grid = crate::cell::CellGrid::new(dimensions, block_size);
        for g in grid.grid_positions() {
            let extent = grid.cell_extent(&g).unwrap();
            let data = extent_positions(&extent.offset, &extent.size)
                .iter()
                .map(|p| f(level, p))
                .collect();
            write_block(base, &path, &attributes, &g, &extent.size, &TypedBuffer::Uint16(data));
        }
    }
}

/// All voxel positions of a box, axis 0 fastest.
pub fn extent_positions(offset: &[u64], size: &[u32]) -> Vec<Vec<u64>> {
    let dimensions: Vec<u64> = size.iter().map(|&s| s as u64).collect();
    let grid = crate::cell::CellGrid::new(&dimensions, &vec![1; size.len()]);
    grid.grid_positions()
        .map(|p| p.iter().zip(offset).map(|(p, o)| p + o).collect())
        .collect()
}

/// In-memory container. Records reads, can hold readers at a gate and inject failures.
#[derive(Default)]
pub struct MemorySource {
    datasets: HashMap<String, DatasetAttributes>,
    blocks: HashMap<(String, Vec<u64>), DataBlock>,
    failing: Mutex<HashSet<(String, Vec<u64>)>>,
    reads: AtomicUsize,
    read_positions: Mutex<Vec<Vec<u64>>>,
    gate_closed: Mutex<bool>,
    gate: Condvar,
}
impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dataset(&mut self, path: &str, attributes: DatasetAttributes) {
        self.datasets.insert(path.to_string(), attributes);
    }

    pub fn add_block(&mut self, path: &str, grid_position: &[u64], size: &[u32], data: TypedBuffer) {
        self.blocks.insert(
            (path.to_string(), grid_position.to_vec()),
            DataBlock {
                size: size.to_vec(),
                grid_position: grid_position.to_vec(),
                data,
            },
        );
    }

    /// Fills a whole dataset with blocks of the constant `value`.
    pub fn add_constant_dataset(&mut self, path: &str, dimensions: &[u64], block_size: &[u32], value: u16) {
        let attributes = DatasetAttributes::new(dimensions, block_size, DataType::Uint16, Default::default());
        let grid = crate::cell::CellGrid::new(dimensions, block_size);
        for g in grid.grid_positions() {
            let extent = grid.cell_extent(&g).unwrap();
            self.add_block(path, &g, &extent.size, TypedBuffer::Uint16(vec![value; extent.num_elements()]));
        }
        self.add_dataset(path, attributes);
    }

    pub fn fail(&self, path: &str, grid_position: &[u64]) {
        self.failing.lock().unwrap().insert((path.to_string(), grid_position.to_vec()));
    }
    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Grid positions of all reads so far, in the order they passed the gate.
    pub fn read_positions(&self) -> Vec<Vec<u64>> {
        self.read_positions.lock().unwrap().clone()
    }

    pub fn close_gate(&self) {
        *self.gate_closed.lock().unwrap() = true;
    }
    pub fn open_gate(&self) {
        *self.gate_closed.lock().unwrap() = false;
        self.gate.notify_all();
    }
}
impl BlockSource for MemorySource {
    fn location(&self) -> String {
        "memory".to_string()
    }

    fn dataset_attributes(&self, path_name: &str) -> Result<DatasetAttributes, ContainerError> {
        self.datasets
            .get(path_name)
            .cloned()
            .ok_or_else(|| ContainerError::MissingDataset(path_name.to_string()))
    }

    fn read_block(
        &self,
        path_name: &str,
        _attributes: &DatasetAttributes,
        grid_position: &[u64],
    ) -> Result<Option<DataBlock>, ContainerError> {
        {
            let mut closed = self.gate_closed.lock().unwrap();
            while *closed {
                closed = self.gate.wait(closed).unwrap();
            }
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.read_positions.lock().unwrap().push(grid_position.to_vec());
        let key = (path_name.to_string(), grid_position.to_vec());
        if self.failing.lock().unwrap().contains(&key) {
            return Err(ContainerError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected failure",
            )));
        }
        Ok(self.blocks.get(&key).cloned())
    }
}
