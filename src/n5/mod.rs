pub mod compression;

use crate::cell::TypedBuffer;
use crate::error::ContainerError;
use crate::model::{SetupId, TimepointId};
pub use compression::Compression;
use derive_more::Debug;
use log::{debug, info};
use memmap::MmapOptions;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float32,
    Float64,
}
impl DataType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Uint8 | DataType::Int8 => 1,
            DataType::Uint16 | DataType::Int16 => 2,
            DataType::Uint32 | DataType::Int32 | DataType::Float32 => 4,
            DataType::Uint64 | DataType::Int64 | DataType::Float64 => 8,
        }
    }
}

/*
{
    "dimensions": [ 1024, 1024, 120 ],
    "blockSize": [ 64, 64, 64 ],
    "dataType": "uint16",
    "compression": { "type": "gzip", "level": -1, "useZlib": false }
}
*/

/// Attributes of one dataset, i.e. one resolution level of one setup at one timepoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", from = "RawDatasetAttributes")]
pub struct DatasetAttributes {
    pub dimensions: Vec<u64>,
    pub block_size: Vec<u32>,
    pub data_type: DataType,
    pub compression: Compression,
}
impl DatasetAttributes {
    pub fn new(dimensions: &[u64], block_size: &[u32], data_type: DataType, compression: Compression) -> Self {
        Self {
            dimensions: dimensions.to_vec(),
            block_size: block_size.to_vec(),
            data_type,
            compression,
        }
    }
    pub fn num_dimensions(&self) -> usize {
        self.dimensions.len()
    }
}

// older containers store the compression as plain `"compressionType": "gzip"`
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDatasetAttributes {
    dimensions: Vec<u64>,
    block_size: Vec<u32>,
    data_type: DataType,
    compression: Option<Compression>,
    compression_type: Option<String>,
}
impl From<RawDatasetAttributes> for DatasetAttributes {
    fn from(raw: RawDatasetAttributes) -> Self {
        let compression = raw
            .compression
            .or_else(|| raw.compression_type.as_deref().map(Compression::named))
            .unwrap_or_default();
        DatasetAttributes {
            dimensions: raw.dimensions,
            block_size: raw.block_size,
            data_type: raw.data_type,
            compression,
        }
    }
}

/// A raw block as stored in the container. `size` may be smaller than the
/// nominal block size at the dataset boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBlock {
    pub size: Vec<u32>,
    pub grid_position: Vec<u64>,
    #[debug(skip)]
    pub data: TypedBuffer,
}
impl DataBlock {
    pub fn num_elements(&self) -> usize {
        self.size.iter().map(|&s| s as usize).product()
    }
}

/// The backing chunked container.
pub trait BlockSource: Send + Sync {
    /// Human readable location, used in logs and errors.
    fn location(&self) -> String;

    fn dataset_attributes(&self, path_name: &str) -> Result<DatasetAttributes, ContainerError>;

    /// Reads one block. `Ok(None)` means the container holds no block at that position.
    fn read_block(
        &self,
        path_name: &str,
        attributes: &DatasetAttributes,
        grid_position: &[u64],
    ) -> Result<Option<DataBlock>, ContainerError>;
}

/// Description of one setup (source) supplied when opening a session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescription {
    pub setup: SetupId,
    pub data_type: DataType,
    /// One factor vector per resolution level, relative to level 0.
    pub downsampling_factors: Vec<Vec<f64>>,
}
impl SourceDescription {
    pub fn num_levels(&self) -> usize {
        self.downsampling_factors.len()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetupAttributes {
    data_type: DataType,
    downsampling_factors: Vec<Vec<f64>>,
}

pub fn setup_path_name(setup: SetupId) -> String {
    format!("setup{}", setup)
}

pub fn path_name(setup: SetupId, timepoint: TimepointId, level: u32) -> String {
    format!("setup{}/timepoint{}/s{}", setup, timepoint, level)
}

const BLOCK_MODE_DEFAULT: u16 = 0;
const BLOCK_MODE_VARLENGTH: u16 = 1;
const BLOCK_MODE_OBJECT: u16 = 2;

/// Parses an N5 block: big-endian header, then the compressed payload.
pub fn parse_block(
    path: &str,
    bytes: &[u8],
    attributes: &DatasetAttributes,
    grid_position: &[u64],
) -> Result<DataBlock, ContainerError> {
    let invalid = |reason: String| ContainerError::InvalidBlockHeader {
        path: path.to_string(),
        reason,
    };
    let u16_at = |offset: usize| -> Result<u16, ContainerError> {
        bytes
            .get(offset..offset + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| invalid(format!("truncated at {}", offset)))
    };
    let u32_at = |offset: usize| -> Result<u32, ContainerError> {
        bytes
            .get(offset..offset + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| invalid(format!("truncated at {}", offset)))
    };

    let mode = u16_at(0)?;
    if mode == BLOCK_MODE_OBJECT {
        return Err(invalid("object blocks are not supported".to_string()));
    } else if mode != BLOCK_MODE_DEFAULT && mode != BLOCK_MODE_VARLENGTH {
        return Err(invalid(format!("unknown block mode {}", mode)));
    }
    let ndim = u16_at(2)? as usize;
    if ndim != attributes.num_dimensions() {
        return Err(invalid(format!(
            "block has {} dimensions, dataset has {}",
            ndim,
            attributes.num_dimensions()
        )));
    }
    let size = (0..ndim).map(|d| u32_at(4 + 4 * d)).collect::<Result<Vec<_>, _>>()?;
    let mut offset = 4 + 4 * ndim;
    let nominal_elements: usize = size.iter().map(|&s| s as usize).product();
    let num_elements = if mode == BLOCK_MODE_VARLENGTH {
        let n = u32_at(offset)? as usize;
        offset += 4;
        n
    } else {
        nominal_elements
    };
    if num_elements < nominal_elements {
        return Err(invalid(format!(
            "{} elements do not fill a block of size {:?}",
            num_elements, size
        )));
    }

    let payload = attributes.compression.decompress(&bytes[offset..])?;
    let data = TypedBuffer::from_be_bytes(attributes.data_type, &payload, num_elements)
        .ok_or_else(|| invalid(format!("payload too short for {} elements", num_elements)))?;

    Ok(DataBlock {
        size,
        grid_position: grid_position.to_vec(),
        data,
    })
}

/// Reads an N5 container from the local filesystem.
#[derive(Debug)]
pub struct N5Reader {
    base_path: PathBuf,
}
impl N5Reader {
    pub fn open(base_path: impl AsRef<Path>) -> Result<Self, ContainerError> {
        let base_path = base_path.as_ref().to_path_buf();
        if !base_path.is_dir() {
            return Err(ContainerError::MissingDataset(base_path.display().to_string()));
        }
        let reader = Self { base_path };
        if let Ok(root) = reader.attributes("") {
            if let Some(version) = root.get("n5") {
                info!("Opened N5 container {} (version {})", reader.base_path.display(), version);
            }
        }
        Ok(reader)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn group_path(&self, path_name: &str) -> PathBuf {
        if path_name.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path_name)
        }
    }

    /// Raw `attributes.json` of a group or dataset.
    pub fn attributes(&self, path_name: &str) -> Result<serde_json::Map<String, serde_json::Value>, ContainerError> {
        let file = self.group_path(path_name).join("attributes.json");
        if !file.exists() {
            return Err(ContainerError::MissingDataset(path_name.to_string()));
        }
        let json = std::fs::read_to_string(file)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn block_path(&self, path_name: &str, grid_position: &[u64]) -> PathBuf {
        grid_position
            .iter()
            .fold(self.group_path(path_name), |path, g| path.join(g.to_string()))
    }

    fn list_numbered(&self, path_name: &str, pattern: &str) -> Result<Vec<u32>, ContainerError> {
        let re = Regex::new(pattern).map_err(|e| ContainerError::MissingDataset(e.to_string()))?;
        let mut ids = vec![];
        for entry in std::fs::read_dir(self.group_path(path_name))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(captures) = name.to_str().and_then(|n| re.captures(n)) {
                if let Ok(id) = captures[1].parse::<u32>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn list_setups(&self) -> Result<Vec<SetupId>, ContainerError> {
        self.list_numbered("", r"^setup(\d+)$")
    }

    pub fn list_timepoints(&self, setup: SetupId) -> Result<Vec<TimepointId>, ContainerError> {
        self.list_numbered(&setup_path_name(setup), r"^timepoint(\d+)$")
    }

    /// Reads `dataType` and `downsamplingFactors` from the setup group.
    pub fn describe_setup(&self, setup: SetupId) -> Result<SourceDescription, ContainerError> {
        let attributes = self.attributes(&setup_path_name(setup))?;
        let attributes: SetupAttributes = serde_json::from_value(serde_json::Value::Object(attributes))?;
        Ok(SourceDescription {
            setup,
            data_type: attributes.data_type,
            downsampling_factors: attributes.downsampling_factors,
        })
    }

    pub fn describe_all(&self) -> Result<Vec<SourceDescription>, ContainerError> {
        self.list_setups()?
            .into_iter()
            .map(|setup| self.describe_setup(setup))
            .collect()
    }
}

impl BlockSource for N5Reader {
    fn location(&self) -> String {
        self.base_path.display().to_string()
    }

    fn dataset_attributes(&self, path_name: &str) -> Result<DatasetAttributes, ContainerError> {
        let attributes = self.attributes(path_name)?;
        Ok(serde_json::from_value(serde_json::Value::Object(attributes))?)
    }

    fn read_block(
        &self,
        path_name: &str,
        attributes: &DatasetAttributes,
        grid_position: &[u64],
    ) -> Result<Option<DataBlock>, ContainerError> {
        let path = self.block_path(path_name, grid_position);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No block at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let display = path.display().to_string();
        if file.metadata()?.len() == 0 {
            return Err(ContainerError::InvalidBlockHeader {
                path: display,
                reason: "empty block file".to_string(),
            });
        }
        let map = unsafe { MmapOptions::new().map(&file) }?;
        parse_block(&display, &map, attributes, grid_position).map(Some)
    }
}
