use crate::error::ContainerError;
use flate2::read::{GzDecoder, ZlibDecoder};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::io::{Cursor, Read};

/// The `compression` attribute of an N5 dataset, e.g. `{"type": "gzip", "level": -1}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Compression {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}
impl Compression {
    pub fn raw() -> Self {
        Self::named("raw")
    }
    pub fn named(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            parameters: serde_json::Map::new(),
        }
    }
    fn use_zlib(&self) -> bool {
        self.parameters
            .get("useZlib")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn decompress<'a>(&self, payload: &'a [u8]) -> Result<Cow<'a, [u8]>, ContainerError> {
        match self.kind.as_str() {
            "raw" => Ok(Cow::Borrowed(payload)),
            "gzip" if self.use_zlib() => read_all(ZlibDecoder::new(payload)).map(Cow::Owned),
            "gzip" => read_all(GzDecoder::new(payload)).map(Cow::Owned),
            "zstd" => zstd_decompress(payload).map(Cow::Owned),
            other => Err(ContainerError::UnsupportedCompression(other.to_string())),
        }
    }
}
impl Default for Compression {
    fn default() -> Self {
        Self::raw()
    }
}

fn read_all(mut reader: impl Read) -> Result<Vec<u8>, ContainerError> {
    let mut uncompressed = Vec::new();
    reader
        .read_to_end(&mut uncompressed)
        .map_err(|e| ContainerError::Decompression(e.to_string()))?;
    Ok(uncompressed)
}

pub fn zstd_decompress(input: &[u8]) -> Result<Vec<u8>, ContainerError> {
    let decoder = ruzstd::decoding::StreamingDecoder::new(Cursor::new(input))
        .map_err(|e| ContainerError::Decompression(e.to_string()))?;
    read_all(decoder)
}
