//! GGUF header validation
//!
//! Reads just enough of a GGUF file to reject truncated or foreign files before
//! handing them to the backend, and to surface basic metadata.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// "GGUF" read as a little-endian u32
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Oldest header version llama.cpp still reads
const MIN_VERSION: u32 = 2;
const MAX_VERSION: u32 = 3;

/// Upper bound for a single metadata string; anything larger is corruption
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a GGUF file (magic 0x{0:08X})")]
    BadMagic(u32),

    #[error("Unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("Malformed metadata: {0}")]
    Malformed(String),
}

/// Scalar metadata value. Arrays keep only their length.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    UInt(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Array(u64),
}

impl MetadataValue {
    fn as_u64(&self) -> Option<u64> {
        match self {
            MetadataValue::UInt(v) => Some(*v),
            MetadataValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Header summary of a GGUF file
#[derive(Debug, Clone)]
pub struct GgufMetadata {
    pub version: u32,
    pub tensor_count: u64,
    pub architecture: Option<String>,
    pub name: Option<String>,
    pub context_length: Option<u64>,
    /// `general.file_type` (llama_ftype), e.g. 1 = F16, 7 = Q8_0, 15 = Q4_K_M
    pub file_type: Option<u64>,
    pub entries: HashMap<String, MetadataValue>,
}

/// Validate the header of a GGUF file and extract its metadata
pub fn validate_gguf(path: &Path) -> Result<GgufMetadata, GgufError> {
    let file = File::open(path)?;
    read_metadata(&mut BufReader::new(file))
}

/// Parse header + metadata key/values from any reader
pub fn read_metadata<R: Read>(reader: &mut R) -> Result<GgufMetadata, GgufError> {
    let magic = read_u32(reader)?;
    if magic != GGUF_MAGIC {
        return Err(GgufError::BadMagic(magic));
    }

    let version = read_u32(reader)?;
    if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
        return Err(GgufError::UnsupportedVersion(version));
    }

    let tensor_count = read_u64(reader)?;
    let kv_count = read_u64(reader)?;

    let mut entries = HashMap::new();
    for _ in 0..kv_count {
        let key = read_string(reader)?;
        let value_type = read_u32(reader)?;
        let value = read_value(reader, value_type)?;
        entries.insert(key, value);
    }

    let architecture = entries
        .get("general.architecture")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let context_length = architecture
        .as_ref()
        .and_then(|arch| entries.get(&format!("{}.context_length", arch)))
        .and_then(|v| v.as_u64());

    Ok(GgufMetadata {
        version,
        tensor_count,
        name: entries
            .get("general.name")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        file_type: entries.get("general.file_type").and_then(|v| v.as_u64()),
        architecture,
        context_length,
        entries,
    })
}

fn read_value<R: Read>(reader: &mut R, value_type: u32) -> Result<MetadataValue, GgufError> {
    Ok(match value_type {
        0 => MetadataValue::UInt(read_array::<1, R>(reader)?[0] as u64),
        1 => MetadataValue::Int(read_array::<1, R>(reader)?[0] as i8 as i64),
        2 => MetadataValue::UInt(u16::from_le_bytes(read_array(reader)?) as u64),
        3 => MetadataValue::Int(i16::from_le_bytes(read_array(reader)?) as i64),
        4 => MetadataValue::UInt(read_u32(reader)? as u64),
        5 => MetadataValue::Int(i32::from_le_bytes(read_array(reader)?) as i64),
        6 => MetadataValue::Float(f32::from_le_bytes(read_array(reader)?) as f64),
        7 => MetadataValue::Bool(read_array::<1, R>(reader)?[0] != 0),
        8 => MetadataValue::Text(read_string(reader)?),
        9 => {
            let element_type = read_u32(reader)?;
            let len = read_u64(reader)?;
            if element_type == 9 {
                return Err(GgufError::Malformed("nested arrays".to_string()));
            }
            for _ in 0..len {
                read_value(reader, element_type)?;
            }
            MetadataValue::Array(len)
        }
        10 => MetadataValue::UInt(read_u64(reader)?),
        11 => MetadataValue::Int(i64::from_le_bytes(read_array(reader)?)),
        12 => MetadataValue::Float(f64::from_le_bytes(read_array(reader)?)),
        other => {
            return Err(GgufError::Malformed(format!(
                "unknown value type {}",
                other
            )))
        }
    })
}

fn read_array<const N: usize, R: Read>(reader: &mut R) -> Result<[u8; N], GgufError> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, GgufError> {
    Ok(u32::from_le_bytes(read_array(reader)?))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, GgufError> {
    Ok(u64::from_le_bytes(read_array(reader)?))
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, GgufError> {
    let len = read_u64(reader)?;
    if len > MAX_STRING_LEN {
        return Err(GgufError::Malformed(format!("string length {}", len)));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| GgufError::Malformed(e.to_string()))
}
