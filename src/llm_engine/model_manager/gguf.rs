//! GGUF header reader
//!
//! Reads just enough of a GGUF file to describe it: magic, version and the
//! metadata key/value section. Tensor data is never touched.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::llm_engine::provider::LlmError;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";
const MIN_VERSION: u32 = 2;
const MAX_VERSION: u32 = 3;

/// Upper bound for a single string; anything larger means the header is garbage
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;
/// Upper bound for the metadata entry count
const MAX_KV_COUNT: u64 = 1 << 20;

// GGUF metadata value types
const TYPE_U8: u32 = 0;
const TYPE_I8: u32 = 1;
const TYPE_U16: u32 = 2;
const TYPE_I16: u32 = 3;
const TYPE_U32: u32 = 4;
const TYPE_I32: u32 = 5;
const TYPE_F32: u32 = 6;
const TYPE_BOOL: u32 = 7;
const TYPE_STRING: u32 = 8;
const TYPE_ARRAY: u32 = 9;
const TYPE_U64: u32 = 10;
const TYPE_I64: u32 = 11;
const TYPE_F64: u32 = 12;

/// Scalar metadata value (arrays are skipped)
#[derive(Debug, Clone, PartialEq)]
enum MetaValue {
    Int(i128),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl MetaValue {
    fn as_u64(&self) -> Option<u64> {
        match self {
            MetaValue::Int(v) if *v >= 0 => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Model facts extracted from GGUF metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GgufMetadata {
    pub version: u32,
    pub architecture: Option<String>,
    pub name: Option<String>,
    pub context_length: Option<u32>,
    pub block_count: Option<u32>,
    pub embedding_length: Option<u32>,
    pub head_count: Option<u32>,
    pub head_count_kv: Option<u32>,
    pub file_type: Option<u32>,
}

impl GgufMetadata {
    /// Quantization label derived from `general.file_type`
    pub fn quantization(&self) -> Option<String> {
        self.file_type.and_then(file_type_label).map(str::to_string)
    }

    /// f16 KV-cache bytes needed per context token
    pub fn kv_bytes_per_token(&self) -> Option<u64> {
        let layers = self.block_count? as u64;
        let embd = self.embedding_length? as u64;
        let heads = self.head_count? as u64;
        let heads_kv = self.head_count_kv.map(u64::from).unwrap_or(heads);
        if layers == 0 || embd == 0 || heads == 0 {
            return None;
        }
        let embd_kv = embd * heads_kv / heads;
        // K and V, two bytes per element
        Some(2 * layers * embd_kv * 2)
    }
}

/// Map llama.cpp `general.file_type` to its quantization label
pub fn file_type_label(file_type: u32) -> Option<&'static str> {
    let label = match file_type {
        0 => "F32",
        1 => "F16",
        2 => "Q4_0",
        3 => "Q4_1",
        7 => "Q8_0",
        8 => "Q5_0",
        9 => "Q5_1",
        10 => "Q2_K",
        11 => "Q3_K_S",
        12 => "Q3_K_M",
        13 => "Q3_K_L",
        14 => "Q4_K_S",
        15 => "Q4_K_M",
        16 => "Q5_K_S",
        17 => "Q5_K_M",
        18 => "Q6_K",
        19 => "IQ2_XXS",
        20 => "IQ2_XS",
        21 => "Q2_K_S",
        22 => "IQ3_XS",
        23 => "IQ3_XXS",
        24 => "IQ1_S",
        25 => "IQ4_NL",
        26 => "IQ3_S",
        27 => "IQ3_M",
        28 => "IQ2_S",
        29 => "IQ2_M",
        30 => "IQ4_XS",
        31 => "IQ1_M",
        32 => "BF16",
        _ => return None,
    };
    Some(label)
}

/// Read the metadata section of a GGUF file
pub fn read_metadata(path: &Path) -> Result<GgufMetadata, LlmError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => LlmError::InvalidModel(format!("{} does not exist", path.display())),
        _ => LlmError::IoFailure(format!("Failed to open {}: {}", path.display(), e)),
    })?;
    let mut reader = BufReader::new(file);

    parse(&mut reader).map_err(|e| match e {
        ParseError::Io(e) if e.kind() == ErrorKind::UnexpectedEof => {
            LlmError::InvalidModel(format!("{} is truncated", path.display()))
        }
        ParseError::Io(e) => LlmError::IoFailure(format!("Failed to read {}: {}", path.display(), e)),
        ParseError::Format(msg) => LlmError::InvalidModel(format!("{}: {}", path.display(), msg)),
    })
}

/// Check only the magic bytes
pub fn has_gguf_magic(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| &magic == GGUF_MAGIC)
        .unwrap_or(false)
}

enum ParseError {
    Io(std::io::Error),
    Format(String),
}

impl From<std::io::Error> for ParseError {
    fn from(e: std::io::Error) -> Self {
        ParseError::Io(e)
    }
}

fn parse<R: Read + Seek>(reader: &mut R) -> Result<GgufMetadata, ParseError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != GGUF_MAGIC {
        return Err(ParseError::Format("not a GGUF file".to_string()));
    }

    let version = read_u32(reader)?;
    if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
        return Err(ParseError::Format(format!("unsupported GGUF version {}", version)));
    }

    let _tensor_count = read_u64(reader)?;
    let kv_count = read_u64(reader)?;
    if kv_count > MAX_KV_COUNT {
        return Err(ParseError::Format(format!("implausible metadata count {}", kv_count)));
    }

    let mut values: HashMap<String, MetaValue> = HashMap::new();
    for _ in 0..kv_count {
        let key = read_string(reader)?;
        let value_type = read_u32(reader)?;
        if let Some(value) = read_value(reader, value_type)? {
            values.insert(key, value);
        }
    }

    let architecture = values
        .get("general.architecture")
        .and_then(MetaValue::as_str)
        .map(str::to_string);
    let arch_u32 = |suffix: &str| -> Option<u32> {
        let arch = architecture.as_deref()?;
        values
            .get(&format!("{}.{}", arch, suffix))
            .and_then(MetaValue::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    };

    Ok(GgufMetadata {
        version,
        name: values.get("general.name").and_then(MetaValue::as_str).map(str::to_string),
        context_length: arch_u32("context_length"),
        block_count: arch_u32("block_count"),
        embedding_length: arch_u32("embedding_length"),
        head_count: arch_u32("attention.head_count"),
        head_count_kv: arch_u32("attention.head_count_kv"),
        file_type: values
            .get("general.file_type")
            .and_then(MetaValue::as_u64)
            .and_then(|v| u32::try_from(v).ok()),
        architecture,
    })
}

fn read_value<R: Read + Seek>(reader: &mut R, value_type: u32) -> Result<Option<MetaValue>, ParseError> {
    let value = match value_type {
        TYPE_U8 => MetaValue::Int(read_array::<1, R>(reader)?[0] as i128),
        TYPE_I8 => MetaValue::Int(i8::from_le_bytes(read_array::<1, R>(reader)?) as i128),
        TYPE_U16 => MetaValue::Int(u16::from_le_bytes(read_array::<2, R>(reader)?) as i128),
        TYPE_I16 => MetaValue::Int(i16::from_le_bytes(read_array::<2, R>(reader)?) as i128),
        TYPE_U32 => MetaValue::Int(read_u32(reader)? as i128),
        TYPE_I32 => MetaValue::Int(i32::from_le_bytes(read_array::<4, R>(reader)?) as i128),
        TYPE_F32 => MetaValue::Float(f32::from_le_bytes(read_array::<4, R>(reader)?) as f64),
        TYPE_BOOL => MetaValue::Bool(read_array::<1, R>(reader)?[0] != 0),
        TYPE_STRING => MetaValue::Str(read_string(reader)?),
        TYPE_U64 => MetaValue::Int(read_u64(reader)? as i128),
        TYPE_I64 => MetaValue::Int(i64::from_le_bytes(read_array::<8, R>(reader)?) as i128),
        TYPE_F64 => MetaValue::Float(f64::from_le_bytes(read_array::<8, R>(reader)?)),
        TYPE_ARRAY => {
            skip_array(reader)?;
            return Ok(None);
        }
        other => return Err(ParseError::Format(format!("unknown metadata type {}", other))),
    };
    Ok(Some(value))
}

fn skip_array<R: Read + Seek>(reader: &mut R) -> Result<(), ParseError> {
    let elem_type = read_u32(reader)?;
    let len = read_u64(reader)?;

    let fixed = match elem_type {
        TYPE_U8 | TYPE_I8 | TYPE_BOOL => Some(1),
        TYPE_U16 | TYPE_I16 => Some(2),
        TYPE_U32 | TYPE_I32 | TYPE_F32 => Some(4),
        TYPE_U64 | TYPE_I64 | TYPE_F64 => Some(8),
        _ => None,
    };

    match (fixed, elem_type) {
        (Some(size), _) => {
            let bytes = len
                .checked_mul(size)
                .and_then(|b| i64::try_from(b).ok())
                .ok_or_else(|| ParseError::Format("array too large".to_string()))?;
            reader.seek(SeekFrom::Current(bytes))?;
        }
        (None, TYPE_STRING) => {
            for _ in 0..len {
                let str_len = read_u64(reader)?;
                if str_len > MAX_STRING_LEN {
                    return Err(ParseError::Format(format!("implausible string length {}", str_len)));
                }
                reader.seek(SeekFrom::Current(str_len as i64))?;
            }
        }
        (None, TYPE_ARRAY) => {
            for _ in 0..len {
                skip_array(reader)?;
            }
        }
        (None, other) => {
            return Err(ParseError::Format(format!("unknown array element type {}", other)));
        }
    }
    Ok(())
}

fn read_array<const N: usize, R: Read>(reader: &mut R) -> std::io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u32<R: Read>(reader: &mut R) -> std::io::Result<u32> {
    Ok(u32::from_le_bytes(read_array::<4, R>(reader)?))
}

fn read_u64<R: Read>(reader: &mut R) -> std::io::Result<u64> {
    Ok(u64::from_le_bytes(read_array::<8, R>(reader)?))
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, ParseError> {
    let len = read_u64(reader)?;
    if len > MAX_STRING_LEN {
        return Err(ParseError::Format(format!("implausible string length {}", len)));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
