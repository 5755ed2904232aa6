//! Metadata probe for GGUF artifacts.
//!
//! Reads only the header key/value table; tensor data is never touched.

use halo_common::ModelMetadata;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";
const DEFAULT_CONTEXT_SIZE: usize = 4096;
const MAX_STRING_LEN: u64 = 64 * 1024 * 1024;
const MAX_ARRAY_DEPTH: usize = 4;

const KEY_ARCHITECTURE: &str = "general.architecture";
const KEY_CHAT_TEMPLATE: &str = "tokenizer.chat_template";
const SUFFIX_CONTEXT_LENGTH: &str = ".context_length";

// Value type tags
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

enum Value {
    Unsigned(u64),
    Signed(i64),
    Text(String),
    Other,
}

/// Probe a model file. A malformed or unreadable file yields `valid == false`.
pub fn read_metadata(path: &Path) -> ModelMetadata {
    let result = File::open(path).and_then(|file| parse(&mut BufReader::new(file)));
    match result {
        Ok(metadata) => {
            tracing::debug!(
                path = %path.display(),
                architecture = %metadata.architecture,
                context_size = metadata.context_size,
                has_template = !metadata.chat_template.is_empty(),
                "Probed model metadata"
            );
            metadata
        }
        Err(e) => {
            tracing::warn!("Failed to read metadata from {}: {}", path.display(), e);
            ModelMetadata::default()
        }
    }
}

fn parse<R: Read + Seek>(reader: &mut R) -> io::Result<ModelMetadata> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != GGUF_MAGIC {
        return Err(invalid("not a GGUF file"));
    }

    let version = read_u32(reader)?;
    if version < 2 {
        return Err(invalid(format!("unsupported GGUF version {}", version)));
    }

    let _tensor_count = read_u64(reader)?;
    let kv_count = read_u64(reader)?;

    let mut architecture = String::new();
    let mut chat_template = String::new();
    let mut context_lengths: HashMap<String, u64> = HashMap::new();

    for _ in 0..kv_count {
        let key = read_string(reader)?;
        let value_type = read_u32(reader)?;
        let value = read_value(reader, value_type, 0)?;

        match (key.as_str(), value) {
            (KEY_ARCHITECTURE, Value::Text(arch)) => architecture = arch,
            (KEY_CHAT_TEMPLATE, Value::Text(template)) => chat_template = template,
            (_, Value::Unsigned(n)) if key.ends_with(SUFFIX_CONTEXT_LENGTH) => {
                context_lengths.insert(key, n);
            }
            (_, Value::Signed(n)) if key.ends_with(SUFFIX_CONTEXT_LENGTH) && n > 0 => {
                context_lengths.insert(key, n as u64);
            }
            _ => {}
        }
    }

    let context_size = context_lengths
        .get(&format!("{}{}", architecture, SUFFIX_CONTEXT_LENGTH))
        .map(|&n| n as usize)
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_CONTEXT_SIZE);

    Ok(ModelMetadata {
        context_size,
        chat_template,
        architecture,
        valid: true,
    })
}

fn read_value<R: Read + Seek>(reader: &mut R, value_type: u32, depth: usize) -> io::Result<Value> {
    let value = match value_type {
        TYPE_U8 => Value::Unsigned(read_array::<1, _>(reader)?[0] as u64),
        TYPE_I8 => Value::Signed(read_array::<1, _>(reader)?[0] as i8 as i64),
        TYPE_U16 => Value::Unsigned(u16::from_le_bytes(read_array(reader)?) as u64),
        TYPE_I16 => Value::Signed(i16::from_le_bytes(read_array(reader)?) as i64),
        TYPE_U32 => Value::Unsigned(read_u32(reader)? as u64),
        TYPE_I32 => Value::Signed(i32::from_le_bytes(read_array(reader)?) as i64),
        TYPE_U64 => Value::Unsigned(read_u64(reader)?),
        TYPE_I64 => Value::Signed(i64::from_le_bytes(read_array(reader)?)),
        TYPE_F32 | TYPE_BOOL | TYPE_F64 => {
            skip(reader, fixed_size(value_type).unwrap_or(0))?;
            Value::Other
        }
        TYPE_STRING => Value::Text(read_string(reader)?),
        TYPE_ARRAY => {
            if depth >= MAX_ARRAY_DEPTH {
                return Err(invalid("array nesting too deep"));
            }
            let element_type = read_u32(reader)?;
            let len = read_u64(reader)?;
            skip_array(reader, element_type, len, depth + 1)?;
            Value::Other
        }
        other => return Err(invalid(format!("unknown value type {}", other))),
    };
    Ok(value)
}

fn skip_array<R: Read + Seek>(reader: &mut R, element_type: u32, len: u64, depth: usize) -> io::Result<()> {
    if let Some(size) = fixed_size(element_type) {
        let total = size
            .checked_mul(len)
            .ok_or_else(|| invalid("array length overflow"))?;
        return skip(reader, total);
    }
    for _ in 0..len {
        read_value_skipping(reader, element_type, depth)?;
    }
    Ok(())
}

fn read_value_skipping<R: Read + Seek>(reader: &mut R, value_type: u32, depth: usize) -> io::Result<()> {
    if value_type == TYPE_STRING {
        let len = read_u64(reader)?;
        return skip(reader, len);
    }
    read_value(reader, value_type, depth).map(|_| ())
}

fn fixed_size(value_type: u32) -> Option<u64> {
    match value_type {
        TYPE_U8 | TYPE_I8 | TYPE_BOOL => Some(1),
        TYPE_U16 | TYPE_I16 => Some(2),
        TYPE_U32 | TYPE_I32 | TYPE_F32 => Some(4),
        TYPE_U64 | TYPE_I64 | TYPE_F64 => Some(8),
        _ => None,
    }
}

fn read_array<const N: usize, R: Read>(reader: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_array(reader)?))
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_array(reader)?))
}

fn read_string<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = read_u64(reader)?;
    if len > MAX_STRING_LEN {
        return Err(invalid(format!("string of {} bytes", len)));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn skip<R: Seek>(reader: &mut R, len: u64) -> io::Result<()> {
    let offset = i64::try_from(len).map_err(|_| invalid("skip length overflow"))?;
    reader.seek(SeekFrom::Current(offset))?;
    Ok(())
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::GgufHeader;

    #[test]
    fn test_reads_header_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        GgufHeader::new()
            .string("general.architecture", "llama")
            .string_array("tokenizer.ggml.tokens", &["<s>", "</s>", "hello"])
            .f32("llama.rope.freq_base", 10000.0)
            .u32("llama.context_length", 8192)
            .string("tokenizer.chat_template", "<|im_start|>{{ content }}<|im_end|>")
            .write_to(&path)
            .unwrap();

        let metadata = read_metadata(&path);
        assert!(metadata.valid);
        assert_eq!(metadata.architecture, "llama");
        assert_eq!(metadata.context_size, 8192);
        assert!(metadata.chat_template.contains("<|im_start|>"));
    }

    #[test]
    fn test_context_length_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        GgufHeader::new()
            .string("general.architecture", "phi3")
            .u32("llama.context_length", 2048)
            .write_to(&path)
            .unwrap();

        let metadata = read_metadata(&path);
        assert!(metadata.valid);
        assert_eq!(metadata.context_size, 4096);
        assert!(metadata.chat_template().is_none());
    }

    #[test]
    fn test_invalid_files() {
        let dir = tempfile::tempdir().unwrap();

        let garbage = dir.path().join("garbage.gguf");
        std::fs::write(&garbage, b"definitely not a model").unwrap();
        assert!(!read_metadata(&garbage).valid);

        let truncated = dir.path().join("truncated.gguf");
        let mut bytes = GgufHeader::new()
            .string("general.architecture", "llama")
            .build();
        bytes.truncate(bytes.len() - 3);
        std::fs::write(&truncated, bytes).unwrap();
        assert!(!read_metadata(&truncated).valid);

        let missing = read_metadata(&dir.path().join("missing.gguf"));
        assert!(!missing.valid);
        assert_eq!(missing.context_size, 4096);
    }
}
