//! Framed codec for log entries.
//!
//! ```text
//! file:  [magic "CRFX"][version]
//! entry: [version: u8][body length: u32 LE][JSON body][crc32(body): u32 LE]
//! ```
//!
//! Bodies reuse the serde attributes of the record types.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use serde::{de::DeserializeOwned, Serialize};

/// Current codec version.
pub const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying a ChatReflex log file.
pub const MAGIC: [u8; 4] = *b"CRFX";

/// Bytes occupied by the file header.
pub const HEADER_LEN: u64 = 5;

/// Version byte, length prefix and checksum.
const FRAME_OVERHEAD: usize = 1 + 4 + 4;

/// Largest body accepted on decode. Chat triggers are small; anything larger
/// is treated as corruption rather than allocated.
const MAX_ENTRY_SIZE: usize = 16 * 1024 * 1024;

fn invalid(message: impl Into<String>) -> IoError {
    IoError::new(ErrorKind::InvalidData, message.into())
}

fn read_array<const N: usize>(reader: &mut impl Read) -> IoResult<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Serialize `value` into one framed, checksummed entry.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let body = serde_json::to_vec(value).map_err(|e| invalid(format!("serialization failed: {e}")))?;
    let len = u32::try_from(body.len()).map_err(|_| invalid("entry too large to frame"))?;

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + body.len());
    frame.push(CODEC_VERSION);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(frame)
}

/// Decode one entry, returning it with the number of bytes consumed.
///
/// # Errors
/// - `UnexpectedEof` when the entry is cut short (torn tail write)
/// - `InvalidData` on version mismatch, oversize length, CRC mismatch or bad JSON
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<(T, u64)> {
    let [version] = read_array::<1>(reader)?;
    if version != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported codec version: {version} (expected {CODEC_VERSION})"
        )));
    }

    let len = u32::from_le_bytes(read_array::<4>(reader)?) as usize;
    if len > MAX_ENTRY_SIZE {
        return Err(invalid(format!("entry size {len} exceeds maximum {MAX_ENTRY_SIZE}")));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;

    let stored = u32::from_le_bytes(read_array::<4>(reader)?);
    let computed = crc32fast::hash(&body);
    if stored != computed {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored:08x}, computed={computed:08x}"
        )));
    }

    let value = serde_json::from_slice(&body).map_err(|e| invalid(format!("deserialization failed: {e}")))?;
    Ok((value, (FRAME_OVERHEAD + len) as u64))
}

/// Write the file header.
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])
}

/// Check the magic and return the header's codec version.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let magic = read_array::<4>(reader)?;
    if magic != MAGIC {
        return Err(invalid(format!("not a chatreflex log: magic {magic:?}")));
    }
    let [version] = read_array::<1>(reader)?;
    Ok(version)
}
