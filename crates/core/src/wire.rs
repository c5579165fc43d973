//! Binary record codec
//!
//! Persisted values use a self-describing framing (all integers are
//! big-endian):
//!
//! FileInfo:
//! ```text
//! +----------+--------+----------+---------+---------------+--------+
//! | name_len | name   | flags    | modified| version       | lver   |
//! | 4 bytes  | var    | 4 bytes  | 8 bytes | see below     | 8 bytes|
//! +----------+--------+----------+---------+---------------+--------+
//! | block_count | per block: hash (32) · offset (8) · size (4)      |
//! | 4 bytes     | block_count × 44 bytes                            |
//! +-------------+---------------------------------------------------+
//! ```
//!
//! Version vector:
//! ```text
//! +---------------+------------------------------------+
//! | counter_count | per counter: id (8) · value (8)    |
//! | 4 bytes       | counter_count × 16 bytes           |
//! +---------------+------------------------------------+
//! ```
//!
//! VersionList:
//! ```text
//! +-------------+--------------------------------------------+
//! | entry_count | per entry: device (32) · version (var)     |
//! | 4 bytes     |                                            |
//! +-------------+--------------------------------------------+
//! ```
//!
//! The truncated FileInfo decoder parses every field up to and excluding
//! the block section, so iterators that do not need block lists never
//! touch those bytes. Decoders are strict: short input and trailing
//! garbage are errors.

use std::io::{Cursor, Read};

use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};

use crate::device::DeviceId;
use crate::file::{BlockInfo, FileInfo, FileInfoTruncated, FileVersion, VersionList};
use crate::version::Vector;

const BLOCK_WIRE_LEN: u64 = 32 + 8 + 4;

/// Encode a file record, blocks included.
#[must_use]
pub fn encode_file_info(f: &FileInfo) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + f.name.len() + 24 + f.blocks.len() * 44);

    buf.extend_from_slice(&(f.name.len() as u32).to_be_bytes());
    buf.extend_from_slice(f.name.as_bytes());
    buf.extend_from_slice(&f.flags.to_be_bytes());
    buf.extend_from_slice(&f.modified.to_be_bytes());
    encode_vector(&mut buf, &f.version);
    buf.extend_from_slice(&f.local_version.to_be_bytes());

    buf.extend_from_slice(&(f.blocks.len() as u32).to_be_bytes());
    for b in &f.blocks {
        buf.extend_from_slice(&b.hash);
        buf.extend_from_slice(&b.offset.to_be_bytes());
        buf.extend_from_slice(&b.size.to_be_bytes());
    }

    buf
}

/// Decode a full file record.
///
/// # Errors
/// Returns an error on truncated input or trailing bytes.
pub fn decode_file_info(data: &[u8]) -> Result<FileInfo> {
    let mut cursor = Cursor::new(data);
    let mut f = decode_file_info_prefix(&mut cursor)?;

    let count = read_u32(&mut cursor)? as usize;
    f.blocks = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let mut hash = [0u8; 32];
        cursor.read_exact(&mut hash)?;
        let offset = read_i64(&mut cursor)?;
        let size = read_u32(&mut cursor)?;
        f.blocks.push(BlockInfo { hash, offset, size });
    }

    expect_consumed(&cursor)?;
    Ok(f)
}

/// Decode a file record without its block list.
///
/// # Errors
/// Returns an error on truncated input or an inconsistent block section
/// length.
pub fn decode_file_info_truncated(data: &[u8]) -> Result<FileInfoTruncated> {
    let mut cursor = Cursor::new(data);
    let f = decode_file_info_prefix(&mut cursor)?;

    // Validate the remainder really is the block section without reading
    // the block bytes themselves.
    let count = u64::from(read_u32(&mut cursor)?);
    let remaining = data.len() as u64 - cursor.position();
    if remaining != count * BLOCK_WIRE_LEN {
        bail!(
            "block section length mismatch: {count} blocks, {remaining} bytes remain"
        );
    }

    Ok(f.truncate())
}

fn decode_file_info_prefix(cursor: &mut Cursor<&[u8]>) -> Result<FileInfo> {
    let name = read_string(cursor)?;
    let flags = read_u32(cursor)?;
    let modified = read_i64(cursor)?;
    let version = decode_vector(cursor)?;
    let local_version = read_i64(cursor)?;

    Ok(FileInfo {
        name,
        flags,
        modified,
        version,
        local_version,
        blocks: Vec::new(),
    })
}

/// Encode a version list.
#[must_use]
pub fn encode_version_list(vl: &VersionList) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + vl.versions.len() * 48);
    buf.extend_from_slice(&(vl.versions.len() as u32).to_be_bytes());
    for fv in &vl.versions {
        buf.extend_from_slice(fv.device.as_bytes());
        encode_vector(&mut buf, &fv.version);
    }
    buf
}

/// Decode a version list.
///
/// # Errors
/// Returns an error on truncated input or trailing bytes.
pub fn decode_version_list(data: &[u8]) -> Result<VersionList> {
    let mut cursor = Cursor::new(data);
    let count = read_u32(&mut cursor)? as usize;

    let mut versions = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        let mut device = [0u8; 32];
        cursor.read_exact(&mut device)?;
        let version = decode_vector(&mut cursor)?;
        versions.push(FileVersion {
            device: DeviceId::from_raw(device),
            version,
        });
    }

    expect_consumed(&cursor)?;
    Ok(VersionList { versions })
}

fn encode_vector(buf: &mut Vec<u8>, v: &Vector) {
    buf.extend_from_slice(&(v.counters().len() as u32).to_be_bytes());
    buf.extend_from_slice(&v.encode());
}

fn decode_vector(cursor: &mut Cursor<&[u8]>) -> Result<Vector> {
    let count = read_u32(cursor)? as usize;
    let mut pairs = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        let id = read_u64(cursor)?;
        let value = read_u64(cursor)?;
        pairs.push((id, value));
    }
    Ok(Vector::from_pairs(&pairs))
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = read_u32(cursor)? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| eyre!("name is not valid UTF-8: {e}"))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut b = [0u8; 4];
    cursor.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let mut b = [0u8; 8];
    cursor.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

fn read_i64(cursor: &mut Cursor<&[u8]>) -> Result<i64> {
    let mut b = [0u8; 8];
    cursor.read_exact(&mut b)?;
    Ok(i64::from_be_bytes(b))
}

fn expect_consumed(cursor: &Cursor<&[u8]>) -> Result<()> {
    let len = cursor.get_ref().len() as u64;
    if cursor.position() != len {
        bail!(
            "{} trailing bytes after record",
            len - cursor.position()
        );
    }
    Ok(())
}
