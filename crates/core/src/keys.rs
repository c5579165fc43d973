//! Key codec
//!
//! Five key shapes share one ordered keyspace, discriminated by the first
//! byte. Fixed-width prefixes make prefix scans cheap: all records for a
//! (folder, device) pair share the first 1+64+32 bytes, all global records
//! for a folder share the first 1+64.
//!
//! ```text
//! DEVICE      = 0 · folder(64, NUL-pad) · device(32) · name(var)
//! GLOBAL      = 1 · folder(64, NUL-pad) · name(var)
//! BLOCK       = 2 · folder(64, NUL-pad) · hash(32) · name(var)
//! DEVICE_STAT = 3 · device(32)
//! FOLDER_STAT = 4 · folder(64, NUL-pad)
//! ```
//!
//! Layouts are bit-exact; an existing data directory must be readable by
//! any implementation of this format.

use color_eyre::Result;
use color_eyre::eyre::bail;

use crate::device::DeviceId;

pub const KEY_TYPE_DEVICE: u8 = 0;
pub const KEY_TYPE_GLOBAL: u8 = 1;
pub const KEY_TYPE_BLOCK: u8 = 2;
pub const KEY_TYPE_DEVICE_STAT: u8 = 3;
pub const KEY_TYPE_FOLDER_STAT: u8 = 4;

/// Width of the NUL-padded folder slot.
pub const FOLDER_SLOT_LEN: usize = 64;

/// Validate a folder identifier and return its fixed-width key slot.
///
/// # Errors
/// Returns an error if the identifier exceeds 64 bytes.
pub fn folder_slot(folder: &str) -> Result<[u8; FOLDER_SLOT_LEN]> {
    let bytes = folder.as_bytes();
    if bytes.len() > FOLDER_SLOT_LEN {
        bail!(
            "folder identifier {folder:?} exceeds {FOLDER_SLOT_LEN} bytes"
        );
    }
    let mut slot = [0u8; FOLDER_SLOT_LEN];
    slot[..bytes.len()].copy_from_slice(bytes);
    Ok(slot)
}

/// Trim the NUL padding off a folder slot.
#[must_use]
pub fn trim_folder_slot(slot: &[u8]) -> &[u8] {
    match slot.iter().position(|&b| b == 0) {
        Some(i) => &slot[..i],
        None => slot,
    }
}

/// Key for one device's record of one file.
#[must_use]
pub fn device_key(folder: &[u8; FOLDER_SLOT_LEN], device: &DeviceId, name: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + FOLDER_SLOT_LEN + 32 + name.len());
    k.push(KEY_TYPE_DEVICE);
    k.extend_from_slice(folder);
    k.extend_from_slice(device.as_bytes());
    k.extend_from_slice(name.as_bytes());
    k
}

/// Prefix of all records for a (folder, device) pair.
#[must_use]
pub fn device_key_prefix(folder: &[u8; FOLDER_SLOT_LEN], device: &DeviceId) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + FOLDER_SLOT_LEN + 32);
    k.push(KEY_TYPE_DEVICE);
    k.extend_from_slice(folder);
    k.extend_from_slice(device.as_bytes());
    k
}

/// Prefix of all device records for a folder, any device.
#[must_use]
pub fn device_folder_prefix(folder: &[u8; FOLDER_SLOT_LEN]) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + FOLDER_SLOT_LEN);
    k.push(KEY_TYPE_DEVICE);
    k.extend_from_slice(folder);
    k
}

/// The name component of a DEVICE key.
#[must_use]
pub fn device_key_name(key: &[u8]) -> &[u8] {
    &key[1 + FOLDER_SLOT_LEN + 32..]
}

/// The device component of a DEVICE key.
#[must_use]
pub fn device_key_device(key: &[u8]) -> Option<DeviceId> {
    DeviceId::from_bytes(&key[1 + FOLDER_SLOT_LEN..1 + FOLDER_SLOT_LEN + 32])
}

/// Key for the global version list of one file.
#[must_use]
pub fn global_key(folder: &[u8; FOLDER_SLOT_LEN], name: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + FOLDER_SLOT_LEN + name.len());
    k.push(KEY_TYPE_GLOBAL);
    k.extend_from_slice(folder);
    k.extend_from_slice(name.as_bytes());
    k
}

/// Prefix of all global records for a folder, optionally narrowed to a
/// name prefix.
#[must_use]
pub fn global_key_prefix(folder: &[u8; FOLDER_SLOT_LEN], name_prefix: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + FOLDER_SLOT_LEN + name_prefix.len());
    k.push(KEY_TYPE_GLOBAL);
    k.extend_from_slice(folder);
    k.extend_from_slice(name_prefix.as_bytes());
    k
}

/// The name component of a GLOBAL key.
#[must_use]
pub fn global_key_name(key: &[u8]) -> &[u8] {
    &key[1 + FOLDER_SLOT_LEN..]
}

/// Key for one block-map entry.
#[must_use]
pub fn block_key(folder: &[u8; FOLDER_SLOT_LEN], hash: &[u8; 32], name: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + FOLDER_SLOT_LEN + 32 + name.len());
    k.push(KEY_TYPE_BLOCK);
    k.extend_from_slice(folder);
    k.extend_from_slice(hash);
    k.extend_from_slice(name.as_bytes());
    k
}

/// Prefix of all block entries for a folder.
#[must_use]
pub fn block_folder_prefix(folder: &[u8; FOLDER_SLOT_LEN]) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + FOLDER_SLOT_LEN);
    k.push(KEY_TYPE_BLOCK);
    k.extend_from_slice(folder);
    k
}

/// Prefix of all block entries for a (folder, hash) pair.
#[must_use]
pub fn block_hash_prefix(folder: &[u8; FOLDER_SLOT_LEN], hash: &[u8; 32]) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + FOLDER_SLOT_LEN + 32);
    k.push(KEY_TYPE_BLOCK);
    k.extend_from_slice(folder);
    k.extend_from_slice(hash);
    k
}

/// The (hash, name) components of a BLOCK key.
#[must_use]
pub fn block_key_parts(key: &[u8]) -> (&[u8], &[u8]) {
    (
        &key[1 + FOLDER_SLOT_LEN..1 + FOLDER_SLOT_LEN + 32],
        &key[1 + FOLDER_SLOT_LEN + 32..],
    )
}

/// Key for a device's statistics record.
#[must_use]
pub fn device_stat_key(device: &DeviceId) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + 32);
    k.push(KEY_TYPE_DEVICE_STAT);
    k.extend_from_slice(device.as_bytes());
    k
}

/// Key for a folder's statistics record.
#[must_use]
pub fn folder_stat_key(folder: &[u8; FOLDER_SLOT_LEN]) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + FOLDER_SLOT_LEN);
    k.push(KEY_TYPE_FOLDER_STAT);
    k.extend_from_slice(folder);
    k
}
