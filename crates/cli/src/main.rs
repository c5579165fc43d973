//! findex: inspect and verify index data directories
//!
//! `findex check` walks a data directory read-only and asserts the
//! structural invariants the engine relies on: non-empty version lists,
//! heads backed by device records, and a block index consistent with the
//! local device's records. `findex dump` prints every record labeled by
//! key type.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, builder::Styles};
use color_eyre::Result;
use tracing::debug;

use findex_core::device::DeviceId;
use findex_core::file::{FileInfo, VersionList};
use findex_core::keys::{
    self, KEY_TYPE_BLOCK, KEY_TYPE_DEVICE, KEY_TYPE_DEVICE_STAT, KEY_TYPE_FOLDER_STAT,
    KEY_TYPE_GLOBAL,
};
use findex_core::store::Store;
use findex_core::version::Vector;
use findex_core::wire;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "findex")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Inspect and verify findex data directories")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the structural invariants of a data directory
    Check {
        /// Path to the data directory
        db: PathBuf,
    },

    /// Print every record in a data directory
    Dump {
        /// Path to the data directory
        db: PathBuf,
    },
}

fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Check { db } => check_command(&db),
        Commands::Dump { db } => {
            dump_command(&db)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// One device's decoded record, as needed by the checks.
struct DeviceRecord {
    device: DeviceId,
    file: FileInfo,
}

fn check_command(db: &PathBuf) -> Result<ExitCode> {
    let store = Store::open_read_only(db)?;
    let rtxn = store.read_txn()?;

    // First pass: collect everything. The checker trades memory for the
    // ability to verify references in both directions.
    let mut records: HashMap<(Vec<u8>, Vec<u8>), Vec<DeviceRecord>> = HashMap::new();
    let mut globals: Vec<(Vec<u8>, Vec<u8>, VersionList)> = Vec::new();
    let mut block_entries: Vec<(Vec<u8>, [u8; 32], Vec<u8>, u32)> = Vec::new();
    let mut errors = 0usize;

    for item in store.iter(&rtxn)? {
        let (key, value) = item?;
        if key.is_empty() {
            println!("*** empty key");
            errors += 1;
            continue;
        }
        match key[0] {
            KEY_TYPE_DEVICE => {
                if key.len() < 1 + keys::FOLDER_SLOT_LEN + 32 {
                    println!("*** short device key: {}", hex::encode(key));
                    errors += 1;
                    continue;
                }
                let folder = keys::trim_folder_slot(&key[1..1 + keys::FOLDER_SLOT_LEN]).to_vec();
                let Some(device) = keys::device_key_device(key) else {
                    println!("*** malformed device key: {}", hex::encode(key));
                    errors += 1;
                    continue;
                };
                let name = keys::device_key_name(key).to_vec();
                match wire::decode_file_info(value) {
                    Ok(file) => {
                        records
                            .entry((folder, name))
                            .or_default()
                            .push(DeviceRecord { device, file });
                    }
                    Err(err) => {
                        println!(
                            "*** undecodable device record {}/{}: {err}",
                            String::from_utf8_lossy(&folder),
                            String::from_utf8_lossy(&name),
                        );
                        errors += 1;
                    }
                }
            }
            KEY_TYPE_GLOBAL => {
                if key.len() < 1 + keys::FOLDER_SLOT_LEN {
                    println!("*** short global key: {}", hex::encode(key));
                    errors += 1;
                    continue;
                }
                let folder = keys::trim_folder_slot(&key[1..1 + keys::FOLDER_SLOT_LEN]).to_vec();
                let name = keys::global_key_name(key).to_vec();
                match wire::decode_version_list(value) {
                    Ok(vl) => globals.push((folder, name, vl)),
                    Err(err) => {
                        println!(
                            "*** undecodable version list {}/{}: {err}",
                            String::from_utf8_lossy(&folder),
                            String::from_utf8_lossy(&name),
                        );
                        errors += 1;
                    }
                }
            }
            KEY_TYPE_BLOCK => {
                if key.len() < 1 + keys::FOLDER_SLOT_LEN + 32 {
                    println!("*** short block key: {}", hex::encode(key));
                    errors += 1;
                    continue;
                }
                let folder = keys::trim_folder_slot(&key[1..1 + keys::FOLDER_SLOT_LEN]).to_vec();
                let (hash, name) = keys::block_key_parts(key);
                let hash: [u8; 32] = match hash.try_into() {
                    Ok(h) => h,
                    Err(_) => {
                        println!("*** malformed block key: {}", hex::encode(key));
                        errors += 1;
                        continue;
                    }
                };
                let index: [u8; 4] = match value.try_into() {
                    Ok(i) => i,
                    Err(_) => {
                        println!("*** block entry value is not 4 bytes: {}", hex::encode(key));
                        errors += 1;
                        continue;
                    }
                };
                block_entries.push((folder, hash, name.to_vec(), u32::from_be_bytes(index)));
            }
            KEY_TYPE_DEVICE_STAT | KEY_TYPE_FOLDER_STAT => {}
            other => {
                println!("*** unknown key type {other}: {}", hex::encode(key));
                errors += 1;
            }
        }
    }
    drop(rtxn);

    println!(
        "Checking {} names, {} globals, {} block entries...",
        records.len(),
        globals.len(),
        block_entries.len()
    );

    errors += check_globals(&records, &globals);
    errors += check_blocks(&records, &block_entries);

    if errors > 0 {
        println!("{errors} errors found");
        return Ok(ExitCode::FAILURE);
    }
    println!("OK");
    Ok(ExitCode::SUCCESS)
}

/// Every version list must be non-empty, every entry backed by a device
/// record at the same name, the head with an equal version. Conversely
/// every non-invalid device record must appear in its name's list.
fn check_globals(
    records: &HashMap<(Vec<u8>, Vec<u8>), Vec<DeviceRecord>>,
    globals: &[(Vec<u8>, Vec<u8>, VersionList)],
) -> usize {
    let mut errors = 0;

    for (folder, name, vl) in globals {
        let label = format!(
            "{}/{}",
            String::from_utf8_lossy(folder),
            String::from_utf8_lossy(name)
        );
        if vl.versions.is_empty() {
            println!("*** empty version list for {label}");
            errors += 1;
            continue;
        }

        let backing = records.get(&(folder.clone(), name.clone()));
        for (i, fv) in vl.versions.iter().enumerate() {
            let record = backing.and_then(|rs| rs.iter().find(|r| r.device == fv.device));
            match record {
                None => {
                    println!(
                        "*** version list entry for {label} has no record on device {}",
                        fv.device
                    );
                    errors += 1;
                }
                Some(r) if i == 0 && !r.file.version.equal(&fv.version) => {
                    println!(
                        "*** head of {label} disagrees with record on device {}",
                        fv.device
                    );
                    errors += 1;
                }
                Some(_) => {}
            }
        }
    }

    // Reverse direction.
    for ((folder, name), rs) in records {
        let label = format!(
            "{}/{}",
            String::from_utf8_lossy(folder),
            String::from_utf8_lossy(name)
        );
        for r in rs {
            if r.file.is_invalid() {
                continue;
            }
            let listed = globals.iter().any(|(f, n, vl)| {
                f == folder && n == name && vl.versions.iter().any(|fv| fv.device == r.device)
            });
            if !listed {
                println!(
                    "*** record {label} on device {} is missing from its version list",
                    r.device
                );
                errors += 1;
            }
        }
    }

    errors
}

/// The block index and the local device's records must agree in both
/// directions.
fn check_blocks(
    records: &HashMap<(Vec<u8>, Vec<u8>), Vec<DeviceRecord>>,
    block_entries: &[(Vec<u8>, [u8; 32], Vec<u8>, u32)],
) -> usize {
    let mut errors = 0;

    let mut indexed: HashMap<(&[u8], &[u8]), Vec<(&[u8; 32], u32)>> = HashMap::new();
    for (folder, hash, name, index) in block_entries {
        indexed
            .entry((folder.as_slice(), name.as_slice()))
            .or_default()
            .push((hash, *index));
    }

    for ((folder, name), rs) in records {
        let Some(local) = rs.iter().find(|r| r.device == DeviceId::LOCAL) else {
            continue;
        };
        if local.file.is_deleted() || local.file.is_invalid() || local.file.is_directory() {
            continue;
        }
        let label = format!(
            "{}/{}",
            String::from_utf8_lossy(folder),
            String::from_utf8_lossy(name)
        );
        let entries = indexed.get(&(folder.as_slice(), name.as_slice()));
        for (i, block) in local.file.blocks.iter().enumerate() {
            let present = entries.is_some_and(|es| {
                es.iter()
                    .any(|(h, idx)| **h == block.hash && *idx as usize == i)
            });
            if !present {
                println!("*** block {i} of {label} is missing from the block index");
                errors += 1;
            }
        }
    }

    for (folder, hash, name, index) in block_entries {
        let label = format!(
            "{}/{}",
            String::from_utf8_lossy(folder),
            String::from_utf8_lossy(name)
        );
        let local = records
            .get(&(folder.clone(), name.clone()))
            .and_then(|rs| rs.iter().find(|r| r.device == DeviceId::LOCAL));
        let Some(local) = local else {
            println!("*** block entry {label} references no local record");
            errors += 1;
            continue;
        };
        let matches = local
            .file
            .blocks
            .get(*index as usize)
            .is_some_and(|b| b.hash == *hash);
        if !matches {
            println!(
                "*** block entry {label}@{index} does not match the record ({})",
                hex::encode(hash)
            );
            errors += 1;
        }
    }

    errors
}

fn dump_command(db: &PathBuf) -> Result<()> {
    let store = Store::open_read_only(db)?;
    let rtxn = store.read_txn()?;

    for item in store.iter(&rtxn)? {
        let (key, value) = item?;
        if key.is_empty() {
            println!("[???] empty key");
            continue;
        }
        match key[0] {
            KEY_TYPE_DEVICE if key.len() >= 1 + keys::FOLDER_SLOT_LEN + 32 => {
                let folder = keys::trim_folder_slot(&key[1..1 + keys::FOLDER_SLOT_LEN]);
                let device = keys::device_key_device(key)
                    .map_or_else(|| "??".to_owned(), |d| d.to_string());
                let name = keys::device_key_name(key);
                match wire::decode_file_info(value) {
                    Ok(f) => println!(
                        "[device] F:{:?} D:{} N:{:?} flags:0{:o} modified:{} version:{} lver:{} size:{} blocks:{}",
                        String::from_utf8_lossy(folder),
                        device,
                        String::from_utf8_lossy(name),
                        f.flags,
                        f.modified,
                        format_vector(&f.version),
                        f.local_version,
                        f.size(),
                        f.blocks.len(),
                    ),
                    Err(err) => println!("[device] undecodable: {err}"),
                }
            }
            KEY_TYPE_GLOBAL if key.len() >= 1 + keys::FOLDER_SLOT_LEN => {
                let folder = keys::trim_folder_slot(&key[1..1 + keys::FOLDER_SLOT_LEN]);
                let name = keys::global_key_name(key);
                match wire::decode_version_list(value) {
                    Ok(vl) => {
                        println!(
                            "[global] F:{:?} N:{:?} entries:{}",
                            String::from_utf8_lossy(folder),
                            String::from_utf8_lossy(name),
                            vl.versions.len(),
                        );
                        for fv in &vl.versions {
                            println!("  D:{} V:{}", fv.device, format_vector(&fv.version));
                        }
                    }
                    Err(err) => println!("[global] undecodable: {err}"),
                }
            }
            KEY_TYPE_BLOCK if key.len() >= 1 + keys::FOLDER_SLOT_LEN + 32 => {
                let folder = keys::trim_folder_slot(&key[1..1 + keys::FOLDER_SLOT_LEN]);
                let (hash, name) = keys::block_key_parts(key);
                let index = value
                    .try_into()
                    .map(u32::from_be_bytes)
                    .unwrap_or(u32::MAX);
                println!(
                    "[block] F:{:?} H:{} N:{:?} I:{}",
                    String::from_utf8_lossy(folder),
                    hex::encode(hash),
                    String::from_utf8_lossy(name),
                    index,
                );
            }
            KEY_TYPE_DEVICE_STAT => {
                println!("[dstat] {} = {}", hex::encode(key), hex::encode(value));
            }
            KEY_TYPE_FOLDER_STAT => {
                println!("[fstat] {} = {}", hex::encode(key), hex::encode(value));
            }
            other => {
                debug!("unknown key type {other}");
                println!("[???] {} = {}", hex::encode(key), hex::encode(value));
            }
        }
    }

    Ok(())
}

fn format_vector(v: &Vector) -> String {
    let pairs: Vec<String> = v
        .counters()
        .iter()
        .map(|c| format!("{:x}:{}", c.id, c.value))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}
