//! Snapshot layer: deterministic projection snapshots.
//!
//! Snapshots contain the canonical JSON and its hash. No wall-clock
//! timestamps go into snapshot content, so the same log always produces
//! byte-identical snapshots. A snapshot is a check on replay, never a
//! substitute for it: if its hash disagrees with a replay of the same
//! prefix, the replay wins.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use som_engine::hashing::{canonical_hash, canonical_serialize, sha256_hex};
use som_engine::state::Projection;
use som_engine::KERNEL_VERSION;

use crate::error::{Result, RuntimeError};

/// Snapshot on-disk format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last event folded into this snapshot.
    pub sequence: u64,
    /// Canonical JSON of the projection (UTF-8).
    pub canonical_json: String,
    /// SHA-256 of the canonical JSON.
    pub hash: String,
    pub kernel_version: u32,
}

fn snapshot_path(dir: &Path, sequence: u64) -> PathBuf {
    dir.join(format!("snapshot_{:06}.json", sequence))
}

/// Save a snapshot of `state` taken after event `sequence`.
pub fn save_snapshot(dir: &Path, sequence: u64, state: &Projection) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let canonical_json = String::from_utf8(canonical_serialize(state))
        .map_err(|e| RuntimeError::CorruptLog(format!("canonical form is not UTF-8: {}", e)))?;
    let snap = Snapshot {
        sequence,
        canonical_json,
        hash: canonical_hash(state),
        kernel_version: KERNEL_VERSION,
    };

    let path = snapshot_path(dir, sequence);
    let content = serde_json::to_string(&snap)?;
    let mut file = File::create(&path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;

    tracing::info!(sequence, hash = %snap.hash, path = %path.display(), "snapshot written");
    Ok(path)
}

/// Load the snapshot taken at `sequence`, if any.
pub fn load_snapshot(dir: &Path, sequence: u64) -> Result<Option<Snapshot>> {
    let path = snapshot_path(dir, sequence);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Load the snapshot with the highest sequence number in `dir`.
pub fn load_latest_snapshot(dir: &Path) -> Result<Option<Snapshot>> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut best_seq: Option<u64> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let seq = name
            .to_string_lossy()
            .strip_prefix("snapshot_")
            .and_then(|s| s.strip_suffix(".json"))
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(seq) = seq {
            best_seq = Some(best_seq.map_or(seq, |best| best.max(seq)));
        }
    }

    match best_seq {
        Some(seq) => load_snapshot(dir, seq),
        None => Ok(None),
    }
}

/// True when the stored hash matches the stored canonical JSON.
pub fn verify_snapshot_hash(snap: &Snapshot) -> bool {
    sha256_hex(snap.canonical_json.as_bytes()) == snap.hash
}
