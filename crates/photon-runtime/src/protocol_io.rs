//! Protocol document persistence.
//!
//! Documents are JSON and always read and written whole.  Saving writes a
//! sibling temp file, syncs it, then renames it over the target so a crash
//! never leaves a half-written protocol behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use photon_types::{PhotonError, Protocol};
use schemars::schema::RootSchema;
use tracing::{debug, info};

/// Read and parse a protocol document.  No validation is performed.
pub fn load_protocol(path: &Path) -> Result<Protocol, PhotonError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| PhotonError::Io(format!("{}: {e}", path.display())))?;
    let protocol: Protocol = serde_json::from_str(&raw)
        .map_err(|e| PhotonError::Serialization(format!("{}: {e}", path.display())))?;
    debug!(path = %path.display(), name = %protocol.protocol_name, "protocol loaded");
    Ok(protocol)
}

/// Atomically replace `path` with the serialised `protocol`.
pub fn save_protocol(path: &Path, protocol: &Protocol) -> Result<(), PhotonError> {
    let json = serde_json::to_string_pretty(protocol)
        .map_err(|e| PhotonError::Serialization(e.to_string()))?;

    replace_atomically(path, |file| {
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")
    })?;
    info!(path = %path.display(), name = %protocol.protocol_name, "protocol saved");
    Ok(())
}

/// JSON Schema of the protocol document.
pub fn protocol_schema() -> RootSchema {
    schemars::schema_for!(Protocol)
}

/// Fill a sibling temp file with `write`, sync it and rename it over
/// `path`.  The temp file is removed on every failure.
fn replace_atomically(
    path: &Path,
    write: impl FnOnce(&mut fs::File) -> std::io::Result<()>,
) -> Result<(), PhotonError> {
    let tmp = temp_path(path);
    let written = fs::File::create(&tmp).and_then(|mut file| {
        write(&mut file)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(PhotonError::Io(format!("{}: {e}", tmp.display())));
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(PhotonError::Io(format!("{}: {e}", path.display())));
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "protocol".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}
