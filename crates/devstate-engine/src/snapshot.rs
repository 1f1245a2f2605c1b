//! Export/import artifacts.
//!
//! A snapshot is two JSON documents under the export root: `state.json`
//! holds the state document and `history.json` holds `{entries: [...]}`,
//! plus `archived: [...]` when part of the ledger has been archived.
//! Each file is written to a temporary file in the same directory and
//! renamed into place, so readers never see a half-written artifact.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use devstate_core::{HistoryEntry, StateDocument};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{EngineError, Result};

pub const STATE_FILE: &str = "state.json";
pub const HISTORY_FILE: &str = "history.json";

/// The history artifact.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistorySnapshot {
    /// Archived entries, oldest first. They precede `entries` in the chain.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archived: Vec<HistoryEntry>,
    /// Live entries, oldest first.
    pub entries: Vec<HistoryEntry>,
}

/// State and ledger exported together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub state: StateDocument,
    pub history: HistorySnapshot,
}

/// Where an export was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportPaths {
    pub state: PathBuf,
    pub history: PathBuf,
}

/// Write both artifacts under `root`, creating it if needed.
pub fn write_bundle(root: &Path, bundle: &ExportBundle) -> Result<ExportPaths> {
    fs::create_dir_all(root)?;
    Ok(ExportPaths {
        state: write_atomic(root, STATE_FILE, &bundle.state)?,
        history: write_atomic(root, HISTORY_FILE, &bundle.history)?,
    })
}

/// Read both artifacts from `root`.
pub fn read_bundle(root: &Path) -> Result<ExportBundle> {
    Ok(ExportBundle {
        state: read_json(&root.join(STATE_FILE))?,
        history: read_json(&root.join(HISTORY_FILE))?,
    })
}

fn write_atomic<T: Serialize>(root: &Path, name: &str, value: &T) -> Result<PathBuf> {
    let path = root.join(name);
    let mut tmp = NamedTempFile::new_in(root)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(&path).map_err(|e| e.error)?;
    Ok(path)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => {
            EngineError::NotFound(format!("snapshot artifact {}", path.display()))
        }
        _ => EngineError::Io(e),
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}
