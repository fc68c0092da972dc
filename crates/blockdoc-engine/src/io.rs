use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::block::{BlockId, BlockRecord};

#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse document {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize document: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// On-disk form of one document: its root identity plus the flat block map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentFile {
    pub id: BlockId,
    #[serde(default)]
    pub blocks: BTreeMap<BlockId, BlockRecord>,
}

impl DocumentFile {
    pub fn new(id: impl Into<BlockId>, blocks: HashMap<BlockId, BlockRecord>) -> Self {
        Self {
            id: id.into(),
            blocks: blocks.into_iter().collect(),
        }
    }

    /// Block map in the shape [`crate::BlockChain::rebuild`] expects
    pub fn into_parts(self) -> (BlockId, HashMap<BlockId, BlockRecord>) {
        (self.id, self.blocks.into_iter().collect())
    }
}

/// Read a document file
pub fn load_document(path: &Path) -> Result<DocumentFile, IoError> {
    if !path.exists() {
        return Err(IoError::NotFound(path.to_path_buf()));
    }
    let text = fs::read_to_string(path)?;
    toml::from_str(&text).map_err(|source| IoError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a document file, creating parent directories as needed
pub fn save_document(path: &Path, document: &DocumentFile) -> Result<(), IoError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = toml::to_string_pretty(document)?;
    fs::write(path, text)?;
    log::info!("saved document {} to {}", document.id, path.display());
    Ok(())
}
