//! Compiled artifact sources.
//!
//! The orchestrator never compiles anything: it asks an [`ArtifactSource`]
//! for the ABI and the (possibly unlinked) creation bytecode of each declared
//! artifact.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use alloy_core::json_abi::JsonAbi;
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading compiled artifacts.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no compiled artifact named `{name}`")]
    NotFound { name: String },

    #[error("failed to read artifact `{name}` from {path}")]
    Io {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse artifact `{name}` from {path}")]
    Parse {
        name: String,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl SourceError {
    pub(crate) fn artifact(&self) -> &str {
        match self {
            Self::NotFound { name } | Self::Io { name, .. } | Self::Parse { name, .. } => name,
        }
    }
}

/// A location in the creation bytecode where a library address must be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkReference {
    /// Name of the library whose address goes here.
    pub library: String,
    /// Byte offset in the creation bytecode.
    pub start: usize,
    /// Length of the placeholder in bytes, 20 for an address.
    pub length: usize,
}

/// ABI and creation bytecode of a compiled contract.
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub name: String,
    pub abi: JsonAbi,
    /// `0x`-prefixed creation bytecode. Placeholders at the link references
    /// are not valid hex until linked.
    pub bytecode: String,
    pub link_references: Vec<LinkReference>,
}

/// Provides compiled artifacts by name.
pub trait ArtifactSource: Send + Sync {
    fn load(&self, name: &str) -> Result<CompiledArtifact, SourceError>;
}

/// Offsets of one library inside a hardhat artifact.
#[derive(Debug, Deserialize)]
struct LinkOffset {
    start: usize,
    length: usize,
}

/// On-disk hardhat artifact (`artifacts/contracts/<File>.sol/<Name>.json`).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HardhatArtifactFile {
    contract_name: String,
    abi: JsonAbi,
    bytecode: String,
    #[serde(default)]
    link_references: BTreeMap<String, BTreeMap<String, Vec<LinkOffset>>>,
}

impl HardhatArtifactFile {
    fn into_compiled(self) -> CompiledArtifact {
        let link_references = self
            .link_references
            .into_values()
            .flat_map(|libraries| libraries.into_iter())
            .flat_map(|(library, offsets)| {
                offsets.into_iter().map(move |offset| LinkReference {
                    library: library.clone(),
                    start: offset.start,
                    length: offset.length,
                })
            })
            .collect();

        CompiledArtifact {
            name: self.contract_name,
            abi: self.abi,
            bytecode: self.bytecode,
            link_references,
        }
    }
}

/// Reads hardhat compilation output from an `artifacts/` directory.
#[derive(Debug, Clone)]
pub struct HardhatArtifacts {
    index: HashMap<String, PathBuf>,
}

impl HardhatArtifacts {
    /// Index every `<Name>.json` artifact below `root`, skipping debug files
    /// and build-info.
    pub fn open(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut index = HashMap::new();
        Self::walk(root.as_ref(), &mut index)?;
        tracing::debug!(root = %root.as_ref().display(), artifacts = index.len(), "Indexed compiled artifacts");
        Ok(Self { index })
    }

    fn walk(dir: &Path, index: &mut HashMap<String, PathBuf>) -> anyhow::Result<()> {
        use anyhow::Context;

        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read artifacts directory {}", dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                if path.file_name().is_some_and(|name| name == "build-info") {
                    continue;
                }
                Self::walk(&path, index)?;
                continue;
            }

            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if file_name.ends_with(".dbg.json") {
                continue;
            }
            if let Some(name) = file_name.strip_suffix(".json") {
                if let Some(previous) = index.insert(name.to_string(), path.clone()) {
                    tracing::warn!(
                        name,
                        kept = %path.display(),
                        shadowed = %previous.display(),
                        "Several artifacts share a name"
                    );
                }
            }
        }

        Ok(())
    }
}

impl ArtifactSource for HardhatArtifacts {
    fn load(&self, name: &str) -> Result<CompiledArtifact, SourceError> {
        let path = self.index.get(name).ok_or_else(|| SourceError::NotFound {
            name: name.to_string(),
        })?;

        let content = std::fs::read_to_string(path).map_err(|source| SourceError::Io {
            name: name.to_string(),
            path: path.clone(),
            source,
        })?;

        let file: HardhatArtifactFile =
            serde_json::from_str(&content).map_err(|source| SourceError::Parse {
                name: name.to_string(),
                path: path.clone(),
                source,
            })?;

        Ok(file.into_compiled())
    }
}

/// Artifacts held in memory, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    artifacts: HashMap<String, CompiledArtifact>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an artifact.
    pub fn insert(&mut self, artifact: CompiledArtifact) -> &mut Self {
        self.artifacts.insert(artifact.name.clone(), artifact);
        self
    }
}

impl ArtifactSource for MemorySource {
    fn load(&self, name: &str) -> Result<CompiledArtifact, SourceError> {
        self.artifacts
            .get(name)
            .cloned()
            .ok_or_else(|| SourceError::NotFound {
                name: name.to_string(),
            })
    }
}
