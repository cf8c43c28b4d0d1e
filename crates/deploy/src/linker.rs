//! Binds deployed library addresses into creation bytecode.

use std::collections::{BTreeMap, HashMap};

use alloy_core::primitives::{Address, Bytes};

use crate::{error::ConfigurationError, source::CompiledArtifact};

/// Size of an address placeholder in bytes.
const ADDRESS_LENGTH: usize = 20;

/// Creation bytecode with every library reference replaced by an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedBytecode {
    pub bytecode: Bytes,
    /// The addresses linked in, keyed by library name.
    pub libraries: BTreeMap<String, Address>,
}

/// Link `compiled` against the addresses of its declared `dependencies`.
///
/// Every declared dependency must already have an address, and every link
/// reference in the bytecode must point at a declared dependency.
pub fn link(
    artifact: &str,
    compiled: &CompiledArtifact,
    dependencies: &[String],
    addresses: &HashMap<String, Address>,
) -> Result<LinkedBytecode, ConfigurationError> {
    let unresolved = |dependency: &str| ConfigurationError::UnresolvedDependency {
        artifact: artifact.to_string(),
        dependency: dependency.to_string(),
    };

    let libraries = dependencies
        .iter()
        .map(|dependency| {
            addresses
                .get(dependency)
                .map(|address| (dependency.clone(), *address))
                .ok_or_else(|| unresolved(dependency))
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    let unlinked = |reason: String| ConfigurationError::UnlinkedBytecode {
        artifact: artifact.to_string(),
        reason,
    };

    let mut code = compiled
        .bytecode
        .strip_prefix("0x")
        .unwrap_or(&compiled.bytecode)
        .to_string();

    for reference in &compiled.link_references {
        let address = libraries
            .get(&reference.library)
            .ok_or_else(|| unresolved(&reference.library))?;

        if reference.length != ADDRESS_LENGTH {
            return Err(unlinked(format!(
                "reference to `{}` spans {} bytes",
                reference.library, reference.length
            )));
        }

        let start = reference.start * 2;
        let end = start + ADDRESS_LENGTH * 2;
        if end > code.len() || !code.is_char_boundary(start) || !code.is_char_boundary(end) {
            return Err(unlinked(format!(
                "reference to `{}` at byte {} is out of bounds",
                reference.library, reference.start
            )));
        }

        code.replace_range(start..end, &hex::encode(address));
    }

    let bytecode = hex::decode(&code).map_err(|e| match code.find("__$") {
        Some(position) => unlinked(format!("placeholder left at byte {}", position / 2)),
        None => unlinked(e.to_string()),
    })?;

    tracing::trace!(artifact, libraries = libraries.len(), "Bytecode linked");

    Ok(LinkedBytecode {
        bytecode: bytecode.into(),
        libraries,
    })
}
