use std::collections::BTreeMap;

use alloy_core::primitives::Address;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::abi::ArgValue;

/// Hex-encoded SHA-256 of everything that determines an artifact's creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for logs.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A facet as seen by the composite that cuts it in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetInput {
    pub name: String,
    pub address: Address,
    pub selectors: Vec<String>,
}

/// Inputs that, when changed, require a fresh deployment.
///
/// Bytecode is hashed after linking, so library addresses are covered twice:
/// through the code and through `libraries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintInput {
    pub name: String,
    pub kind: String,
    /// SHA-256 of the linked creation bytecode.
    pub bytecode_hash: String,
    pub constructor_args: Vec<ArgValue>,
    pub libraries: BTreeMap<String, Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composite: Option<CompositeInput>,
}

/// Composite-only inputs: owner, cut and initializer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeInput {
    pub owner: Address,
    pub facets: Vec<FacetInput>,
    pub init_method: String,
    pub init_args: Vec<ArgValue>,
}

impl FingerprintInput {
    /// Compute the fingerprint.
    ///
    /// Struct fields serialize in declaration order and maps are ordered, so
    /// the same inputs always hash to the same value.
    pub fn compute(&self) -> Fingerprint {
        let json = serde_json::to_vec(self).expect("FingerprintInput serialization should never fail");
        Fingerprint(hex::encode(Sha256::digest(&json)))
    }
}

/// SHA-256 of raw bytecode, hex-encoded.
pub fn bytecode_hash(bytecode: &[u8]) -> String {
    hex::encode(Sha256::digest(bytecode))
}
