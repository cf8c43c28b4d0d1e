//! Error taxonomy for deployment runs.
//!
//! Failures fall into four families: configuration problems detected before
//! anything is submitted, submission failures, confirmation timeouts (the only
//! retryable case), and partially initialized composites.

use alloy_core::primitives::{Address, B256};
use thiserror::Error;

use crate::{registry::RegistryError, source::SourceError};

/// The stage of the pipeline at which a failure surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum DeployStage {
    /// Reading declarations, resolving the plan and preflight checks.
    Plan,
    /// Binding library addresses into bytecode.
    Link,
    /// Handing the creation transaction to the chain.
    Submit,
    /// Waiting for the creation transaction to be mined.
    Confirm,
    /// Running the composite's one-shot initializer.
    Initialize,
    /// Reading or writing the deployment registry.
    Registry,
}

/// Fatal configuration problems. None of these are retried and all of them are
/// detected before the affected artifact is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("artifact `{artifact}` depends on undeclared artifact `{dependency}`")]
    MissingDependency { artifact: String, dependency: String },

    #[error("artifact `{name}` is declared more than once")]
    DuplicateArtifact { name: String },

    #[error("composite `{composite}` references undeclared facet `{facet}`")]
    UnknownFacet { composite: String, facet: String },

    #[error("composite `{composite}` lists `{artifact}` as a facet but it is declared as a {kind}")]
    NotAFacet {
        composite: String,
        artifact: String,
        kind: String,
    },

    #[error("composite `{composite}` has no facets")]
    EmptyComposite { composite: String },

    #[error("facet `{facet}` is listed more than once in composite `{composite}`")]
    DuplicateFacet { composite: String, facet: String },

    #[error("selector {selector} of facet `{facet}` is already provided by facet `{owner}`")]
    DuplicateSelector {
        facet: String,
        owner: String,
        selector: String,
    },

    #[error("no facet of composite `{composite}` declares `{method}` taking {arity} argument(s)")]
    MissingInitMethod {
        composite: String,
        method: String,
        arity: usize,
    },

    #[error("invalid arguments for `{artifact}`: {reason}")]
    ArgumentMismatch { artifact: String, reason: String },

    #[error("artifact `{artifact}` needs `{dependency}` linked but it has no address yet")]
    UnresolvedDependency { artifact: String, dependency: String },

    #[error("bytecode of `{artifact}` is not fully linked: {reason}")]
    UnlinkedBytecode { artifact: String, reason: String },

    #[error("invalid validator set: {reason}")]
    InvalidValidatorSet { reason: String },

    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: String, reason: String },
}

/// Errors produced while deploying a plan.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The chain refused the creation transaction before it was mined.
    #[error("submission of `{artifact}` failed: {reason}")]
    Submission { artifact: String, reason: String },

    /// The creation transaction was mined but reverted.
    #[error("creation of `{artifact}` reverted: {reason}")]
    TransactionReverted { artifact: String, reason: String },

    /// The outcome of the creation transaction is unknown. Calling deploy again
    /// with the same fingerprint re-attaches to `tx_hash`.
    #[error("timed out waiting for `{artifact}` (tx {tx_hash}) to confirm")]
    ConfirmationTimeout { artifact: String, tx_hash: B256 },

    /// The composite exists on chain but its initializer did not succeed.
    /// Requires operator intervention.
    #[error("composite `{artifact}` was created at {address} but initialization failed: {reason}")]
    PartialInitialization {
        artifact: String,
        address: Address,
        reason: String,
    },
}

impl DeployError {
    /// Only a confirmation timeout may be retried, by re-attaching.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConfirmationTimeout { .. })
    }

    /// The pipeline stage this error belongs to.
    pub fn stage(&self) -> DeployStage {
        match self {
            Self::Configuration(
                ConfigurationError::UnresolvedDependency { .. }
                | ConfigurationError::UnlinkedBytecode { .. },
            ) => DeployStage::Link,
            Self::Configuration(_) | Self::Source(_) => DeployStage::Plan,
            Self::Registry(_) => DeployStage::Registry,
            Self::Submission { .. } => DeployStage::Submit,
            Self::TransactionReverted { .. } | Self::ConfirmationTimeout { .. } => {
                DeployStage::Confirm
            }
            Self::PartialInitialization { .. } => DeployStage::Initialize,
        }
    }

    /// The artifact the failure is attributed to, when there is one.
    pub fn artifact(&self) -> Option<&str> {
        match self {
            Self::Submission { artifact, .. }
            | Self::TransactionReverted { artifact, .. }
            | Self::ConfirmationTimeout { artifact, .. }
            | Self::PartialInitialization { artifact, .. } => Some(artifact),
            Self::Configuration(err) => err.artifact(),
            Self::Source(err) => Some(err.artifact()),
            Self::Registry(_) => None,
        }
    }
}

impl ConfigurationError {
    fn artifact(&self) -> Option<&str> {
        match self {
            Self::CyclicDependency { cycle } => cycle.first().map(String::as_str),
            Self::MissingDependency { artifact, .. }
            | Self::ArgumentMismatch { artifact, .. }
            | Self::UnresolvedDependency { artifact, .. }
            | Self::UnlinkedBytecode { artifact, .. } => Some(artifact),
            Self::DuplicateArtifact { name } => Some(name),
            Self::UnknownFacet { composite, .. }
            | Self::NotAFacet { composite, .. }
            | Self::EmptyComposite { composite }
            | Self::DuplicateFacet { composite, .. }
            | Self::MissingInitMethod { composite, .. } => Some(composite),
            Self::DuplicateSelector { facet, .. } => Some(facet),
            Self::InvalidValidatorSet { .. } | Self::InvalidField { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeouts_are_retryable() {
        let timeout = DeployError::ConfirmationTimeout {
            artifact: "Merkle".to_string(),
            tx_hash: B256::ZERO,
        };
        let reverted = DeployError::TransactionReverted {
            artifact: "Merkle".to_string(),
            reason: "status 0x0".to_string(),
        };
        let partial = DeployError::PartialInitialization {
            artifact: "Rollups".to_string(),
            address: Address::ZERO,
            reason: "init reverted".to_string(),
        };

        assert!(timeout.is_retryable());
        assert!(!reverted.is_retryable());
        assert!(!partial.is_retryable());
    }

    #[test]
    fn test_stage_and_artifact_attribution() {
        let err = DeployError::from(ConfigurationError::UnresolvedDependency {
            artifact: "Merkle".to_string(),
            dependency: "CartesiMath".to_string(),
        });
        assert_eq!(err.stage(), DeployStage::Link);
        assert_eq!(err.artifact(), Some("Merkle"));

        let err = DeployError::from(ConfigurationError::CyclicDependency {
            cycle: vec!["A".to_string(), "B".to_string(), "A".to_string()],
        });
        assert_eq!(err.stage(), DeployStage::Plan);
        assert_eq!(err.to_string(), "cyclic dependency: A -> B -> A");
    }
}
