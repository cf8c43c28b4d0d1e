//! Single-artifact deployment.
//!
//! [`ArtifactDeployer::deploy`] is idempotent per fingerprint: a confirmed
//! registry entry is reused, a recorded submission is re-attached to, and a
//! new creation is only submitted when neither exists.

use std::{collections::HashMap, time::Duration};

use alloy_core::primitives::{Address, B256, Bytes};

use crate::{
    abi::encode_constructor_args,
    artifact::Artifact,
    chain::{ChainClient, ChainError, CreationReceipt, CreationRequest, InitOutcome},
    error::{ConfigurationError, DeployError},
    fingerprint::{Fingerprint, FingerprintInput, bytecode_hash},
    init::InitCall,
    linker::link,
    registry::{InitRecord, InitState, PendingSubmission, Registry, RegistryEntry, now},
    source::CompiledArtifact,
};

/// Everything needed to create one artifact: the payload sent to the chain
/// and the fingerprint it is recorded under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedDeployment {
    pub artifact: String,
    pub kind: &'static str,
    /// Linked creation bytecode followed by the encoded constructor arguments.
    pub payload: Bytes,
    pub fingerprint: Fingerprint,
    /// Initializer folded into the creation, for composites.
    pub init: Option<InitCall>,
}

impl PreparedDeployment {
    /// Prepare a library or facet: link, encode constructor arguments and
    /// fingerprint the result.
    pub fn standalone(
        artifact: &Artifact,
        compiled: &CompiledArtifact,
        addresses: &HashMap<String, Address>,
    ) -> Result<Self, ConfigurationError> {
        let linked = link(
            &artifact.name,
            compiled,
            &artifact.library_dependencies,
            addresses,
        )?;

        let args = encode_constructor_args(&compiled.abi, &artifact.constructor_args).map_err(
            |reason| ConfigurationError::ArgumentMismatch {
                artifact: artifact.name.clone(),
                reason,
            },
        )?;

        let fingerprint = FingerprintInput {
            name: artifact.name.clone(),
            kind: artifact.kind.label().to_string(),
            bytecode_hash: bytecode_hash(&linked.bytecode),
            constructor_args: artifact.constructor_args.clone(),
            libraries: linked.libraries,
            composite: None,
        }
        .compute();

        let mut payload = linked.bytecode.to_vec();
        payload.extend(args);

        Ok(Self {
            artifact: artifact.name.clone(),
            kind: artifact.kind.label(),
            payload: payload.into(),
            fingerprint,
            init: None,
        })
    }
}

/// Result of deploying one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedArtifact {
    pub entry: RegistryEntry,
    /// Whether the entry was already in the registry.
    pub reused: bool,
    /// Initialization record, for composites.
    pub init: Option<InitRecord>,
}

impl DeployedArtifact {
    pub fn address(&self) -> Address {
        self.entry.address
    }
}

/// Deploys prepared artifacts against a chain, recording every step in a
/// registry.
#[derive(Debug)]
pub struct ArtifactDeployer<'a, C, R> {
    chain: &'a C,
    registry: &'a R,
    confirmation_timeout: Duration,
}

impl<'a, C: ChainClient, R: Registry> ArtifactDeployer<'a, C, R> {
    pub fn new(chain: &'a C, registry: &'a R, confirmation_timeout: Duration) -> Self {
        Self {
            chain,
            registry,
            confirmation_timeout,
        }
    }

    /// Deploy one artifact, or return its existing deployment.
    ///
    /// Deploying the same fingerprint twice yields the same address and
    /// submits at most one confirmed creation.
    pub async fn deploy(&self, prepared: &PreparedDeployment) -> Result<DeployedArtifact, DeployError> {
        let name = prepared.artifact.as_str();

        if let Some(entry) = self.registry.lookup(name, &prepared.fingerprint)? {
            let init = self.recorded_init(prepared, &entry)?;
            tracing::info!(
                artifact = name,
                address = %entry.address,
                fingerprint = %prepared.fingerprint.short(),
                "Already deployed, reusing"
            );
            return Ok(DeployedArtifact {
                entry,
                reused: true,
                init,
            });
        }

        let mut pending = self.registry.pending(name, &prepared.fingerprint)?;

        loop {
            let (tx_hash, reattached) = match pending.take() {
                Some(pending) => {
                    tracing::info!(
                        artifact = name,
                        tx = %pending.tx_hash,
                        "Re-attaching to pending submission"
                    );
                    (pending.tx_hash, true)
                }
                None => (self.submit(prepared).await?, false),
            };

            let waited = self
                .chain
                .wait_for_receipt(tx_hash, prepared.init.is_some(), self.confirmation_timeout)
                .await;

            match waited {
                Ok(receipt) => return self.settle(prepared, receipt),
                Err(ChainError::Dropped) if reattached => {
                    // The recorded transaction never landed: submit again.
                    tracing::warn!(
                        artifact = name,
                        tx = %tx_hash,
                        "Pending submission was dropped, resubmitting"
                    );
                    self.registry.clear_pending(name, &prepared.fingerprint)?;
                }
                Err(err) => return Err(self.failure(prepared, tx_hash, err)),
            }
        }
    }

    async fn submit(&self, prepared: &PreparedDeployment) -> Result<B256, DeployError> {
        let request = CreationRequest {
            artifact: prepared.artifact.clone(),
            payload: prepared.payload.clone(),
            initializes: prepared.init.is_some(),
        };

        let tx_hash = self
            .chain
            .submit_creation(&request)
            .await
            .map_err(|e| DeployError::Submission {
                artifact: prepared.artifact.clone(),
                reason: e.to_string(),
            })?;

        let recorded = self.registry.record_pending(PendingSubmission {
            artifact: prepared.artifact.clone(),
            fingerprint: prepared.fingerprint.clone(),
            tx_hash,
            submitted_at: now(),
        });
        if let Err(err) = recorded {
            tracing::error!(
                artifact = %prepared.artifact,
                tx = %tx_hash,
                err = %err,
                "Creation submitted but its intent could not be recorded, check the transaction before re-running"
            );
            return Err(err.into());
        }

        tracing::info!(
            artifact = %prepared.artifact,
            kind = prepared.kind,
            tx = %tx_hash,
            fingerprint = %prepared.fingerprint.short(),
            "Creation submitted"
        );

        Ok(tx_hash)
    }

    /// Record a mined creation.
    fn settle(
        &self,
        prepared: &PreparedDeployment,
        receipt: CreationReceipt,
    ) -> Result<DeployedArtifact, DeployError> {
        let entry = RegistryEntry {
            artifact: prepared.artifact.clone(),
            address: receipt.address,
            fingerprint: prepared.fingerprint.clone(),
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            recorded_at: now(),
        };

        let Some(call) = &prepared.init else {
            self.registry.confirm(entry.clone())?;
            tracing::info!(
                artifact = %entry.artifact,
                address = %entry.address,
                block = entry.block_number,
                "Deployed"
            );
            return Ok(DeployedArtifact {
                entry,
                reused: false,
                init: None,
            });
        };

        let state = match receipt.init {
            Some(InitOutcome::Succeeded) => InitState::Initialized,
            Some(InitOutcome::Reverted { reason }) => InitState::Failed { reason },
            None => InitState::Failed {
                reason: "chain did not report the initializer outcome".to_string(),
            },
        };

        let record = InitRecord {
            composite: prepared.artifact.clone(),
            address: entry.address,
            method: call.method.clone(),
            state,
            recorded_at: now(),
        };

        self.registry
            .confirm_composite(entry.clone(), record.clone())?;

        if let InitState::Failed { reason } = &record.state {
            tracing::error!(
                artifact = %entry.artifact,
                address = %entry.address,
                method = %call.signature,
                reason = %reason,
                "Composite created but initialization failed"
            );
            return Err(DeployError::PartialInitialization {
                artifact: entry.artifact,
                address: entry.address,
                reason: reason.clone(),
            });
        }

        tracing::info!(
            artifact = %entry.artifact,
            address = %entry.address,
            block = entry.block_number,
            method = %call.signature,
            facet = %call.facet,
            "Composite deployed and initialized"
        );

        Ok(DeployedArtifact {
            entry,
            reused: false,
            init: Some(record),
        })
    }

    /// Check the initialization ledger of a reused composite.
    fn recorded_init(
        &self,
        prepared: &PreparedDeployment,
        entry: &RegistryEntry,
    ) -> Result<Option<InitRecord>, DeployError> {
        if prepared.init.is_none() {
            return Ok(None);
        }

        match self.registry.init_record(&entry.address)? {
            Some(record) => match &record.state {
                InitState::Initialized => Ok(Some(record)),
                InitState::Failed { reason } => Err(DeployError::PartialInitialization {
                    artifact: entry.artifact.clone(),
                    address: entry.address,
                    reason: reason.clone(),
                }),
            },
            None => Err(DeployError::PartialInitialization {
                artifact: entry.artifact.clone(),
                address: entry.address,
                reason: "no initialization record".to_string(),
            }),
        }
    }

    /// Map a failed wait to a deploy error, dropping the submission intent
    /// unless the transaction may still land.
    fn failure(&self, prepared: &PreparedDeployment, tx_hash: B256, err: ChainError) -> DeployError {
        let artifact = prepared.artifact.clone();

        // A fresh transaction the node does not know yet may still be
        // propagating. Only a re-attached one is treated as dropped.
        if matches!(
            err,
            ChainError::Timeout | ChainError::Transport(_) | ChainError::Dropped
        ) {
            tracing::warn!(
                artifact = %artifact,
                tx = %tx_hash,
                err = %err,
                "Confirmation not observed, submission kept for re-attachment"
            );
            return DeployError::ConfirmationTimeout { artifact, tx_hash };
        }

        if let Err(e) = self
            .registry
            .clear_pending(&prepared.artifact, &prepared.fingerprint)
        {
            return e.into();
        }

        match err {
            ChainError::Reverted { reason } => {
                tracing::error!(artifact = %artifact, tx = %tx_hash, reason = %reason, "Creation reverted");
                DeployError::TransactionReverted { artifact, reason }
            }
            other => DeployError::Submission {
                artifact,
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        MemoryChain, MemoryRegistry,
        chain::Fault,
        registry::{RegistryError, RegistryState},
    };
    use alloy_core::json_abi::JsonAbi;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn compiled(name: &str) -> CompiledArtifact {
        CompiledArtifact {
            name: name.to_string(),
            abi: JsonAbi::default(),
            bytecode: "0x6080604052".to_string(),
            link_references: vec![],
        }
    }

    fn prepared(name: &str) -> PreparedDeployment {
        PreparedDeployment::standalone(&Artifact::library(name), &compiled(name), &HashMap::new())
            .expect("prepares")
    }

    fn composite(name: &str) -> PreparedDeployment {
        PreparedDeployment {
            init: Some(InitCall {
                method: "init".to_string(),
                signature: "init()".to_string(),
                facet: "InitFacet".to_string(),
                target: Address::repeat_byte(1),
                calldata: Bytes::from_static(&[0xe1, 0xc7, 0x39, 0x2a]),
            }),
            kind: "composite",
            ..prepared(name)
        }
    }

    #[test]
    fn test_standalone_payload_and_fingerprint() {
        let bitmask = prepared("Bitmask");
        assert_eq!(bitmask.payload.as_ref(), &[0x60, 0x80, 0x60, 0x40, 0x52]);
        assert_eq!(bitmask.fingerprint, prepared("Bitmask").fingerprint);

        let with_args = PreparedDeployment::standalone(
            &Artifact::library("Bitmask").with_args([crate::ArgValue::Number(1)]),
            &compiled("Bitmask"),
            &HashMap::new(),
        );
        assert!(matches!(
            with_args,
            Err(ConfigurationError::ArgumentMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_deploy_twice_submits_once() {
        let chain = MemoryChain::default();
        let registry = MemoryRegistry::new();
        let deployer = ArtifactDeployer::new(&chain, &registry, TIMEOUT);
        let bitmask = prepared("Bitmask");

        let first = deployer.deploy(&bitmask).await.expect("deploys");
        let second = deployer.deploy(&bitmask).await.expect("reuses");

        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.address(), second.address());
        assert_eq!(chain.submission_count(), 1);
        assert!(registry.read().unwrap().pending.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_keeps_pending_and_reattaches() {
        let chain = MemoryChain::default();
        let registry = MemoryRegistry::new();
        let deployer = ArtifactDeployer::new(&chain, &registry, TIMEOUT);
        let merkle = prepared("Merkle");

        chain.inject("Merkle", Fault::TimeoutOnce);
        let err = deployer.deploy(&merkle).await.unwrap_err();
        assert!(err.is_retryable(), "timeout should be retryable: {err}");
        assert!(registry.pending("Merkle", &merkle.fingerprint).unwrap().is_some());

        let deployed = deployer.deploy(&merkle).await.expect("re-attaches");
        assert!(!deployed.reused);
        assert_eq!(chain.submission_count(), 1, "re-attaching must not resubmit");
        assert!(registry.pending("Merkle", &merkle.fingerprint).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_pending_is_resubmitted() {
        let chain = MemoryChain::default();
        let registry = MemoryRegistry::new();
        let deployer = ArtifactDeployer::new(&chain, &registry, TIMEOUT);
        let merkle = prepared("Merkle");

        registry
            .record_pending(PendingSubmission {
                artifact: "Merkle".to_string(),
                fingerprint: merkle.fingerprint.clone(),
                tx_hash: B256::repeat_byte(0x77),
                submitted_at: 0,
            })
            .unwrap();

        let deployed = deployer.deploy(&merkle).await.expect("resubmits");
        assert_eq!(chain.submission_count(), 1);
        assert_ne!(deployed.entry.tx_hash, B256::repeat_byte(0x77));
    }

    #[tokio::test]
    async fn test_unknown_fresh_submission_keeps_pending() {
        let chain = MemoryChain::default();
        let registry = MemoryRegistry::new();
        let deployer = ArtifactDeployer::new(&chain, &registry, TIMEOUT);
        let merkle = prepared("Merkle");

        chain.inject("Merkle", Fault::Drop);
        let err = deployer.deploy(&merkle).await.unwrap_err();
        assert!(matches!(err, DeployError::ConfirmationTimeout { .. }));
        assert!(err.is_retryable());

        let pending = registry
            .pending("Merkle", &merkle.fingerprint)
            .unwrap()
            .expect("intent kept");

        // The next run re-attaches first, and only resubmits once the node
        // still does not know the transaction.
        let deployed = deployer.deploy(&merkle).await.expect("resubmits");
        assert_eq!(chain.submissions_of("Merkle"), 2);
        assert_ne!(deployed.entry.tx_hash, pending.tx_hash);
        assert!(registry.pending("Merkle", &merkle.fingerprint).unwrap().is_none());
    }

    /// A registry that can be read but never written.
    #[derive(Debug, Default)]
    struct ReadOnlyRegistry;

    impl Registry for ReadOnlyRegistry {
        fn read(&self) -> Result<RegistryState, RegistryError> {
            Ok(RegistryState::default())
        }

        fn update<T>(
            &self,
            _mutate: impl FnOnce(&mut RegistryState) -> Result<T, RegistryError>,
        ) -> Result<T, RegistryError> {
            Err(RegistryError::Io {
                path: "deployments/localhost.json".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }
    }

    #[tokio::test]
    async fn test_unrecorded_intent_stops_before_waiting() {
        let chain = MemoryChain::default();
        let deployer = ArtifactDeployer::new(&chain, &ReadOnlyRegistry, TIMEOUT);

        let err = deployer.deploy(&prepared("Bitmask")).await.unwrap_err();
        assert!(matches!(err, DeployError::Registry(RegistryError::Io { .. })));
        assert!(!err.is_retryable());
        assert_eq!(chain.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_revert_and_rejection_clear_pending() {
        let chain = MemoryChain::default();
        let registry = MemoryRegistry::new();
        let deployer = ArtifactDeployer::new(&chain, &registry, TIMEOUT);
        let bitmask = prepared("Bitmask");

        chain.inject("Bitmask", Fault::Revert("out of gas".to_string()));
        let err = deployer.deploy(&bitmask).await.unwrap_err();
        assert!(matches!(err, DeployError::TransactionReverted { .. }));
        assert!(!err.is_retryable());

        chain.inject("Bitmask", Fault::Reject("nonce too low".to_string()));
        let err = deployer.deploy(&bitmask).await.unwrap_err();
        assert!(matches!(err, DeployError::Submission { .. }));

        let state = registry.read().unwrap();
        assert!(state.pending.is_empty());
        assert!(state.entries.is_empty());
    }

    #[tokio::test]
    async fn test_composite_init_outcome_is_recorded() {
        let chain = MemoryChain::default();
        let registry = MemoryRegistry::new();
        let deployer = ArtifactDeployer::new(&chain, &registry, TIMEOUT);
        let rollups = composite("Rollups");

        let deployed = deployer.deploy(&rollups).await.expect("deploys");
        let record = deployed.init.expect("init recorded");
        assert_eq!(record.state, InitState::Initialized);
        assert_eq!(record.address, deployed.entry.address);

        let again = deployer.deploy(&rollups).await.expect("reuses");
        assert!(again.reused);
        assert_eq!(chain.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_init_is_terminal() {
        let chain = MemoryChain::default();
        let registry = MemoryRegistry::new();
        let deployer = ArtifactDeployer::new(&chain, &registry, TIMEOUT);
        let rollups = composite("Rollups");

        chain.inject("Rollups", Fault::InitRevert("bad validators".to_string()));
        let err = deployer.deploy(&rollups).await.unwrap_err();
        let DeployError::PartialInitialization { address, reason, .. } = &err else {
            panic!("expected partial initialization, got {err:?}");
        };
        assert_eq!(reason, "bad validators");
        assert!(registry.lookup("Rollups", &rollups.fingerprint).unwrap().is_some());
        let address = *address;

        // A rerun reports the same failure and never retries the initializer.
        let err = deployer.deploy(&rollups).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::PartialInitialization { address: a, .. } if a == address
        ));
        assert_eq!(chain.submission_count(), 1);
    }
}
