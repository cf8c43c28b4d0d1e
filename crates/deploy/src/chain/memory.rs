//! In-memory chain with deterministic addresses and fault injection.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use alloy_core::primitives::{Address, B256, Bytes, keccak256};

use super::{ChainClient, ChainError, CreationReceipt, CreationRequest, InitOutcome};

/// A failure to inject for a given artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Refuse the submission.
    Reject(String),
    /// Mine the creation with a failed status.
    Revert(String),
    /// Report a timeout on the first wait; the transaction still confirms on
    /// a later wait.
    TimeoutOnce,
    /// Create the contract but report a failed initializer.
    InitRevert(String),
    /// Forget the transaction after accepting it.
    Drop,
}

/// A creation transaction accepted by the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationRecord {
    pub artifact: String,
    pub tx_hash: B256,
    pub payload: Bytes,
    pub address: Address,
    pub initializes: bool,
}

#[derive(Debug)]
struct Transaction {
    record: CreationRecord,
    block_number: u64,
    outcome: Result<Option<InitOutcome>, ChainError>,
    delayed: bool,
}

#[derive(Debug)]
struct State {
    nonce: u64,
    block_number: u64,
    transactions: HashMap<B256, Transaction>,
    submissions: Vec<CreationRecord>,
    faults: HashMap<String, Fault>,
}

/// A chain living in memory.
///
/// Contract addresses follow the CREATE rule from a fixed deployer account,
/// so the same sequence of submissions always yields the same addresses.
#[derive(Debug)]
pub struct MemoryChain {
    deployer: Address,
    state: Mutex<State>,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new(Address::repeat_byte(0xde))
    }
}

impl MemoryChain {
    /// A chain where every creation is sent from `deployer`.
    pub fn new(deployer: Address) -> Self {
        Self {
            deployer,
            state: Mutex::new(State {
                nonce: 0,
                block_number: 0,
                transactions: HashMap::new(),
                submissions: Vec::new(),
                faults: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked while holding it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inject a fault for the next submission of `artifact`.
    pub fn inject(&self, artifact: impl Into<String>, fault: Fault) {
        self.state().faults.insert(artifact.into(), fault);
    }

    /// Every creation accepted so far, in submission order.
    pub fn submissions(&self) -> Vec<CreationRecord> {
        self.state().submissions.clone()
    }

    /// Number of creations accepted so far.
    pub fn submission_count(&self) -> usize {
        self.state().submissions.len()
    }

    /// Number of accepted creations of `artifact`.
    pub fn submissions_of(&self, artifact: &str) -> usize {
        self.state()
            .submissions
            .iter()
            .filter(|record| record.artifact == artifact)
            .count()
    }
}

impl ChainClient for MemoryChain {
    async fn submit_creation(&self, request: &CreationRequest) -> Result<B256, ChainError> {
        let mut state = self.state();
        let fault = state.faults.remove(&request.artifact);

        if let Some(Fault::Reject(reason)) = &fault {
            return Err(ChainError::Rejected(reason.clone()));
        }

        let nonce = state.nonce;
        state.nonce += 1;
        state.block_number += 1;

        let mut preimage = request.artifact.as_bytes().to_vec();
        preimage.extend(nonce.to_be_bytes());
        let tx_hash = keccak256(&preimage);

        let record = CreationRecord {
            artifact: request.artifact.clone(),
            tx_hash,
            payload: request.payload.clone(),
            address: self.deployer.create(nonce),
            initializes: request.initializes,
        };

        let outcome = match &fault {
            Some(Fault::Revert(reason)) => Err(ChainError::Reverted {
                reason: reason.clone(),
            }),
            Some(Fault::InitRevert(reason)) if request.initializes => {
                Ok(Some(InitOutcome::Reverted {
                    reason: reason.clone(),
                }))
            }
            _ => Ok(request.initializes.then_some(InitOutcome::Succeeded)),
        };

        state.submissions.push(record.clone());
        if fault != Some(Fault::Drop) {
            let block_number = state.block_number;
            state.transactions.insert(
                tx_hash,
                Transaction {
                    record,
                    block_number,
                    outcome,
                    delayed: fault == Some(Fault::TimeoutOnce),
                },
            );
        }

        Ok(tx_hash)
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: B256,
        _initializes: bool,
        _timeout: Duration,
    ) -> Result<CreationReceipt, ChainError> {
        let mut state = self.state();
        let transaction = state
            .transactions
            .get_mut(&tx_hash)
            .ok_or(ChainError::Dropped)?;

        if transaction.delayed {
            transaction.delayed = false;
            return Err(ChainError::Timeout);
        }

        let init = transaction.outcome.clone()?;
        Ok(CreationReceipt {
            tx_hash,
            address: transaction.record.address,
            block_number: transaction.block_number,
            init,
        })
    }
}
