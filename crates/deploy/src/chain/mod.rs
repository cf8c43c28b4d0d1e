//! Chain submission layer.
//!
//! The orchestrator only needs two primitives from a chain: submit a
//! creation payload, and wait for its receipt. Submission is at-least-once;
//! confirmation is eventual.

mod memory;
mod rpc;

use std::{future::Future, time::Duration};

use alloy_core::primitives::{Address, B256, Bytes};
use thiserror::Error;

pub use memory::{CreationRecord, Fault, MemoryChain};
pub use rpc::{JsonRpcChain, RpcError};

/// A contract creation handed to the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationRequest {
    /// Artifact being created, for logs.
    pub artifact: String,
    /// Creation bytecode followed by the encoded constructor arguments.
    pub payload: Bytes,
    /// Whether the creation runs an initializer whose outcome the chain
    /// should report.
    pub initializes: bool,
}

/// Outcome of an initializer run as part of a creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    Succeeded,
    Reverted { reason: String },
}

/// A mined, successful creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationReceipt {
    pub tx_hash: B256,
    pub address: Address,
    pub block_number: u64,
    /// Present when the request asked for initialization.
    pub init: Option<InitOutcome>,
}

/// Failures reported by a chain client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// Refused before inclusion: malformed payload, insufficient funds...
    #[error("transaction rejected: {0}")]
    Rejected(String),
    /// Mined with a failed status.
    #[error("transaction reverted: {reason}")]
    Reverted { reason: String },
    /// No receipt within the allotted time. The transaction may still land.
    #[error("timed out waiting for receipt")]
    Timeout,
    /// The node no longer knows the transaction.
    #[error("transaction dropped")]
    Dropped,
    #[error("transport error: {0}")]
    Transport(String),
}

/// A chain able to create contracts.
pub trait ChainClient: Send + Sync {
    /// Submit a creation transaction, returning its hash once accepted.
    fn submit_creation(
        &self,
        request: &CreationRequest,
    ) -> impl Future<Output = Result<B256, ChainError>> + Send;

    /// Block until `tx_hash` is mined or `timeout` elapses.
    fn wait_for_receipt(
        &self,
        tx_hash: B256,
        initializes: bool,
        timeout: Duration,
    ) -> impl Future<Output = Result<CreationReceipt, ChainError>> + Send;
}

impl<T: ChainClient> ChainClient for &T {
    fn submit_creation(
        &self,
        request: &CreationRequest,
    ) -> impl Future<Output = Result<B256, ChainError>> + Send {
        (**self).submit_creation(request)
    }

    fn wait_for_receipt(
        &self,
        tx_hash: B256,
        initializes: bool,
        timeout: Duration,
    ) -> impl Future<Output = Result<CreationReceipt, ChainError>> + Send {
        (**self).wait_for_receipt(tx_hash, initializes, timeout)
    }
}
