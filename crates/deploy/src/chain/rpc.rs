//! Ethereum JSON-RPC chain client.

use std::time::Duration;

use alloy_core::primitives::{Address, B256};
use anyhow::Context;
use backon::{ConstantBuilder, Retryable};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use super::{ChainClient, ChainError, CreationReceipt, CreationRequest, InitOutcome};

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by a single JSON-RPC call.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to send {method} request")]
    Transport {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("no result in {method} response")]
    MissingResult { method: String },

    #[error("failed to deserialize {method} result")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Create an HTTP client configured for JSON-RPC requests.
fn create_client() -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Make a JSON-RPC call and deserialize the result.
async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &Url,
    method: &str,
    params: Vec<Value>,
) -> Result<T, RpcError> {
    let transport = |source| RpcError::Transport {
        method: method.to_string(),
        source,
    };

    let response: Value = client
        .post(url.clone())
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .map_err(transport)?
        .json()
        .await
        .map_err(transport)?;

    if let Some(error) = response.get("error") {
        return Err(RpcError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        });
    }

    let result = response
        .get("result")
        .cloned()
        .ok_or_else(|| RpcError::MissingResult {
            method: method.to_string(),
        })?;

    serde_json::from_value(result).map_err(|source| RpcError::Decode {
        method: method.to_string(),
        source,
    })
}

/// Deserialize a u64 from a hex string (with 0x prefix).
fn deserialize_u64_from_hex<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(serde::de::Error::custom)
}

/// The fields of `eth_getTransactionReceipt` the deployer cares about.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionReceipt {
    transaction_hash: B256,
    contract_address: Option<Address>,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    status: u64,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    block_number: u64,
}

impl TransactionReceipt {
    fn into_creation(self, initializes: bool) -> Result<CreationReceipt, ChainError> {
        if self.status != 1 {
            return Err(ChainError::Reverted {
                reason: format!("status {:#x}", self.status),
            });
        }

        let address = self.contract_address.ok_or_else(|| ChainError::Reverted {
            reason: "receipt has no contract address".to_string(),
        })?;

        // The initializer runs inside the creation: a mined creation means
        // the initializer succeeded.
        Ok(CreationReceipt {
            tx_hash: self.transaction_hash,
            address,
            block_number: self.block_number,
            init: initializes.then_some(InitOutcome::Succeeded),
        })
    }
}

/// Why a receipt poll did not produce a receipt.
#[derive(Debug)]
enum PollError {
    Pending,
    Dropped,
    Rpc(RpcError),
}

/// Chain client talking to a node over JSON-RPC.
///
/// Transactions are sent with `eth_sendTransaction` from an account unlocked
/// on the node (a development node, or a node fronting a signer).
#[derive(Debug, Clone)]
pub struct JsonRpcChain {
    client: reqwest::Client,
    url: Url,
    from: Address,
    poll_interval: Duration,
}

impl JsonRpcChain {
    /// Connect to `url`.
    ///
    /// When `chain_id` is given the node must report it. When `from` is not
    /// given the node's first account is used.
    pub async fn connect(
        url: Url,
        chain_id: Option<u64>,
        from: Option<Address>,
        poll_interval: Duration,
    ) -> anyhow::Result<Self> {
        let client = create_client()?;

        if let Some(expected) = chain_id {
            let actual: String = json_rpc_call(&client, &url, "eth_chainId", vec![])
                .await
                .context("Failed to query chain id")?;
            let actual = u64::from_str_radix(actual.trim_start_matches("0x"), 16)
                .context("Node returned a malformed chain id")?;
            if actual != expected {
                anyhow::bail!("Node at {url} is on chain {actual}, expected {expected}");
            }
        }

        let from = match from {
            Some(from) => from,
            None => {
                let accounts: Vec<Address> = json_rpc_call(&client, &url, "eth_accounts", vec![])
                    .await
                    .context("Failed to query node accounts")?;
                accounts
                    .first()
                    .copied()
                    .context("Node has no unlocked account to deploy from")?
            }
        };

        tracing::info!(url = %url, from = %from, "Connected to chain");

        Ok(Self {
            client,
            url,
            from,
            poll_interval,
        })
    }

    /// The account creations are sent from.
    pub fn from(&self) -> Address {
        self.from
    }

    async fn poll_receipt(&self, tx_hash: B256) -> Result<TransactionReceipt, PollError> {
        let receipt: Option<TransactionReceipt> = json_rpc_call(
            &self.client,
            &self.url,
            "eth_getTransactionReceipt",
            vec![serde_json::json!(tx_hash)],
        )
        .await
        .map_err(PollError::Rpc)?;

        if let Some(receipt) = receipt {
            return Ok(receipt);
        }

        let transaction: Option<Value> = json_rpc_call(
            &self.client,
            &self.url,
            "eth_getTransactionByHash",
            vec![serde_json::json!(tx_hash)],
        )
        .await
        .map_err(PollError::Rpc)?;

        match transaction {
            Some(_) => Err(PollError::Pending),
            None => Err(PollError::Dropped),
        }
    }
}

impl ChainClient for JsonRpcChain {
    async fn submit_creation(&self, request: &CreationRequest) -> Result<B256, ChainError> {
        tracing::debug!(
            artifact = %request.artifact,
            payload_bytes = request.payload.len(),
            "Sending creation transaction"
        );

        json_rpc_call(
            &self.client,
            &self.url,
            "eth_sendTransaction",
            vec![serde_json::json!({
                "from": self.from,
                "data": request.payload,
            })],
        )
        .await
        .map_err(|e| match e {
            RpcError::Rpc { message, .. } => ChainError::Rejected(message),
            other => ChainError::Transport(other.to_string()),
        })
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: B256,
        initializes: bool,
        timeout: Duration,
    ) -> Result<CreationReceipt, ChainError> {
        let backoff = ConstantBuilder::default()
            .with_delay(self.poll_interval)
            .with_max_times(usize::MAX);

        let polled = tokio::time::timeout(
            timeout,
            (|| self.poll_receipt(tx_hash))
                .retry(backoff)
                .when(|e| matches!(e, PollError::Pending | PollError::Rpc(RpcError::Transport { .. })))
                .notify(|e, delay| {
                    tracing::trace!(tx = %tx_hash, err = ?e, ?delay, "Receipt not available yet, retrying...");
                }),
        )
        .await;

        match polled {
            Err(_) => Err(ChainError::Timeout),
            Ok(Ok(receipt)) => receipt.into_creation(initializes),
            Ok(Err(PollError::Dropped)) => Err(ChainError::Dropped),
            Ok(Err(PollError::Pending)) => Err(ChainError::Timeout),
            Ok(Err(PollError::Rpc(e))) => Err(ChainError::Transport(e.to_string())),
        }
    }
}
