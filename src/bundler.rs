use crate::encoding::{self, parse_h256, parse_u256_quantity};
use crate::error::{Result, UserOpError};
use crate::rpc::{JsonRpcHttp, RpcFailure};
use crate::types::SignedUserOperation;
use ethers::types::{Address, H256, U256};
use serde_json::Value;
use std::time::Duration;

/// The bundler methods the submission flow uses.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Bundler: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;

    async fn send_user_operation(&self, user_op: Value, entry_point: Address) -> Result<H256>;

    /// `None` while the operation is still pending.
    async fn get_user_operation_receipt(&self, user_op_hash: H256) -> Result<Option<Value>>;
}

#[derive(Debug, Clone)]
pub struct BundlerClient {
    rpc: JsonRpcHttp,
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self {
            rpc: JsonRpcHttp::new(url),
        }
    }
}

fn unavailable(method: &'static str) -> impl Fn(RpcFailure) -> UserOpError {
    move |failure| match failure {
        RpcFailure::Malformed(reason) => UserOpError::MalformedResponse { method, reason },
        other => UserOpError::BundlerUnavailable(format!("{method}: {other}")),
    }
}

/// A JSON-RPC error from `eth_sendUserOperation` is the bundler refusing the operation.
fn submission_failure(failure: RpcFailure) -> UserOpError {
    match failure {
        RpcFailure::Rejected(err) => UserOpError::SubmissionRejected(err.to_string()),
        RpcFailure::Transport(msg) => UserOpError::BundlerUnavailable(msg),
        RpcFailure::Malformed(reason) => UserOpError::MalformedResponse {
            method: "eth_sendUserOperation",
            reason,
        },
    }
}

#[async_trait::async_trait]
impl Bundler for BundlerClient {
    async fn chain_id(&self) -> Result<u64> {
        const METHOD: &str = "eth_chainId";
        let res = self
            .rpc
            .call(METHOD, serde_json::json!([]))
            .await
            .map_err(unavailable(METHOD))?;
        let s = res.as_str().ok_or_else(|| UserOpError::MalformedResponse {
            method: METHOD,
            reason: format!("expected quantity, got {res}"),
        })?;
        let id = parse_u256_quantity(s)?;
        if id > U256::from(u64::MAX) {
            return Err(UserOpError::MalformedResponse {
                method: METHOD,
                reason: format!("chain id {id} out of range"),
            });
        }
        Ok(id.as_u64())
    }

    async fn send_user_operation(&self, user_op: Value, entry_point: Address) -> Result<H256> {
        const METHOD: &str = "eth_sendUserOperation";
        let params = serde_json::json!([user_op, encoding::fmt_address(entry_point)]);
        let res = self
            .rpc
            .call(METHOD, params)
            .await
            .map_err(submission_failure)?;
        parse_userop_hash(&res)
    }

    async fn get_user_operation_receipt(&self, user_op_hash: H256) -> Result<Option<Value>> {
        const METHOD: &str = "eth_getUserOperationReceipt";
        let params = serde_json::json!([encoding::fmt_h256(user_op_hash)]);
        let res = self
            .rpc
            .call(METHOD, params)
            .await
            .map_err(unavailable(METHOD))?;
        Ok((!res.is_null()).then_some(res))
    }
}

fn parse_userop_hash(res: &Value) -> Result<H256> {
    // Most bundlers return the userOpHash directly as a JSON string; some wrap it in an object.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(UserOpError::MalformedResponse {
            method: "eth_sendUserOperation",
            reason: format!("expected string or {{result: ...}}, got {res}"),
        });
    };

    parse_h256(hash_str)
}

/// Receipt polling cadence and deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiptPolling {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ReceiptPolling {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1500),
            timeout: Duration::from_secs(180),
        }
    }
}

/// Returned by [`Submitter::submit`]; the hash the bundler indexes the operation under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserOpHandle {
    pub user_op_hash: H256,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UserOpReceipt {
    pub user_op_hash: H256,
    pub success: bool,
    pub actual_gas_cost: Option<U256>,
    pub transaction_hash: H256,
    pub raw: Value,
}

impl UserOpReceipt {
    /// `Ok(None)` when the receipt does not carry a transaction hash yet.
    pub fn from_value(user_op_hash: H256, raw: Value) -> Result<Option<Self>> {
        const METHOD: &str = "eth_getUserOperationReceipt";
        let tx_hash = raw
            .get("receipt")
            .and_then(|r| r.get("transactionHash"))
            .or_else(|| raw.get("transactionHash"))
            .and_then(|v| v.as_str());
        let Some(tx_hash) = tx_hash else {
            return Ok(None);
        };
        let transaction_hash = parse_h256(tx_hash).map_err(|e| UserOpError::MalformedResponse {
            method: METHOD,
            reason: format!("transactionHash: {e}"),
        })?;

        let success = raw.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
        let actual_gas_cost = match raw.get("actualGasCost").and_then(|v| v.as_str()) {
            Some(s) => Some(parse_u256_quantity(s)?),
            None => None,
        };

        Ok(Some(Self {
            user_op_hash,
            success,
            actual_gas_cost,
            transaction_hash,
            raw,
        }))
    }
}

/// Hands signed operations to a bundler and waits for them to land.
#[derive(Debug)]
pub struct Submitter<B> {
    bundler: B,
    entry_point: Address,
    chain_id: u64,
    polling: ReceiptPolling,
}

impl<B: Bundler> Submitter<B> {
    pub fn new(bundler: B, entry_point: Address, chain_id: u64, polling: ReceiptPolling) -> Self {
        Self {
            bundler,
            entry_point,
            chain_id,
            polling,
        }
    }

    /// Fails with [`UserOpError::Config`] when the bundler serves a different chain.
    pub async fn validate_chain_id(&self) -> Result<()> {
        let bundler_chain_id = self.bundler.chain_id().await?;
        if bundler_chain_id != self.chain_id {
            return Err(UserOpError::Config(format!(
                "bundler serves chain {bundler_chain_id}, expected {}",
                self.chain_id
            )));
        }
        Ok(())
    }

    /// One `eth_sendUserOperation` call. Does not wait for inclusion.
    pub async fn submit(&self, op: &SignedUserOperation) -> Result<UserOpHandle> {
        let json = encoding::user_op_to_json(op.operation());
        let user_op_hash = self
            .bundler
            .send_user_operation(json, self.entry_point)
            .await?;

        if user_op_hash != op.user_op_hash() {
            tracing::warn!(
                local = ?op.user_op_hash(),
                bundler = ?user_op_hash,
                "bundler returned a different userOpHash than computed locally"
            );
        }
        tracing::info!(user_op_hash = ?user_op_hash, sender = ?op.operation().sender, "submitted user operation");
        Ok(UserOpHandle { user_op_hash })
    }

    /// Poll until the receipt names a transaction, or fail with [`UserOpError::ReceiptTimeout`].
    ///
    /// A timeout too large to represent as an instant waits without a deadline.
    pub async fn await_receipt(&self, handle: &UserOpHandle) -> Result<UserOpReceipt> {
        let start = tokio::time::Instant::now();
        let deadline = start.checked_add(self.polling.timeout);
        let mut last_poll_error = None;
        loop {
            match self
                .bundler
                .get_user_operation_receipt(handle.user_op_hash)
                .await
            {
                Ok(Some(raw)) => {
                    if let Some(receipt) = UserOpReceipt::from_value(handle.user_op_hash, raw)? {
                        tracing::info!(
                            user_op_hash = ?receipt.user_op_hash,
                            transaction_hash = ?receipt.transaction_hash,
                            success = receipt.success,
                            "user operation included"
                        );
                        return Ok(receipt);
                    }
                    last_poll_error = None;
                }
                Ok(None) => last_poll_error = None,
                Err(e) => {
                    // transient errors are common on free-tier bundlers; keep polling
                    tracing::warn!(error = %e, "bundler receipt poll error");
                    last_poll_error = Some(e.to_string());
                }
            }

            let now = tokio::time::Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    return Err(UserOpError::ReceiptTimeout {
                        user_op_hash: handle.user_op_hash,
                        waited: now - start,
                        last_poll_error,
                    });
                }
                Some(deadline) => self.polling.interval.min(deadline - now),
                None => self.polling.interval,
            };
            tokio::time::sleep(pause).await;
        }
    }
}
