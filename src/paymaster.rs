use crate::encoding::{self, parse_hex_bytes, parse_u256_quantity};
use crate::error::{Result, UserOpError};
use crate::rpc::{JsonRpcHttp, RpcFailure};
use crate::types::UserOperation;
use ethers::types::{Address, Bytes, U256};
use serde::Serialize;
use serde_json::Value;

const SPONSOR_METHOD: &str = "pm_sponsorUserOperation";

/// Policy tag sent along with a sponsorship request, serialized as `{"type": ...}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PaymasterContext {
    #[serde(rename = "type")]
    pub policy: String,
}

impl PaymasterContext {
    pub fn new(policy: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
        }
    }
}

impl Default for PaymasterContext {
    fn default() -> Self {
        Self::new("payg")
    }
}

/// What a paymaster agreed to. Gas limits are present only when the service revised them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SponsorshipResult {
    pub paymaster_and_data: Bytes,
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
}

impl SponsorshipResult {
    pub fn new(paymaster_and_data: impl Into<Bytes>) -> Self {
        Self {
            paymaster_and_data: paymaster_and_data.into(),
            ..Default::default()
        }
    }
}

/// Anything that can sponsor a draft operation.
///
/// The builder only ever talks to this trait, so a different sponsorship service is a new
/// implementation, not a change to the builder.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PaymasterSponsor: Send + Sync {
    async fn sponsor(
        &self,
        op: &UserOperation,
        entry_point: Address,
        context: &PaymasterContext,
    ) -> Result<SponsorshipResult>;
}

/// `pm_sponsorUserOperation` client.
#[derive(Debug, Clone)]
pub struct PaymasterClient {
    rpc: JsonRpcHttp,
}

impl PaymasterClient {
    pub fn new(url: String) -> Self {
        Self {
            rpc: JsonRpcHttp::new(url),
        }
    }
}

#[async_trait::async_trait]
impl PaymasterSponsor for PaymasterClient {
    async fn sponsor(
        &self,
        op: &UserOperation,
        entry_point: Address,
        context: &PaymasterContext,
    ) -> Result<SponsorshipResult> {
        let context =
            serde_json::to_value(context).map_err(|e| UserOpError::Abi(e.to_string()))?;
        let params = serde_json::json!([
            encoding::user_op_to_json(op),
            encoding::fmt_address(entry_point),
            context,
        ]);

        let res = self
            .rpc
            .call(SPONSOR_METHOD, params)
            .await
            .map_err(sponsorship_failure)?;

        let result = parse_sponsorship_result(&res)?;
        tracing::info!(
            paymaster_and_data_len = result.paymaster_and_data.len(),
            revised_gas = result.call_gas_limit.is_some()
                || result.verification_gas_limit.is_some()
                || result.pre_verification_gas.is_some(),
            "paymaster sponsored user operation"
        );
        Ok(result)
    }
}

/// An unreachable paymaster is distinct from one that answers with a JSON-RPC error.
fn sponsorship_failure(failure: RpcFailure) -> UserOpError {
    match failure {
        RpcFailure::Transport(msg) => UserOpError::PaymasterRejected(msg),
        RpcFailure::Rejected(err) => UserOpError::SponsorshipDenied(err.to_string()),
        RpcFailure::Malformed(reason) => UserOpError::MalformedResponse {
            method: SPONSOR_METHOD,
            reason,
        },
    }
}

/// Accepts a bare hex string, `{ "result": "0x.." }`, or an object carrying
/// `paymasterAndData` and optionally revised gas limits.
pub(crate) fn parse_sponsorship_result(res: &Value) -> Result<SponsorshipResult> {
    let malformed = |reason: String| UserOpError::MalformedResponse {
        method: SPONSOR_METHOD,
        reason,
    };

    let result = if let Some(s) = res.as_str() {
        SponsorshipResult::new(parse_hex_bytes(s).map_err(|e| malformed(e.to_string()))?)
    } else if let Some(s) = res.get("paymasterAndData").and_then(|v| v.as_str()) {
        SponsorshipResult {
            paymaster_and_data: parse_hex_bytes(s).map_err(|e| malformed(e.to_string()))?,
            call_gas_limit: optional_quantity(res, "callGasLimit").map_err(malformed)?,
            verification_gas_limit: optional_quantity(res, "verificationGasLimit")
                .map_err(malformed)?,
            pre_verification_gas: optional_quantity(res, "preVerificationGas")
                .map_err(malformed)?,
        }
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        SponsorshipResult::new(parse_hex_bytes(s).map_err(|e| malformed(e.to_string()))?)
    } else if res.is_null() {
        return Err(UserOpError::SponsorshipDenied(
            "paymaster returned no result".into(),
        ));
    } else {
        return Err(malformed(format!("unexpected result shape: {res}")));
    };

    if result.paymaster_and_data.is_empty() {
        return Err(UserOpError::SponsorshipDenied(
            "paymaster returned empty paymasterAndData".into(),
        ));
    }
    Ok(result)
}

fn optional_quantity(v: &Value, key: &str) -> std::result::Result<Option<U256>, String> {
    match v.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => parse_u256_quantity(s)
            .map(Some)
            .map_err(|e| format!("{key}: {e}")),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|n| Some(U256::from(n)))
            .ok_or_else(|| format!("{key}: not an unsigned integer")),
        Some(other) => Err(format!("{key}: unexpected value {other}")),
    }
}
