use crate::error::{Result, UserOpError};
use crate::types::UserOperation;
use ethers::types::{Address, Bytes, H256, U256};

/// Full lowercase `0x` hex. `Debug` on fixed-size hashes never abbreviates.
pub fn fmt_address(addr: Address) -> String {
    format!("{addr:?}")
}

pub fn fmt_h256(h: H256) -> String {
    format!("{h:?}")
}

/// JSON-RPC "quantity" encoding: no leading zeros, `0x0` for zero.
pub fn fmt_u256(v: U256) -> String {
    format!("{v:#x}")
}

pub fn fmt_bytes(b: &Bytes) -> String {
    b.to_string()
}

/// Wire form shared by `pm_sponsorUserOperation` and `eth_sendUserOperation`.
///
/// Every field is listed by hand; adding a field to [`UserOperation`] means adding it here.
pub fn user_op_to_json(op: &UserOperation) -> serde_json::Value {
    serde_json::json!({
        "sender": fmt_address(op.sender),
        "nonce": fmt_u256(op.nonce),
        "initCode": fmt_bytes(&op.init_code),
        "callData": fmt_bytes(&op.call_data),
        "callGasLimit": fmt_u256(op.call_gas_limit),
        "verificationGasLimit": fmt_u256(op.verification_gas_limit),
        "preVerificationGas": fmt_u256(op.pre_verification_gas),
        "maxFeePerGas": fmt_u256(op.max_fee_per_gas),
        "maxPriorityFeePerGas": fmt_u256(op.max_priority_fee_per_gas),
        "paymasterAndData": fmt_bytes(&op.paymaster_and_data),
        "signature": fmt_bytes(&op.signature),
    })
}

pub fn parse_u256_quantity(s: &str) -> Result<U256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(s, 16)
        .map_err(|e| UserOpError::Abi(format!("invalid quantity 0x{s}: {e}")))
}

pub fn parse_h256(s: &str) -> Result<H256> {
    let bytes = parse_hex_bytes(s)?;
    if bytes.len() != 32 {
        return Err(UserOpError::Abi(format!(
            "expected 32-byte hex, got {} bytes",
            bytes.len()
        )));
    }
    Ok(H256::from_slice(&bytes))
}

pub fn parse_hex_bytes(s: &str) -> Result<Bytes> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| UserOpError::Abi(format!("invalid hex: {e}")))?;
    Ok(Bytes::from(bytes))
}
