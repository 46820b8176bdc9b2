use crate::contracts::{ApproveCall, TransferCall};
use crate::error::{Result, UserOpError};
use ethers::abi::{AbiEncode, AbiParser, Token};
use ethers::types::{Address, Bytes, U256};

// SimpleAccount entry points.
const EXECUTE: &str = "function execute(address dest, uint256 value, bytes func)";
const EXECUTE_BATCH: &str = "function executeBatch(address[] dest, bytes[] func)";
const EXECUTE_BATCH_WITH_VALUE: &str =
    "function executeBatch(address[] dest, uint256[] value, bytes[] func)";

/// One call the account will make.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

impl Call {
    pub fn new(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            to,
            value: U256::zero(),
            data: data.into(),
        }
    }

    pub fn with_value(to: Address, value: U256, data: impl Into<Bytes>) -> Self {
        Self {
            to,
            value,
            data: data.into(),
        }
    }
}

/// Column-wise view of an ordered call list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodedBatch {
    pub targets: Vec<Address>,
    pub values: Vec<U256>,
    pub payloads: Vec<Bytes>,
}

/// Split `calls` into parallel columns, keeping order. Duplicate targets are fine.
pub fn encode_batch(calls: &[Call]) -> Result<EncodedBatch> {
    if calls.is_empty() {
        return Err(UserOpError::InvalidBatchShape("batch has no calls".into()));
    }
    let mut batch = EncodedBatch {
        targets: Vec::with_capacity(calls.len()),
        values: Vec::with_capacity(calls.len()),
        payloads: Vec::with_capacity(calls.len()),
    };
    for (i, call) in calls.iter().enumerate() {
        if call.to.is_zero() {
            return Err(UserOpError::InvalidBatchShape(format!(
                "call {i} has an empty target address"
            )));
        }
        batch.targets.push(call.to);
        batch.values.push(call.value);
        batch.payloads.push(call.data.clone());
    }
    Ok(batch)
}

impl EncodedBatch {
    pub fn from_parts(
        targets: Vec<Address>,
        values: Vec<U256>,
        payloads: Vec<Bytes>,
    ) -> Result<Self> {
        if targets.len() != values.len() || targets.len() != payloads.len() {
            return Err(UserOpError::InvalidBatchShape(format!(
                "column lengths differ: {} targets, {} values, {} payloads",
                targets.len(),
                values.len(),
                payloads.len()
            )));
        }
        Ok(Self {
            targets,
            values,
            payloads,
        })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Account calldata that runs the whole batch.
    ///
    /// A single call goes through `execute`; several calls go through `executeBatch`, using the
    /// value-carrying overload only when some call actually sends value.
    pub fn execute_calldata(&self) -> Result<Bytes> {
        if self.targets.len() != self.values.len() || self.targets.len() != self.payloads.len() {
            return Err(UserOpError::InvalidBatchShape("column lengths differ".into()));
        }

        match self.len() {
            0 => Err(UserOpError::InvalidBatchShape("batch has no calls".into())),
            1 => encode_account_call(
                EXECUTE,
                "execute",
                &[
                    Token::Address(self.targets[0]),
                    Token::Uint(self.values[0]),
                    Token::Bytes(self.payloads[0].to_vec()),
                ],
            ),
            _ => {
                let dest = Token::Array(self.targets.iter().copied().map(Token::Address).collect());
                let func = Token::Array(
                    self.payloads
                        .iter()
                        .map(|p| Token::Bytes(p.to_vec()))
                        .collect(),
                );
                if self.values.iter().all(|v| v.is_zero()) {
                    encode_account_call(EXECUTE_BATCH, "executeBatch", &[dest, func])
                } else {
                    let value =
                        Token::Array(self.values.iter().copied().map(Token::Uint).collect());
                    encode_account_call(
                        EXECUTE_BATCH_WITH_VALUE,
                        "executeBatch",
                        &[dest, value, func],
                    )
                }
            }
        }
    }
}

fn encode_account_call(signature: &str, name: &str, args: &[Token]) -> Result<Bytes> {
    let abi = AbiParser::default()
        .parse(&[signature])
        .map_err(|e| UserOpError::Abi(format!("{name}: {e}")))?;
    let function = abi
        .function(name)
        .map_err(|e| UserOpError::Abi(format!("{name}: {e}")))?;
    let calldata = function
        .encode_input(args)
        .map_err(|e| UserOpError::Abi(format!("{name}: {e}")))?;
    Ok(Bytes::from(calldata))
}

/// ERC-20 `approve(to, amount)` followed by `transfer(to, amount)` on the same token.
pub fn erc20_approve_and_transfer(token: Address, to: Address, amount: U256) -> Vec<Call> {
    let approve = ApproveCall {
        spender: to,
        amount,
    }
    .encode();
    let transfer = TransferCall { to, amount }.encode();
    vec![Call::new(token, approve), Call::new(token, transfer)]
}

/// Plain value transfer with empty calldata.
pub fn native_transfer(to: Address, value: U256) -> Vec<Call> {
    vec![Call::with_value(to, value, Bytes::default())]
}
