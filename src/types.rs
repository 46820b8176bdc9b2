use ethers::abi::{self, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// Note: EntryPoint v0.7 uses a *different* packed struct layout.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// Tokens in Solidity struct order, signature included.
    fn abi_tokens(&self) -> Vec<Token> {
        vec![
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::Bytes(self.init_code.to_vec()),
            Token::Bytes(self.call_data.to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::Bytes(self.paymaster_and_data.to_vec()),
            Token::Bytes(self.signature.to_vec()),
        ]
    }

    /// ABI encoding of every field, the way calldata carries it to `handleOps`.
    pub fn pack(&self) -> Bytes {
        abi::encode(&self.abi_tokens()).into()
    }

    /// Encoding used for the signing hash: no signature, dynamic fields replaced by their hash.
    pub fn pack_for_signature(&self) -> Bytes {
        abi::encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(keccak256(&self.paymaster_and_data).to_vec()),
        ])
        .into()
    }

    /// Same value `EntryPoint.getUserOpHash` returns, computed locally.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        let inner = keccak256(self.pack_for_signature());
        H256(keccak256(abi::encode(&[
            Token::FixedBytes(inner.to_vec()),
            Token::Address(entry_point),
            Token::Uint(U256::from(chain_id)),
        ])))
    }
}

/// A fully resolved, signed operation ready for a bundler.
///
/// Only the builder hands these out, so holding one means every field is final.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedUserOperation {
    operation: UserOperation,
    user_op_hash: H256,
}

impl SignedUserOperation {
    pub(crate) fn new(operation: UserOperation, user_op_hash: H256) -> Self {
        Self {
            operation,
            user_op_hash,
        }
    }

    pub fn operation(&self) -> &UserOperation {
        &self.operation
    }

    pub fn user_op_hash(&self) -> H256 {
        self.user_op_hash
    }

    pub fn into_operation(self) -> UserOperation {
        self.operation
    }
}
