use crate::error::{Result, UserOpError};
use crate::types::UserOperation;
use ethers::types::U256;

/// Value the preVerificationGas field holds while its own cost is being measured.
pub const PRE_VERIFICATION_GAS_PLACEHOLDER: u64 = 21_000;

/// Base verification allowance before account deployment cost is added.
pub const DEFAULT_VERIFICATION_GAS: u64 = 100_000;

/// Applied to verificationGasLimit once a paymaster takes part in validation.
pub const VERIFICATION_GAS_MULTIPLIER: u64 = 3;

/// Per-byte and per-operation costs a bundler charges before verification runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Overhead {
    pub fixed: U256,
    pub per_user_op: U256,
    pub per_user_op_word: U256,
    pub zero_byte: U256,
    pub non_zero_byte: U256,
    pub bundle_size: U256,
}

impl Default for Overhead {
    fn default() -> Self {
        Self {
            fixed: U256::from(21_000),
            per_user_op: U256::from(18_300),
            per_user_op_word: U256::from(4),
            zero_byte: U256::from(4),
            non_zero_byte: U256::from(16),
            bundle_size: U256::from(1),
        }
    }
}

impl Overhead {
    /// `round(calldata cost + fixed / bundle_size + per_user_op + per_user_op_word * words)`
    ///
    /// `op` must already have its final shape (signature and paymasterAndData at their final
    /// lengths); the preVerificationGas field itself is measured at the placeholder value so the
    /// result does not depend on a previous estimate.
    pub fn calculate_pre_verification_gas(&self, op: &UserOperation) -> Result<U256> {
        const WHAT: &str = "preVerificationGas";
        let overflow = || UserOpError::ArithmeticOverflow(WHAT);

        let mut shaped = op.clone();
        shaped.pre_verification_gas = U256::from(PRE_VERIFICATION_GAS_PLACEHOLDER);
        let packed = shaped.pack();

        let zero_bytes = packed.iter().filter(|b| **b == 0).count();
        let non_zero_bytes = packed.len() - zero_bytes;
        let call_data_cost = self
            .zero_byte
            .checked_mul(U256::from(zero_bytes))
            .zip(self.non_zero_byte.checked_mul(U256::from(non_zero_bytes)))
            .and_then(|(z, nz)| z.checked_add(nz))
            .ok_or_else(overflow)?;

        // Work in 1/(32 * bundle_size) units so the fractional word count and the fixed share
        // are rounded once, at the end.
        let word = U256::from(32);
        let denominator = word.checked_mul(self.bundle_size).ok_or_else(overflow)?;
        if denominator.is_zero() {
            return Err(overflow());
        }
        let whole = call_data_cost
            .checked_add(self.per_user_op)
            .and_then(|v| v.checked_mul(denominator))
            .ok_or_else(overflow)?;
        let fixed_share = self.fixed.checked_mul(word).ok_or_else(overflow)?;
        let words = self
            .per_user_op_word
            .checked_mul(U256::from(packed.len() + 31))
            .and_then(|v| v.checked_mul(self.bundle_size))
            .ok_or_else(overflow)?;
        let numerator = whole
            .checked_add(fixed_share)
            .and_then(|v| v.checked_add(words))
            .ok_or_else(overflow)?;

        // Half rounds up.
        let two = U256::from(2);
        numerator
            .checked_mul(two)
            .and_then(|v| v.checked_add(denominator))
            .zip(denominator.checked_mul(two))
            .and_then(|(v, d)| v.checked_div(d))
            .ok_or_else(overflow)
    }
}

/// verificationGasLimit after paymaster involvement.
pub fn pad_verification_gas(verification_gas_limit: U256) -> Result<U256> {
    verification_gas_limit
        .checked_mul(U256::from(VERIFICATION_GAS_MULTIPLIER))
        .ok_or(UserOpError::ArithmeticOverflow("verificationGasLimit"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Bytes;

    fn dummy_signed() -> UserOperation {
        UserOperation {
            signature: Bytes::from(vec![1u8; 65]),
            ..Default::default()
        }
    }

    #[test]
    fn pre_verification_gas_of_minimal_operation() {
        let pvg = Overhead::default()
            .calculate_pre_verification_gas(&dummy_signed())
            .unwrap();
        assert_eq!(pvg, U256::from(42_592));
    }

    #[test]
    fn pre_verification_gas_calculation() {
        let op = UserOperation {
            sender: "0x9c5754De1443984659E1b3a8d1931D83475ba29C".parse().unwrap(),
            call_gas_limit: 200_000.into(),
            verification_gas_limit: 100_000.into(),
            max_fee_per_gas: 3_000_000_000u64.into(),
            max_priority_fee_per_gas: 1_000_000_000u64.into(),
            signature: "0x7cb39607585dee8e297d0d7a669ad8c5e43975220b6773c10a138deadbc8ec864981de4b9b3c735288a217115fb33f8326a61ddabc60a534e3b5536515c70f931c".parse().unwrap(),
            ..Default::default()
        };
        let overhead = Overhead::default();
        assert_eq!(
            overhead.calculate_pre_verification_gas(&op).unwrap(),
            U256::from(42_976)
        );

        // The field being estimated does not feed into its own estimate.
        let mut estimated = op.clone();
        estimated.pre_verification_gas = 55_555.into();
        assert_eq!(
            overhead.calculate_pre_verification_gas(&estimated).unwrap(),
            U256::from(42_976)
        );
    }

    #[test]
    fn overhead_parameters_are_respected() {
        let op = dummy_signed();
        let halved = Overhead {
            bundle_size: U256::from(2),
            ..Default::default()
        };
        assert_eq!(
            halved.calculate_pre_verification_gas(&op).unwrap(),
            U256::from(32_092)
        );

        let wordier = Overhead {
            per_user_op_word: U256::from(5),
            ..Default::default()
        };
        assert_eq!(
            wordier.calculate_pre_verification_gas(&op).unwrap(),
            U256::from(42_611)
        );
    }

    #[test]
    fn zero_bundle_size_is_an_error() {
        let overhead = Overhead {
            bundle_size: U256::zero(),
            ..Default::default()
        };
        assert!(matches!(
            overhead.calculate_pre_verification_gas(&dummy_signed()),
            Err(UserOpError::ArithmeticOverflow(_))
        ));
    }

    #[test]
    fn longer_paymaster_data_costs_more() {
        let overhead = Overhead::default();
        let bare = overhead.calculate_pre_verification_gas(&dummy_signed()).unwrap();
        let sponsored = UserOperation {
            paymaster_and_data: Bytes::from(vec![1u8; 149]),
            ..dummy_signed()
        };
        assert!(overhead.calculate_pre_verification_gas(&sponsored).unwrap() > bare);
    }

    #[test]
    fn verification_gas_is_tripled() {
        assert_eq!(
            pad_verification_gas(U256::from(100_000)).unwrap(),
            U256::from(300_000)
        );
        assert!(matches!(
            pad_verification_gas(U256::MAX),
            Err(UserOpError::ArithmeticOverflow("verificationGasLimit"))
        ));
    }
}
