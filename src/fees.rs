use crate::chain::ChainState;
use crate::error::{Result, UserOpError};
use ethers::types::U256;

/// Safety margin added on top of the network-suggested tip, in percent.
pub const PRIORITY_FEE_BUFFER_PERCENT: u64 = 13;

/// Chain fee levels captured once per build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeeSnapshot {
    /// `None` on chains without EIP-1559.
    pub base_fee_per_gas: Option<U256>,
    pub suggested_tip: U256,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GasFees {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl GasFees {
    /// `tip + floor(tip / 100) * 13`, and twice the base fee on top of that when there is one.
    pub fn from_snapshot(snapshot: &FeeSnapshot) -> Result<Self> {
        let tip = snapshot.suggested_tip;
        let buffer = (tip / U256::from(100u64))
            .checked_mul(U256::from(PRIORITY_FEE_BUFFER_PERCENT))
            .ok_or(UserOpError::ArithmeticOverflow("priority fee buffer"))?;
        let max_priority_fee_per_gas = tip
            .checked_add(buffer)
            .ok_or(UserOpError::ArithmeticOverflow("maxPriorityFeePerGas"))?;

        let max_fee_per_gas = match snapshot.base_fee_per_gas {
            Some(base_fee) => base_fee
                .checked_mul(U256::from(2u64))
                .and_then(|doubled| doubled.checked_add(max_priority_fee_per_gas))
                .ok_or(UserOpError::ArithmeticOverflow("maxFeePerGas"))?,
            None => max_priority_fee_per_gas,
        };

        Ok(Self {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }
}

/// Query the chain tip and base fee, then derive the fee caps for one build.
pub async fn estimate_fees<C: ChainState + ?Sized>(chain: &C) -> Result<GasFees> {
    let snapshot = chain.fee_snapshot().await?;
    let fees = GasFees::from_snapshot(&snapshot)?;
    tracing::info!(
        base_fee = ?snapshot.base_fee_per_gas,
        tip = %snapshot.suggested_tip,
        max_fee_per_gas = %fees.max_fee_per_gas,
        max_priority_fee_per_gas = %fees.max_priority_fee_per_gas,
        "estimated fees"
    );
    Ok(fees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainState;

    fn snapshot(base: Option<u64>, tip: u64) -> FeeSnapshot {
        FeeSnapshot {
            base_fee_per_gas: base.map(U256::from),
            suggested_tip: U256::from(tip),
        }
    }

    #[test]
    fn buffer_uses_floor_division() {
        // 1_999 / 100 = 19, 19 * 13 = 247
        let fees = GasFees::from_snapshot(&snapshot(None, 1_999)).unwrap();
        assert_eq!(fees.max_priority_fee_per_gas, U256::from(2_246));
    }

    #[test]
    fn base_fee_is_doubled_on_top_of_priority_fee() {
        for (base, tip) in [(0u64, 0u64), (7, 99), (30_000_000_000, 1_500_000_000), (1, 100)] {
            let fees = GasFees::from_snapshot(&snapshot(Some(base), tip)).unwrap();
            let priority = tip + (tip / 100) * 13;
            assert_eq!(fees.max_priority_fee_per_gas, U256::from(priority));
            assert_eq!(fees.max_fee_per_gas, U256::from(2 * base + priority));
        }
    }

    #[test]
    fn missing_base_fee_caps_at_priority_fee() {
        let fees = GasFees::from_snapshot(&snapshot(None, 1_000_000_000)).unwrap();
        assert_eq!(fees.max_priority_fee_per_gas, U256::from(1_130_000_000u64));
        assert_eq!(fees.max_fee_per_gas, fees.max_priority_fee_per_gas);
    }

    #[test]
    fn overflow_is_reported_not_wrapped() {
        let err = GasFees::from_snapshot(&FeeSnapshot {
            base_fee_per_gas: None,
            suggested_tip: U256::MAX,
        })
        .unwrap_err();
        assert!(matches!(err, UserOpError::ArithmeticOverflow(_)));

        let err = GasFees::from_snapshot(&FeeSnapshot {
            base_fee_per_gas: Some(U256::MAX / 2 + 1),
            suggested_tip: U256::zero(),
        })
        .unwrap_err();
        assert!(matches!(err, UserOpError::ArithmeticOverflow("maxFeePerGas")));
    }

    #[tokio::test]
    async fn estimate_fees_propagates_fee_errors() {
        let mut chain = MockChainState::new();
        chain
            .expect_fee_snapshot()
            .returning(|| Err(UserOpError::FeeUnavailable("rpc down".into())));
        let err = estimate_fees(&chain).await.unwrap_err();
        assert!(matches!(err, UserOpError::FeeUnavailable(_)));
    }

    #[tokio::test]
    async fn estimate_fees_uses_snapshot() {
        let mut chain = MockChainState::new();
        chain
            .expect_fee_snapshot()
            .times(1)
            .returning(|| Ok(snapshot(Some(10), 200)));
        let fees = estimate_fees(&chain).await.unwrap();
        assert_eq!(fees.max_priority_fee_per_gas, U256::from(226));
        assert_eq!(fees.max_fee_per_gas, U256::from(246));
    }
}
