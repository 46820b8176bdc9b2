use crate::contracts::{EntryPoint, SimpleAccountFactory};
use crate::error::{Result, UserOpError};
use crate::fees::FeeSnapshot;
use ethers::providers::Middleware;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, TransactionRequest, U256};
use std::sync::Arc;

/// Read-only chain queries a build needs.
///
/// Nothing here is cached: every build reads fresh values, the account nonce in particular.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ChainState: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;

    /// Suggested priority tip plus the latest block's base fee, if the chain has one.
    async fn fee_snapshot(&self) -> Result<FeeSnapshot>;

    /// Counterfactual account address from `SimpleAccountFactory.getAddress`.
    async fn account_address(&self, factory: Address, owner: Address, salt: U256)
        -> Result<Address>;

    async fn is_deployed(&self, account: Address) -> Result<bool>;

    /// `EntryPoint.getNonce(sender, 0)`.
    async fn entry_point_nonce(&self, entry_point: Address, sender: Address) -> Result<U256>;

    async fn estimate_gas(&self, from: Option<Address>, to: Address, data: Bytes) -> Result<U256>;
}

/// [`ChainState`] over any ethers middleware.
#[derive(Debug, Clone)]
pub struct RpcChain<M> {
    client: Arc<M>,
}

impl<M: Middleware + 'static> RpcChain<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Arc<M> {
        self.client.clone()
    }
}

#[async_trait::async_trait]
impl<M> ChainState for RpcChain<M>
where
    M: Middleware + 'static,
{
    async fn chain_id(&self) -> Result<u64> {
        let id = self
            .client
            .get_chainid()
            .await
            .map_err(|e| UserOpError::chain("eth_chainId", e))?;
        if id > U256::from(u64::MAX) {
            return Err(UserOpError::chain(
                "eth_chainId",
                format!("chain id {id} out of range"),
            ));
        }
        Ok(id.as_u64())
    }

    async fn fee_snapshot(&self) -> Result<FeeSnapshot> {
        // Not every middleware exposes this one, so go through the raw passthrough.
        let suggested_tip: U256 = self
            .client
            .provider()
            .request("eth_maxPriorityFeePerGas", ())
            .await
            .map_err(|e| UserOpError::FeeUnavailable(format!("eth_maxPriorityFeePerGas: {e}")))?;

        let block = self
            .client
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| UserOpError::FeeUnavailable(format!("latest block: {e}")))?
            .ok_or_else(|| UserOpError::FeeUnavailable("latest block not found".into()))?;

        Ok(FeeSnapshot {
            base_fee_per_gas: block.base_fee_per_gas,
            suggested_tip,
        })
    }

    async fn account_address(
        &self,
        factory: Address,
        owner: Address,
        salt: U256,
    ) -> Result<Address> {
        SimpleAccountFactory::new(factory, self.client.clone())
            .get_address(owner, salt)
            .call()
            .await
            .map_err(|e| UserOpError::chain("factory.getAddress", e))
    }

    async fn is_deployed(&self, account: Address) -> Result<bool> {
        let code = self
            .client
            .get_code(account, None)
            .await
            .map_err(|e| UserOpError::chain("eth_getCode", e))?;
        Ok(!code.as_ref().is_empty())
    }

    async fn entry_point_nonce(&self, entry_point: Address, sender: Address) -> Result<U256> {
        EntryPoint::new(entry_point, self.client.clone())
            .get_nonce(sender, U256::zero())
            .call()
            .await
            .map_err(|e| UserOpError::chain("entryPoint.getNonce", e))
    }

    async fn estimate_gas(&self, from: Option<Address>, to: Address, data: Bytes) -> Result<U256> {
        let mut request = TransactionRequest::new().to(to).data(data);
        if let Some(from) = from {
            request = request.from(from);
        }
        let tx: TypedTransaction = request.into();
        self.client
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| UserOpError::chain("eth_estimateGas", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::{MockProvider, Provider};

    fn mocked() -> (RpcChain<Provider<MockProvider>>, MockProvider) {
        let (provider, mock) = Provider::mocked();
        (RpcChain::new(Arc::new(provider)), mock)
    }

    #[tokio::test]
    async fn fee_snapshot_without_answers_is_fee_unavailable() {
        let (chain, _mock) = mocked();
        let err = chain.fee_snapshot().await.unwrap_err();
        assert!(matches!(err, UserOpError::FeeUnavailable(_)));
    }

    #[tokio::test]
    async fn deployment_check_follows_code_size() {
        let (chain, mock) = mocked();
        mock.push::<Bytes, _>(Bytes::from(vec![0x60u8, 0x80])).unwrap();
        assert!(chain.is_deployed(Address::repeat_byte(1)).await.unwrap());

        mock.push::<Bytes, _>(Bytes::default()).unwrap();
        assert!(!chain.is_deployed(Address::repeat_byte(1)).await.unwrap());
    }

    #[tokio::test]
    async fn chain_id_must_fit_in_u64() {
        let (chain, mock) = mocked();
        mock.push::<U256, _>(U256::from(80_001u64)).unwrap();
        assert_eq!(chain.chain_id().await.unwrap(), 80_001);

        mock.push::<U256, _>(U256::MAX).unwrap();
        assert!(matches!(
            chain.chain_id().await,
            Err(UserOpError::Chain {
                query: "eth_chainId",
                ..
            })
        ));
    }
}
