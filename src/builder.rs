use crate::batch::{encode_batch, Call};
use crate::chain::ChainState;
use crate::config::Config;
use crate::contracts::CreateAccountCall;
use crate::error::{Result, UserOpError};
use crate::fees::{estimate_fees, GasFees};
use crate::gas::{pad_verification_gas, Overhead, DEFAULT_VERIFICATION_GAS};
use crate::paymaster::{PaymasterContext, PaymasterSponsor, SponsorshipResult};
use crate::placeholder::{dummy_signature, Placeholders};
use crate::types::{SignedUserOperation, UserOperation};
use ethers::abi::AbiEncode;
use ethers::signers::Signer;
use ethers::types::{Address, Bytes, U256};
use std::fmt;

/// Where a draft is in its life. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Draft,
    GasEstimated,
    PaymasterPending,
    PaymasterResolved,
    Signed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Draft => "draft",
            Stage::GasEstimated => "gas-estimated",
            Stage::PaymasterPending => "paymaster-pending",
            Stage::PaymasterResolved => "paymaster-resolved",
            Stage::Signed => "signed",
        })
    }
}

/// A user operation moving from `Draft` to `Signed`.
///
/// Each method is one transition and checks the current stage first. Once signed, the draft is
/// frozen; any further mutation is [`UserOpError::OperationAlreadySigned`].
#[derive(Clone, Debug)]
pub struct UserOpDraft {
    op: UserOperation,
    stage: Stage,
    overhead: Overhead,
    placeholder_len: Option<usize>,
}

impl UserOpDraft {
    pub fn new(
        sender: Address,
        nonce: U256,
        init_code: Bytes,
        call_data: Bytes,
        overhead: Overhead,
    ) -> Self {
        Self {
            op: UserOperation {
                sender,
                nonce,
                init_code,
                call_data,
                ..Default::default()
            },
            stage: Stage::Draft,
            overhead,
            placeholder_len: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn operation(&self) -> &UserOperation {
        &self.op
    }

    fn require(&self, action: &'static str, allowed: &[Stage]) -> Result<()> {
        if self.stage == Stage::Signed {
            return Err(UserOpError::OperationAlreadySigned(action));
        }
        if !allowed.contains(&self.stage) {
            return Err(UserOpError::UnexpectedStage {
                action,
                stage: self.stage,
            });
        }
        Ok(())
    }

    fn advance(&mut self, to: Stage) {
        tracing::debug!(sender = ?self.op.sender, from = %self.stage, to = %to, "user operation stage");
        self.stage = to;
    }

    /// Fill fee and gas fields. preVerificationGas is measured with a placeholder signature and
    /// no paymaster, which is the final shape of an unsponsored operation.
    pub fn apply_gas(
        &mut self,
        fees: GasFees,
        call_gas_limit: U256,
        verification_gas_limit: U256,
    ) -> Result<()> {
        self.require("apply gas", &[Stage::Draft])?;

        let mut op = self.op.clone();
        op.max_fee_per_gas = fees.max_fee_per_gas;
        op.max_priority_fee_per_gas = fees.max_priority_fee_per_gas;
        op.call_gas_limit = call_gas_limit;
        op.verification_gas_limit = verification_gas_limit;
        op.paymaster_and_data = Bytes::default();
        op.signature = dummy_signature();
        op.pre_verification_gas = self.overhead.calculate_pre_verification_gas(&op)?;

        self.op = op;
        self.advance(Stage::GasEstimated);
        Ok(())
    }

    /// Shape the draft for a paymaster: filler payload and signature, preVerificationGas
    /// re-measured, verificationGasLimit tripled.
    pub fn attach_placeholders(&mut self, placeholders: &Placeholders) -> Result<()> {
        self.require("attach placeholders", &[Stage::GasEstimated])?;

        let mut op = self.op.clone();
        op.paymaster_and_data = placeholders.paymaster_and_data.clone();
        op.signature = placeholders.signature.clone();
        op.pre_verification_gas = self.overhead.calculate_pre_verification_gas(&op)?;
        op.verification_gas_limit = pad_verification_gas(op.verification_gas_limit)?;

        tracing::info!(
            pre_verification_gas = %op.pre_verification_gas,
            verification_gas_limit = %op.verification_gas_limit,
            "gas padded for paymaster validation"
        );
        self.op = op;
        self.placeholder_len = Some(placeholders.paymaster_and_data.len());
        self.advance(Stage::PaymasterPending);
        Ok(())
    }

    /// Swap the filler for the paymaster's real payload.
    ///
    /// preVerificationGas is not re-measured here: the paymaster signed over the current value.
    pub fn resolve_paymaster(&mut self, sponsorship: SponsorshipResult) -> Result<()> {
        self.require("resolve paymaster", &[Stage::PaymasterPending])?;
        if sponsorship.paymaster_and_data.is_empty() {
            return Err(UserOpError::SponsorshipDenied(
                "empty paymasterAndData".into(),
            ));
        }

        let mut op = self.op.clone();
        if let Some(gas) = sponsorship.call_gas_limit {
            op.call_gas_limit = gas;
        }
        if let Some(gas) = sponsorship.verification_gas_limit {
            op.verification_gas_limit = gas;
        }
        if let Some(gas) = sponsorship.pre_verification_gas {
            op.pre_verification_gas = gas;
        }
        op.paymaster_and_data = sponsorship.paymaster_and_data;

        if let Some(expected) = self.placeholder_len {
            if expected != op.paymaster_and_data.len() {
                tracing::warn!(
                    placeholder = expected,
                    actual = op.paymaster_and_data.len(),
                    "paymasterAndData length differs from placeholder"
                );
            }
        }
        let needed = self.overhead.calculate_pre_verification_gas(&op)?;
        if needed > op.pre_verification_gas {
            tracing::warn!(
                needed = %needed,
                set = %op.pre_verification_gas,
                "preVerificationGas is below what the final payload costs"
            );
        }

        self.op = op;
        self.advance(Stage::PaymasterResolved);
        Ok(())
    }

    /// EIP-191 signature over the user operation hash, which is what SimpleAccount checks.
    pub async fn sign<S: Signer>(
        &mut self,
        signer: &S,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<SignedUserOperation> {
        self.require("sign", &[Stage::GasEstimated, Stage::PaymasterResolved])?;

        let user_op_hash = self.op.hash(entry_point, chain_id);
        let signature = signer
            .sign_message(user_op_hash.as_bytes())
            .await
            .map_err(|e| UserOpError::Signing(e.to_string()))?;

        self.op.signature = Bytes::from(signature.to_vec());
        self.advance(Stage::Signed);
        Ok(SignedUserOperation::new(self.op.clone(), user_op_hash))
    }
}

/// Fixed inputs for every build.
#[derive(Clone, Debug)]
pub struct BuilderSettings {
    pub entry_point: Address,
    pub factory: Address,
    pub salt: U256,
    pub paymaster_context: PaymasterContext,
    pub overhead: Overhead,
    pub placeholders: Placeholders,
}

impl BuilderSettings {
    pub fn new(entry_point: Address, factory: Address) -> Self {
        Self {
            entry_point,
            factory,
            salt: U256::zero(),
            paymaster_context: PaymasterContext::default(),
            overhead: Overhead::default(),
            placeholders: Placeholders::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            salt: config.salt,
            paymaster_context: PaymasterContext::new(config.paymaster_context.clone()),
            ..Self::new(config.entry_point, config.factory)
        }
    }
}

/// `factory ++ createAccount(owner, salt)`
pub fn account_init_code(factory: Address, owner: Address, salt: U256) -> Bytes {
    let create = CreateAccountCall { owner, salt }.encode();
    let mut init_code = Vec::with_capacity(20 + create.len());
    init_code.extend_from_slice(factory.as_bytes());
    init_code.extend_from_slice(&create);
    Bytes::from(init_code)
}

/// Runs the whole draft flow for one call batch against live chain state.
///
/// Builds for the same sender must not overlap: the nonce is read fresh each time and two
/// concurrent builds would sign the same one.
pub struct UserOpBuilder<C, S> {
    chain: C,
    signer: S,
    paymaster: Option<Box<dyn PaymasterSponsor>>,
    settings: BuilderSettings,
}

impl<C: ChainState, S: Signer> UserOpBuilder<C, S> {
    pub fn new(chain: C, signer: S, settings: BuilderSettings) -> Self {
        Self {
            chain,
            signer,
            paymaster: None,
            settings,
        }
    }

    pub fn with_paymaster(mut self, paymaster: Box<dyn PaymasterSponsor>) -> Self {
        self.paymaster = Some(paymaster);
        self
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    pub fn settings(&self) -> &BuilderSettings {
        &self.settings
    }

    pub fn owner(&self) -> Address {
        self.signer.address()
    }

    /// Counterfactual account address for this owner and salt.
    pub async fn account_address(&self) -> Result<Address> {
        self.chain
            .account_address(self.settings.factory, self.owner(), self.settings.salt)
            .await
    }

    pub async fn build(&self, calls: &[Call]) -> Result<SignedUserOperation> {
        let call_data = encode_batch(calls)?.execute_calldata()?;
        let BuilderSettings {
            entry_point,
            factory,
            salt,
            ..
        } = self.settings;
        let owner = self.owner();

        let chain_id = self.chain.chain_id().await?;
        let sender = self.chain.account_address(factory, owner, salt).await?;
        let deployed = self.chain.is_deployed(sender).await?;
        let init_code = if deployed {
            Bytes::default()
        } else {
            account_init_code(factory, owner, salt)
        };
        let nonce = self.chain.entry_point_nonce(entry_point, sender).await?;
        tracing::info!(sender = ?sender, deployed, nonce = %nonce, calls = calls.len(), "building user operation");

        let mut draft = UserOpDraft::new(
            sender,
            nonce,
            init_code,
            call_data,
            self.settings.overhead.clone(),
        );

        let fees = estimate_fees(&self.chain).await?;
        let call_gas_limit = self
            .chain
            .estimate_gas(Some(entry_point), sender, draft.operation().call_data.clone())
            .await?;
        let creation_gas = if deployed {
            U256::zero()
        } else {
            let factory_call = Bytes::from(draft.operation().init_code[20..].to_vec());
            self.chain.estimate_gas(None, factory, factory_call).await?
        };
        let verification_gas_limit = U256::from(DEFAULT_VERIFICATION_GAS)
            .checked_add(creation_gas)
            .ok_or(UserOpError::ArithmeticOverflow("verificationGasLimit"))?;
        draft.apply_gas(fees, call_gas_limit, verification_gas_limit)?;

        if let Some(paymaster) = &self.paymaster {
            draft.attach_placeholders(&self.settings.placeholders)?;
            let sponsorship = paymaster
                .sponsor(
                    draft.operation(),
                    entry_point,
                    &self.settings.paymaster_context,
                )
                .await?;
            draft.resolve_paymaster(sponsorship)?;
        }

        let signed = draft.sign(&self.signer, entry_point, chain_id).await?;
        tracing::info!(user_op_hash = ?signed.user_op_hash(), "user operation signed");
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::erc20_approve_and_transfer;
    use crate::chain::MockChainState;
    use crate::fees::FeeSnapshot;
    use crate::paymaster::MockPaymasterSponsor;
    use crate::placeholder::PAYMASTER_FILLER_LEN;
    use ethers::signers::LocalWallet;
    use ethers::types::Signature;

    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const CHAIN_ID: u64 = 80_001;
    const CALL_GAS: u64 = 61_234;
    const CREATION_GAS: u64 = 250_000;

    fn wallet() -> LocalWallet {
        KEY.parse().unwrap()
    }

    fn entry_point() -> Address {
        "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789".parse().unwrap()
    }

    fn factory() -> Address {
        "0x9406Cc6185a346906296840746125a0E44976454".parse().unwrap()
    }

    fn token() -> Address {
        "0x3870419Ba2BBf0127060bCB37f69A1b1C090992B".parse().unwrap()
    }

    fn account() -> Address {
        Address::repeat_byte(0xaa)
    }

    fn chain(deployed: bool) -> MockChainState {
        let mut chain = MockChainState::new();
        chain.expect_chain_id().returning(|| Ok(CHAIN_ID));
        chain
            .expect_account_address()
            .returning(|_, _, _| Ok(account()));
        chain.expect_is_deployed().returning(move |_| Ok(deployed));
        chain
            .expect_entry_point_nonce()
            .returning(|_, _| Ok(U256::from(3)));
        chain.expect_fee_snapshot().returning(|| {
            Ok(FeeSnapshot {
                base_fee_per_gas: Some(U256::from(10_000_000_000u64)),
                suggested_tip: U256::from(1_500_000_000u64),
            })
        });
        chain
            .expect_estimate_gas()
            .withf(|from, to, _| *from == Some(entry_point()) && *to == account())
            .returning(|_, _, _| Ok(U256::from(CALL_GAS)));
        chain
            .expect_estimate_gas()
            .withf(|from, to, _| from.is_none() && *to == factory())
            .returning(|_, _, _| Ok(U256::from(CREATION_GAS)));
        chain
    }

    fn builder(deployed: bool) -> UserOpBuilder<MockChainState, LocalWallet> {
        UserOpBuilder::new(
            chain(deployed),
            wallet(),
            BuilderSettings::new(entry_point(), factory()),
        )
    }

    fn self_transfer() -> Vec<Call> {
        erc20_approve_and_transfer(token(), account(), U256::zero())
    }

    fn gas_estimated_draft() -> UserOpDraft {
        let mut draft = UserOpDraft::new(
            account(),
            U256::zero(),
            Bytes::default(),
            Bytes::from(vec![0xb6u8, 0x1d, 0x27, 0xf6]),
            Overhead::default(),
        );
        draft
            .apply_gas(
                GasFees {
                    max_fee_per_gas: U256::from(100),
                    max_priority_fee_per_gas: U256::from(10),
                },
                U256::from(CALL_GAS),
                U256::from(DEFAULT_VERIFICATION_GAS),
            )
            .unwrap();
        draft
    }

    #[tokio::test]
    async fn unsponsored_build_for_new_account() {
        let signed = builder(false).build(&self_transfer()).await.unwrap();
        let op = signed.operation();

        assert_eq!(op.sender, account());
        assert!(op.paymaster_and_data.is_empty());
        assert_eq!(op.nonce, U256::from(3));
        assert_eq!(
            op.init_code,
            account_init_code(factory(), wallet().address(), U256::zero())
        );
        assert_eq!(op.call_gas_limit, U256::from(CALL_GAS));
        assert_eq!(
            op.verification_gas_limit,
            U256::from(DEFAULT_VERIFICATION_GAS + CREATION_GAS)
        );
        assert_eq!(op.max_priority_fee_per_gas, U256::from(1_695_000_000u64));
        assert_eq!(op.max_fee_per_gas, U256::from(21_695_000_000u64));
        assert_eq!(&op.call_data[..4], &[0x18, 0xdf, 0xb3, 0xc7]);
        assert_eq!(op.signature.len(), 65);
        assert_eq!(signed.user_op_hash(), op.hash(entry_point(), CHAIN_ID));

        // measured with the all-non-zero dummy signature, so never below the real cost
        let measured = UserOperation {
            signature: dummy_signature(),
            ..op.clone()
        };
        let overhead = Overhead::default();
        assert_eq!(
            op.pre_verification_gas,
            overhead.calculate_pre_verification_gas(&measured).unwrap()
        );
        assert!(op.pre_verification_gas >= overhead.calculate_pre_verification_gas(op).unwrap());
    }

    #[tokio::test]
    async fn deployed_account_has_no_init_code() {
        let signed = builder(true).build(&self_transfer()).await.unwrap();
        let op = signed.operation();
        assert!(op.init_code.is_empty());
        assert_eq!(
            op.verification_gas_limit,
            U256::from(DEFAULT_VERIFICATION_GAS)
        );
    }

    #[tokio::test]
    async fn sponsored_build_uses_paymaster_payload_and_triples_verification_gas() {
        let payload = Bytes::from(vec![0x5au8; PAYMASTER_FILLER_LEN]);
        let returned = payload.clone();

        let mut paymaster = MockPaymasterSponsor::new();
        paymaster
            .expect_sponsor()
            .withf(|op, ep, ctx| {
                op.paymaster_and_data.len() == PAYMASTER_FILLER_LEN
                    && *ep == entry_point()
                    && ctx.policy == "payg"
            })
            .times(1)
            .returning(move |_, _, _| Ok(SponsorshipResult::new(returned.clone())));

        let signed = builder(false)
            .with_paymaster(Box::new(paymaster))
            .build(&self_transfer())
            .await
            .unwrap();
        let op = signed.operation();

        assert_eq!(op.sender, account());
        assert_eq!(op.paymaster_and_data, payload);
        assert_eq!(
            op.verification_gas_limit,
            U256::from(3 * (DEFAULT_VERIFICATION_GAS + CREATION_GAS))
        );
        assert_eq!(signed.user_op_hash(), op.hash(entry_point(), CHAIN_ID));
    }

    #[tokio::test]
    async fn sponsorship_denial_aborts_the_build() {
        let mut paymaster = MockPaymasterSponsor::new();
        paymaster
            .expect_sponsor()
            .returning(|_, _, _| Err(UserOpError::SponsorshipDenied("not allow-listed".into())));

        let err = builder(true)
            .with_paymaster(Box::new(paymaster))
            .build(&self_transfer())
            .await
            .unwrap_err();
        assert!(matches!(err, UserOpError::SponsorshipDenied(_)));
    }

    #[test]
    fn revised_gas_from_paymaster_is_applied() {
        let mut draft = gas_estimated_draft();
        draft.attach_placeholders(&Placeholders::default()).unwrap();
        draft
            .resolve_paymaster(SponsorshipResult {
                paymaster_and_data: Bytes::from(vec![0x01u8; 20]),
                call_gas_limit: Some(U256::from(90_000)),
                verification_gas_limit: None,
                pre_verification_gas: Some(U256::from(60_000)),
            })
            .unwrap();
        let op = draft.operation();
        assert_eq!(op.call_gas_limit, U256::from(90_000));
        assert_eq!(
            op.verification_gas_limit,
            U256::from(3 * DEFAULT_VERIFICATION_GAS)
        );
        assert_eq!(op.pre_verification_gas, U256::from(60_000));
        assert_eq!(draft.stage(), Stage::PaymasterResolved);
    }

    #[tokio::test]
    async fn signature_recovers_to_owner_and_is_deterministic() {
        let mut first = gas_estimated_draft();
        let mut second = gas_estimated_draft();
        let a = first.sign(&wallet(), entry_point(), CHAIN_ID).await.unwrap();
        let b = second.sign(&wallet(), entry_point(), CHAIN_ID).await.unwrap();
        assert_eq!(a, b);

        let signature = Signature::try_from(a.operation().signature.as_ref()).unwrap();
        let recovered = signature
            .recover(a.user_op_hash().as_bytes().to_vec())
            .unwrap();
        assert_eq!(recovered, wallet().address());
    }

    #[tokio::test]
    async fn signed_draft_is_frozen() {
        let mut draft = gas_estimated_draft();
        draft.sign(&wallet(), entry_point(), CHAIN_ID).await.unwrap();
        assert_eq!(draft.stage(), Stage::Signed);

        assert!(matches!(
            draft.attach_placeholders(&Placeholders::default()),
            Err(UserOpError::OperationAlreadySigned(_))
        ));
        assert!(matches!(
            draft.resolve_paymaster(SponsorshipResult::new(vec![1u8; 20])),
            Err(UserOpError::OperationAlreadySigned(_))
        ));
        assert!(matches!(
            draft.sign(&wallet(), entry_point(), CHAIN_ID).await,
            Err(UserOpError::OperationAlreadySigned("sign"))
        ));
    }

    #[tokio::test]
    async fn out_of_order_transitions_are_rejected() {
        let mut draft = UserOpDraft::new(
            account(),
            U256::zero(),
            Bytes::default(),
            Bytes::default(),
            Overhead::default(),
        );
        assert!(matches!(
            draft.attach_placeholders(&Placeholders::default()),
            Err(UserOpError::UnexpectedStage {
                stage: Stage::Draft,
                ..
            })
        ));
        assert!(matches!(
            draft.sign(&wallet(), entry_point(), CHAIN_ID).await,
            Err(UserOpError::UnexpectedStage { .. })
        ));

        let mut pending = gas_estimated_draft();
        pending.attach_placeholders(&Placeholders::default()).unwrap();
        assert!(matches!(
            pending.sign(&wallet(), entry_point(), CHAIN_ID).await,
            Err(UserOpError::UnexpectedStage {
                stage: Stage::PaymasterPending,
                ..
            })
        ));
    }

    #[test]
    fn settings_follow_config() {
        let config = Config::try_from(crate::config::ConfigFile {
            signing_key: Some(KEY.into()),
            rpc_url: Some("http://localhost:8545".into()),
            salt: Some(9),
            paymaster_context: Some("sponsored".into()),
            ..Default::default()
        })
        .unwrap();
        let settings = BuilderSettings::from_config(&config);
        assert_eq!(settings.entry_point, entry_point());
        assert_eq!(settings.factory, factory());
        assert_eq!(settings.salt, U256::from(9));
        assert_eq!(settings.paymaster_context.policy, "sponsored");
    }

    #[test]
    fn placeholders_raise_pre_verification_gas() {
        let mut draft = gas_estimated_draft();
        let bare = draft.operation().pre_verification_gas;
        draft.attach_placeholders(&Placeholders::default()).unwrap();
        assert!(draft.operation().pre_verification_gas > bare);
        assert_eq!(
            draft.operation().paymaster_and_data.len(),
            PAYMASTER_FILLER_LEN
        );
    }
}
