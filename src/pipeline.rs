use crate::account::SmartAccount;
use crate::bundler::RelayClient;
use crate::confirm::{await_confirmation, CancelHandle, ConfirmationRequest, Confirmer, PromptResponse};
use crate::error::{normalize_signer_error, UserOpError};
use crate::fees::FeeEstimator;
use crate::gas::GasLimitEstimator;
use crate::sponsor::{Sponsor, SponsorshipNegotiator, SponsorshipPolicy};
use crate::store::{CurrentPatch, OperationStateStore};
use crate::types::{Action, Call, SenderContext, SignatureStage, UserOperation};
use crate::value::{adjust_value, check_sufficient_balance, total_cost};
use ethers::types::{Address, U256};
use std::sync::Arc;
use std::time::Duration;

/// What the caller wants executed.
#[derive(Debug, Clone, Default)]
pub struct UserOpRequest {
    pub calls: Vec<Call>,
    pub action: Option<Action>,
    pub resource_id: Option<String>,
    /// Declared native value; drives sponsorship policy and drain handling.
    pub value: Option<U256>,
    pub signature_stage: SignatureStage,
    pub context: SenderContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Draft,
    FeesEstimated,
    SponsorshipResolved,
    LimitsEstimated,
    ValueAdjusted,
    AwaitingConfirmation,
    Signed,
    Ready,
}

/// Per-attempt knobs set by the retrier.
#[derive(Debug, Clone)]
pub struct PrepareOptions {
    /// Applied to pre-verification gas of self-funded ops; grows with each
    /// gas-too-low retry.
    pub pvg_multiplier: u32,
    pub cancel: CancelHandle,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            pvg_multiplier: 1,
            cancel: CancelHandle::never(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedOperation {
    pub op: UserOperation,
    pub sponsored: bool,
}

/// Collaborators the pipeline is assembled from.
pub struct PipelineDeps {
    pub account: Arc<dyn SmartAccount>,
    pub relay: Arc<dyn RelayClient>,
    pub sponsor: Option<Arc<dyn Sponsor>>,
    pub policy: SponsorshipPolicy,
    pub confirmer: Arc<dyn Confirmer>,
    pub store: Arc<OperationStateStore>,
    pub confirmation_timeout: Duration,
}

/// Builds, prices, sponsors and signs an operation. Fields a sponsor pins are
/// never recomputed afterwards.
pub struct PreparationPipeline {
    account: Arc<dyn SmartAccount>,
    relay: Arc<dyn RelayClient>,
    store: Arc<OperationStateStore>,
    fees: FeeEstimator,
    sponsorship: SponsorshipNegotiator,
    gas: GasLimitEstimator,
    confirmer: Arc<dyn Confirmer>,
    confirmation_timeout: Duration,
}

impl PreparationPipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            fees: FeeEstimator::new(deps.relay.clone(), deps.store.clone()),
            sponsorship: SponsorshipNegotiator::new(deps.sponsor, deps.store.clone(), deps.policy),
            gas: GasLimitEstimator::new(deps.relay.clone()),
            account: deps.account,
            relay: deps.relay,
            store: deps.store,
            confirmer: deps.confirmer,
            confirmation_timeout: deps.confirmation_timeout,
        }
    }

    pub fn sender(&self) -> Address {
        self.account.address()
    }

    pub fn account(&self) -> &Arc<dyn SmartAccount> {
        &self.account
    }

    pub fn store(&self) -> &Arc<OperationStateStore> {
        &self.store
    }

    pub async fn prepare(
        &self,
        request: &UserOpRequest,
        opts: &PrepareOptions,
    ) -> Result<PreparedOperation, UserOpError> {
        let sender = self.account.address();
        let provider = self.relay.provider();
        self.stage(sender, PipelineStage::Draft);

        let (call_data, init_code, nonce) = futures::try_join!(
            async { self.account.encode_calls(&request.calls) },
            self.account.init_code(),
            self.account.nonce(),
        )?;

        let mut op = UserOperation {
            sender,
            nonce,
            init_code,
            call_data,
            signature: self.account.stub_signature(),
            ..Default::default()
        };
        self.store.set_current(
            sender,
            CurrentPatch {
                op: Some(op.clone()),
                action: request.action.clone(),
                resource_id: request.resource_id.clone(),
                value: request.value,
            },
        );

        if provider.fees_before_sponsorship() {
            op.set_fees(self.fees.estimate_fees(sender).await?);
            self.stage(sender, PipelineStage::FeesEstimated);
        }

        let sponsorship = self.sponsorship.negotiate(&op, &request.context).await;
        let sponsored = sponsorship.is_some();
        if let Some(result) = &sponsorship {
            result.apply_to(&mut op);
        }
        self.stage(sender, PipelineStage::SponsorshipResolved);

        if !sponsored && !provider.fees_before_sponsorship() {
            op.set_fees(self.fees.estimate_fees(sender).await?);
            self.stage(sender, PipelineStage::FeesEstimated);
        }

        // sponsored limits are covered by the paymaster signature
        if !sponsored && !op.gas_limits().is_complete() {
            op.set_gas_limits(self.gas.estimate_limits(&op).await?);
            if opts.pvg_multiplier > 1 {
                op.pre_verification_gas = op
                    .pre_verification_gas
                    .saturating_mul(U256::from(opts.pvg_multiplier));
            }
            self.stage(sender, PipelineStage::LimitsEstimated);
        }

        self.store.set_current(sender, CurrentPatch::op(op.clone()));

        if !sponsored {
            self.authorize_unsponsored(&op, request, opts).await?;
        }

        if request.action == Some(Action::TransferEth) {
            if let Some(value) = request.value.filter(|v| !v.is_zero()) {
                self.adjust_drain(&mut op, request, value).await?;
            }
        }

        op.signature = match request.signature_stage {
            SignatureStage::Stub => self.account.stub_signature(),
            SignatureStage::Final => {
                let sig = self.account.sign(&op).await.map_err(normalize_signer_error)?;
                self.stage(sender, PipelineStage::Signed);
                sig
            }
        };

        self.store.set_current(sender, CurrentPatch::op(op.clone()));
        self.stage(sender, PipelineStage::Ready);
        tracing::info!(
            sender = ?sender,
            sponsored,
            nonce = %op.nonce,
            max_fee_per_gas = %op.max_fee_per_gas,
            "prepared user operation"
        );

        Ok(PreparedOperation { op, sponsored })
    }

    /// Tips fail fast on low balance, trading is pre-authorized, everything
    /// else needs the user's confirmation.
    async fn authorize_unsponsored(
        &self,
        op: &UserOperation,
        request: &UserOpRequest,
        opts: &PrepareOptions,
    ) -> Result<(), UserOpError> {
        let sender = op.sender;
        let gas = op.gas_limits();
        let max_cost = total_cost(&gas, op.max_fee_per_gas, request.value);

        match request.action.as_ref() {
            Some(Action::Tip) => {
                let balance = self.account.balance().await?;
                check_sufficient_balance(balance, max_cost)
            }
            Some(Action::Trading) => Ok(()),
            action => {
                // an earlier attempt of this action was confirmed at this cost or more
                let snap = self.store.snapshot(sender);
                if snap.prompt_response == Some(PromptResponse::Confirmed)
                    && snap.confirmed_max_cost.is_some_and(|shown| max_cost <= shown)
                {
                    return Ok(());
                }
                self.stage(sender, PipelineStage::AwaitingConfirmation);
                let prompt = ConfirmationRequest {
                    sender,
                    action: action.cloned().unwrap_or_else(|| Action::from("")),
                    value: request.value,
                    fees: op.fees(),
                    gas,
                    max_cost,
                };
                let answer = await_confirmation(
                    self.confirmer.as_ref(),
                    &prompt,
                    self.confirmation_timeout,
                    &opts.cancel,
                )
                .await?;
                self.store.record_prompt(sender, answer, max_cost);
                match answer {
                    PromptResponse::Confirmed => Ok(()),
                    PromptResponse::Denied => Err(UserOpError::UserRejected),
                }
            }
        }
    }

    /// Shrinks a drain transfer so value plus worst-case gas fits the balance.
    async fn adjust_drain(
        &self,
        op: &mut UserOperation,
        request: &UserOpRequest,
        value: U256,
    ) -> Result<(), UserOpError> {
        let balance = self.account.balance().await?;
        let adjusted = adjust_value(balance, value, &op.gas_limits(), op.max_fee_per_gas)?;
        if adjusted == value {
            return Ok(());
        }

        let [call] = request.calls.as_slice() else {
            return Err(UserOpError::Account(
                "value transfer must be a single call".to_string(),
            ));
        };
        op.call_data = self.account.encode_calls(&[Call {
            value: adjusted,
            ..call.clone()
        }])?;
        self.store.set_current(
            op.sender,
            CurrentPatch {
                op: Some(op.clone()),
                value: Some(adjusted),
                ..Default::default()
            },
        );
        tracing::info!(
            sender = ?op.sender,
            requested = %value,
            sending = %adjusted,
            "reduced transfer value to cover gas"
        );
        self.stage(op.sender, PipelineStage::ValueAdjusted);
        Ok(())
    }

    fn stage(&self, sender: Address, stage: PipelineStage) {
        tracing::debug!(sender = ?sender, stage = ?stage, "pipeline stage");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayProvider;
    use crate::confirm::AutoConfirm;
    use crate::sponsor::{SponsorReply, SponsorshipResult};
    use crate::testing::{CountingConfirmer, FakeAccount, FakeRelay, FakeSponsor, SIGNATURE};
    use crate::types::{FeeFields, GasLimits, OperationDetails};
    use ethers::abi::{ParamType, Token};
    use ethers::types::Bytes;

    struct Harness {
        relay: Arc<FakeRelay>,
        account: Arc<FakeAccount>,
        sponsor: Arc<FakeSponsor>,
        confirmer: Arc<CountingConfirmer>,
        store: Arc<OperationStateStore>,
        pipeline: PreparationPipeline,
    }

    fn sender() -> Address {
        Address::repeat_byte(1)
    }

    fn sponsor_approval(fees: Option<FeeFields>) -> SponsorReply {
        SponsorReply::Approved(SponsorshipResult {
            paymaster_and_data: Bytes::from(vec![0xbb; 20]),
            gas: GasLimits {
                call_gas_limit: U256::from(100),
                verification_gas_limit: U256::from(200),
                pre_verification_gas: U256::from(300),
            },
            fees,
        })
    }

    fn denial() -> SponsorReply {
        SponsorReply::Denied {
            code: crate::error::SponsorshipDenialCode::PaymasterLimitReached,
            message: "limit".to_string(),
        }
    }

    fn harness(provider: RelayProvider, reply: SponsorReply, answer: PromptResponse) -> Harness {
        let relay = Arc::new(FakeRelay::with_provider(provider));
        let account = Arc::new(FakeAccount::new(sender()));
        let sponsor = Arc::new(FakeSponsor::new(Ok(reply)));
        let confirmer = Arc::new(CountingConfirmer::new(answer));
        let store = Arc::new(OperationStateStore::new());
        let pipeline = PreparationPipeline::new(PipelineDeps {
            account: account.clone(),
            relay: relay.clone(),
            sponsor: Some(sponsor.clone()),
            policy: SponsorshipPolicy {
                non_sponsorable_actions: vec![Action::Tip],
                ..Default::default()
            },
            confirmer: confirmer.clone(),
            store: store.clone(),
            confirmation_timeout: Duration::from_secs(5),
        });
        Harness {
            relay,
            account,
            sponsor,
            confirmer,
            store,
            pipeline,
        }
    }

    fn request(action: &str, value: Option<U256>) -> UserOpRequest {
        UserOpRequest {
            calls: vec![Call {
                to: Address::repeat_byte(0x22),
                value: value.unwrap_or_default(),
                data: Bytes::default(),
            }],
            action: Some(Action::from(action)),
            value,
            ..Default::default()
        }
    }

    /// The service starts every action this way before preparing.
    fn begin(h: &Harness, req: &UserOpRequest) {
        h.store.begin_action(
            sender(),
            OperationDetails {
                op: UserOperation::new(sender()),
                action: req.action.clone(),
                resource_id: req.resource_id.clone(),
                value: req.value,
            },
        );
    }

    #[tokio::test]
    async fn sponsored_op_keeps_sponsor_fields_and_skips_prompt() {
        let h = harness(RelayProvider::Generic, sponsor_approval(None), PromptResponse::Denied);
        let req = request("joinSpace", None);
        begin(&h, &req);

        let prepared = h.pipeline.prepare(&req, &PrepareOptions::default()).await.unwrap();

        assert!(prepared.sponsored);
        assert_eq!(prepared.op.call_gas_limit, U256::from(100));
        assert_eq!(prepared.op.pre_verification_gas, U256::from(300));
        // generic relays price before asking the sponsor
        assert_eq!(prepared.op.max_fee_per_gas, U256::from(80));
        assert_eq!(h.relay.estimations(), 0);
        assert_eq!(h.confirmer.prompts(), 0);
        assert_eq!(prepared.op.signature, Bytes::from(SIGNATURE.to_vec()));
        assert_eq!(h.store.current(sender()).unwrap().op, prepared.op);
    }

    #[tokio::test]
    async fn alchemy_uses_sponsor_fees_without_estimating() {
        let sponsor_fees = FeeFields {
            max_fee_per_gas: U256::from(999),
            max_priority_fee_per_gas: U256::from(99),
        };
        let h = harness(
            RelayProvider::Alchemy,
            sponsor_approval(Some(sponsor_fees)),
            PromptResponse::Denied,
        );
        let req = request("joinSpace", None);
        begin(&h, &req);

        let prepared = h.pipeline.prepare(&req, &PrepareOptions::default()).await.unwrap();
        assert_eq!(prepared.op.fees(), sponsor_fees);
        assert_eq!(h.relay.fee_queries(), 0);
    }

    #[tokio::test]
    async fn approval_with_zero_limit_is_not_used() {
        let reply = SponsorReply::Approved(SponsorshipResult {
            paymaster_and_data: Bytes::from(vec![0xbb; 20]),
            gas: GasLimits {
                call_gas_limit: U256::zero(),
                verification_gas_limit: U256::from(200),
                pre_verification_gas: U256::from(300),
            },
            fees: None,
        });
        let h = harness(RelayProvider::Generic, reply, PromptResponse::Confirmed);
        let req = request("joinSpace", None);
        begin(&h, &req);

        let prepared = h.pipeline.prepare(&req, &PrepareOptions::default()).await.unwrap();

        assert!(!prepared.sponsored);
        assert!(prepared.op.paymaster_and_data.is_empty());
        assert_eq!(prepared.op.verification_gas_limit, U256::from(20));
        assert_eq!(prepared.op.pre_verification_gas, U256::from(11));
        assert_eq!(h.relay.estimations(), 1);
        assert_eq!(h.confirmer.prompts(), 1);
    }

    #[tokio::test]
    async fn sponsored_limits_are_never_reestimated() {
        let h = harness(RelayProvider::Generic, sponsor_approval(None), PromptResponse::Denied);
        let req = request("joinSpace", None);
        begin(&h, &req);
        let opts = PrepareOptions {
            pvg_multiplier: 4,
            ..Default::default()
        };

        let prepared = h.pipeline.prepare(&req, &opts).await.unwrap();

        assert!(prepared.sponsored);
        assert_eq!(prepared.op.gas_limits().total(), U256::from(600));
        assert_eq!(h.relay.estimations(), 0);
    }

    #[tokio::test]
    async fn denied_sponsorship_prompts_and_user_can_refuse() {
        let h = harness(RelayProvider::Alchemy, denial(), PromptResponse::Denied);
        let req = request("joinSpace", None);
        begin(&h, &req);

        let err = h.pipeline.prepare(&req, &PrepareOptions::default()).await.unwrap_err();
        assert!(matches!(err, UserOpError::UserRejected));
        assert_eq!(h.confirmer.prompts(), 1);

        let snap = h.store.snapshot(sender());
        assert_eq!(snap.prompt_response, Some(PromptResponse::Denied));
        assert!(snap.rejected_sponsorship_reason.is_some());
        assert_eq!(h.account.signatures(), 0);
    }

    #[tokio::test]
    async fn unsponsored_op_is_estimated_and_signed_after_confirmation() {
        let h = harness(RelayProvider::Alchemy, denial(), PromptResponse::Confirmed);
        let req = request("joinSpace", None);
        begin(&h, &req);

        let prepared = h.pipeline.prepare(&req, &PrepareOptions::default()).await.unwrap();
        assert!(!prepared.sponsored);
        assert!(prepared.op.paymaster_and_data.is_empty());
        assert_eq!(prepared.op.max_fee_per_gas, U256::from(80));
        // 10 estimated, +10%
        assert_eq!(prepared.op.pre_verification_gas, U256::from(11));
        assert_eq!(h.account.signatures(), 1);

        // a second attempt at the same cost does not ask again
        h.pipeline.prepare(&req, &PrepareOptions::default()).await.unwrap();
        assert_eq!(h.confirmer.prompts(), 1);

        // a pricier one does
        let bumped = PrepareOptions {
            pvg_multiplier: 2,
            ..Default::default()
        };
        h.pipeline.prepare(&req, &bumped).await.unwrap();
        assert_eq!(h.confirmer.prompts(), 2);
        // (20 + 20 + 22) * 80
        assert_eq!(
            h.store.snapshot(sender()).confirmed_max_cost,
            Some(U256::from(4960))
        );
    }

    #[tokio::test]
    async fn tip_checks_balance_instead_of_prompting() {
        let h = harness(RelayProvider::Generic, denial(), PromptResponse::Confirmed);
        h.account.set_balance(U256::from(10));
        let req = request("tip", Some(U256::from(5)));
        begin(&h, &req);

        let err = h.pipeline.prepare(&req, &PrepareOptions::default()).await.unwrap_err();
        assert_eq!(err.category(), "insufficient_balance");
        assert_eq!(h.sponsor.calls(), 0);
        assert_eq!(h.confirmer.prompts(), 0);
    }

    #[tokio::test]
    async fn trading_never_prompts() {
        let h = harness(RelayProvider::Generic, denial(), PromptResponse::Denied);
        let req = request("trading", None);
        begin(&h, &req);

        h.pipeline.prepare(&req, &PrepareOptions::default()).await.unwrap();
        assert_eq!(h.confirmer.prompts(), 0);
    }

    #[tokio::test]
    async fn drain_transfer_is_reduced_by_gas() {
        let h = harness(RelayProvider::Generic, denial(), PromptResponse::Confirmed);
        // max fee = 1 wei/gas, gas = 20 + 20 + 11 = 51
        h.relay.set_fee_market(U256::one(), None);
        h.account.set_balance(U256::from(1000));
        let req = request("transferEth", Some(U256::from(1000)));
        begin(&h, &req);

        let prepared = h.pipeline.prepare(&req, &PrepareOptions::default()).await.unwrap();

        let sent = h.account.last_encoded().unwrap();
        assert_eq!(sent[0].value, U256::from(949));
        let tokens = ethers::abi::decode(
            &[ParamType::Address, ParamType::Uint(256), ParamType::Bytes],
            &prepared.op.call_data[4..],
        )
        .unwrap();
        assert_eq!(tokens[1], Token::Uint(U256::from(949)));
        assert_eq!(h.store.current(sender()).unwrap().value, Some(U256::from(949)));
    }

    #[tokio::test]
    async fn drain_that_cannot_cover_gas_fails() {
        let h = harness(RelayProvider::Generic, denial(), PromptResponse::Confirmed);
        h.relay.set_fee_market(U256::from(100), None);
        h.account.set_balance(U256::from(1000));
        let req = request("transferEth", Some(U256::from(1000)));
        begin(&h, &req);

        let err = h.pipeline.prepare(&req, &PrepareOptions::default()).await.unwrap_err();
        assert!(matches!(err, UserOpError::NegativeValue { .. }));
    }

    #[tokio::test]
    async fn pvg_multiplier_only_applies_to_self_funded_ops() {
        let h = harness(RelayProvider::Generic, denial(), PromptResponse::Confirmed);
        let req = request("joinSpace", None);
        begin(&h, &req);
        let opts = PrepareOptions {
            pvg_multiplier: 3,
            ..Default::default()
        };

        let prepared = h.pipeline.prepare(&req, &opts).await.unwrap();
        assert_eq!(prepared.op.pre_verification_gas, U256::from(33));

        let h = harness(RelayProvider::Generic, sponsor_approval(None), PromptResponse::Confirmed);
        begin(&h, &req);
        let prepared = h.pipeline.prepare(&req, &opts).await.unwrap();
        assert_eq!(prepared.op.pre_verification_gas, U256::from(300));
    }

    #[tokio::test]
    async fn stub_stage_skips_signing_and_init_code_is_included() {
        let relay = Arc::new(FakeRelay::default());
        let account = Arc::new(FakeAccount::new(sender()).undeployed());
        let store = Arc::new(OperationStateStore::new());
        let pipeline = PreparationPipeline::new(PipelineDeps {
            account: account.clone(),
            relay,
            sponsor: None,
            policy: SponsorshipPolicy::default(),
            confirmer: Arc::new(AutoConfirm(PromptResponse::Confirmed)),
            store,
            confirmation_timeout: Duration::from_secs(5),
        });
        let req = UserOpRequest {
            signature_stage: SignatureStage::Stub,
            ..request("joinSpace", None)
        };

        let prepared = pipeline.prepare(&req, &PrepareOptions::default()).await.unwrap();
        assert_eq!(prepared.op.signature, account.stub_signature());
        assert_eq!(prepared.op.signature.len(), 65);
        assert!(!prepared.op.init_code.is_empty());
        assert_eq!(prepared.op.nonce, U256::from(7));
        assert_eq!(account.signatures(), 0);
    }

    #[tokio::test]
    async fn estimation_failure_aborts() {
        let h = harness(RelayProvider::Generic, denial(), PromptResponse::Confirmed);
        h.relay
            .fail_estimation(UserOpError::Transport("bundler down".to_string()));
        let req = request("joinSpace", None);
        begin(&h, &req);

        let err = h.pipeline.prepare(&req, &PrepareOptions::default()).await.unwrap_err();
        assert_eq!(err.category(), "gas_estimation");
        assert_eq!(h.confirmer.prompts(), 0);
    }
}
