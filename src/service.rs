use crate::account::SmartAccount;
use crate::bundler::RelayClient;
use crate::config::PipelineConfig;
use crate::confirm::{CancelHandle, Confirmer};
use crate::error::UserOpError;
use crate::pipeline::{PipelineDeps, PreparationPipeline, UserOpRequest};
use crate::sponsor::{Sponsor, SponsorshipPolicy};
use crate::store::OperationStateStore;
use crate::submit::{RetryPolicy, SubmissionRetrier, SubmittedOperation};
use crate::types::{OperationDetails, UserOperation};
use ethers::types::Address;
use std::sync::Arc;

pub struct UserOps {
    pipeline: Arc<PreparationPipeline>,
    retrier: SubmissionRetrier,
    relay: Arc<dyn RelayClient>,
    max_retries: u32,
}

impl UserOps {
    pub fn new(
        deps: PipelineDeps,
        policy: RetryPolicy,
        receipt_poll_interval: std::time::Duration,
        max_retries: u32,
    ) -> Self {
        let relay = deps.relay.clone();
        let pipeline = Arc::new(PreparationPipeline::new(deps));
        let retrier =
            SubmissionRetrier::new(pipeline.clone(), relay.clone(), policy, receipt_poll_interval);
        Self {
            pipeline,
            retrier,
            relay,
            max_retries,
        }
    }

    pub fn from_config(
        cfg: &PipelineConfig,
        account: Arc<dyn SmartAccount>,
        relay: Arc<dyn RelayClient>,
        sponsor: Option<Arc<dyn Sponsor>>,
        confirmer: Arc<dyn Confirmer>,
        store: Arc<OperationStateStore>,
    ) -> Self {
        let deps = PipelineDeps {
            account,
            relay,
            sponsor,
            policy: SponsorshipPolicy {
                non_sponsorable_actions: cfg.non_sponsorable_actions.clone(),
                non_sponsorable_login_methods: cfg.non_sponsorable_login_methods.clone(),
            },
            confirmer,
            store,
            confirmation_timeout: cfg.confirmation_timeout,
        };
        Self::new(
            deps,
            RetryPolicy::for_test_mode(cfg.test_mode),
            cfg.receipt_poll_interval,
            cfg.max_retries,
        )
    }

    pub fn sender(&self) -> Address {
        self.pipeline.sender()
    }

    pub fn store(&self) -> &Arc<OperationStateStore> {
        self.pipeline.store()
    }

    /// Runs a whole logical submission, retries included, under the sender's
    /// lease.
    pub async fn send(
        &self,
        request: UserOpRequest,
        cancel: &CancelHandle,
    ) -> Result<SubmittedOperation, UserOpError> {
        let sender = self.sender();
        let store = self.store();
        let _lease = store.lease(sender).await;

        self.reconcile_pending(sender).await;
        store.begin_action(
            sender,
            OperationDetails {
                op: UserOperation::new(sender),
                action: request.action.clone(),
                resource_id: request.resource_id.clone(),
                value: request.value,
            },
        );

        match self.retrier.submit(&request, self.max_retries, cancel).await {
            Ok(submitted) => Ok(submitted),
            Err(e) => {
                tracing::error!(sender = ?sender, category = e.category(), "{}", e.tagged());
                Err(e)
            }
        }
    }

    /// Drops `pending` once its receipt exists. An op that has not landed stays
    /// as the target the next submission must outbid.
    async fn reconcile_pending(&self, sender: Address) {
        let Some(pending) = self.store().pending(sender) else {
            return;
        };
        match self.relay.get_user_operation_receipt(pending.hash).await {
            Ok(Some(receipt)) => {
                tracing::info!(
                    sender = ?sender,
                    user_op_hash = ?pending.hash,
                    success = receipt.success,
                    "previous operation landed"
                );
                self.store().clear_pending(sender, pending.hash);
            }
            Ok(None) => {
                tracing::info!(
                    sender = ?sender,
                    user_op_hash = ?pending.hash,
                    "previous operation still pending; pricing as replacement"
                );
            }
            Err(e) => {
                tracing::warn!(sender = ?sender, error = %e, "pending receipt lookup failed");
            }
        }
    }

    pub async fn reset(&self, sender: Address) {
        let _lease = self.store().lease(sender).await;
        self.store().reset(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::PromptResponse;
    use crate::testing::{submitted_hash, CountingConfirmer, FakeAccount, FakeRelay};
    use crate::types::{Action, Call};
    use ethers::types::{Bytes, H256, U256};
    use std::time::Duration;

    fn sender() -> Address {
        Address::repeat_byte(3)
    }

    fn service(relay: Arc<FakeRelay>) -> (UserOps, Arc<OperationStateStore>) {
        let store = Arc::new(OperationStateStore::new());
        let deps = PipelineDeps {
            account: Arc::new(FakeAccount::new(sender())),
            relay,
            sponsor: None,
            policy: SponsorshipPolicy::default(),
            confirmer: Arc::new(CountingConfirmer::new(PromptResponse::Confirmed)),
            store: store.clone(),
            confirmation_timeout: Duration::from_secs(5),
        };
        let ops = UserOps::new(deps, RetryPolicy::immediate(), Duration::from_millis(10), 3);
        (ops, store)
    }

    fn request() -> UserOpRequest {
        UserOpRequest {
            calls: vec![Call {
                to: Address::repeat_byte(0x44),
                value: U256::zero(),
                data: Bytes::from(vec![0xab]),
            }],
            action: Some(Action::from("mint")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unlanded_pending_is_outbid() {
        let relay = Arc::new(FakeRelay::default());
        let (ops, store) = service(relay.clone());

        ops.send(request(), &CancelHandle::never()).await.unwrap();
        let first = store.pending(sender()).unwrap();
        assert_eq!(
            (first.max_fee_per_gas, first.max_priority_fee_per_gas),
            (U256::from(80), U256::from(10))
        );

        let second_hash = H256::repeat_byte(0xbb);
        relay.push_send_result(Ok(second_hash));
        ops.send(request(), &CancelHandle::never()).await.unwrap();

        let sent = relay.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].max_fee_per_gas, U256::from(104));
        assert_eq!(sent[1].max_priority_fee_per_gas, U256::from(13));
        assert_eq!(store.pending(sender()).unwrap().hash, second_hash);
    }

    #[tokio::test]
    async fn landed_pending_is_cleared_before_next_action() {
        let relay = Arc::new(FakeRelay::default());
        let (ops, store) = service(relay.clone());

        ops.send(request(), &CancelHandle::never()).await.unwrap();
        relay.set_receipt(submitted_hash(), true);

        relay.push_send_result(Err(UserOpError::Rpc(crate::error::RpcFailure {
            code: Some(-32000),
            message: "boom".to_string(),
            data: None,
        })));
        let err = ops.send(request(), &CancelHandle::never()).await.unwrap_err();
        assert!(matches!(err, UserOpError::GenericSubmission { .. }));

        // priced at market again, nothing left to replace
        assert_eq!(relay.sent()[1].max_fee_per_gas, U256::from(80));
        assert!(store.pending(sender()).is_none());
    }

    #[tokio::test]
    async fn reset_clears_sender() {
        let relay = Arc::new(FakeRelay::default());
        let (ops, store) = service(relay);
        ops.send(request(), &CancelHandle::never()).await.unwrap();

        ops.reset(sender()).await;
        assert_eq!(store.snapshot(sender()), crate::store::SenderOperationState::default());
    }
}
