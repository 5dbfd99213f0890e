use crate::bundler::{RelayClient, UserOperationReceipt};
use crate::confirm::CancelHandle;
use crate::error::{normalize_relay_error, UserOpError};
use crate::pipeline::{PrepareOptions, PreparationPipeline, UserOpRequest};
use crate::store::{OperationStateStore, RetryDetails};
use ethers::types::{Address, H256};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Multiplied by the attempt number.
    pub connector_backoff: Duration,
    pub gas_too_low_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connector_backoff: Duration::from_millis(2000),
            gas_too_low_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn immediate() -> Self {
        Self {
            connector_backoff: Duration::ZERO,
            gas_too_low_backoff: Duration::ZERO,
        }
    }

    pub fn for_test_mode(test_mode: bool) -> Self {
        if test_mode {
            Self::immediate()
        } else {
            Self::default()
        }
    }

    /// `None` when `err` is not retried at all.
    pub fn backoff(&self, err: &UserOpError, attempt: u32) -> Option<Duration> {
        if !err.is_retryable() {
            return None;
        }
        match err {
            UserOpError::UnknownConnectorError(_) => Some(self.connector_backoff * attempt),
            _ => Some(self.gas_too_low_backoff),
        }
    }
}

pub struct SubmissionRetrier {
    pipeline: Arc<PreparationPipeline>,
    relay: Arc<dyn RelayClient>,
    store: Arc<OperationStateStore>,
    policy: RetryPolicy,
    receipt_poll_interval: Duration,
}

impl SubmissionRetrier {
    pub fn new(
        pipeline: Arc<PreparationPipeline>,
        relay: Arc<dyn RelayClient>,
        policy: RetryPolicy,
        receipt_poll_interval: Duration,
    ) -> Self {
        Self {
            store: pipeline.store().clone(),
            pipeline,
            relay,
            policy,
            receipt_poll_interval,
        }
    }

    /// Prepares and submits `request`, making at most `max_retries` attempts.
    pub async fn submit(
        &self,
        request: &UserOpRequest,
        max_retries: u32,
        cancel: &CancelHandle,
    ) -> Result<SubmittedOperation, UserOpError> {
        let sender = self.pipeline.sender();
        let max_attempts = max_retries.max(1);
        let mut opts = PrepareOptions {
            pvg_multiplier: 1,
            cancel: cancel.clone(),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(UserOpError::Cancelled);
            }
            self.store.set_attempt(sender, attempt);

            let (err, sponsored) = match self.attempt(request, &opts).await {
                Ok(hash) => {
                    self.store.set_pending(sender, hash);
                    tracing::info!(
                        sender = ?sender,
                        attempt,
                        user_op_hash = ?hash,
                        "user operation submitted"
                    );
                    return Ok(SubmittedOperation {
                        hash,
                        sender,
                        relay: self.relay.clone(),
                        store: self.store.clone(),
                        poll_interval: self.receipt_poll_interval,
                    });
                }
                Err(failure) => failure,
            };

            let Some(delay) = self.policy.backoff(&err, attempt) else {
                tracing::warn!(
                    sender = ?sender,
                    attempt,
                    category = err.category(),
                    error = %err,
                    "user operation failed"
                );
                return Err(err);
            };

            self.store.set_retry_details(
                sender,
                Some(RetryDetails::from_error(&err, attempt, max_attempts)),
            );
            if attempt >= max_attempts {
                tracing::warn!(
                    sender = ?sender,
                    attempt,
                    category = err.category(),
                    "retry budget exhausted"
                );
                return Err(err);
            }

            if matches!(err, UserOpError::GasTooLow { .. }) && !sponsored {
                opts.pvg_multiplier += 1;
            }
            tracing::warn!(
                sender = ?sender,
                attempt,
                max_attempts,
                category = err.category(),
                backoff_ms = delay.as_millis() as u64,
                "retrying user operation"
            );
            cancel.sleep(delay).await?;
        }
    }

    /// One prepare + send. Failures carry whether the op was sponsored.
    async fn attempt(
        &self,
        request: &UserOpRequest,
        opts: &PrepareOptions,
    ) -> Result<H256, (UserOpError, bool)> {
        let prepared = self
            .pipeline
            .prepare(request, opts)
            .await
            .map_err(|e| (e, false))?;
        self.relay
            .send_user_operation(&prepared.op)
            .await
            .map_err(|e| (normalize_relay_error(e, prepared.sponsored), prepared.sponsored))
    }
}

/// Handle to an operation the relay accepted.
pub struct SubmittedOperation {
    pub hash: H256,
    sender: Address,
    relay: Arc<dyn RelayClient>,
    store: Arc<OperationStateStore>,
    poll_interval: Duration,
}

impl std::fmt::Debug for SubmittedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmittedOperation")
            .field("hash", &self.hash)
            .field("sender", &self.sender)
            .finish()
    }
}

impl SubmittedOperation {
    pub fn sender(&self) -> Address {
        self.sender
    }

    /// Single receipt lookup. A landed receipt clears the sender's pending op.
    pub async fn fetch_receipt(&self) -> Result<Option<UserOperationReceipt>, UserOpError> {
        let receipt = self.relay.get_user_operation_receipt(self.hash).await?;
        if receipt.is_some() {
            self.store.clear_pending(self.sender, self.hash);
        }
        Ok(receipt)
    }

    /// Polls until the receipt shows up or `timeout` elapses.
    pub async fn await_receipt(&self, timeout: Duration) -> Result<UserOperationReceipt, UserOpError> {
        let poll = async {
            loop {
                match self.fetch_receipt().await {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => {}
                    Err(e) => {
                        // transient; keep polling
                        tracing::warn!(error = %e, user_op_hash = ?self.hash, "receipt poll error");
                    }
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| UserOpError::ReceiptTimeout {
                seconds: timeout.as_secs(),
            })
    }
}
