use crate::error::UserOpError;
use crate::types::{Action, FeeFields, GasLimits};
use async_trait::async_trait;
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PromptResponse {
    Confirmed,
    Denied,
}

/// What the confirmation UI shows the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRequest {
    pub sender: Address,
    pub action: Action,
    pub value: Option<U256>,
    pub fees: FeeFields,
    pub gas: GasLimits,
    /// Upper bound of what the user pays: gas at max fee plus value.
    pub max_cost: U256,
}

#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, request: &ConfirmationRequest) -> Result<PromptResponse, UserOpError>;
}

/// Answers every prompt the same way; used for `--yes` and in tests.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub PromptResponse);

#[async_trait]
impl Confirmer for AutoConfirm {
    async fn confirm(&self, _request: &ConfirmationRequest) -> Result<PromptResponse, UserOpError> {
        Ok(self.0)
    }
}

/// Caller side of a cancellation pair.
#[derive(Debug)]
pub struct Canceller(watch::Sender<bool>);

impl Canceller {
    pub fn cancel(&self) {
        // send only fails when every handle is gone, in which case nobody is waiting
        let _ = self.0.send(true);
    }
}

/// Observer side of a cancellation pair. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelHandle(Option<watch::Receiver<bool>>);

pub fn cancel_pair() -> (Canceller, CancelHandle) {
    let (tx, rx) = watch::channel(false);
    (Canceller(tx), CancelHandle(Some(rx)))
}

impl CancelHandle {
    /// A handle that is never cancelled.
    pub fn never() -> Self {
        CancelHandle(None)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves once cancellation is requested; pends forever otherwise.
    pub async fn cancelled(&self) {
        let Some(rx) = self.0.as_ref() else {
            return futures::future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // canceller dropped without cancelling
                return futures::future::pending().await;
            }
        }
    }

    /// Sleeps for `dur`, returning `Cancelled` early if cancellation is requested.
    pub async fn sleep(&self, dur: Duration) -> Result<(), UserOpError> {
        if dur.is_zero() {
            return if self.is_cancelled() {
                Err(UserOpError::Cancelled)
            } else {
                Ok(())
            };
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => Ok(()),
            _ = self.cancelled() => Err(UserOpError::Cancelled),
        }
    }
}

/// Runs the prompt under a timeout and the caller's cancellation.
pub async fn await_confirmation(
    confirmer: &dyn Confirmer,
    request: &ConfirmationRequest,
    timeout: Duration,
    cancel: &CancelHandle,
) -> Result<PromptResponse, UserOpError> {
    tokio::select! {
        res = tokio::time::timeout(timeout, confirmer.confirm(request)) => match res {
            Ok(answer) => answer,
            Err(_) => Err(UserOpError::ConfirmationTimedOut { seconds: timeout.as_secs() }),
        },
        _ = cancel.cancelled() => Err(UserOpError::Cancelled),
    }
}
