use crate::confirm::PromptResponse;
use crate::encoding::fmt_address;
use crate::error::{SponsorshipDenialCode, UserOpError};
use crate::persist::{PersistedState, StatePersistence, STATE_VERSION};
use crate::types::{Action, FeeFields, OperationDetails, UserOperation};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::runtime::RuntimeFlavor;
use tokio::sync::{broadcast, OwnedMutexGuard};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderOperationState {
    #[serde(default)]
    pub current: Option<OperationDetails>,
    #[serde(default)]
    pub pending: Option<PendingOperation>,
    #[serde(default)]
    pub operation_attempt: u32,
    #[serde(default)]
    pub rejected_sponsorship_reason: Option<SponsorshipDenialCode>,
    #[serde(default)]
    pub retry_details: Option<RetryDetails>,
    /// Answer to the confirmation prompt for `current`. Never persisted.
    #[serde(skip)]
    pub prompt_response: Option<PromptResponse>,
    /// Worst-case cost the user was shown when they answered.
    #[serde(skip)]
    pub confirmed_max_cost: Option<U256>,
}

/// An operation the relay accepted but that has not been seen on chain yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub hash: H256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    #[serde(default)]
    pub nonce: Option<U256>,
    #[serde(default)]
    pub action: Option<Action>,
    /// Unix seconds.
    #[serde(default)]
    pub submitted_at: u64,
}

impl PendingOperation {
    pub fn fees(&self) -> FeeFields {
        FeeFields {
            max_fee_per_gas: self.max_fee_per_gas,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
        }
    }
}

/// Last classified submission failure, for "retrying (2/3)" style display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryDetails {
    pub category: String,
    pub message: String,
    pub attempt: u32,
    pub max_retries: u32,
}

impl RetryDetails {
    pub fn from_error(err: &UserOpError, attempt: u32, max_retries: u32) -> Self {
        Self {
            category: err.category().to_string(),
            message: err.to_string(),
            attempt,
            max_retries,
        }
    }
}

/// Field-wise update of `current`; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct CurrentPatch {
    pub op: Option<UserOperation>,
    pub action: Option<Action>,
    pub resource_id: Option<String>,
    pub value: Option<U256>,
}

impl CurrentPatch {
    pub fn op(op: UserOperation) -> Self {
        Self {
            op: Some(op),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreUpdate {
    pub sender: Address,
    pub state: SenderOperationState,
}

#[derive(Debug, Default)]
struct SenderSlot {
    state: Mutex<SenderOperationState>,
    lease: Arc<tokio::sync::Mutex<()>>,
}

impl SenderSlot {
    fn with_state(state: SenderOperationState) -> Self {
        Self {
            state: Mutex::new(state),
            lease: Arc::default(),
        }
    }

    fn read(&self) -> SenderOperationState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Per-sender operation state. Slot locks are short and never held across an
/// `.await`; whole submissions serialize through [`OperationStateStore::lease`].
pub struct OperationStateStore {
    senders: RwLock<HashMap<Address, Arc<SenderSlot>>>,
    updates: broadcast::Sender<StoreUpdate>,
    persistence: Option<Arc<dyn StatePersistence>>,
    persist_lock: Mutex<()>,
}

impl Default for OperationStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OperationStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationStateStore")
            .field("senders", &self.senders())
            .field("persistent", &self.persistence.is_some())
            .finish()
    }
}

impl OperationStateStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            senders: RwLock::default(),
            updates,
            persistence: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Loads whatever the backend holds (migrating older versions) and writes
    /// every subsequent mutation back.
    pub fn with_persistence(persistence: Arc<dyn StatePersistence>) -> Result<Self, UserOpError> {
        let loaded = persistence
            .load()
            .map_err(|e| UserOpError::Persistence(e.to_string()))?;

        let mut store = Self::new();
        if let Some(loaded) = loaded {
            let mut map = HashMap::new();
            for (key, state) in loaded.senders {
                match key.parse::<Address>() {
                    Ok(addr) => {
                        map.insert(addr, Arc::new(SenderSlot::with_state(state)));
                    }
                    Err(err) => {
                        tracing::warn!(key = %key, error = %err, "skipping persisted entry with bad sender key");
                    }
                }
            }
            tracing::info!(senders = map.len(), "loaded persisted userop state");
            store.senders = RwLock::new(map);
        }
        store.persistence = Some(persistence);
        Ok(store)
    }

    fn slot(&self, sender: Address) -> Arc<SenderSlot> {
        if let Some(slot) = self
            .senders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&sender)
        {
            return slot.clone();
        }
        self.senders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(sender)
            .or_default()
            .clone()
    }

    /// Exclusive right to run a logical submission for `sender`.
    pub async fn lease(&self, sender: Address) -> OwnedMutexGuard<()> {
        self.slot(sender).lease.clone().lock_owned().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self, sender: Address) -> SenderOperationState {
        match self
            .senders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&sender)
        {
            Some(slot) => slot.read(),
            None => SenderOperationState::default(),
        }
    }

    pub fn snapshot_json(&self, sender: Address) -> serde_json::Value {
        serde_json::to_value(self.snapshot(sender)).unwrap_or(serde_json::Value::Null)
    }

    pub fn senders(&self) -> Vec<Address> {
        let mut out: Vec<Address> = self
            .senders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        out.sort();
        out
    }

    pub fn current(&self, sender: Address) -> Option<OperationDetails> {
        self.snapshot(sender).current
    }

    pub fn pending(&self, sender: Address) -> Option<PendingOperation> {
        self.snapshot(sender).pending
    }

    /// Starts a new logical action: `current` is replaced wholesale and the
    /// per-action diagnostics reset. An unconfirmed `pending` survives so the
    /// new operation can be priced as its replacement.
    pub fn begin_action(&self, sender: Address, details: OperationDetails) {
        self.mutate(sender, |s| {
            *s = SenderOperationState {
                current: Some(details),
                pending: s.pending.take(),
                ..Default::default()
            };
            true
        });
    }

    pub fn set_current(&self, sender: Address, patch: CurrentPatch) {
        self.mutate(sender, |s| {
            let current = s.current.get_or_insert_with(OperationDetails::default);
            if let Some(op) = patch.op {
                current.op = op;
            }
            if let Some(action) = patch.action {
                current.action = Some(action);
            }
            if let Some(resource_id) = patch.resource_id {
                current.resource_id = Some(resource_id);
            }
            if let Some(value) = patch.value {
                current.value = Some(value);
            }
            true
        });
    }

    /// Copies `current` into `pending` under `hash`. Returns false when there
    /// is no current operation to copy.
    pub fn set_pending(&self, sender: Address, hash: H256) -> bool {
        let submitted_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.mutate(sender, |s| {
            let Some(current) = s.current.as_ref() else {
                return false;
            };
            s.pending = Some(PendingOperation {
                hash,
                max_fee_per_gas: current.op.max_fee_per_gas,
                max_priority_fee_per_gas: current.op.max_priority_fee_per_gas,
                nonce: Some(current.op.nonce),
                action: current.action.clone(),
                submitted_at,
            });
            true
        })
    }

    /// Clears `pending` if it is the operation identified by `hash`.
    pub fn clear_pending(&self, sender: Address, hash: H256) -> bool {
        self.mutate(sender, |s| match &s.pending {
            Some(p) if p.hash == hash => {
                s.pending = None;
                true
            }
            _ => false,
        })
    }

    pub fn reset(&self, sender: Address) {
        self.mutate(sender, |s| {
            *s = SenderOperationState::default();
            true
        });
    }

    pub fn set_attempt(&self, sender: Address, attempt: u32) {
        self.mutate(sender, |s| {
            s.operation_attempt = attempt;
            true
        });
    }

    pub fn set_rejected_sponsorship(&self, sender: Address, reason: Option<SponsorshipDenialCode>) {
        self.mutate(sender, |s| {
            s.rejected_sponsorship_reason = reason;
            true
        });
    }

    pub fn set_retry_details(&self, sender: Address, details: Option<RetryDetails>) {
        self.mutate(sender, |s| {
            s.retry_details = details;
            true
        });
    }

    pub fn set_prompt_response(&self, sender: Address, response: Option<PromptResponse>) {
        self.mutate(sender, |s| {
            s.prompt_response = response;
            true
        });
    }

    /// Records an answer to a prompt that showed `max_cost`.
    pub fn record_prompt(&self, sender: Address, response: PromptResponse, max_cost: U256) {
        self.mutate(sender, |s| {
            s.prompt_response = Some(response);
            s.confirmed_max_cost = Some(max_cost);
            true
        });
    }

    /// Applies `f` under the sender's lock. When `f` reports a change the new
    /// state is logged, broadcast and persisted.
    fn mutate<F>(&self, sender: Address, f: F) -> bool
    where
        F: FnOnce(&mut SenderOperationState) -> bool,
    {
        let slot = self.slot(sender);
        let updated = {
            let mut guard = slot.state.lock().unwrap_or_else(|e| e.into_inner());
            if !f(&mut guard) {
                return false;
            }
            guard.clone()
        };

        if tracing::enabled!(tracing::Level::DEBUG) {
            let json = serde_json::to_string(&updated).unwrap_or_default();
            tracing::debug!(sender = ?sender, state = %json, "userop state updated");
        }

        // no receivers is fine
        let _ = self.updates.send(StoreUpdate {
            sender,
            state: updated,
        });

        self.persist();
        true
    }

    fn persist(&self) {
        let Some(persistence) = self.persistence.as_ref() else {
            return;
        };
        let _guard = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());

        let senders = self
            .senders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(addr, slot)| (fmt_address(*addr), slot.read()))
            .collect();
        let state = PersistedState {
            version: STATE_VERSION,
            senders,
        };

        if let Err(err) = blocking_io(|| persistence.save(&state)) {
            tracing::warn!(error = %err, "failed to persist userop state");
        }
    }
}

/// Runs file I/O so it does not stall other tasks on a multi-threaded runtime.
/// Current-thread runtimes and plain threads run `f` inline.
fn blocking_io<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
