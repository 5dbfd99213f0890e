use crate::account::{encode_execute_calls, SmartAccount};
use crate::bundler::{RelayClient, UserOperationReceipt};
use crate::config::RelayProvider;
use crate::confirm::{ConfirmationRequest, Confirmer, PromptResponse};
use crate::error::UserOpError;
use crate::sponsor::{Sponsor, SponsorReply, SponsorshipRequest};
use crate::types::{Call, GasLimits, UserOperation};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn submitted_hash() -> H256 {
    H256::repeat_byte(0xaa)
}

pub struct FakeRelay {
    provider: RelayProvider,
    tip: Mutex<U256>,
    base_fee: Mutex<Option<U256>>,
    fee_queries: AtomicUsize,
    gas: Mutex<Result<GasLimits, UserOpError>>,
    estimations: AtomicUsize,
    last_balance_override: Mutex<Option<U256>>,
    send_results: Mutex<VecDeque<Result<H256, UserOpError>>>,
    sent: Mutex<Vec<UserOperation>>,
    receipts: Mutex<HashMap<H256, bool>>,
}

impl Default for FakeRelay {
    fn default() -> Self {
        Self::with_provider(RelayProvider::Generic)
    }
}

impl FakeRelay {
    pub fn with_provider(provider: RelayProvider) -> Self {
        Self {
            provider,
            tip: Mutex::new(U256::from(8)),
            base_fee: Mutex::new(Some(U256::from(35))),
            fee_queries: AtomicUsize::new(0),
            gas: Mutex::new(Ok(GasLimits {
                call_gas_limit: U256::from(20),
                verification_gas_limit: U256::from(20),
                pre_verification_gas: U256::from(10),
            })),
            estimations: AtomicUsize::new(0),
            last_balance_override: Mutex::new(None),
            send_results: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            receipts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_fee_market(&self, tip: U256, base_fee: Option<U256>) {
        *locked(&self.tip) = tip;
        *locked(&self.base_fee) = base_fee;
    }

    pub fn fee_queries(&self) -> usize {
        self.fee_queries.load(Ordering::SeqCst)
    }

    pub fn set_gas(&self, gas: GasLimits) {
        *locked(&self.gas) = Ok(gas);
    }

    pub fn fail_estimation(&self, err: UserOpError) {
        *locked(&self.gas) = Err(err);
    }

    pub fn estimations(&self) -> usize {
        self.estimations.load(Ordering::SeqCst)
    }

    pub fn last_balance_override(&self) -> Option<U256> {
        *locked(&self.last_balance_override)
    }

    /// Queued results for `send_user_operation`; once drained every send
    /// succeeds with [`submitted_hash`].
    pub fn push_send_result(&self, result: Result<H256, UserOpError>) {
        locked(&self.send_results).push_back(result);
    }

    pub fn sent(&self) -> Vec<UserOperation> {
        locked(&self.sent).clone()
    }

    pub fn set_receipt(&self, hash: H256, success: bool) {
        locked(&self.receipts).insert(hash, success);
    }
}

#[async_trait]
impl RelayClient for FakeRelay {
    fn provider(&self) -> RelayProvider {
        self.provider
    }

    fn entry_point(&self) -> Address {
        Address::repeat_byte(0xee)
    }

    async fn max_priority_fee_per_gas(&self) -> Result<U256, UserOpError> {
        self.fee_queries.fetch_add(1, Ordering::SeqCst);
        Ok(*locked(&self.tip))
    }

    async fn latest_base_fee(&self) -> Result<Option<U256>, UserOpError> {
        Ok(*locked(&self.base_fee))
    }

    async fn estimate_user_operation_gas(
        &self,
        _op: &UserOperation,
        balance_override: Option<U256>,
    ) -> Result<GasLimits, UserOpError> {
        self.estimations.fetch_add(1, Ordering::SeqCst);
        *locked(&self.last_balance_override) = balance_override;
        locked(&self.gas).clone()
    }

    async fn send_user_operation(&self, op: &UserOperation) -> Result<H256, UserOpError> {
        locked(&self.sent).push(op.clone());
        locked(&self.send_results)
            .pop_front()
            .unwrap_or_else(|| Ok(submitted_hash()))
    }

    async fn get_user_operation_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<UserOperationReceipt>, UserOpError> {
        Ok(locked(&self.receipts)
            .get(&hash)
            .map(|success| UserOperationReceipt {
                user_op_hash: hash,
                success: *success,
                transaction_hash: None,
                actual_gas_cost: None,
                raw: serde_json::Value::Null,
            }))
    }
}

pub struct FakeSponsor {
    reply: Mutex<Result<SponsorReply, UserOpError>>,
    requests: Mutex<Vec<SponsorshipRequest>>,
}

impl FakeSponsor {
    pub fn new(reply: Result<SponsorReply, UserOpError>) -> Self {
        Self {
            reply: Mutex::new(reply),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        locked(&self.requests).len()
    }

    pub fn last_request(&self) -> Option<SponsorshipRequest> {
        locked(&self.requests).last().cloned()
    }
}

#[async_trait]
impl Sponsor for FakeSponsor {
    async fn sponsor(
        &self,
        request: &SponsorshipRequest,
        _access_token: Option<&str>,
    ) -> Result<SponsorReply, UserOpError> {
        locked(&self.requests).push(request.clone());
        locked(&self.reply).clone()
    }
}

pub const SIGNATURE: [u8; 3] = [0x51, 0x67, 0x00];

pub struct FakeAccount {
    address: Address,
    balance: Mutex<U256>,
    nonce: U256,
    deployed: bool,
    sign_failures: Mutex<VecDeque<UserOpError>>,
    signatures: AtomicUsize,
    encoded: Mutex<Vec<Vec<Call>>>,
}

impl FakeAccount {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            balance: Mutex::new(U256::from(1_000_000u64)),
            nonce: U256::from(7),
            deployed: true,
            sign_failures: Mutex::new(VecDeque::new()),
            signatures: AtomicUsize::new(0),
            encoded: Mutex::new(Vec::new()),
        }
    }

    pub fn undeployed(mut self) -> Self {
        self.deployed = false;
        self
    }

    pub fn set_balance(&self, balance: U256) {
        *locked(&self.balance) = balance;
    }

    pub fn fail_next_sign(&self, err: UserOpError) {
        locked(&self.sign_failures).push_back(err);
    }

    pub fn signatures(&self) -> usize {
        self.signatures.load(Ordering::SeqCst)
    }

    pub fn last_encoded(&self) -> Option<Vec<Call>> {
        locked(&self.encoded).last().cloned()
    }
}

#[async_trait]
impl SmartAccount for FakeAccount {
    fn address(&self) -> Address {
        self.address
    }

    fn encode_calls(&self, calls: &[Call]) -> Result<Bytes, UserOpError> {
        locked(&self.encoded).push(calls.to_vec());
        encode_execute_calls(calls)
    }

    async fn init_code(&self) -> Result<Bytes, UserOpError> {
        if self.deployed {
            Ok(Bytes::default())
        } else {
            Ok(Bytes::from(vec![0xfa; 24]))
        }
    }

    async fn nonce(&self) -> Result<U256, UserOpError> {
        Ok(self.nonce)
    }

    async fn sign(&self, _op: &UserOperation) -> Result<Bytes, UserOpError> {
        if let Some(err) = locked(&self.sign_failures).pop_front() {
            return Err(err);
        }
        self.signatures.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from(SIGNATURE.to_vec()))
    }

    async fn balance(&self) -> Result<U256, UserOpError> {
        Ok(*locked(&self.balance))
    }
}

/// Answers with a fixed response and counts prompts.
pub struct CountingConfirmer {
    answer: PromptResponse,
    prompts: AtomicUsize,
}

impl CountingConfirmer {
    pub fn new(answer: PromptResponse) -> Self {
        Self {
            answer,
            prompts: AtomicUsize::new(0),
        }
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Confirmer for CountingConfirmer {
    async fn confirm(&self, _request: &ConfirmationRequest) -> Result<PromptResponse, UserOpError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer)
    }
}
