use crate::bundler::RelayClient;
use crate::error::UserOpError;
use crate::store::OperationStateStore;
use crate::types::FeeFields;
use ethers::types::{Address, U256};
use std::sync::Arc;

const BPS: u64 = 10_000;
/// +25% on the suggested tip.
pub const PRIORITY_FEE_BUFFER_BPS: u64 = 12_500;
/// Same-nonce replacement bid over the pending op's fees. Relays require at
/// least +10%.
pub const REPLACEMENT_BPS: u64 = 13_000;

pub fn apply_bps(v: U256, bps: u64) -> U256 {
    v.saturating_mul(U256::from(bps)) / U256::from(BPS)
}

/// Fresh market bid from a tip suggestion and the latest base fee.
pub fn market_fees(tip: U256, base_fee: Option<U256>) -> FeeFields {
    let max_priority_fee_per_gas = apply_bps(tip, PRIORITY_FEE_BUFFER_BPS);
    let max_fee_per_gas = match base_fee {
        Some(base) => base
            .saturating_mul(U256::from(2))
            .saturating_add(max_priority_fee_per_gas),
        None => max_priority_fee_per_gas,
    };
    FeeFields {
        max_fee_per_gas,
        max_priority_fee_per_gas,
    }
}

/// Lowest bid a relay will accept in place of `pending`.
pub fn replacement_floor(pending: FeeFields) -> FeeFields {
    FeeFields {
        max_fee_per_gas: apply_bps(pending.max_fee_per_gas, REPLACEMENT_BPS),
        max_priority_fee_per_gas: apply_bps(pending.max_priority_fee_per_gas, REPLACEMENT_BPS),
    }
}

/// Element-wise maximum of the market bid and the replacement floor.
pub fn with_replacement(market: FeeFields, pending: Option<FeeFields>) -> FeeFields {
    let Some(pending) = pending else {
        return market;
    };
    let floor = replacement_floor(pending);
    FeeFields {
        max_fee_per_gas: market.max_fee_per_gas.max(floor.max_fee_per_gas),
        max_priority_fee_per_gas: market
            .max_priority_fee_per_gas
            .max(floor.max_priority_fee_per_gas),
    }
}

pub struct FeeEstimator {
    relay: Arc<dyn RelayClient>,
    store: Arc<OperationStateStore>,
}

impl FeeEstimator {
    pub fn new(relay: Arc<dyn RelayClient>, store: Arc<OperationStateStore>) -> Self {
        Self { relay, store }
    }

    pub async fn estimate_fees(&self, sender: Address) -> Result<FeeFields, UserOpError> {
        let (tip, base_fee) = futures::try_join!(
            self.relay.max_priority_fee_per_gas(),
            self.relay.latest_base_fee()
        )?;

        let market = market_fees(tip, base_fee);
        let pending = self.store.pending(sender).map(|p| p.fees());
        let fees = with_replacement(market, pending);

        tracing::debug!(
            sender = ?sender,
            tip = %tip,
            base_fee = ?base_fee,
            replacing = pending.is_some(),
            max_fee_per_gas = %fees.max_fee_per_gas,
            max_priority_fee_per_gas = %fees.max_priority_fee_per_gas,
            "estimated fees"
        );
        Ok(fees)
    }
}
