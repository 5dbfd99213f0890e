use crate::error::UserOpError;
use crate::types::GasLimits;
use ethers::types::U256;

/// Worst-case gas spend: every limit fully consumed at `max_fee_per_gas`.
pub fn gas_cost(gas: &GasLimits, max_fee_per_gas: U256) -> U256 {
    gas.total().saturating_mul(max_fee_per_gas)
}

pub fn total_cost(gas: &GasLimits, max_fee_per_gas: U256, value: Option<U256>) -> U256 {
    gas_cost(gas, max_fee_per_gas).saturating_add(value.unwrap_or_default())
}

/// Amount a drain transfer may send so that value plus gas fits in `balance`.
///
/// Below the balance the value is returned untouched; otherwise the gas cost
/// is carved out of it.
pub fn adjust_value(
    balance: U256,
    value: U256,
    gas: &GasLimits,
    max_fee_per_gas: U256,
) -> Result<U256, UserOpError> {
    let gas_cost = gas_cost(gas, max_fee_per_gas);
    let total = gas_cost.saturating_add(value);
    if total < balance {
        return Ok(value);
    }
    value
        .checked_sub(gas_cost)
        .ok_or(UserOpError::NegativeValue { value, gas_cost })
}

pub fn check_sufficient_balance(balance: U256, total_cost: U256) -> Result<(), UserOpError> {
    if balance < total_cost {
        return Err(UserOpError::InsufficientBalance {
            message: format!(
                "insufficient balance: have {balance} wei, operation may cost up to {total_cost} wei"
            ),
        });
    }
    Ok(())
}
