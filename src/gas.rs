use crate::bundler::RelayClient;
use crate::error::UserOpError;
use crate::fees::apply_bps;
use crate::types::{GasLimits, UserOperation};
use ethers::abi::{self, ParamType, Token};
use ethers::types::U256;
use serde_json::Value;
use std::sync::Arc;

/// Balance the sender is given for the estimation call only (2^128 - 1 wei).
pub fn balance_override() -> U256 {
    U256::from(u128::MAX)
}

/// Relays under-price pre-verification gas relative to what submission
/// demands; +10%.
pub const PRE_VERIFICATION_BUFFER_BPS: u64 = 11_000;

/// `Error(string)` selector.
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

pub struct GasLimitEstimator {
    relay: Arc<dyn RelayClient>,
}

impl GasLimitEstimator {
    pub fn new(relay: Arc<dyn RelayClient>) -> Self {
        Self { relay }
    }

    pub async fn estimate_limits(&self, op: &UserOperation) -> Result<GasLimits, UserOpError> {
        let mut gas = self
            .relay
            .estimate_user_operation_gas(op, Some(balance_override()))
            .await
            .map_err(|err| {
                let revert_reason = revert_reason(&err);
                tracing::warn!(
                    sender = ?op.sender,
                    error = %err,
                    revert_reason = ?revert_reason,
                    "gas estimation failed"
                );
                UserOpError::GasEstimation {
                    message: err.to_string(),
                    revert_reason,
                }
            })?;

        gas.pre_verification_gas = apply_bps(gas.pre_verification_gas, PRE_VERIFICATION_BUFFER_BPS);
        Ok(gas)
    }
}

/// Best-effort human readable revert reason from a relay error.
pub fn revert_reason(err: &UserOpError) -> Option<String> {
    if let UserOpError::Rpc(failure) = err {
        if let Some(reason) = failure.data.as_ref().and_then(reason_from_data) {
            return Some(reason);
        }
        return aa_reason(&failure.message);
    }
    aa_reason(&err.to_string())
}

fn reason_from_data(data: &Value) -> Option<String> {
    match data {
        Value::String(s) => decode_revert_data(s),
        Value::Object(obj) => ["revertData", "data", "reason"]
            .iter()
            .filter_map(|k| obj.get(*k).and_then(Value::as_str))
            .find_map(|s| decode_revert_data(s).or_else(|| aa_reason(s))),
        _ => None,
    }
}

/// Decodes ABI-encoded `Error(string)` revert data.
pub fn decode_revert_data(hex_data: &str) -> Option<String> {
    let bytes = hex::decode(hex_data.strip_prefix("0x").unwrap_or(hex_data)).ok()?;
    if bytes.len() < 4 || bytes[..4] != ERROR_STRING_SELECTOR {
        return None;
    }
    match abi::decode(&[ParamType::String], &bytes[4..]).ok()?.pop()? {
        Token::String(s) => Some(s),
        _ => None,
    }
}

/// EntryPoint failures are reported as `AAxx <reason>`.
fn aa_reason(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    (0..bytes.len().saturating_sub(3)).find_map(|i| {
        let is_code = bytes[i] == b'A'
            && bytes[i + 1] == b'A'
            && bytes[i + 2].is_ascii_digit()
            && bytes[i + 3].is_ascii_digit()
            && (i == 0 || !bytes[i - 1].is_ascii_alphanumeric());
        is_code.then(|| text[i..].trim_end_matches(['"', '}']).trim().to_string())
    })
}
