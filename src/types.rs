use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// `paymaster_and_data` is empty for self-funded operations and carries the
/// sponsor's payload once sponsorship has been negotiated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    pub fn new(sender: Address) -> Self {
        Self {
            sender,
            ..Default::default()
        }
    }

    /// Returns a tuple matching the Solidity struct layout, suitable for
    /// calling `EntryPoint.getUserOpHash((...))`.
    pub fn as_abi_tuple(
        &self,
    ) -> (
        Address,
        U256,
        Bytes,
        Bytes,
        U256,
        U256,
        U256,
        U256,
        U256,
        Bytes,
        Bytes,
    ) {
        (
            self.sender,
            self.nonce,
            self.init_code.clone(),
            self.call_data.clone(),
            self.call_gas_limit,
            self.verification_gas_limit,
            self.pre_verification_gas,
            self.max_fee_per_gas,
            self.max_priority_fee_per_gas,
            self.paymaster_and_data.clone(),
            self.signature.clone(),
        )
    }

    pub fn is_sponsored(&self) -> bool {
        !self.paymaster_and_data.is_empty()
    }

    pub fn fees(&self) -> FeeFields {
        FeeFields {
            max_fee_per_gas: self.max_fee_per_gas,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
        }
    }

    pub fn set_fees(&mut self, fees: FeeFields) {
        self.max_fee_per_gas = fees.max_fee_per_gas;
        self.max_priority_fee_per_gas = fees.max_priority_fee_per_gas;
    }

    pub fn gas_limits(&self) -> GasLimits {
        GasLimits {
            call_gas_limit: self.call_gas_limit,
            verification_gas_limit: self.verification_gas_limit,
            pre_verification_gas: self.pre_verification_gas,
        }
    }

    pub fn set_gas_limits(&mut self, gas: GasLimits) {
        self.call_gas_limit = gas.call_gas_limit;
        self.verification_gas_limit = gas.verification_gas_limit;
        self.pre_verification_gas = gas.pre_verification_gas;
    }

    pub fn has_fees(&self) -> bool {
        !self.max_fee_per_gas.is_zero()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeFields {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasLimits {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

impl GasLimits {
    /// True when every limit has been populated (zero means "not estimated yet").
    pub fn is_complete(&self) -> bool {
        !self.call_gas_limit.is_zero()
            && !self.verification_gas_limit.is_zero()
            && !self.pre_verification_gas.is_zero()
    }

    pub fn total(&self) -> U256 {
        self.call_gas_limit
            .saturating_add(self.verification_gas_limit)
            .saturating_add(self.pre_verification_gas)
    }
}

/// The logical action that produced an operation.
///
/// The sponsor proxy keys its policies off this identifier, and a few actions
/// change how the pipeline treats unsponsored spends.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    /// Tips skip sponsorship and must never prompt; they fail fast on low balance.
    Tip,
    /// Trading is pre-authorized upstream, so unsponsored spends do not prompt.
    Trading,
    /// Native currency transfer; may drain the remaining balance.
    TransferEth,
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::Tip => "tip",
            Action::Trading => "trading",
            Action::TransferEth => "transferEth",
            Action::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        match s {
            "tip" => Action::Tip,
            "trading" => Action::Trading,
            "transferEth" => Action::TransferEth,
            other => Action::Other(other.to_string()),
        }
    }
}

impl From<String> for Action {
    fn from(s: String) -> Self {
        Action::from(s.as_str())
    }
}

impl From<Action> for String {
    fn from(a: Action) -> Self {
        a.as_str().to_string()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single call executed by the smart account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

/// Whether the caller wants a real signature or a stub (for estimation-only flows).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignatureStage {
    Stub,
    #[default]
    Final,
}

/// Who is asking: the root key behind the smart account and how they logged in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SenderContext {
    pub root_key: Address,
    pub login_method: Option<String>,
    pub access_token: Option<String>,
}

/// The operation currently being prepared for a sender, plus its metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDetails {
    pub op: UserOperation,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub value: Option<U256>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_through_string() {
        assert_eq!(Action::from("tip"), Action::Tip);
        assert_eq!(Action::from("transferEth"), Action::TransferEth);
        assert_eq!(
            Action::from("joinSpace"),
            Action::Other("joinSpace".to_string())
        );
        assert_eq!(String::from(Action::Trading), "trading");
    }

    #[test]
    fn action_serializes_as_plain_string() {
        let v = serde_json::to_value(Action::TransferEth).unwrap();
        assert_eq!(v, serde_json::json!("transferEth"));
        let a: Action = serde_json::from_value(serde_json::json!("createSpace")).unwrap();
        assert_eq!(a, Action::Other("createSpace".to_string()));
    }

    #[test]
    fn gas_limits_completeness() {
        let mut gas = GasLimits {
            call_gas_limit: U256::from(1),
            verification_gas_limit: U256::from(2),
            pre_verification_gas: U256::zero(),
        };
        assert!(!gas.is_complete());
        gas.pre_verification_gas = U256::from(3);
        assert!(gas.is_complete());
        assert_eq!(gas.total(), U256::from(6));
    }

    #[test]
    fn sponsored_iff_paymaster_data_present() {
        let mut op = UserOperation::new(Address::repeat_byte(0x11));
        assert!(!op.is_sponsored());
        op.paymaster_and_data = Bytes::from(vec![0xde, 0xad]);
        assert!(op.is_sponsored());
    }
}
