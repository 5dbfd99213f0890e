use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Denial codes returned by the sponsor (paymaster proxy) service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SponsorshipDenialCode {
    InvalidPrivyAuthToken,
    InvalidUserOperation,
    InvalidSpace,
    UnknownOperation,
    PaymasterLimitReached,
    PaymasterError,
    InvalidPaymasterResponse,
    MissingEnvVariable,
    BadRequest,
    NotFound,
    QueryError,
    UnknownError,
}

impl SponsorshipDenialCode {
    /// Parses a wire code; anything outside the closed set maps to `UnknownError`.
    pub fn from_wire(code: &str) -> Self {
        match code {
            "INVALID_PRIVY_AUTH_TOKEN" => Self::InvalidPrivyAuthToken,
            "INVALID_USER_OPERATION" => Self::InvalidUserOperation,
            "INVALID_SPACE" => Self::InvalidSpace,
            "UNKNOWN_OPERATION" => Self::UnknownOperation,
            "PAYMASTER_LIMIT_REACHED" => Self::PaymasterLimitReached,
            "PAYMASTER_ERROR" => Self::PaymasterError,
            "INVALID_PAYMASTER_RESPONSE" => Self::InvalidPaymasterResponse,
            "MISSING_ENV_VARIABLE" => Self::MissingEnvVariable,
            "BAD_REQUEST" => Self::BadRequest,
            "NOT_FOUND" => Self::NotFound,
            "QUERY_ERROR" => Self::QueryError,
            _ => Self::UnknownError,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::InvalidPrivyAuthToken => "INVALID_PRIVY_AUTH_TOKEN",
            Self::InvalidUserOperation => "INVALID_USER_OPERATION",
            Self::InvalidSpace => "INVALID_SPACE",
            Self::UnknownOperation => "UNKNOWN_OPERATION",
            Self::PaymasterLimitReached => "PAYMASTER_LIMIT_REACHED",
            Self::PaymasterError => "PAYMASTER_ERROR",
            Self::InvalidPaymasterResponse => "INVALID_PAYMASTER_RESPONSE",
            Self::MissingEnvVariable => "MISSING_ENV_VARIABLE",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::QueryError => "QUERY_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for SponsorshipDenialCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Which field the relay considered underpriced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GasTooLowVariant {
    PreVerificationGas,
    MaxFeePerGas,
    MaxPriorityFeePerGas,
}

impl fmt::Display for GasTooLowVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GasTooLowVariant::PreVerificationGas => f.write_str("preVerificationGas"),
            GasTooLowVariant::MaxFeePerGas => f.write_str("maxFeePerGas"),
            GasTooLowVariant::MaxPriorityFeePerGas => f.write_str("maxPriorityFeePerGas"),
        }
    }
}

/// A raw JSON-RPC error object as returned by a relay.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcFailure {
    pub code: Option<i64>,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "RPC error {code}: {}", self.message)?,
            None => write!(f, "RPC error: {}", self.message)?,
        }
        if let Some(data) = &self.data {
            write!(f, " ({data})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum UserOpError {
    #[error("{message}")]
    InsufficientBalance { message: String },

    #[error("value {value} cannot cover gas cost {gas_cost}")]
    NegativeValue { value: U256, gas_cost: U256 },

    #[error("{0}")]
    NonceMismatch(String),

    #[error("sponsorship denied ({code}): {message}")]
    SponsorshipDenied {
        code: SponsorshipDenialCode,
        message: String,
    },

    #[error("{message}")]
    GasTooLow {
        variant: GasTooLowVariant,
        message: String,
    },

    #[error("{0}")]
    ReplacementUnderpriced(String),

    #[error("{0}")]
    UnknownConnectorError(String),

    #[error("{message}")]
    GenericSubmission { sponsored: bool, message: String },

    #[error("gas estimation failed: {message}")]
    GasEstimation {
        message: String,
        revert_reason: Option<String>,
    },

    #[error("user declined the unsponsored operation")]
    UserRejected,

    #[error("timed out after {seconds}s waiting for confirmation")]
    ConfirmationTimedOut { seconds: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out after {seconds}s waiting for user operation receipt")]
    ReceiptTimeout { seconds: u64 },

    #[error("{0}")]
    Rpc(RpcFailure),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("smart account error: {0}")]
    Account(String),

    #[error("state persistence error: {0}")]
    Persistence(String),
}

impl UserOpError {
    /// Stable category tag, suitable for dashboards.
    pub fn category(&self) -> &'static str {
        match self {
            UserOpError::InsufficientBalance { .. } => "insufficient_balance",
            UserOpError::NegativeValue { .. } => "negative_value",
            UserOpError::NonceMismatch(_) => "nonce_mismatch",
            UserOpError::SponsorshipDenied { .. } => "sponsorship_denied",
            UserOpError::GasTooLow { .. } => "gas_too_low",
            UserOpError::ReplacementUnderpriced(_) => "replacement_underpriced",
            UserOpError::UnknownConnectorError(_) => "unknown_connector_error",
            UserOpError::GenericSubmission { sponsored: true, .. } => "userop_sponsored",
            UserOpError::GenericSubmission { sponsored: false, .. } => "userop_non_sponsored",
            UserOpError::GasEstimation { .. } => "gas_estimation",
            UserOpError::UserRejected => "user_rejected",
            UserOpError::ConfirmationTimedOut { .. } => "confirmation_timed_out",
            UserOpError::Cancelled => "cancelled",
            UserOpError::ReceiptTimeout { .. } => "receipt_timeout",
            UserOpError::Rpc(_) => "rpc",
            UserOpError::Transport(_) => "transport",
            UserOpError::InvalidResponse(_) => "invalid_response",
            UserOpError::Account(_) => "account",
            UserOpError::Persistence(_) => "persistence",
        }
    }

    /// `[category] message`, the form rendered to operators and users.
    pub fn tagged(&self) -> String {
        format!("[{}] {}", self.category(), self)
    }

    /// Whether the submission retrier may try again after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UserOpError::GasTooLow { .. } | UserOpError::UnknownConnectorError(_)
        )
    }
}

/// Maps a raw relay failure into the closed taxonomy.
///
/// Already-classified errors pass through untouched. Anything raw that does
/// not match a known pattern becomes `GenericSubmission`, tagged with whether
/// the operation was sponsored.
pub fn normalize_relay_error(err: UserOpError, sponsored: bool) -> UserOpError {
    let text = match &err {
        UserOpError::Rpc(f) => f.to_string(),
        UserOpError::Transport(m) | UserOpError::Account(m) | UserOpError::InvalidResponse(m) => {
            m.clone()
        }
        _ => return err,
    };
    classify_text(&text).unwrap_or(UserOpError::GenericSubmission {
        sponsored,
        message: text,
    })
}

/// Maps a signer failure; only the known flaky-connector condition is reclassified.
pub fn normalize_signer_error(err: UserOpError) -> UserOpError {
    match &err {
        UserOpError::Account(m) if is_connector_text(&m.to_lowercase()) => {
            UserOpError::UnknownConnectorError(m.clone())
        }
        _ => err,
    }
}

fn is_connector_text(lower: &str) -> bool {
    lower.contains("unknown connector error")
        || lower.contains("connector not connected")
        || lower.contains("connector not found")
}

fn classify_text(text: &str) -> Option<UserOpError> {
    let lower = text.to_lowercase();

    if is_connector_text(&lower) {
        return Some(UserOpError::UnknownConnectorError(text.to_string()));
    }

    // Checked before gas-too-low: replacement rejections also mention maxFeePerGas.
    if lower.contains("replacement")
        && (lower.contains("underpriced") || lower.contains("must increase"))
    {
        return Some(UserOpError::ReplacementUnderpriced(text.to_string()));
    }

    if let Some(variant) = gas_too_low_variant(&lower) {
        return Some(UserOpError::GasTooLow {
            variant,
            message: text.to_string(),
        });
    }

    if lower.contains("aa25") || lower.contains("invalid account nonce") {
        return Some(UserOpError::NonceMismatch(text.to_string()));
    }

    if lower.contains("aa21") || lower.contains("didn't pay prefund") {
        return Some(UserOpError::InsufficientBalance {
            message: text.to_string(),
        });
    }

    None
}

/// Recognises underpricing signals from the two relay families we talk to.
///
/// Alchemy (rundler): `precheck failed: preVerificationGas is 0x.. but must be at least 0x..`
/// Stackup: `preVerificationGas: below expected gas of ..` / `pvg too low`.
fn gas_too_low_variant(lower: &str) -> Option<GasTooLowVariant> {
    let alchemy = lower.contains("must be at least");
    let stackup = lower.contains("below expected") || lower.contains("too low");
    if !(alchemy || stackup) {
        return None;
    }

    if lower.contains("preverificationgas") || lower.contains("pvg") {
        Some(GasTooLowVariant::PreVerificationGas)
    } else if lower.contains("maxpriorityfeepergas") {
        Some(GasTooLowVariant::MaxPriorityFeePerGas)
    } else if lower.contains("maxfeepergas") {
        Some(GasTooLowVariant::MaxFeePerGas)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc(message: &str) -> UserOpError {
        UserOpError::Rpc(RpcFailure {
            code: Some(-32602),
            message: message.to_string(),
            data: None,
        })
    }

    #[test]
    fn alchemy_precheck_is_gas_too_low() {
        let err = normalize_relay_error(
            rpc("precheck failed: preVerificationGas is 0x5208 but must be at least 0x6000"),
            true,
        );
        assert!(matches!(
            err,
            UserOpError::GasTooLow {
                variant: GasTooLowVariant::PreVerificationGas,
                ..
            }
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn alchemy_max_fee_precheck_is_gas_too_low() {
        let err = normalize_relay_error(
            rpc("precheck failed: maxFeePerGas is 0x10 but must be at least 0x20"),
            false,
        );
        assert!(matches!(
            err,
            UserOpError::GasTooLow {
                variant: GasTooLowVariant::MaxFeePerGas,
                ..
            }
        ));
    }

    #[test]
    fn stackup_pvg_is_gas_too_low() {
        let err = normalize_relay_error(rpc("preVerificationGas: below expected gas of 48000"), false);
        assert_eq!(err.category(), "gas_too_low");
    }

    #[test]
    fn replacement_underpriced_wins_over_fee_text() {
        let err = normalize_relay_error(
            rpc("pending ops: replacement op must increase maxFeePerGas and MaxPriorityFeePerGas"),
            false,
        );
        assert!(matches!(err, UserOpError::ReplacementUnderpriced(_)));
        assert!(!err.is_retryable());

        let err = normalize_relay_error(rpc("Replacement operation underpriced"), true);
        assert_eq!(err.category(), "replacement_underpriced");
    }

    #[test]
    fn connector_error_is_retryable() {
        let err = normalize_signer_error(UserOpError::Account(
            "Unknown connector error: wallet not ready".to_string(),
        ));
        assert!(matches!(err, UserOpError::UnknownConnectorError(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn signer_errors_other_than_connector_pass_through() {
        let err = normalize_signer_error(UserOpError::Account("bad key".to_string()));
        assert!(matches!(err, UserOpError::Account(_)));
    }

    #[test]
    fn unknown_errors_are_tagged_by_sponsorship() {
        let err = normalize_relay_error(rpc("AA23 reverted (or OOG)"), true);
        assert_eq!(err.category(), "userop_sponsored");
        let err = normalize_relay_error(rpc("AA23 reverted (or OOG)"), false);
        assert_eq!(err.category(), "userop_non_sponsored");
        assert!(err.tagged().starts_with("[userop_non_sponsored] RPC error -32602"));
    }

    #[test]
    fn nonce_and_prefund_errors_are_classified() {
        assert!(matches!(
            normalize_relay_error(rpc("AA25 invalid account nonce"), false),
            UserOpError::NonceMismatch(_)
        ));
        assert!(matches!(
            normalize_relay_error(rpc("AA21 didn't pay prefund"), false),
            UserOpError::InsufficientBalance { .. }
        ));
    }

    #[test]
    fn classified_errors_pass_through() {
        let err = normalize_relay_error(UserOpError::UserRejected, false);
        assert!(matches!(err, UserOpError::UserRejected));
    }

    #[test]
    fn denial_codes_parse_from_wire() {
        assert_eq!(
            SponsorshipDenialCode::from_wire("PAYMASTER_LIMIT_REACHED"),
            SponsorshipDenialCode::PaymasterLimitReached
        );
        assert_eq!(
            SponsorshipDenialCode::from_wire("SOMETHING_NEW"),
            SponsorshipDenialCode::UnknownError
        );
        let v = serde_json::to_value(SponsorshipDenialCode::InvalidSpace).unwrap();
        assert_eq!(v, serde_json::json!("INVALID_SPACE"));
    }
}
