use crate::config::RelayProvider;
use crate::encoding::{fmt_address, fmt_bytes, fmt_u256_word, parse_bytes, parse_u256_quantity};
use crate::error::{SponsorshipDenialCode, UserOpError};
use crate::fees::replacement_floor;
use crate::store::OperationStateStore;
use crate::types::{Action, FeeFields, GasLimits, SenderContext, UserOperation};
use async_trait::async_trait;
use ethers::types::{Bytes, U256};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Which operations are never sent to the sponsor.
#[derive(Debug, Clone, Default)]
pub struct SponsorshipPolicy {
    pub non_sponsorable_actions: Vec<Action>,
    pub non_sponsorable_login_methods: Vec<String>,
}

impl SponsorshipPolicy {
    /// Why the operation is self-funded without asking, if it is.
    pub fn skip_reason(
        &self,
        action: Option<&Action>,
        value: Option<U256>,
        ctx: &SenderContext,
    ) -> Option<&'static str> {
        if action.is_some_and(|a| self.non_sponsorable_actions.contains(a)) {
            return Some("action is not sponsorable");
        }
        if value.is_some_and(|v| !v.is_zero()) {
            return Some("operation carries native value");
        }
        if ctx
            .login_method
            .as_ref()
            .is_some_and(|m| self.non_sponsorable_login_methods.contains(m))
        {
            return Some("login method is not sponsorable");
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SponsorshipRequest {
    pub data: SponsorshipData,
}

/// Operation fields as fixed-width hex, plus what the proxy keys policy on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorshipData {
    pub sender: String,
    pub nonce: String,
    pub init_code: String,
    pub call_data: String,
    pub call_gas_limit: String,
    pub verification_gas_limit: String,
    pub pre_verification_gas: String,
    pub max_fee_per_gas: String,
    pub max_priority_fee_per_gas: String,
    pub paymaster_and_data: String,
    pub signature: String,
    pub function_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub town_id: Option<String>,
    pub root_key_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_overrides: Option<GasOverrides>,
}

/// Minimum fees the sponsor must price at so the op can replace a pending one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GasOverrides {
    pub max_fee_per_gas: String,
    pub max_priority_fee_per_gas: String,
}

impl SponsorshipRequest {
    pub fn new(
        op: &UserOperation,
        action: Option<&Action>,
        resource_id: Option<&str>,
        ctx: &SenderContext,
        replacing: Option<FeeFields>,
    ) -> Self {
        let gas_overrides = replacing.map(|pending| {
            let floor = replacement_floor(pending);
            GasOverrides {
                max_fee_per_gas: fmt_u256_word(floor.max_fee_per_gas),
                max_priority_fee_per_gas: fmt_u256_word(floor.max_priority_fee_per_gas),
            }
        });

        Self {
            data: SponsorshipData {
                sender: fmt_address(op.sender),
                nonce: fmt_u256_word(op.nonce),
                init_code: fmt_bytes(&op.init_code),
                call_data: fmt_bytes(&op.call_data),
                call_gas_limit: fmt_u256_word(op.call_gas_limit),
                verification_gas_limit: fmt_u256_word(op.verification_gas_limit),
                pre_verification_gas: fmt_u256_word(op.pre_verification_gas),
                max_fee_per_gas: fmt_u256_word(op.max_fee_per_gas),
                max_priority_fee_per_gas: fmt_u256_word(op.max_priority_fee_per_gas),
                paymaster_and_data: fmt_bytes(&op.paymaster_and_data),
                signature: fmt_bytes(&op.signature),
                function_hash: action.map(|a| a.to_string()).unwrap_or_default(),
                town_id: resource_id.map(str::to_string),
                root_key_address: fmt_address(ctx.root_key),
                gas_overrides,
            },
        }
    }
}

/// What an approval pins down. Once merged these fields are authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SponsorshipResult {
    pub paymaster_and_data: Bytes,
    pub gas: GasLimits,
    pub fees: Option<FeeFields>,
}

impl SponsorshipResult {
    pub fn apply_to(&self, op: &mut UserOperation) {
        op.paymaster_and_data = self.paymaster_and_data.clone();
        op.set_gas_limits(self.gas);
        if let Some(fees) = self.fees {
            op.set_fees(fees);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SponsorReply {
    Approved(SponsorshipResult),
    Denied {
        code: SponsorshipDenialCode,
        message: String,
    },
}

#[async_trait]
pub trait Sponsor: Send + Sync {
    async fn sponsor(
        &self,
        request: &SponsorshipRequest,
        access_token: Option<&str>,
    ) -> Result<SponsorReply, UserOpError>;
}

/// HTTP client for the paymaster proxy worker.
#[derive(Debug, Clone)]
pub struct PaymasterProxyClient {
    endpoint: String,
    auth_secret: Option<String>,
    http: reqwest::Client,
}

impl PaymasterProxyClient {
    pub fn new(base_url: &str, provider: RelayProvider, auth_secret: Option<String>) -> Self {
        Self {
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), provider.sponsor_path()),
            auth_secret,
            http: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Sponsor for PaymasterProxyClient {
    async fn sponsor(
        &self,
        request: &SponsorshipRequest,
        access_token: Option<&str>,
    ) -> Result<SponsorReply, UserOpError> {
        let mut req = self.http.post(&self.endpoint).json(request);
        if let Some(secret) = &self.auth_secret {
            req = req.bearer_auth(secret);
        }
        if let Some(token) = access_token {
            req = req.header("X-Auth-Token", token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| UserOpError::Transport(format!("POST {} failed: {e}", self.endpoint)))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| UserOpError::InvalidResponse(format!("sponsor reply is not JSON: {e}")))?;

        parse_sponsor_reply(status.is_success(), &body)
    }
}

/// Interprets a proxy reply. Success bodies may wrap the result or nest the
/// v0.6 payload; failures carry a code from the closed denial set.
pub fn parse_sponsor_reply(ok: bool, body: &Value) -> Result<SponsorReply, UserOpError> {
    if !ok {
        let detail = body.get("errorDetail").unwrap_or(body);
        let code = ["code", "errorCode"]
            .iter()
            .find_map(|k| detail.get(*k).and_then(Value::as_str))
            .or_else(|| body.pointer("/error/code").and_then(Value::as_str))
            .map(SponsorshipDenialCode::from_wire)
            .unwrap_or(SponsorshipDenialCode::UnknownError);
        let message = ["description", "message"]
            .iter()
            .find_map(|k| detail.get(*k).and_then(Value::as_str))
            .or_else(|| body.get("error").and_then(Value::as_str))
            .or_else(|| body.pointer("/error/message").and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string());
        return Ok(SponsorReply::Denied { code, message });
    }

    let result = body.get("result").filter(|r| r.is_object()).unwrap_or(body);
    let v06 = result
        .get("entrypointV06Response")
        .or_else(|| result.get("entryPointV06Response"))
        .unwrap_or(result);

    let paymaster_and_data = v06
        .get("paymasterAndData")
        .and_then(Value::as_str)
        .ok_or_else(|| UserOpError::InvalidResponse("sponsor reply has no paymasterAndData".into()))
        .and_then(|s| {
            parse_bytes(s).map_err(|e| {
                UserOpError::InvalidResponse(format!("invalid hex in paymasterAndData: {e}"))
            })
        })?;
    if paymaster_and_data.is_empty() {
        return Err(UserOpError::InvalidResponse(
            "sponsor approved with empty paymasterAndData".into(),
        ));
    }

    let gas = GasLimits {
        call_gas_limit: required_quantity(v06, "callGasLimit")?,
        verification_gas_limit: required_quantity(v06, "verificationGasLimit")?,
        pre_verification_gas: required_quantity(v06, "preVerificationGas")?,
    };

    let fees = match (
        optional_quantity(v06, "maxFeePerGas")?,
        optional_quantity(v06, "maxPriorityFeePerGas")?,
    ) {
        (Some(max_fee_per_gas), Some(max_priority_fee_per_gas)) => Some(FeeFields {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        }),
        _ => None,
    };

    Ok(SponsorReply::Approved(SponsorshipResult {
        paymaster_and_data,
        gas,
        fees,
    }))
}

fn optional_quantity(v: &Value, key: &str) -> Result<Option<U256>, UserOpError> {
    match v.get(key).and_then(Value::as_str) {
        None => Ok(None),
        Some(s) => parse_u256_quantity(s)
            .map(Some)
            .map_err(|e| UserOpError::InvalidResponse(format!("invalid {key} {s}: {e}"))),
    }
}

fn required_quantity(v: &Value, key: &str) -> Result<U256, UserOpError> {
    optional_quantity(v, key)?
        .ok_or_else(|| UserOpError::InvalidResponse(format!("sponsor reply has no {key}")))
}

pub struct SponsorshipNegotiator {
    sponsor: Option<Arc<dyn Sponsor>>,
    store: Arc<OperationStateStore>,
    policy: SponsorshipPolicy,
}

impl SponsorshipNegotiator {
    pub fn new(
        sponsor: Option<Arc<dyn Sponsor>>,
        store: Arc<OperationStateStore>,
        policy: SponsorshipPolicy,
    ) -> Self {
        Self {
            sponsor,
            store,
            policy,
        }
    }

    /// Asks the sponsor to cover `op`. `None` means the sender pays.
    ///
    /// Action, resource and declared value come from the sender's `current`
    /// record. Never fails: denials are recorded on the store, anything else
    /// is logged.
    pub async fn negotiate(
        &self,
        op: &UserOperation,
        ctx: &SenderContext,
    ) -> Option<SponsorshipResult> {
        let sender = op.sender;
        let Some(sponsor) = self.sponsor.as_ref() else {
            tracing::debug!(sender = ?sender, "no sponsor configured");
            return None;
        };

        let current = self.store.current(sender).unwrap_or_default();
        if let Some(reason) =
            self.policy
                .skip_reason(current.action.as_ref(), current.value, ctx)
        {
            tracing::debug!(sender = ?sender, action = ?current.action, reason, "skipping sponsorship");
            return None;
        }

        let replacing = self.store.pending(sender).map(|p| p.fees());
        let request = SponsorshipRequest::new(
            op,
            current.action.as_ref(),
            current.resource_id.as_deref(),
            ctx,
            replacing,
        );

        match sponsor.sponsor(&request, ctx.access_token.as_deref()).await {
            Ok(SponsorReply::Approved(result)) => {
                if result.fees.is_none() && !op.has_fees() {
                    tracing::warn!(
                        sender = ?sender,
                        "sponsor approved an unpriced operation without fees; paying instead"
                    );
                    return None;
                }
                if !result.gas.is_complete() {
                    tracing::warn!(
                        sender = ?sender,
                        gas = ?result.gas,
                        "sponsor approved with incomplete gas limits; paying instead"
                    );
                    return None;
                }
                tracing::info!(
                    sender = ?sender,
                    action = ?current.action,
                    replacing = replacing.is_some(),
                    "operation sponsored"
                );
                self.store.set_rejected_sponsorship(sender, None);
                Some(result)
            }
            Ok(SponsorReply::Denied { code, message }) => {
                tracing::info!(
                    sender = ?sender,
                    code = %code,
                    message = %message,
                    "sponsorship denied"
                );
                self.store.set_rejected_sponsorship(sender, Some(code));
                None
            }
            Err(err) => {
                tracing::warn!(sender = ?sender, error = %err, "sponsorship request failed");
                None
            }
        }
    }
}
