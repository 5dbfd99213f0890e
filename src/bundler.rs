use crate::config::RelayProvider;
use crate::encoding::{fmt_address, fmt_h256, fmt_u256, parse_h256, parse_u256_quantity, user_op_to_json};
use crate::error::{RpcFailure, UserOpError};
use crate::types::{GasLimits, UserOperation};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde_json::Value;

/// Receipt fields the pipeline acts on; the raw object is kept for callers.
#[derive(Debug, Clone, PartialEq)]
pub struct UserOperationReceipt {
    pub user_op_hash: H256,
    pub success: bool,
    pub transaction_hash: Option<H256>,
    pub actual_gas_cost: Option<U256>,
    pub raw: Value,
}

/// The relay network as the pipeline sees it: fee suggestions, gas
/// estimation, submission and receipts.
#[async_trait]
pub trait RelayClient: Send + Sync {
    fn provider(&self) -> RelayProvider;

    fn entry_point(&self) -> Address;

    async fn max_priority_fee_per_gas(&self) -> Result<U256, UserOpError>;

    /// `None` on networks without EIP-1559 base fees.
    async fn latest_base_fee(&self) -> Result<Option<U256>, UserOpError>;

    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        balance_override: Option<U256>,
    ) -> Result<GasLimits, UserOpError>;

    async fn send_user_operation(&self, op: &UserOperation) -> Result<H256, UserOpError>;

    async fn get_user_operation_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<UserOperationReceipt>, UserOpError>;
}

/// JSON-RPC client for a bundler plus the chain node behind it.
#[derive(Debug, Clone)]
pub struct BundlerClient {
    bundler_url: String,
    node_url: String,
    entry_point: Address,
    provider: RelayProvider,
    http: reqwest::Client,
}

impl BundlerClient {
    pub fn new(
        bundler_url: String,
        node_url: String,
        entry_point: Address,
        provider: RelayProvider,
    ) -> Self {
        Self {
            bundler_url,
            node_url,
            entry_point,
            provider,
            http: reqwest::Client::new(),
        }
    }

    async fn rpc(&self, url: &str, method: &str, params: Value) -> Result<Value, UserOpError> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(url)
            .json(&req)
            .send()
            .await
            .map_err(|e| UserOpError::Transport(format!("{method}: POST failed: {e}")))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| UserOpError::InvalidResponse(format!("{method}: failed to decode JSON: {e}")))?;

        // JSON-RPC errors can arrive with non-2xx statuses, so check the body first.
        if let Some(err) = body.get("error") {
            return Err(UserOpError::Rpc(parse_rpc_error(err)));
        }

        if !status.is_success() {
            return Err(UserOpError::Transport(format!("{method}: HTTP {status}: {body}")));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| UserOpError::InvalidResponse(format!("{method}: missing result field")))
    }
}

#[async_trait]
impl RelayClient for BundlerClient {
    fn provider(&self) -> RelayProvider {
        self.provider
    }

    fn entry_point(&self) -> Address {
        self.entry_point
    }

    async fn max_priority_fee_per_gas(&self) -> Result<U256, UserOpError> {
        if self.provider == RelayProvider::Alchemy {
            match self
                .rpc(&self.bundler_url, "rundler_maxPriorityFeePerGas", serde_json::json!([]))
                .await
            {
                Ok(v) => return parse_quantity(&v, "rundler_maxPriorityFeePerGas"),
                Err(err) => {
                    tracing::warn!(error = %err, "rundler_maxPriorityFeePerGas failed, falling back");
                }
            }
        }
        let v = self
            .rpc(&self.node_url, "eth_maxPriorityFeePerGas", serde_json::json!([]))
            .await?;
        parse_quantity(&v, "eth_maxPriorityFeePerGas")
    }

    async fn latest_base_fee(&self) -> Result<Option<U256>, UserOpError> {
        let block = self
            .rpc(&self.node_url, "eth_getBlockByNumber", serde_json::json!(["latest", false]))
            .await?;
        match block.get("baseFeePerGas") {
            None | Some(Value::Null) => Ok(None),
            Some(v) => parse_quantity(v, "baseFeePerGas").map(Some),
        }
    }

    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        balance_override: Option<U256>,
    ) -> Result<GasLimits, UserOpError> {
        let mut params = vec![
            user_op_to_json(op),
            Value::String(fmt_address(self.entry_point)),
        ];
        if let Some(balance) = balance_override {
            params.push(serde_json::json!({
                fmt_address(op.sender): { "balance": fmt_u256(balance) }
            }));
        }

        let res = self
            .rpc(&self.bundler_url, "eth_estimateUserOperationGas", Value::Array(params))
            .await?;

        Ok(GasLimits {
            call_gas_limit: parse_u256_field(&res, "callGasLimit")?,
            verification_gas_limit: parse_u256_field(&res, "verificationGasLimit")?,
            pre_verification_gas: parse_u256_field(&res, "preVerificationGas")?,
        })
    }

    async fn send_user_operation(&self, op: &UserOperation) -> Result<H256, UserOpError> {
        let params = serde_json::json!([user_op_to_json(op), fmt_address(self.entry_point)]);
        let res = self
            .rpc(&self.bundler_url, "eth_sendUserOperation", params)
            .await?;
        parse_userop_hash(&res)
    }

    async fn get_user_operation_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<UserOperationReceipt>, UserOpError> {
        let res = self
            .rpc(
                &self.bundler_url,
                "eth_getUserOperationReceipt",
                serde_json::json!([fmt_h256(hash)]),
            )
            .await?;
        if res.is_null() {
            return Ok(None);
        }
        parse_receipt(hash, res).map(Some)
    }
}

fn parse_rpc_error(err: &Value) -> RpcFailure {
    RpcFailure {
        code: err.get("code").and_then(Value::as_i64),
        message: err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
        data: err.get("data").filter(|d| !d.is_null()).cloned(),
    }
}

/// Bundlers disagree on hex strings versus JSON numbers for quantities.
fn parse_quantity(v: &Value, what: &str) -> Result<U256, UserOpError> {
    match v {
        Value::String(s) => parse_u256_quantity(s)
            .map_err(|e| UserOpError::InvalidResponse(format!("invalid {what} {s}: {e}"))),
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| UserOpError::InvalidResponse(format!("invalid {what} {n}"))),
        other => Err(UserOpError::InvalidResponse(format!(
            "invalid {what}: {other}"
        ))),
    }
}

fn parse_u256_field(v: &Value, key: &str) -> Result<U256, UserOpError> {
    let field = v
        .get(key)
        .ok_or_else(|| UserOpError::InvalidResponse(format!("missing field {key}")))?;
    parse_quantity(field, key)
}

fn parse_userop_hash(res: &Value) -> Result<H256, UserOpError> {
    // Most bundlers return the userOpHash directly as a JSON string; some wrap it.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(UserOpError::InvalidResponse(format!(
            "unexpected eth_sendUserOperation result shape (expected string or {{result: ...}}): {res}"
        )));
    };

    parse_h256(hash_str).map_err(|e| UserOpError::InvalidResponse(format!("bad userOpHash: {e}")))
}

fn parse_receipt(hash: H256, raw: Value) -> Result<UserOperationReceipt, UserOpError> {
    let success = match raw.get("success") {
        Some(Value::Bool(b)) => *b,
        _ => {
            return Err(UserOpError::InvalidResponse(format!(
                "receipt for {} has no success flag",
                fmt_h256(hash)
            )))
        }
    };
    let transaction_hash = raw
        .get("receipt")
        .and_then(|r| r.get("transactionHash"))
        .and_then(Value::as_str)
        .and_then(|s| parse_h256(s).ok());
    let actual_gas_cost = raw
        .get("actualGasCost")
        .and_then(|v| parse_quantity(v, "actualGasCost").ok());

    Ok(UserOperationReceipt {
        user_op_hash: hash,
        success,
        transaction_hash,
        actual_gas_cost,
        raw,
    })
}
