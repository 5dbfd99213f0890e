use crate::error::UserOpError;
use crate::types::{Call, UserOperation};
use async_trait::async_trait;
use ethers::abi::{Abi, AbiParser, Token};
use ethers::prelude::*;
use std::sync::Arc;

/// 65-byte dummy ECDSA signature accepted by SimpleAccount validation during
/// estimation.
const STUB_SIGNATURE: &str = "fffffffffffffffffffffffffffffff0000000000000000000000000000000007aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa1c";

const ENTRYPOINT_GET_USER_OP_HASH_ABI: &str = r#"[{"inputs":[{"components":[{"internalType":"address","name":"sender","type":"address"},{"internalType":"uint256","name":"nonce","type":"uint256"},{"internalType":"bytes","name":"initCode","type":"bytes"},{"internalType":"bytes","name":"callData","type":"bytes"},{"internalType":"uint256","name":"callGasLimit","type":"uint256"},{"internalType":"uint256","name":"verificationGasLimit","type":"uint256"},{"internalType":"uint256","name":"preVerificationGas","type":"uint256"},{"internalType":"uint256","name":"maxFeePerGas","type":"uint256"},{"internalType":"uint256","name":"maxPriorityFeePerGas","type":"uint256"},{"internalType":"bytes","name":"paymasterAndData","type":"bytes"},{"internalType":"bytes","name":"signature","type":"bytes"}],"internalType":"struct UserOperation","name":"userOp","type":"tuple"}],"name":"getUserOpHash","outputs":[{"internalType":"bytes32","name":"","type":"bytes32"}],"stateMutability":"view","type":"function"}]"#;

#[async_trait]
pub trait SmartAccount: Send + Sync {
    fn address(&self) -> Address;

    /// Wraps the calls in the account's execute entry point.
    fn encode_calls(&self, calls: &[Call]) -> Result<Bytes, UserOpError>;

    /// Factory init code, empty once the account is deployed.
    async fn init_code(&self) -> Result<Bytes, UserOpError>;

    async fn nonce(&self) -> Result<U256, UserOpError>;

    fn stub_signature(&self) -> Bytes {
        Bytes::from(hex::decode(STUB_SIGNATURE).unwrap_or_default())
    }

    async fn sign(&self, op: &UserOperation) -> Result<Bytes, UserOpError>;

    async fn balance(&self) -> Result<U256, UserOpError>;
}

/// SimpleAccount calldata: `execute` for one call, `executeBatch` for many.
///
/// `executeBatch(address[],bytes[])` carries no values, so batches that send
/// native currency are rejected.
pub fn encode_execute_calls(calls: &[Call]) -> Result<Bytes, UserOpError> {
    let account_err = |e: ethers::abi::Error| UserOpError::Account(e.to_string());
    match calls {
        [] => Err(UserOpError::Account("no calls to encode".to_string())),
        [call] => {
            let f = AbiParser::default()
                .parse_function("function execute(address dest, uint256 value, bytes func)")
                .map_err(|e| UserOpError::Account(e.to_string()))?;
            let data = f
                .encode_input(&[
                    Token::Address(call.to),
                    Token::Uint(call.value),
                    Token::Bytes(call.data.to_vec()),
                ])
                .map_err(account_err)?;
            Ok(Bytes::from(data))
        }
        many => {
            if many.iter().any(|c| !c.value.is_zero()) {
                return Err(UserOpError::Account(
                    "executeBatch cannot carry native value".to_string(),
                ));
            }
            let f = AbiParser::default()
                .parse_function("function executeBatch(address[] dest, bytes[] func)")
                .map_err(|e| UserOpError::Account(e.to_string()))?;
            let dests = many.iter().map(|c| Token::Address(c.to)).collect();
            let funcs = many.iter().map(|c| Token::Bytes(c.data.to_vec())).collect();
            let data = f
                .encode_input(&[Token::Array(dests), Token::Array(funcs)])
                .map_err(account_err)?;
            Ok(Bytes::from(data))
        }
    }
}

/// eth-infinitism SimpleAccount owned by a local key.
pub struct SimpleAccount<M> {
    client: Arc<M>,
    wallet: LocalWallet,
    entry_point: Address,
    factory: Address,
    salt: U256,
    address: Address,
}

impl<M: Middleware + 'static> SimpleAccount<M> {
    /// Resolves the counterfactual account address through the factory.
    pub async fn connect(
        client: Arc<M>,
        wallet: LocalWallet,
        entry_point: Address,
        factory: Address,
        salt: U256,
    ) -> Result<Self, UserOpError> {
        let factory_abi = parse_abi(&[
            "function getAddress(address owner, uint256 salt) view returns (address)",
        ])?;
        let factory_c = Contract::new(factory, factory_abi, client.clone());

        let address: Address = factory_c
            .method("getAddress", (wallet.address(), salt))
            .map_err(|e| UserOpError::Account(e.to_string()))?
            .call()
            .await
            .map_err(|e| UserOpError::Account(format!("factory.getAddress failed: {e}")))?;

        Ok(Self {
            client,
            wallet,
            entry_point,
            factory,
            salt,
            address,
        })
    }

    pub fn owner(&self) -> Address {
        self.wallet.address()
    }

    pub async fn is_deployed(&self) -> Result<bool, UserOpError> {
        let code = self
            .client
            .get_code(self.address, None)
            .await
            .map_err(|e| UserOpError::Account(format!("eth_getCode failed: {e}")))?;
        Ok(!code.as_ref().is_empty())
    }
}

#[async_trait]
impl<M: Middleware + 'static> SmartAccount for SimpleAccount<M> {
    fn address(&self) -> Address {
        self.address
    }

    fn encode_calls(&self, calls: &[Call]) -> Result<Bytes, UserOpError> {
        encode_execute_calls(calls)
    }

    async fn init_code(&self) -> Result<Bytes, UserOpError> {
        if self.is_deployed().await? {
            return Ok(Bytes::default());
        }
        let factory_abi = parse_abi(&[
            "function createAccount(address owner, uint256 salt) returns (address)",
        ])?;
        let factory_c = Contract::new(self.factory, factory_abi, self.client.clone());
        let create_calldata = factory_c
            .method::<_, Address>("createAccount", (self.owner(), self.salt))
            .map_err(|e| UserOpError::Account(e.to_string()))?
            .calldata()
            .ok_or_else(|| UserOpError::Account("failed to build createAccount calldata".to_string()))?;

        let mut v = Vec::with_capacity(20 + create_calldata.len());
        v.extend_from_slice(self.factory.as_bytes());
        v.extend_from_slice(create_calldata.as_ref());
        Ok(Bytes::from(v))
    }

    async fn nonce(&self) -> Result<U256, UserOpError> {
        let entrypoint_abi = parse_abi(&[
            "function getNonce(address sender, uint192 key) view returns (uint256)",
        ])?;
        let entrypoint_c = Contract::new(self.entry_point, entrypoint_abi, self.client.clone());
        entrypoint_c
            .method("getNonce", (self.address, U256::zero()))
            .map_err(|e| UserOpError::Account(e.to_string()))?
            .call()
            .await
            .map_err(|e| UserOpError::Account(format!("entryPoint.getNonce failed: {e}")))
    }

    async fn sign(&self, op: &UserOperation) -> Result<Bytes, UserOpError> {
        let entrypoint_abi: Abi = serde_json::from_str(ENTRYPOINT_GET_USER_OP_HASH_ABI)
            .map_err(|e| UserOpError::Account(format!("failed to parse EntryPoint ABI: {e}")))?;
        let entrypoint_c = Contract::new(self.entry_point, entrypoint_abi, self.client.clone());

        let user_op_hash: H256 = entrypoint_c
            .method("getUserOpHash", (op.as_abi_tuple(),))
            .map_err(|e| UserOpError::Account(e.to_string()))?
            .call()
            .await
            .map_err(|e| UserOpError::Account(format!("entryPoint.getUserOpHash failed: {e}")))?;

        let sig = self
            .wallet
            .sign_message(user_op_hash.as_bytes())
            .await
            .map_err(|e| UserOpError::Account(format!("failed to sign userOpHash: {e}")))?;
        Ok(Bytes::from(sig.to_vec()))
    }

    async fn balance(&self) -> Result<U256, UserOpError> {
        self.client
            .get_balance(self.address, None)
            .await
            .map_err(|e| UserOpError::Account(format!("eth_getBalance failed: {e}")))
    }
}

fn parse_abi(sigs: &[&str]) -> Result<Abi, UserOpError> {
    AbiParser::default()
        .parse(sigs)
        .map_err(|e| UserOpError::Account(e.to_string()))
}
