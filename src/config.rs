use crate::types::Action;
use anyhow::{anyhow, bail, Context, Result};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

/// EntryPoint v0.6, deployed at the same address on every supported chain.
pub const DEFAULT_ENTRY_POINT: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";

/// Which relay family the bundler URL points at. Selected once at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelayProvider {
    Alchemy,
    Generic,
}

impl RelayProvider {
    pub fn from_bundler_url(url: &str) -> Self {
        if url.to_lowercase().contains("alchemy.com") {
            RelayProvider::Alchemy
        } else {
            RelayProvider::Generic
        }
    }

    /// Generic sponsors price the op themselves and need fees in the request;
    /// Alchemy fills fees only once sponsorship is known to have failed.
    pub fn fees_before_sponsorship(self) -> bool {
        matches!(self, RelayProvider::Generic)
    }

    pub fn priority_fee_method(self) -> &'static str {
        match self {
            RelayProvider::Alchemy => "rundler_maxPriorityFeePerGas",
            RelayProvider::Generic => "eth_maxPriorityFeePerGas",
        }
    }

    pub fn sponsor_path(self) -> &'static str {
        match self {
            RelayProvider::Alchemy => "/api/sponsor-userop/alchemy",
            RelayProvider::Generic => "/api/sponsor-userop",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfigRaw {
    pub chain_id: u64,
    pub rpc: String,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    pub bundler: String,
    #[serde(default)]
    pub bundler_env_var: Option<String>,
    #[serde(default)]
    pub paymaster_proxy: Option<String>,
    /// Name of the env var holding the proxy's bearer secret; secrets never live in the file.
    #[serde(default)]
    pub paymaster_proxy_secret_env_var: Option<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
    pub factory: String,
    #[serde(default)]
    pub relay_provider: Option<RelayProvider>,
    #[serde(default)]
    pub non_sponsorable_actions: Option<Vec<String>>,
    #[serde(default)]
    pub non_sponsorable_login_methods: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub confirmation_timeout_secs: Option<u64>,
    #[serde(default)]
    pub receipt_poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub receipt_timeout_secs: Option<u64>,
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub bundler_url: String,
    pub paymaster_proxy_url: Option<String>,
    pub paymaster_auth_secret: Option<String>,
    pub entry_point: Address,
    pub factory: Address,
    pub relay_provider: RelayProvider,
    pub non_sponsorable_actions: Vec<Action>,
    pub non_sponsorable_login_methods: Vec<String>,
    pub max_retries: u32,
    /// Zeroes every retry backoff.
    pub test_mode: bool,
    pub confirmation_timeout: Duration,
    pub receipt_poll_interval: Duration,
    pub receipt_timeout: Duration,
    pub state_file: PathBuf,
}

/// Values supplied on the command line or through `USEROPS_*` env vars;
/// these win over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub rpc_url: Option<String>,
    pub bundler_url: Option<String>,
    pub paymaster_proxy_url: Option<String>,
    pub paymaster_auth_secret: Option<String>,
    pub state_file: Option<PathBuf>,
    pub test_mode: bool,
}

pub fn load_config(path: &Path, overrides: ConfigOverrides) -> Result<PipelineConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config json at {}", path.display()))?;
    let raw: PipelineConfigRaw = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config json at {}", path.display()))?;
    resolve(raw, overrides)
}

pub fn resolve(raw: PipelineConfigRaw, overrides: ConfigOverrides) -> Result<PipelineConfig> {
    let rpc_url = pick(overrides.rpc_url, raw.rpc_env_var.as_deref(), &raw.rpc);
    let bundler_url = pick(overrides.bundler_url, raw.bundler_env_var.as_deref(), &raw.bundler);
    if bundler_url.is_empty() {
        bail!("bundler url is empty");
    }

    let paymaster_proxy_url = overrides
        .paymaster_proxy_url
        .or(raw.paymaster_proxy)
        .map(|u| u.trim_end_matches('/').to_string())
        .filter(|u| !u.is_empty());

    let paymaster_auth_secret = overrides.paymaster_auth_secret.or_else(|| {
        raw.paymaster_proxy_secret_env_var
            .as_deref()
            .and_then(|name| env::var(name).ok())
    });
    if paymaster_proxy_url.is_some() && paymaster_auth_secret.is_none() {
        tracing::warn!("paymaster proxy configured without an auth secret; requests will be unauthenticated");
    }

    let entry_point = parse_addr(raw.entry_point.as_deref().unwrap_or(DEFAULT_ENTRY_POINT))
        .context("invalid entryPoint address")?;
    let factory = parse_addr(&raw.factory).context("invalid factory address")?;

    let relay_provider = raw
        .relay_provider
        .unwrap_or_else(|| RelayProvider::from_bundler_url(&bundler_url));

    let non_sponsorable_actions = raw
        .non_sponsorable_actions
        .unwrap_or_else(|| vec![Action::Tip.to_string()])
        .into_iter()
        .map(Action::from)
        .collect();

    Ok(PipelineConfig {
        chain_id: raw.chain_id,
        rpc_url,
        bundler_url,
        paymaster_proxy_url,
        paymaster_auth_secret,
        entry_point,
        factory,
        relay_provider,
        non_sponsorable_actions,
        non_sponsorable_login_methods: raw.non_sponsorable_login_methods,
        max_retries: raw.max_retries.unwrap_or(3),
        test_mode: overrides.test_mode || raw.test_mode,
        confirmation_timeout: Duration::from_secs(raw.confirmation_timeout_secs.unwrap_or(300)),
        receipt_poll_interval: Duration::from_millis(raw.receipt_poll_interval_ms.unwrap_or(1500)),
        receipt_timeout: Duration::from_secs(raw.receipt_timeout_secs.unwrap_or(120)),
        state_file: overrides
            .state_file
            .or(raw.state_file)
            .unwrap_or_else(|| PathBuf::from("userops-state.json")),
    })
}

fn pick(flag: Option<String>, env_var: Option<&str>, file_value: &str) -> String {
    if let Some(v) = flag {
        v
    } else if let Some(name) = env_var {
        env::var(name).unwrap_or_else(|_| file_value.to_string())
    } else {
        file_value.to_string()
    }
}

fn parse_addr(s: &str) -> Result<Address> {
    s.parse::<Address>().map_err(|e| anyhow!("{e}"))
}
