use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use ethers::prelude::*;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use userops_pipeline::account::{SimpleAccount, SmartAccount};
use userops_pipeline::bundler::BundlerClient;
use userops_pipeline::config::{load_config, ConfigOverrides, PipelineConfig};
use userops_pipeline::confirm::{
    cancel_pair, AutoConfirm, ConfirmationRequest, Confirmer, PromptResponse,
};
use userops_pipeline::encoding;
use userops_pipeline::persist::JsonFileStore;
use userops_pipeline::pipeline::UserOpRequest;
use userops_pipeline::sponsor::{PaymasterProxyClient, Sponsor};
use userops_pipeline::store::OperationStateStore;
use userops_pipeline::types::{Action, Call, SenderContext};
use userops_pipeline::{UserOpError, UserOps};

#[derive(Parser, Debug)]
#[command(name = "userops-cli", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the counterfactual smart account address and deployment status.
    Account(AccountArgs),

    /// Prepare, sponsor (when possible) and submit a user operation.
    Send(SendArgs),

    /// Print the persisted per-sender operation state.
    Status(StatusArgs),

    /// Forget everything recorded for a sender, including a pending operation.
    Reset(ResetArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Pipeline config JSON (chain, bundler, factory, policy).
    #[arg(long, env = "USEROPS_CONFIG", default_value = "userops.json")]
    config: PathBuf,

    /// Override the chain RPC URL.
    #[arg(long, env = "USEROPS_RPC_URL")]
    rpc: Option<String>,

    /// Override the bundler RPC URL.
    #[arg(long, env = "USEROPS_BUNDLER_URL")]
    bundler: Option<String>,

    /// Override the paymaster proxy base URL.
    #[arg(long, env = "USEROPS_PAYMASTER_PROXY_URL")]
    paymaster_proxy: Option<String>,

    /// Bearer secret for the paymaster proxy.
    #[arg(long, env = "USEROPS_PAYMASTER_SECRET", hide_env_values = true)]
    paymaster_secret: Option<String>,

    /// Smart account owner private key.
    #[arg(long, env = "USEROPS_OWNER_PRIVATE_KEY", hide_env_values = true)]
    owner_private_key: String,

    /// CREATE2 salt for the smart account.
    #[arg(long, default_value_t = 0)]
    salt: u64,

    /// Override the persisted state file.
    #[arg(long, env = "USEROPS_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Disable retry backoff.
    #[arg(long, env = "USEROPS_TEST_MODE", default_value_t = false)]
    test_mode: bool,
}

impl CommonArgs {
    fn load(&self) -> Result<PipelineConfig> {
        load_config(
            &self.config,
            ConfigOverrides {
                rpc_url: self.rpc.clone(),
                bundler_url: self.bundler.clone(),
                paymaster_proxy_url: self.paymaster_proxy.clone(),
                paymaster_auth_secret: self.paymaster_secret.clone(),
                state_file: self.state_file.clone(),
                test_mode: self.test_mode,
            },
        )
    }
}

#[derive(Args, Debug)]
struct AccountArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Print a single JSON object to stdout.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Call target.
    #[arg(long)]
    to: String,

    /// Hex calldata.
    #[arg(long, default_value = "0x")]
    data: String,

    /// Native value in wei (decimal).
    #[arg(long)]
    value: Option<String>,

    /// Send the whole balance to `--to`, minus the worst-case gas cost.
    #[arg(long, default_value_t = false, conflicts_with = "value")]
    drain: bool,

    /// Action label, e.g. "tip", "trading", "transferEth", "joinSpace".
    #[arg(long)]
    action: Option<String>,

    /// Resource the action targets (forwarded to the sponsor as townId).
    #[arg(long)]
    resource_id: Option<String>,

    /// How the user logged in; some login methods are never sponsored.
    #[arg(long)]
    login_method: Option<String>,

    /// Root key forwarded to the sponsor. Defaults to the owner address.
    #[arg(long)]
    root_key: Option<String>,

    /// Session token for the paymaster proxy.
    #[arg(long, env = "USEROPS_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Override the configured retry budget.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Skip the confirmation prompt for self-funded operations.
    #[arg(long, short = 'y', default_value_t = false)]
    yes: bool,

    /// Return right after the bundler accepts the operation.
    #[arg(long, default_value_t = false)]
    no_wait: bool,
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[arg(long, env = "USEROPS_STATE_FILE", default_value = "userops-state.json")]
    state_file: PathBuf,

    /// Only print this sender.
    #[arg(long)]
    sender: Option<String>,
}

#[derive(Args, Debug)]
struct ResetArgs {
    #[arg(long, env = "USEROPS_STATE_FILE", default_value = "userops-state.json")]
    state_file: PathBuf,

    #[arg(long)]
    sender: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // stdout carries only command output
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Account(args) => cmd_account(args).await,
        Command::Send(args) => cmd_send(args).await,
        Command::Status(args) => cmd_status(args),
        Command::Reset(args) => cmd_reset(args),
    }
}

async fn connect(
    common: &CommonArgs,
    cfg: &PipelineConfig,
) -> Result<SimpleAccount<Provider<Http>>> {
    let provider =
        Provider::<Http>::try_from(cfg.rpc_url.as_str())?.interval(Duration::from_millis(350));

    let chain_id = provider.get_chainid().await?.as_u64();
    if chain_id != cfg.chain_id {
        return Err(anyhow!(
            "chainId mismatch: config has {}, RPC returned {}",
            cfg.chain_id,
            chain_id
        ));
    }

    let wallet = LocalWallet::from_str(common.owner_private_key.trim())
        .context("invalid owner private key")?
        .with_chain_id(chain_id);

    let account = SimpleAccount::connect(
        Arc::new(provider),
        wallet,
        cfg.entry_point,
        cfg.factory,
        U256::from(common.salt),
    )
    .await?;
    Ok(account)
}

async fn cmd_account(args: AccountArgs) -> Result<()> {
    let cfg = args.common.load()?;
    let account = connect(&args.common, &cfg).await?;
    let deployed = account.is_deployed().await?;
    let balance = account.balance().await?;

    if args.json {
        let out = serde_json::json!({
            "owner": encoding::fmt_address(account.owner()),
            "smartAccount": encoding::fmt_address(account.address()),
            "isDeployed": deployed,
            "balance": encoding::fmt_u256(balance),
        });
        println!("{}", out);
        return Ok(());
    }

    println!("chainId:        {}", cfg.chain_id);
    println!("entryPoint:     {:?}", cfg.entry_point);
    println!("factory:        {:?}", cfg.factory);
    println!("relay:          {:?}", cfg.relay_provider);
    println!("owner:          {:?}", account.owner());
    println!("smartAccount:   {:?}", account.address());
    println!("isDeployed:     {}", deployed);
    println!("balance:        {} ETH", ethers::utils::format_ether(balance));
    Ok(())
}

async fn cmd_send(args: SendArgs) -> Result<()> {
    let mut cfg = args.common.load()?;
    if let Some(n) = args.max_retries {
        cfg.max_retries = n;
    }

    let _lock = lock_state(&cfg.state_file)?;

    let account = Arc::new(connect(&args.common, &cfg).await?);
    let owner = account.owner();
    let sender = account.address();

    let to = Address::from_str(&args.to).context("invalid --to address")?;
    let data = encoding::parse_bytes(&args.data).context("invalid --data hex")?;
    let (action, value) = if args.drain {
        let balance = account.balance().await?;
        (Some(Action::TransferEth), Some(balance))
    } else {
        let value = args
            .value
            .as_deref()
            .map(U256::from_dec_str)
            .transpose()
            .context("invalid --value")?;
        (args.action.as_deref().map(Action::from), value)
    };
    let root_key = match args.root_key.as_deref() {
        Some(k) => Address::from_str(k).context("invalid --root-key address")?,
        None => owner,
    };

    let request = UserOpRequest {
        calls: vec![Call {
            to,
            value: value.unwrap_or_default(),
            data,
        }],
        action,
        resource_id: args.resource_id.clone(),
        value,
        context: SenderContext {
            root_key,
            login_method: args.login_method.clone(),
            access_token: args.access_token.clone(),
        },
        ..Default::default()
    };

    let store = Arc::new(OperationStateStore::with_persistence(Arc::new(
        JsonFileStore::new(cfg.state_file.clone()),
    ))?);
    let relay = Arc::new(BundlerClient::new(
        cfg.bundler_url.clone(),
        cfg.rpc_url.clone(),
        cfg.entry_point,
        cfg.relay_provider,
    ));
    let sponsor = cfg.paymaster_proxy_url.as_deref().map(|url| {
        Arc::new(PaymasterProxyClient::new(
            url,
            cfg.relay_provider,
            cfg.paymaster_auth_secret.clone(),
        )) as Arc<dyn Sponsor>
    });
    let confirmer: Arc<dyn Confirmer> = if args.yes {
        Arc::new(AutoConfirm(PromptResponse::Confirmed))
    } else {
        Arc::new(StdinConfirmer)
    };

    let ops = UserOps::from_config(&cfg, account, relay, sponsor, confirmer, store.clone());

    let (canceller, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; cancelling");
            canceller.cancel();
        }
    });

    tracing::info!(
        sender = ?sender,
        relay = ?cfg.relay_provider,
        sponsor = cfg.paymaster_proxy_url.is_some(),
        max_retries = cfg.max_retries,
        "sending user operation"
    );

    let submitted = ops.send(request, &cancel).await?;
    println!("userOpHash:     {:?}", submitted.hash);

    if args.no_wait {
        return Ok(());
    }

    let receipt = submitted.await_receipt(cfg.receipt_timeout).await?;
    println!("success:        {}", receipt.success);
    if let Some(tx) = receipt.transaction_hash {
        println!("txHash:         {:?}", tx);
    }
    if let Some(cost) = receipt.actual_gas_cost {
        println!("actualGasCost:  {} ETH", ethers::utils::format_ether(cost));
    }
    if !receipt.success {
        return Err(anyhow!("user operation reverted on-chain"));
    }
    Ok(())
}

fn cmd_status(args: StatusArgs) -> Result<()> {
    let store = OperationStateStore::with_persistence(Arc::new(JsonFileStore::new(
        args.state_file.clone(),
    )))?;

    let out = match args.sender.as_deref() {
        Some(s) => {
            let sender = Address::from_str(s).context("invalid --sender address")?;
            store.snapshot_json(sender)
        }
        None => {
            let senders = store
                .senders()
                .into_iter()
                .map(|a| (encoding::fmt_address(a), store.snapshot_json(a)))
                .collect::<serde_json::Map<_, _>>();
            serde_json::Value::Object(senders)
        }
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn cmd_reset(args: ResetArgs) -> Result<()> {
    let sender = Address::from_str(&args.sender).context("invalid --sender address")?;
    let _lock = lock_state(&args.state_file)?;
    let store = OperationStateStore::with_persistence(Arc::new(JsonFileStore::new(
        args.state_file.clone(),
    )))?;
    store.reset(sender);
    println!("reset {:?}", sender);
    Ok(())
}

/// Single-writer guard on the state file; released when the handle drops.
fn lock_state(state_file: &Path) -> Result<File> {
    if let Some(parent) = state_file.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state directory {}", parent.display()))?;
        }
    }
    let lock_path = state_file.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("failed to open lock file {}", lock_path.display()))?;
    lock_file.try_lock_exclusive().with_context(|| {
        format!(
            "another userops-cli is using {} (lock {})",
            state_file.display(),
            lock_path.display()
        )
    })?;
    Ok(lock_file)
}

/// `y/N` prompt on stderr/stdin.
struct StdinConfirmer;

#[async_trait]
impl Confirmer for StdinConfirmer {
    async fn confirm(&self, request: &ConfirmationRequest) -> Result<PromptResponse, UserOpError> {
        let summary = format!(
            "{} from {:?} is not sponsored: up to {} ETH (maxFeePerGas {} wei, value {} wei).",
            request.action,
            request.sender,
            ethers::utils::format_ether(request.max_cost),
            request.fees.max_fee_per_gas,
            request.value.unwrap_or_default(),
        );
        let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            let mut stderr = std::io::stderr();
            write!(stderr, "{summary} Proceed? [y/N] ")?;
            stderr.flush()?;
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            Ok(line)
        })
        .await;

        match answer {
            Ok(Ok(line)) if matches!(line.trim(), "y" | "Y" | "yes") => Ok(PromptResponse::Confirmed),
            Ok(Ok(_)) => Ok(PromptResponse::Denied),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to read confirmation; treating as denied");
                Ok(PromptResponse::Denied)
            }
            Err(e) => {
                tracing::warn!(error = %e, "confirmation prompt aborted; treating as denied");
                Ok(PromptResponse::Denied)
            }
        }
    }
}
