use aa_userop::batch::{erc20_approve_and_transfer, native_transfer, Call};
use aa_userop::builder::{BuilderSettings, UserOpBuilder};
use aa_userop::bundler::{BundlerClient, ReceiptPolling, Submitter};
use aa_userop::chain::{ChainState, RpcChain};
use aa_userop::config::{
    write_config_file, Config, ConfigFile, DEFAULT_ENTRY_POINT, DEFAULT_FACTORY,
    DEFAULT_PAYMASTER_CONTEXT,
};
use aa_userop::contracts::Erc20;
use aa_userop::encoding;
use aa_userop::owner::{generate_signing_key, load_owner};
use aa_userop::paymaster::PaymasterClient;
use aa_userop::UserOpError;
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256};
use ethers::utils::{parse_ether, parse_units};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config.json";

// In --json mode stdout carries a single JSON object, so human-readable lines go to stderr.
macro_rules! outln {
    ($machine_mode:expr, $($arg:tt)*) => {{
        if $machine_mode {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    }};
}

#[derive(Parser, Debug)]
#[command(name = "aa-userop", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a config file with a freshly generated signing key.
    Init(InitArgs),

    /// Print the owner, the counterfactual smart account address and deployment status.
    Address(AddressArgs),

    /// Approve + transfer an ERC-20 amount from the smart account in one user operation.
    Erc20Transfer(Erc20TransferArgs),

    /// Send native currency from the smart account.
    Transfer(TransferArgs),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Init(_) => "init",
            Command::Address(_) => "address",
            Command::Erc20Transfer(_) => "erc20-transfer",
            Command::Transfer(_) => "transfer",
        }
    }
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Where to write the config file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    path: PathBuf,

    /// Overwrite an existing file.
    #[arg(long, default_value_t = false)]
    force: bool,

    /// Node RPC URL to record in the file.
    #[arg(long, env = "AA_RPC_URL")]
    rpc_url: Option<String>,

    /// Paymaster URL to record in the file. Leave empty to pay gas from the account.
    #[arg(long, env = "AA_PAYMASTER_URL")]
    paymaster_url: Option<String>,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// JSON config file. Defaults to ./config.json when it exists.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Smart account owner private key.
    ///
    /// Recommended: set via env var AA_SIGNING_KEY or the config file.
    #[arg(long, env = "AA_SIGNING_KEY", hide_env_values = true)]
    signing_key: Option<String>,

    /// Node RPC URL.
    #[arg(long, env = "AA_RPC_URL")]
    rpc_url: Option<String>,

    /// Bundler RPC URL (must support ERC-4337 JSON-RPC methods). Defaults to the node RPC URL.
    #[arg(long, env = "AA_BUNDLER_URL")]
    bundler_url: Option<String>,

    /// Paymaster URL (pm_sponsorUserOperation). Empty disables sponsorship.
    #[arg(long, env = "AA_PAYMASTER_URL")]
    paymaster_url: Option<String>,

    /// Paymaster policy type.
    #[arg(long, env = "AA_PAYMASTER_CONTEXT")]
    paymaster_context: Option<String>,

    /// EntryPoint address.
    #[arg(long, env = "AA_ENTRY_POINT")]
    entry_point: Option<String>,

    /// SimpleAccountFactory address.
    #[arg(long, env = "AA_FACTORY")]
    factory: Option<String>,

    /// CREATE2 salt for the smart account.
    #[arg(long)]
    salt: Option<u64>,

    /// Print a single JSON object to stdout; all other output goes to stderr.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct TxArgs {
    /// Build and sign the user operation, but do not send it.
    #[arg(long)]
    dry_run: bool,

    /// Do not wait for the userOp receipt.
    #[arg(long)]
    no_wait: bool,

    /// Max seconds to wait for the userOp receipt.
    #[arg(long)]
    max_wait_seconds: Option<u64>,
}

#[derive(Args, Debug)]
struct AddressArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct Erc20TransferArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    tx: TxArgs,

    /// ERC-20 token address.
    #[arg(long)]
    token: String,

    /// Recipient. Defaults to the smart account itself.
    #[arg(long)]
    to: Option<String>,

    /// Amount in whole tokens (decimal string); scaled by the token's decimals().
    #[arg(long)]
    amount: String,
}

#[derive(Args, Debug)]
struct TransferArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    tx: TxArgs,

    /// Recipient address.
    #[arg(long)]
    to: String,

    /// Amount in ETH (decimal string).
    #[arg(long)]
    eth: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Always write logs to stderr so stdout can be used for script-friendly outputs.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let operation = cli.cmd.name();

    let res = match cli.cmd {
        Command::Init(args) => cmd_init(args),
        Command::Address(args) => cmd_address(args).await,
        Command::Erc20Transfer(args) => cmd_erc20_transfer(args).await,
        Command::Transfer(args) => cmd_transfer(args).await,
    };

    if let Err(err) = &res {
        let kind = err
            .chain()
            .find_map(|e| e.downcast_ref::<UserOpError>())
            .map(UserOpError::kind)
            .unwrap_or("Other");
        tracing::error!(operation, kind, error = %format!("{err:#}"), "command failed");
    }
    res
}

type LiveChain = RpcChain<Provider<Http>>;

fn load_config(common: &CommonArgs, tx: Option<&TxArgs>) -> Result<Config> {
    let file = match &common.config {
        Some(path) => ConfigFile::load(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            ConfigFile::load(Path::new(DEFAULT_CONFIG_PATH))?
        }
        None => ConfigFile::default(),
    };

    // clap has already layered environment variables under the flags.
    let flags = ConfigFile {
        signing_key: common.signing_key.clone(),
        rpc_url: common.rpc_url.clone(),
        bundler_url: common.bundler_url.clone(),
        paymaster_url: common.paymaster_url.clone(),
        paymaster_context: common.paymaster_context.clone(),
        entry_point: common.entry_point.clone(),
        factory: common.factory.clone(),
        salt: common.salt,
        receipt_poll_interval_ms: None,
        receipt_timeout_secs: tx.and_then(|t| t.max_wait_seconds),
    };

    let config = Config::try_from(file.merge(flags)).context("invalid configuration")?;
    tracing::debug!(?config, "configuration loaded");
    Ok(config)
}

async fn connect(config: &Config) -> Result<(LiveChain, u64)> {
    let provider =
        Provider::<Http>::try_from(config.rpc_url.as_str())?.interval(Duration::from_millis(350));
    let chain = RpcChain::new(Arc::new(provider));
    let chain_id = chain.chain_id().await?;
    Ok((chain, chain_id))
}

fn user_op_builder(
    config: &Config,
    chain: LiveChain,
    chain_id: u64,
) -> Result<UserOpBuilder<LiveChain, LocalWallet>> {
    let wallet = load_owner(&config.signing_key, chain_id)?;
    let mut builder = UserOpBuilder::new(chain, wallet, BuilderSettings::from_config(config));
    if let Some(url) = &config.paymaster_url {
        builder = builder.with_paymaster(Box::new(PaymasterClient::new(url.clone())));
    }
    Ok(builder)
}

fn cmd_init(args: InitArgs) -> Result<()> {
    let (wallet, signing_key) = generate_signing_key()?;
    let contents = ConfigFile {
        signing_key: Some(signing_key),
        rpc_url: Some(args.rpc_url.unwrap_or_default()),
        paymaster_url: Some(args.paymaster_url.unwrap_or_default()),
        paymaster_context: Some(DEFAULT_PAYMASTER_CONTEXT.to_string()),
        entry_point: Some(DEFAULT_ENTRY_POINT.to_string()),
        factory: Some(DEFAULT_FACTORY.to_string()),
        ..Default::default()
    };
    write_config_file(&args.path, &contents, args.force)?;

    // The key itself is never printed.
    println!("owner:  {}", encoding::fmt_address(wallet.address()));
    println!("config: {}", args.path.display());
    eprintln!("DO NOT COMMIT {}: it holds the owner's private key.", args.path.display());
    Ok(())
}

async fn cmd_address(args: AddressArgs) -> Result<()> {
    let config = load_config(&args.common, None)?;
    let machine_mode = args.common.json;
    let (chain, chain_id) = connect(&config).await?;
    let builder = user_op_builder(&config, chain, chain_id)?;

    let owner = builder.owner();
    let account = builder.account_address().await?;
    let deployed = builder.chain().is_deployed(account).await?;

    if machine_mode {
        let out = serde_json::json!({
            "chainId": chain_id,
            "owner": encoding::fmt_address(owner),
            "smartAccount": encoding::fmt_address(account),
            "isDeployed": deployed,
        });
        println!("{}", out);
    }

    outln!(machine_mode, "chainId:        {}", chain_id);
    outln!(machine_mode, "entryPoint:     {:?}", config.entry_point);
    outln!(machine_mode, "factory:        {:?}", config.factory);
    outln!(machine_mode, "owner:          {:?}", owner);
    outln!(machine_mode, "smartAccount:   {:?}", account);
    outln!(machine_mode, "isDeployed:     {}", deployed);
    outln!(
        machine_mode,
        "paymaster:      {}",
        if config.paymaster_url.is_some() { "enabled" } else { "disabled" }
    );

    Ok(())
}

async fn cmd_erc20_transfer(args: Erc20TransferArgs) -> Result<()> {
    let config = load_config(&args.common, Some(&args.tx))?;
    let (chain, chain_id) = connect(&config).await?;
    let client = chain.client();
    let builder = user_op_builder(&config, chain, chain_id)?;

    let token: Address = args.token.parse().context("invalid --token address")?;
    let to = match &args.to {
        Some(to) => to.parse().context("invalid --to address")?,
        None => builder.account_address().await?,
    };
    let decimals = Erc20::new(token, client)
        .decimals()
        .call()
        .await
        .context("token.decimals failed")?;
    let amount: U256 = parse_units(&args.amount, u32::from(decimals))
        .with_context(|| format!("invalid --amount {}", args.amount))?
        .into();
    tracing::info!(token = ?token, to = ?to, amount = %amount, decimals, "erc20 transfer");

    let calls = erc20_approve_and_transfer(token, to, amount);
    send(&config, &builder, chain_id, &calls, &args.tx, args.common.json).await
}

async fn cmd_transfer(args: TransferArgs) -> Result<()> {
    let config = load_config(&args.common, Some(&args.tx))?;
    let (chain, chain_id) = connect(&config).await?;
    let builder = user_op_builder(&config, chain, chain_id)?;

    let to: Address = args.to.parse().context("invalid --to address")?;
    let value = parse_ether(&args.eth).with_context(|| format!("invalid --eth {}", args.eth))?;

    let calls = native_transfer(to, value);
    send(&config, &builder, chain_id, &calls, &args.tx, args.common.json).await
}

async fn send(
    config: &Config,
    builder: &UserOpBuilder<LiveChain, LocalWallet>,
    chain_id: u64,
    calls: &[Call],
    tx: &TxArgs,
    machine_mode: bool,
) -> Result<()> {
    let signed = builder.build(calls).await.context("building user operation")?;
    let op_json = encoding::user_op_to_json(signed.operation());
    let mut out = serde_json::json!({
        "userOperation": op_json,
        "userOpHash": encoding::fmt_h256(signed.user_op_hash()),
    });

    outln!(
        machine_mode,
        "\nUserOperation (signed):\n{}",
        serde_json::to_string_pretty(&op_json)?
    );

    if tx.dry_run {
        outln!(machine_mode, "\n--dry-run set: not sending user operation.");
        if machine_mode {
            println!("{}", out);
        }
        return Ok(());
    }

    let submitter = Submitter::new(
        BundlerClient::new(config.bundler_url.clone()),
        config.entry_point,
        chain_id,
        ReceiptPolling {
            interval: config.receipt_poll_interval,
            timeout: config.receipt_timeout,
        },
    );
    submitter.validate_chain_id().await?;

    let handle = submitter
        .submit(&signed)
        .await
        .context("submitting user operation")?;
    out["userOpHash"] = encoding::fmt_h256(handle.user_op_hash).into();
    outln!(
        machine_mode,
        "\nuserOpHash: {}",
        encoding::fmt_h256(handle.user_op_hash)
    );

    if tx.no_wait {
        outln!(machine_mode, "--no-wait set: not waiting for receipt.");
        if machine_mode {
            println!("{}", out);
        }
        return Ok(());
    }

    outln!(machine_mode, "Waiting for transaction...");
    let receipt = submitter
        .await_receipt(&handle)
        .await
        .context("waiting for userOp receipt")?;
    out["transactionHash"] = encoding::fmt_h256(receipt.transaction_hash).into();
    out["success"] = receipt.success.into();

    outln!(
        machine_mode,
        "Transaction hash: {}",
        encoding::fmt_h256(receipt.transaction_hash)
    );
    if machine_mode {
        println!("{}", out);
    }

    if !receipt.success {
        bail!(
            "user operation {} was included but reverted",
            encoding::fmt_h256(handle.user_op_hash)
        );
    }
    Ok(())
}
