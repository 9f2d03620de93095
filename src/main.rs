use std::{
    env, fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use unspendable::{AccountId, BlockHeight, Token, TokenConfig, Transaction};

#[derive(Parser)]
#[command(
    name = "unspendable",
    version,
    about = "Token ledger that holds back same-block receipts"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy a token from a TOML config into a fresh state file.
    Init {
        /// Deployment parameters; defaults are used when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        state: PathBuf,
        /// Overwrite an existing state file.
        #[arg(long)]
        force: bool,
    },
    /// Apply a JSON transaction; the state is written back only if accepted.
    Exec {
        #[arg(long)]
        state: PathBuf,
        #[arg(long)]
        tx: PathBuf,
    },
    /// Show total and spendable balance of an account.
    Balance {
        #[arg(long)]
        state: PathBuf,
        #[arg(long)]
        account: AccountId,
        /// Height at which spend eligibility is evaluated.
        #[arg(long)]
        block: Option<BlockHeight>,
    },
    /// Show token metadata and sale parameters.
    Info {
        #[arg(long)]
        state: PathBuf,
    },
    /// Print the account table with its merkle root.
    Snapshot {
        #[arg(long)]
        state: PathBuf,
    },
}

#[derive(Serialize)]
struct BalanceReport<'a> {
    account: &'a str,
    total: String,
    spendable: String,
    block: BlockHeight,
}

#[derive(Serialize)]
struct InfoReport<'a> {
    name: &'a str,
    symbol: &'a str,
    decimals: u8,
    owner: &'a str,
    reserve: &'a str,
    total_supply: String,
    reserve_balance: String,
    token_rate: String,
    proceeds: String,
    deployed_at: BlockHeight,
}

fn load_state(path: &Path) -> Result<Token> {
    let raw = fs::read(path).with_context(|| format!("read state {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("decode state {}", path.display()))
}

fn store_state(path: &Path, token: &Token) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let encoded = serde_json::to_vec_pretty(token)?;
    let tmp = path.with_extension("json.tmp");
    let mut f = fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(&encoded)?;
    f.sync_all()?;
    fs::rename(&tmp, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_cmd(config: Option<&Path>, state: &Path, force: bool) -> Result<()> {
    if state.exists() && !force {
        bail!("state {} already exists (use --force)", state.display());
    }
    let config = match config {
        Some(path) => TokenConfig::load(path)?,
        None => {
            let config = TokenConfig::default();
            config.validate()?;
            config
        }
    };
    let token = Token::deploy(&config)?;
    store_state(state, &token)?;
    println!("{} ({}) deployed → {}", token.name(), token.symbol(), state.display());
    Ok(())
}

fn exec_cmd(state: &Path, tx_path: &Path) -> Result<()> {
    let mut token = load_state(state)?;
    let raw = fs::read(tx_path).with_context(|| format!("read tx {}", tx_path.display()))?;
    let tx: Transaction = serde_json::from_slice(&raw)
        .with_context(|| format!("decode tx {}", tx_path.display()))?;
    let receipt = token.apply_transaction(&tx);
    if receipt.outcome.is_accepted() {
        store_state(state, &token)?;
    }
    print_json(&receipt)
}

fn balance_cmd(state: &Path, account: &AccountId, block: Option<BlockHeight>) -> Result<()> {
    let token = load_state(state)?;
    // Without an explicit height, report what would be spendable in the next block.
    let block = block.unwrap_or_else(|| {
        token
            .ledger()
            .accounts()
            .filter_map(|(_, entry)| entry.pending_block)
            .max()
            .unwrap_or(token.deployed_at())
            .saturating_add(1)
    });
    print_json(&BalanceReport {
        account,
        total: token.balance_of(account).to_string(),
        spendable: token.spendable_balance_of(account, block).to_string(),
        block,
    })
}

fn info_cmd(state: &Path) -> Result<()> {
    let token = load_state(state)?;
    print_json(&InfoReport {
        name: token.name(),
        symbol: token.symbol(),
        decimals: token.decimals(),
        owner: token.owner(),
        reserve: token.reserve(),
        total_supply: token.total_supply().to_string(),
        reserve_balance: token.balance_of(token.reserve()).to_string(),
        token_rate: token.token_rate().to_string(),
        proceeds: token.proceeds().to_string(),
        deployed_at: token.deployed_at(),
    })
}

fn snapshot_cmd(state: &Path) -> Result<()> {
    let token = load_state(state)?;
    print_json(&token.ledger().snapshot())
}

fn main() -> Result<()> {
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Init {
            config,
            state,
            force,
        } => init_cmd(config.as_deref(), &state, force),
        Command::Exec { state, tx } => exec_cmd(&state, &tx),
        Command::Balance {
            state,
            account,
            block,
        } => balance_cmd(&state, &account, block),
        Command::Info { state } => info_cmd(&state),
        Command::Snapshot { state } => snapshot_cmd(&state),
    }
}
