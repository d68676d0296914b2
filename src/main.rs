mod allocator;
mod error;
mod executor;
mod progress;
mod rpc;
mod wallet;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use solana_sdk::{
    native_token::{lamports_to_sol, sol_to_lamports},
    pubkey::Pubkey,
    signature::Keypair,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing_subscriber::EnvFilter;

use crate::allocator::{allocate, AllocationMode, DistributionPlan};
use crate::executor::{refresh_balances, BatchExecutor, ExecutorConfig, Session};
use crate::progress::Stage;
use crate::rpc::{RetryPolicy, RetryingRpcClient, SolanaRpc};
use crate::wallet::{Vault, FLEET_SIZE};

#[derive(Parser)]
#[clap(author, version, about = "Derive, bulk-fund, and manage a fleet of Solana subwallets", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive the subwallet fleet from a parent keypair
    Generate(GenerateArgs),
    /// Split a SOL budget across the fleet in batched transfers
    Fund(FundArgs),
    /// Re-read fleet balances from the chain
    Refresh(RefreshArgs),
    /// Write a public address sheet (no key material) as CSV
    Export(ExportArgs),
    /// Replace the vault with a previously saved backup
    Restore(RestoreArgs),
}

#[derive(Parser)]
struct GenerateArgs {
    /// Parent keypair path (JSON byte array, solana-keygen format)
    #[clap(long)]
    parent: PathBuf,

    /// Vault file to write
    #[clap(long, default_value = "fleet-vault.json")]
    vault: PathBuf,

    /// Overwrite an existing vault
    #[clap(long)]
    force: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Same amount for every subwallet
    Uniform,
    /// Random amount per subwallet within --min/--max
    Random,
}

#[derive(Parser)]
struct FundArgs {
    /// Parent keypair path: source of funds and fee payer
    #[clap(long)]
    parent: PathBuf,

    /// Vault file with the target subwallets
    #[clap(long, default_value = "fleet-vault.json")]
    vault: PathBuf,

    /// RPC URL
    #[clap(long)]
    url: String,

    /// Total budget to distribute, in SOL
    #[clap(long)]
    budget: f64,

    /// Allocation mode
    #[clap(long, value_enum, default_value = "uniform")]
    mode: ModeArg,

    /// Minimum per-wallet amount in SOL (random mode)
    #[clap(long)]
    min: Option<f64>,

    /// Maximum per-wallet amount in SOL (random mode)
    #[clap(long)]
    max: Option<f64>,

    /// Fund only the first N subwallets instead of the whole fleet
    #[clap(long)]
    count: Option<usize>,

    /// Transfers per transaction
    #[clap(long, default_value = "2")]
    batch_size: usize,

    /// Rate limit (requests per second)
    #[clap(long, default_value = "10")]
    rate_limit: u32,

    /// Compute unit price in microlamports
    #[clap(long, default_value = "1000")]
    priority_fee: u64,

    /// Show the plan without sending anything
    #[clap(long)]
    dry_run: bool,

    /// Skip confirmation prompt
    #[clap(long)]
    yes: bool,
}

#[derive(Parser)]
struct RefreshArgs {
    #[clap(long, default_value = "fleet-vault.json")]
    vault: PathBuf,

    /// RPC URL
    #[clap(long)]
    url: String,

    /// Also refresh balances of this SPL token mint
    #[clap(long)]
    mint: Option<String>,
}

#[derive(Parser)]
struct ExportArgs {
    #[clap(long, default_value = "fleet-vault.json")]
    vault: PathBuf,

    /// Output CSV path
    #[clap(long, default_value = "fleet-addresses.csv")]
    output: PathBuf,
}

#[derive(Parser)]
struct RestoreArgs {
    #[clap(long, default_value = "fleet-vault.json")]
    vault: PathBuf,

    /// Backup file to restore from
    #[clap(long)]
    backup: PathBuf,

    /// Skip confirmation prompt
    #[clap(long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Generate(args) => generate(args),
        Commands::Fund(args) => fund(args).await,
        Commands::Refresh(args) => refresh(args).await,
        Commands::Export(args) => export(args),
        Commands::Restore(args) => restore(args),
    }
}

fn generate(args: GenerateArgs) -> Result<()> {
    if args.vault.exists() && !args.force {
        bail!(
            "vault {} already exists; pass --force to overwrite (the old keys will be lost)",
            args.vault.display()
        );
    }

    let parent = load_keypair(&args.parent)?;
    let vault = Vault::generate(&parent)?;
    vault.save(&args.vault)?;

    println!(
        "✅ Derived {} subwallets from parent {}",
        FLEET_SIZE, vault.parent_address
    );
    println!("Vault written to {}", args.vault.display());
    println!("First address: {}", vault.accounts[0].pubkey());
    Ok(())
}

async fn fund(args: FundArgs) -> Result<()> {
    let parent = load_keypair(&args.parent)?;
    let mut vault = Vault::load(&args.vault)
        .with_context(|| format!("loading vault {}", args.vault.display()))?;

    let target_count = args.count.unwrap_or(vault.accounts.len());
    if target_count == 0 || target_count > vault.accounts.len() {
        bail!(
            "--count must be between 1 and {} (vault size)",
            vault.accounts.len()
        );
    }

    let mode = match args.mode {
        ModeArg::Uniform => AllocationMode::Uniform,
        ModeArg::Random => {
            let (Some(min), Some(max)) = (args.min, args.max) else {
                bail!("random mode requires --min and --max");
            };
            AllocationMode::BoundedRandom {
                min_lamports: sol_to_lamports(min),
                max_lamports: sol_to_lamports(max),
            }
        }
    };

    let plan = allocate(sol_to_lamports(args.budget), target_count as u32, mode)?;

    print_plan_summary(&plan, target_count, args.batch_size);
    if args.dry_run {
        println!("\nDry run: nothing was sent.");
        return Ok(());
    }

    if !args.yes && !confirm("Ready to distribute? [y/N] ")? {
        println!("Aborted.");
        return Ok(());
    }

    let rpc = RetryingRpcClient::new(SolanaRpc::new(args.url.clone()), RetryPolicy::default());
    let config = ExecutorConfig {
        batch_size: args.batch_size,
        rate_limit_rps: args.rate_limit,
        priority_fee: args.priority_fee,
        ..ExecutorConfig::default()
    };
    let (mut exec, mut progress_rx, cancel) =
        BatchExecutor::new(rpc, Session { source: parent }, config);

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n⚠️  Stopping after the current batch...");
                cancel.cancel();
            }
        }
    });

    let pb = ProgressBar::new(target_count as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("##-"),
    );
    let render = tokio::spawn({
        let pb = pb.clone();
        async move {
            while progress_rx.changed().await.is_ok() {
                let state = progress_rx.borrow_and_update().clone();
                pb.set_position(state.processed_count as u64);
                pb.set_message(match state.stage {
                    Stage::Preparing => "preparing".to_string(),
                    Stage::Processing => format!(
                        "batch {}/{} building",
                        state.current_batch + 1,
                        state.total_batches
                    ),
                    Stage::Confirming => format!(
                        "batch {}/{} confirming",
                        state.current_batch + 1,
                        state.total_batches
                    ),
                    Stage::Complete => "complete".to_string(),
                    Stage::Failed => "failed".to_string(),
                });
                if state.is_terminal() {
                    break;
                }
            }
        }
    });

    let result = exec.run(&plan, &mut vault.accounts[..target_count]).await;
    drop(exec);
    let _ = render.await;

    // Persist whatever was credited, also after a mid-run failure.
    vault.save(&args.vault)?;

    match result {
        Ok(()) => {
            pb.finish_with_message("complete");
            println!(
                "\n✅ Distribution complete: {} subwallets funded with {} SOL total",
                target_count,
                lamports_to_sol(plan.total_lamports)
            );
            println!("Vault balances updated in {}", args.vault.display());
            Ok(())
        }
        Err(err) => {
            pb.abandon_with_message("failed");
            println!("\n❌ Distribution failed: {err}");
            println!(
                "Confirmed batches were saved to {}; re-run `fund` with a fresh budget for the remainder.",
                args.vault.display()
            );
            Err(err.into())
        }
    }
}

async fn refresh(args: RefreshArgs) -> Result<()> {
    let mut vault = Vault::load(&args.vault)
        .with_context(|| format!("loading vault {}", args.vault.display()))?;
    let mint = args
        .mint
        .as_deref()
        .map(Pubkey::from_str)
        .transpose()
        .context("invalid mint address")?;

    let rpc = RetryingRpcClient::new(SolanaRpc::new(args.url.clone()), RetryPolicy::default());
    println!("Refreshing {} subwallet balances...", vault.accounts.len());
    let refreshed = refresh_balances(&rpc, &mut vault.accounts, mint.as_ref()).await;
    vault.save(&args.vault)?;

    println!(
        "✅ Refreshed {}/{} subwallets; fleet holds {} SOL",
        refreshed,
        vault.accounts.len(),
        lamports_to_sol(vault.total_native_lamports())
    );
    if refreshed < vault.accounts.len() {
        println!(
            "⚠️  {} reads failed; their cached balances were kept",
            vault.accounts.len() - refreshed
        );
    }
    Ok(())
}

fn export(args: ExportArgs) -> Result<()> {
    let vault = Vault::load(&args.vault)
        .with_context(|| format!("loading vault {}", args.vault.display()))?;
    vault.export_csv(&args.output)?;
    println!(
        "✅ Exported {} addresses to {}",
        vault.accounts.len(),
        args.output.display()
    );
    Ok(())
}

fn restore(args: RestoreArgs) -> Result<()> {
    let backup = Vault::load(&args.backup)
        .with_context(|| format!("loading backup {}", args.backup.display()))?;

    if args.vault.exists() && !args.yes {
        println!(
            "This replaces {} with {} ({} accounts, parent {}).",
            args.vault.display(),
            args.backup.display(),
            backup.accounts.len(),
            backup.parent_address
        );
        if !confirm("Continue? [y/N] ")? {
            println!("Aborted.");
            return Ok(());
        }
    }

    backup.save(&args.vault)?;
    println!(
        "✅ Restored {} accounts into {}",
        backup.accounts.len(),
        args.vault.display()
    );
    Ok(())
}

fn load_keypair(path: &Path) -> Result<Keypair> {
    let keypair_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read keypair from {}", path.display()))?;

    let keypair_bytes: Vec<u8> = serde_json::from_str(&keypair_str)
        .with_context(|| format!("Failed to parse keypair JSON from {}", path.display()))?;

    Keypair::try_from(keypair_bytes.as_slice())
        .with_context(|| format!("Invalid keypair format in {}", path.display()))
}

fn print_plan_summary(plan: &DistributionPlan, target_count: usize, batch_size: usize) {
    let batches = plan.entries.len().div_ceil(batch_size.max(1));
    println!("\n=== FUNDING PLAN ===");
    println!("Subwallets: {target_count}");
    println!(
        "Per wallet: {} - {} SOL",
        lamports_to_sol(plan.min_entry()),
        lamports_to_sol(plan.max_entry())
    );
    println!("Total: {} SOL", lamports_to_sol(plan.total_lamports));
    println!(
        "Estimated fees: {} SOL",
        lamports_to_sol(plan.estimated_fee_lamports)
    );
    println!("Batches: {batches} ({batch_size} transfers per transaction)");
}

fn confirm(prompt: &str) -> Result<bool> {
    println!("\n{prompt}");
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}
