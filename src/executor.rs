//! Sequential batched execution of a distribution plan.
//!
//! Batches go out one at a time: batch k's confirmation result is known
//! before batch k+1 is built, which keeps one blockhash/one transaction in
//! flight and bounds the RPC request rate together with the governor gate
//! and the inter-batch delay. Any failure inside a batch aborts the whole
//! run: reads were already retried a layer down, and resending a transfer
//! after an ambiguous failure risks paying twice.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use solana_sdk::{
    compute_budget::ComputeBudgetInstruction,
    hash::Hash,
    instruction::Instruction,
    message::{Message, VersionedMessage},
    packet::PACKET_DATA_SIZE,
    pubkey::Pubkey,
    signature::Keypair,
    signer::Signer,
    system_instruction,
    transaction::VersionedTransaction,
};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::allocator::{DistributionPlan, PlanEntry};
use crate::error::FleetError;
use crate::progress::{ProgressState, ProgressTracker};
use crate::rpc::{ConfirmationOutcome, RawRpc, RetryingRpcClient};
use crate::wallet::Account;

/// Keep the serialized transaction clear of the UDP packet ceiling.
const PACKET_HEADROOM: usize = 100;

/// Accounts queried concurrently per wave during a balance refresh.
pub const REFRESH_WAVE: usize = 5;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Explicit session context: who pays and signs. Constructed per run and
/// passed in, never read from ambient globals.
pub struct Session {
    pub source: Keypair,
}

impl Session {
    pub fn source_pubkey(&self) -> Pubkey {
        self.source.pubkey()
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Transfers per transaction.
    pub batch_size: usize,
    /// Throttle between consecutive batches.
    pub inter_batch_delay: Duration,
    /// Send-side rate limit, requests per second.
    pub rate_limit_rps: u32,
    /// Priority fee in microlamports per compute unit.
    pub priority_fee: u64,
    pub compute_unit_limit: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            inter_batch_delay: Duration::from_secs(1),
            rate_limit_rps: 10,
            priority_fee: 1_000,
            compute_unit_limit: 200_000,
        }
    }
}

/// Cooperative cancellation, checked between batches, the only point where
/// stopping cannot strand an in-flight transaction.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct BatchExecutor<R> {
    rpc: RetryingRpcClient<R>,
    session: Session,
    config: ExecutorConfig,
    limiter: Arc<DirectRateLimiter>,
    tracker: ProgressTracker,
    cancel: CancelFlag,
}

impl<R: RawRpc> BatchExecutor<R> {
    pub fn new(
        rpc: RetryingRpcClient<R>,
        session: Session,
        config: ExecutorConfig,
    ) -> (Self, watch::Receiver<ProgressState>, CancelFlag) {
        let (tracker, progress_rx) = ProgressTracker::new();
        let rps = NonZeroU32::new(config.rate_limit_rps).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));
        let cancel = CancelFlag::default();
        let executor = Self {
            rpc,
            session,
            config,
            limiter,
            tracker,
            cancel: cancel.clone(),
        };
        (executor, progress_rx, cancel)
    }

    /// Execute `plan` against `accounts`, where plan entry `i` targets
    /// `accounts[i]`. On success every targeted account's cached balance has
    /// been bumped by its allocation; on failure the run stops at the failed
    /// batch and the error is also recorded in the progress state.
    pub async fn run(
        &mut self,
        plan: &DistributionPlan,
        accounts: &mut [Account],
    ) -> Result<(), FleetError> {
        match self.execute(plan, accounts).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.tracker.fail(err.to_string());
                Err(err)
            }
        }
    }

    async fn execute(
        &mut self,
        plan: &DistributionPlan,
        accounts: &mut [Account],
    ) -> Result<(), FleetError> {
        if self.config.batch_size == 0 {
            return Err(FleetError::Validation("batch size must be at least 1".into()));
        }
        if plan.entries.is_empty() {
            return Err(FleetError::Validation("distribution plan is empty".into()));
        }
        if plan
            .entries
            .iter()
            .any(|e| e.account_index as usize >= accounts.len())
        {
            return Err(FleetError::Validation(format!(
                "plan targets {} accounts but only {} are loaded",
                plan.entries.len(),
                accounts.len()
            )));
        }

        let total_batches = plan.entries.len().div_ceil(self.config.batch_size);
        self.tracker.begin_run(total_batches, plan.entries.len());

        let need = plan
            .total_lamports
            .checked_add(plan.estimated_fee_lamports)
            .ok_or_else(|| FleetError::Validation("plan total overflows".into()))?;
        let have = self.rpc.get_balance(&self.session.source_pubkey()).await?;
        if have < need {
            return Err(FleetError::InsufficientBalance { have, need });
        }
        info!(
            total_batches,
            total_lamports = plan.total_lamports,
            "starting funding run"
        );

        for (batch_index, batch) in plan.entries.chunks(self.config.batch_size).enumerate() {
            if batch_index > 0 {
                if self.cancel.is_cancelled() {
                    warn!(batch_index, "run cancelled between batches");
                    return Err(FleetError::Cancelled);
                }
                sleep(self.config.inter_batch_delay).await;
            }

            self.tracker.begin_batch(batch_index);
            self.process_batch(batch_index, batch, accounts).await?;
        }

        self.tracker.complete();
        info!("funding run complete");
        Ok(())
    }

    async fn process_batch(
        &mut self,
        batch_index: usize,
        batch: &[PlanEntry],
        accounts: &mut [Account],
    ) -> Result<(), FleetError> {
        let transfers: Vec<Instruction> = batch
            .iter()
            .map(|entry| {
                system_instruction::transfer(
                    &self.session.source_pubkey(),
                    &accounts[entry.account_index as usize].pubkey(),
                    entry.lamports,
                )
            })
            .collect();

        let blockhash = self.rpc.get_latest_blockhash().await?;
        let tx = self.build_transaction(batch_index, &transfers, blockhash)?;

        let (fits, size) = transaction_fits(&tx);
        if !fits {
            return Err(FleetError::Validation(format!(
                "batch {batch_index}: {} transfers serialize to {size} bytes; lower the batch size",
                batch.len()
            )));
        }

        self.tracker.confirming();
        self.limiter.until_ready().await;
        let signature =
            self.rpc
                .send_transaction(&tx)
                .await
                .map_err(|e| FleetError::Submission {
                    batch: batch_index,
                    message: format!("{e:#}"),
                })?;
        debug!(batch_index, %signature, transfers = batch.len(), "batch submitted");

        match self.rpc.wait_for_confirmation(&signature).await {
            ConfirmationOutcome::Confirmed => {
                // Optimistic: credit the allocation locally instead of
                // re-querying; `refresh` re-reads the chain truth on demand.
                for entry in batch {
                    let account = &mut accounts[entry.account_index as usize];
                    account.native_lamports = account.native_lamports.saturating_add(entry.lamports);
                }
                self.tracker.batch_confirmed(batch.len());
                Ok(())
            }
            ConfirmationOutcome::Failed(reason) => Err(FleetError::TransactionFailed {
                batch: batch_index,
                signature,
                reason,
            }),
            ConfirmationOutcome::TimedOut => Err(FleetError::ConfirmationTimeout {
                batch: batch_index,
                signature,
                polls: self.rpc.policy().confirm_attempts,
            }),
        }
    }

    fn build_transaction(
        &self,
        batch_index: usize,
        transfers: &[Instruction],
        blockhash: Hash,
    ) -> Result<VersionedTransaction, FleetError> {
        let mut instructions = vec![
            ComputeBudgetInstruction::set_compute_unit_limit(self.config.compute_unit_limit),
            ComputeBudgetInstruction::set_compute_unit_price(self.config.priority_fee),
        ];
        instructions.extend_from_slice(transfers);

        let message = VersionedMessage::Legacy(Message::new_with_blockhash(
            &instructions,
            Some(&self.session.source_pubkey()),
            &blockhash,
        ));
        VersionedTransaction::try_new(message, &[&self.session.source]).map_err(|e| {
            FleetError::Signing {
                batch: batch_index,
                message: e.to_string(),
            }
        })
    }
}

fn transaction_fits(tx: &VersionedTransaction) -> (bool, usize) {
    let mut buf = Vec::with_capacity(PACKET_DATA_SIZE);
    // Same wire format the cluster enforces the packet limit against.
    if bincode::serialize_into(&mut buf, tx).is_err() {
        return (false, 0);
    }
    let size = buf.len();
    (size <= PACKET_DATA_SIZE - PACKET_HEADROOM, size)
}

/// Re-read cached balances from the chain, [`REFRESH_WAVE`] accounts at a
/// time. Within a wave the reads run concurrently with no ordering
/// guarantee; a wave fully settles before the next starts. An account whose
/// read fails keeps its cached value. Returns how many accounts refreshed.
pub async fn refresh_balances<R: RawRpc>(
    rpc: &RetryingRpcClient<R>,
    accounts: &mut [Account],
    mint: Option<&Pubkey>,
) -> usize {
    let mut refreshed = 0;
    for wave in accounts.chunks_mut(REFRESH_WAVE) {
        let reads = wave.iter().map(|account| {
            let address = account.pubkey();
            async move {
                let native = rpc.get_balance(&address).await;
                let token = match mint {
                    Some(mint) => Some(rpc.get_token_balance(&address, mint).await),
                    None => None,
                };
                (native, token)
            }
        });
        let results = futures_util::future::join_all(reads).await;

        for (account, (native, token)) in wave.iter_mut().zip(results) {
            match native {
                Ok(lamports) => {
                    account.native_lamports = lamports;
                    refreshed += 1;
                }
                Err(e) => warn!(index = account.index, "balance refresh failed: {e}"),
            }
            match token {
                Some(Ok(amount)) => account.token_lamports = amount,
                Some(Err(e)) => warn!(index = account.index, "token refresh failed: {e}"),
                None => {}
            }
        }
    }
    refreshed
}
