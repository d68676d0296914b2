//! Chain access behind retry and confirmation-polling policies.
//!
//! [`RawRpc`] is the seam over the Solana RPC surface the engine needs.
//! [`SolanaRpc`] adapts the real nonblocking client; tests swap in a mock.
//! [`RetryingRpcClient`] layers the policies on top so the executor never
//! deals with transient read failures or polling loops itself:
//! reads are retried with bounded backoff, transaction submission is a
//! single attempt (a blind resend risks a double transfer), and
//! confirmation is polled to a hard cap with timeout as an outcome rather
//! than an error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig, hash::Hash, program_pack::Pack, pubkey::Pubkey,
    signature::Signature, transaction::VersionedTransaction,
};
use solana_transaction_status::TransactionConfirmationStatus;
use spl_associated_token_account::get_associated_token_address;
use spl_token::state::Account as TokenAccount;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::FleetError;

/// Processed-or-better status of a submitted transaction, reduced to what
/// the engine acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxStatus {
    pub confirmed: bool,
    pub err: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed,
    /// The transaction landed on chain but failed.
    Failed(String),
    /// Never observed confirmed within the polling window. Ambiguous: the
    /// transfer may still have happened.
    TimedOut,
}

#[allow(async_fn_in_trait)]
pub trait RawRpc {
    async fn get_balance(&self, address: &Pubkey) -> Result<u64>;
    async fn get_latest_blockhash(&self) -> Result<Hash>;
    async fn send_transaction(&self, tx: &VersionedTransaction) -> Result<Signature>;
    async fn get_signature_status(&self, signature: &Signature) -> Result<Option<TxStatus>>;
    /// Raw balance of a token account, or `None` if the account does not exist.
    async fn get_token_account_balance(&self, token_account: &Pubkey) -> Result<Option<u64>>;
}

/// Adapter over the real nonblocking Solana client, at confirmed commitment.
pub struct SolanaRpc {
    client: Arc<RpcClient>,
}

impl SolanaRpc {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Arc::new(RpcClient::new_with_commitment(
                url.into(),
                CommitmentConfig::confirmed(),
            )),
        }
    }
}

impl RawRpc for SolanaRpc {
    async fn get_balance(&self, address: &Pubkey) -> Result<u64> {
        Ok(self.client.get_balance(address).await?)
    }

    async fn get_latest_blockhash(&self) -> Result<Hash> {
        Ok(self.client.get_latest_blockhash().await?)
    }

    async fn send_transaction(&self, tx: &VersionedTransaction) -> Result<Signature> {
        Ok(self.client.send_transaction(tx).await?)
    }

    async fn get_signature_status(&self, signature: &Signature) -> Result<Option<TxStatus>> {
        let response = self.client.get_signature_statuses(&[*signature]).await?;
        Ok(response.value.into_iter().flatten().next().map(|status| {
            TxStatus {
                confirmed: status.err.is_none()
                    && matches!(
                        status.confirmation_status,
                        Some(TransactionConfirmationStatus::Confirmed)
                            | Some(TransactionConfirmationStatus::Finalized)
                    ),
                err: status.err.map(|e| e.to_string()),
            }
        }))
    }

    async fn get_token_account_balance(&self, token_account: &Pubkey) -> Result<Option<u64>> {
        let response = self
            .client
            .get_account_with_commitment(token_account, self.client.commitment())
            .await?;
        match response.value {
            None => Ok(None),
            Some(account) => {
                let parsed =
                    TokenAccount::unpack(&account.data).context("unpacking token account data")?;
                Ok(Some(parsed.amount))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts for balance and blockhash reads.
    pub read_attempts: usize,
    /// Backoff unit: linear (`attempt x unit`) for balance reads, fixed for
    /// blockhash fetches.
    pub backoff: Duration,
    /// Confirmation polls before reporting a timeout.
    pub confirm_attempts: usize,
    pub poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            read_attempts: 3,
            backoff: Duration::from_secs(1),
            confirm_attempts: 30,
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct RetryingRpcClient<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R: RawRpc> RetryingRpcClient<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn get_balance(&self, address: &Pubkey) -> Result<u64, FleetError> {
        let mut last = String::new();
        for attempt in 1..=self.policy.read_attempts {
            match self.inner.get_balance(address).await {
                Ok(lamports) => return Ok(lamports),
                Err(e) => {
                    warn!(attempt, %address, "balance query failed: {e:#}");
                    last = format!("{e:#}");
                    if attempt < self.policy.read_attempts {
                        sleep(self.policy.backoff * attempt as u32).await;
                    }
                }
            }
        }
        Err(FleetError::Rpc {
            attempts: self.policy.read_attempts,
            message: last,
        })
    }

    /// Token balance of `owner`'s associated token account for `mint`.
    /// `None` means the account has never been created.
    pub async fn get_token_balance(
        &self,
        owner: &Pubkey,
        mint: &Pubkey,
    ) -> Result<Option<u64>, FleetError> {
        let token_account = get_associated_token_address(owner, mint);
        let mut last = String::new();
        for attempt in 1..=self.policy.read_attempts {
            match self.inner.get_token_account_balance(&token_account).await {
                Ok(amount) => return Ok(amount),
                Err(e) => {
                    warn!(attempt, %owner, "token balance query failed: {e:#}");
                    last = format!("{e:#}");
                    if attempt < self.policy.read_attempts {
                        sleep(self.policy.backoff * attempt as u32).await;
                    }
                }
            }
        }
        Err(FleetError::Rpc {
            attempts: self.policy.read_attempts,
            message: last,
        })
    }

    pub async fn get_latest_blockhash(&self) -> Result<Hash, FleetError> {
        let mut last = String::new();
        for attempt in 1..=self.policy.read_attempts {
            match self.inner.get_latest_blockhash().await {
                Ok(hash) => return Ok(hash),
                Err(e) => {
                    warn!(attempt, "blockhash fetch failed: {e:#}");
                    last = format!("{e:#}");
                    if attempt < self.policy.read_attempts {
                        sleep(self.policy.backoff).await;
                    }
                }
            }
        }
        Err(FleetError::Rpc {
            attempts: self.policy.read_attempts,
            message: last,
        })
    }

    /// Single attempt, never retried.
    pub async fn send_transaction(&self, tx: &VersionedTransaction) -> Result<Signature> {
        let signature = self.inner.send_transaction(tx).await?;
        debug!(%signature, "transaction submitted");
        Ok(signature)
    }

    /// Poll until confirmed, failed, or the attempt cap is reached.
    /// Transient poll errors consume an attempt and polling continues.
    pub async fn wait_for_confirmation(&self, signature: &Signature) -> ConfirmationOutcome {
        for attempt in 1..=self.policy.confirm_attempts {
            match self.inner.get_signature_status(signature).await {
                Ok(Some(status)) => {
                    if let Some(err) = status.err {
                        return ConfirmationOutcome::Failed(err);
                    }
                    if status.confirmed {
                        debug!(%signature, attempt, "transaction confirmed");
                        return ConfirmationOutcome::Confirmed;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(attempt, %signature, "status poll failed: {e:#}"),
            }
            if attempt < self.policy.confirm_attempts {
                sleep(self.policy.poll_interval).await;
            }
        }
        ConfirmationOutcome::TimedOut
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockRpc;
    use super::*;

    fn client(mock: &MockRpc) -> RetryingRpcClient<&MockRpc> {
        RetryingRpcClient::new(mock, RetryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn balance_read_retries_then_succeeds() {
        let address = Pubkey::new_unique();
        let mock = MockRpc::with_balance(address, 42);
        *mock.balance_failures.lock().unwrap() = 1;

        let lamports = client(&mock).get_balance(&address).await.unwrap();
        assert_eq!(lamports, 42);
        assert_eq!(*mock.balance_calls.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn balance_read_exhausts_after_three_attempts() {
        let mock = MockRpc::default();
        *mock.balance_failures.lock().unwrap() = 5;

        let err = client(&mock)
            .get_balance(&Pubkey::new_unique())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Rpc { attempts: 3, .. }), "{err}");
        assert_eq!(*mock.balance_calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn blockhash_fetch_retries_with_fixed_backoff() {
        let mock = MockRpc::default();
        *mock.blockhash_failures.lock().unwrap() = 2;

        client(&mock).get_latest_blockhash().await.unwrap();
    }

    #[tokio::test]
    async fn send_is_a_single_attempt() {
        let mock = MockRpc::default();
        *mock.fail_send_at.lock().unwrap() = Some(0);
        let tx = VersionedTransaction::default();

        let err = client(&mock).send_transaction(&tx).await;
        assert!(err.is_err());
        assert_eq!(*mock.send_calls.lock().unwrap(), 1);
        assert_eq!(mock.sent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_succeeds_after_pending_polls() {
        let mock = MockRpc::default();
        mock.status_script
            .lock()
            .unwrap()
            .extend([None, None, Some(TxStatus {
                confirmed: true,
                err: None,
            })]);

        let outcome = client(&mock)
            .wait_for_confirmation(&Signature::new_unique())
            .await;
        assert_eq!(outcome, ConfirmationOutcome::Confirmed);
        assert_eq!(*mock.status_calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_times_out_at_poll_cap() {
        let mock = MockRpc::default();
        *mock.never_confirm.lock().unwrap() = true;

        let outcome = client(&mock)
            .wait_for_confirmation(&Signature::new_unique())
            .await;
        assert_eq!(outcome, ConfirmationOutcome::TimedOut);
        assert_eq!(*mock.status_calls.lock().unwrap(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_surfaces_on_chain_failure() {
        let mock = MockRpc::default();
        mock.status_script
            .lock()
            .unwrap()
            .extend([None, Some(TxStatus {
                confirmed: false,
                err: Some("custom program error: 0x1".into()),
            })]);

        let outcome = client(&mock)
            .wait_for_confirmation(&Signature::new_unique())
            .await;
        assert_eq!(
            outcome,
            ConfirmationOutcome::Failed("custom program error: 0x1".into())
        );
    }

    #[tokio::test]
    async fn token_balance_distinguishes_absent_account() {
        let owner = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let mock = MockRpc::default();
        let rpc = client(&mock);

        assert_eq!(rpc.get_token_balance(&owner, &mint).await.unwrap(), None);

        let ata = get_associated_token_address(&owner, &mint);
        mock.token_balances.lock().unwrap().insert(ata, 9_000);
        assert_eq!(
            rpc.get_token_balance(&owner, &mint).await.unwrap(),
            Some(9_000)
        );
    }
}
