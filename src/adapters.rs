//! Chain adapter capability contracts.
//!
//! The flows are written against these two capabilities, never against a
//! concrete ledger: a UTXO-script capability ([`ScriptChain`]) and an
//! account/contract capability ([`ContractChain`]). This is the only boundary
//! through which the engine touches real funds.
//!
//! Every state-changing call takes an `on_tx_id` callback invoked exactly once
//! with the broadcast transaction id *before* the returned future settles, so
//! the caller can persist the id for crash-resume even if the confirmation
//! wait is interrupted.

use async_trait::async_trait;

use crate::error::LedgerError;
use crate::types::{Address, Amount, ScriptValues, Secret, SecretHash, TxId, Unspent};

/// Callback receiving the broadcast transaction id.
pub type OnTxId = Box<dyn FnOnce(TxId) + Send>;

/// UTXO-script ledger capability.
#[async_trait]
pub trait ScriptChain: Send + Sync {
    /// Derives the deterministic script address for a set of lock parameters.
    fn create_script(&self, values: &ScriptValues) -> Result<Address, LedgerError>;

    /// Funds the lock script with `amount` from the local wallet.
    async fn fund_script(
        &self,
        values: &ScriptValues,
        amount: Amount,
        on_tx_id: OnTxId,
    ) -> Result<(), LedgerError>;

    /// Lists unspent outputs sitting on a script address.
    async fn fetch_unspents(&self, script_address: &Address) -> Result<Vec<Unspent>, LedgerError>;

    /// Confirmed balance locked under the script.
    async fn script_balance(&self, values: &ScriptValues) -> Result<Amount, LedgerError>;

    /// Spendable balance of a regular wallet address.
    async fn wallet_balance(&self, address: &Address) -> Result<Amount, LedgerError>;

    /// Claims the script by revealing the secret.
    async fn withdraw(
        &self,
        values: &ScriptValues,
        secret: &Secret,
        destination: Option<&Address>,
        on_tx_id: OnTxId,
    ) -> Result<(), LedgerError>;

    /// Reclaims the script after `lock_time` expiry. The adapter enforces the
    /// time check; a refund before expiry must be rejected.
    async fn refund(&self, values: &ScriptValues, on_tx_id: OnTxId) -> Result<(), LedgerError>;
}

/// Parameters for creating the contract-side lock.
#[derive(Debug, Clone)]
pub struct ContractParams {
    pub secret_hash: SecretHash,
    pub participant_address: Address,
    pub amount: Amount,
    /// Payout address when it differs from the participant; the adapter
    /// dispatches to its target-wallet variant in that case.
    pub target_wallet: Option<Address>,
}

/// What the contract-side lock is expected to contain before withdrawing.
#[derive(Debug, Clone)]
pub struct ContractExpectation {
    pub owner_address: Address,
    pub participant_address: Address,
    pub expected_value: Amount,
    pub expected_hash: SecretHash,
}

/// Account/contract ledger capability.
#[async_trait]
pub trait ContractChain: Send + Sync {
    /// Creates the hash-locked contract entry.
    async fn create(&self, params: &ContractParams, on_tx_id: OnTxId) -> Result<(), LedgerError>;

    /// Checks the lock against expectations. `Ok(Some(reason))` describes a
    /// mismatch (wrong hash, short value); `Ok(None)` means the lock matches.
    async fn check_balance(
        &self,
        expectation: &ContractExpectation,
    ) -> Result<Option<String>, LedgerError>;

    /// Balance locked by `owner` for the local party.
    async fn balance_of(&self, owner: &Address) -> Result<Amount, LedgerError>;

    /// Spendable balance of a regular wallet address.
    async fn wallet_balance(&self, address: &Address) -> Result<Amount, LedgerError>;

    /// Whether this contract records an explicit payout target per swap.
    fn has_target_wallet(&self) -> bool;

    /// The payout target recorded for `owner`'s lock.
    async fn target_wallet(&self, owner: &Address) -> Result<Address, LedgerError>;

    /// Withdraws from `owner`'s lock by revealing the secret. The secret
    /// becomes publicly extractable from this transaction.
    async fn withdraw(
        &self,
        owner: &Address,
        secret: &Secret,
        on_tx_id: OnTxId,
    ) -> Result<(), LedgerError>;

    /// Withdraws on behalf of `participant` who cannot cover the network fee.
    async fn withdraw_on_behalf(
        &self,
        participant: &Address,
        secret: &Secret,
        on_tx_id: OnTxId,
    ) -> Result<(), LedgerError>;

    /// The revealed secret, once `participant`'s counterpart has withdrawn.
    async fn secret_of(&self, participant: &Address) -> Result<Option<Secret>, LedgerError>;

    /// Extracts the secret from a withdrawal transaction's call data.
    async fn secret_from_tx(&self, tx_id: &TxId) -> Result<Option<Secret>, LedgerError>;

    /// Whether a live lock between these parties already exists.
    async fn swap_exists(
        &self,
        owner: &Address,
        participant: &Address,
    ) -> Result<bool, LedgerError>;

    /// Whether the lock keyed by this hash was already refunded.
    async fn was_refunded(&self, secret_hash: &SecretHash) -> Result<bool, LedgerError>;

    /// Reclaims the lock held for `participant` after expiry.
    async fn refund(&self, participant: &Address, on_tx_id: OnTxId) -> Result<(), LedgerError>;

    /// Estimates the fee a withdrawal would cost.
    async fn withdraw_gas(&self, owner: &Address, secret: &Secret) -> Result<Amount, LedgerError>;
}
