//! Wire vocabulary for the peer protocol.
//!
//! Event names are stable across implementations; ledger-specific events embed
//! the lowercase asset ticker (`create btc script`, `request ethWithdrawTxHash`).

use serde::{Deserialize, Serialize};

use crate::types::{Asset, ScriptValues, Secret, TxId};

pub const REQUEST_SIGN: &str = "request sign";
pub const SWAP_SIGN: &str = "swap sign";
pub const SWAP_EXISTS: &str = "swap exists";
pub const REQUEST_WITHDRAW: &str = "request withdraw";
pub const ACCEPT_WITHDRAW_REQUEST: &str = "accept withdraw request";
pub const DO_WITHDRAW: &str = "do withdraw";
pub const WITHDRAW_READY: &str = "withdraw ready";
pub const REFUND_COMPLETED: &str = "refund completed";
pub const SWAP_CANCELED: &str = "swap was canceled for core";
pub const SWAP_FINISHED: &str = "swap finished";

pub fn request_script(asset: &Asset) -> String {
    format!("request {} script", asset)
}

pub fn create_script(asset: &Asset) -> String {
    format!("create {} script", asset)
}

pub fn create_contract(asset: &Asset) -> String {
    format!("create {} contract", asset)
}

pub fn request_withdraw_tx_hash(asset: &Asset) -> String {
    format!("request {}WithdrawTxHash", asset)
}

pub fn withdraw_tx_hash(asset: &Asset) -> String {
    format!("{}WithdrawTxHash", asset)
}

pub fn finish_withdraw(asset: &Asset) -> String {
    format!("finish {} withdraw", asset)
}

/// Payload of `create <x> script`: the lock parameters plus the funding tx.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptAnnouncement {
    pub script_values: ScriptValues,
    pub funding_tx_id: TxId,
}

/// Payload of `create <y> contract`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractAnnouncement {
    pub creation_tx_id: TxId,
}

/// Payload of `<y>WithdrawTxHash` and `withdraw ready`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawTxAnnouncement {
    pub withdraw_tx_id: TxId,
}

/// Payload of `do withdraw`: the secret handed over for an assisted withdrawal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoWithdraw {
    pub secret: Secret,
}
