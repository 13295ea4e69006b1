//! Swap session: the immutable negotiation facts for one exchange attempt.

use std::sync::Arc;
use uuid::Uuid;

use crate::adapters::{ContractChain, ScriptChain};
use crate::channel::MessageChannel;
use crate::error::SwapError;
use crate::types::{Address, Amount, AssetPair, PublicKey, Role};

/// Keys and addresses one party brings to the swap.
#[derive(Debug, Clone)]
pub struct PartyIdentity {
    /// Public key used in the UTXO-side lock script.
    pub script_public_key: PublicKey,
    /// Wallet address on the script-side ledger.
    pub script_address: Address,
    /// Account address on the contract-side ledger.
    pub contract_address: Address,
}

/// Immutable facts negotiated for one exchange, plus the bound collaborators.
///
/// Constructed once per swap attempt and destroyed when the flow reaches a
/// terminal state or is abandoned. Only the destination overrides may be set
/// after construction, and only before the flow starts.
pub struct SwapSession {
    pub id: Uuid,
    pub role: Role,
    pub pair: AssetPair,
    pub sell_amount: Amount,
    pub buy_amount: Amount,
    pub me: PartyIdentity,
    pub counterpart: PartyIdentity,
    /// Override for where bought funds land; defaults to own wallet.
    pub destination_buy_address: Option<Address>,
    /// Override for where sold funds are payable from a third-party wallet.
    pub destination_sell_address: Option<Address>,
    pub channel: Arc<dyn MessageChannel>,
    pub script_chain: Arc<dyn ScriptChain>,
    pub contract_chain: Arc<dyn ContractChain>,
}

impl SwapSession {
    /// Validates the negotiated facts; malformed sessions fail fast so no
    /// partial flow object ever exists.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        role: Role,
        pair: AssetPair,
        sell_amount: Amount,
        buy_amount: Amount,
        me: PartyIdentity,
        counterpart: PartyIdentity,
        channel: Arc<dyn MessageChannel>,
        script_chain: Arc<dyn ScriptChain>,
        contract_chain: Arc<dyn ContractChain>,
    ) -> Result<Self, SwapError> {
        if sell_amount.is_zero() || buy_amount.is_zero() {
            return Err(SwapError::Construction(
                "swap amounts must be positive".into(),
            ));
        }
        if me.contract_address == counterpart.contract_address {
            return Err(SwapError::Construction(
                "own and counterpart contract addresses must differ".into(),
            ));
        }
        Ok(Self {
            id,
            role,
            pair,
            sell_amount,
            buy_amount,
            me,
            counterpart,
            destination_buy_address: None,
            destination_sell_address: None,
            channel,
            script_chain,
            contract_chain,
        })
    }

    pub fn with_destination_buy_address(mut self, address: Address) -> Self {
        self.destination_buy_address = Some(address);
        self
    }

    pub fn with_destination_sell_address(mut self, address: Address) -> Self {
        self.destination_sell_address = Some(address);
        self
    }

    /// The asset locked in the UTXO-side script.
    pub fn script_asset(&self) -> &crate::types::Asset {
        match self.role {
            Role::Owner => &self.pair.sell,
            Role::Participant => &self.pair.buy,
        }
    }

    /// The asset locked in the contract-side lock.
    pub fn contract_asset(&self) -> &crate::types::Asset {
        match self.role {
            Role::Owner => &self.pair.buy,
            Role::Participant => &self.pair.sell,
        }
    }
}
