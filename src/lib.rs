//! Resumable two-party atomic swap engine.
//!
//! Two parties exchange assets across two ledgers without a custodian: the
//! owner locks a hash-keyed script on one ledger, the participant locks a
//! contract keyed by the same hash on the other, and the owner's withdrawal
//! reveals the secret that lets the participant claim the first leg. Either
//! side can reclaim its own lock after expiry.
//!
//! The crate is transport- and ledger-agnostic: applications supply a
//! [`channel::MessageChannel`] to the counterpart and the two chain adapters
//! ([`adapters::ScriptChain`], [`adapters::ContractChain`]), then drive a flow
//! built through the [`flows::FlowRegistry`]. All protocol state is persisted
//! through a [`persist::StateStore`] after every mutation, so a flow restarted
//! with the same store resumes at the step it left off.

pub mod adapters;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fee;
pub mod flows;
pub mod persist;
pub mod retry;
pub mod session;
pub mod types;

pub use config::SwapConfig;
pub use engine::{FlowEngine, FlowState, FlowVariant, StatePatch, StepTable};
pub use error::{ChannelError, LedgerError, LedgerErrorKind, StoreError, SwapError};
pub use flows::{ContractParticipantFlow, FlowRegistry, ScriptOwnerFlow, SwapFlow};
pub use session::{PartyIdentity, SwapSession};
pub use types::{
    Address, Amount, Asset, AssetPair, FeeSpeed, PublicKey, Role, ScriptValues, Secret,
    SecretHash, TxId, Unspent,
};
