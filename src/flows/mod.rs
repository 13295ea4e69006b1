//! Flow variants: the per-direction protocol logic driven by the engine.
//!
//! Both directions share one skeleton — sign, lock on the first ledger, wait
//! for the counterpart lock, reveal the secret through a withdrawal, withdraw
//! the other leg, finish — with the roles swapped. The engine composes with a
//! variant through the [`FlowVariant`] step interface; applications hold the
//! [`SwapFlow`] handle.

mod contract_participant;
mod registry;
mod script_owner;

pub use contract_participant::ContractParticipantFlow;
pub use registry::{FlowFactory, FlowRegistry};
pub use script_owner::ScriptOwnerFlow;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

use crate::channel::MessageChannel;
use crate::engine::{FlowEngine, FlowVariant, StatePatch};
use crate::error::SwapError;
use crate::events;
use crate::session::SwapSession;
use crate::types::Secret;

/// Handle to one party's resumable swap flow.
#[async_trait]
pub trait SwapFlow: Send + Sync {
    fn session(&self) -> &SwapSession;

    fn engine(&self) -> &Arc<FlowEngine>;

    /// Drives the flow from its persisted step to the terminal step.
    async fn run(&self) -> Result<(), SwapError>;

    /// Reclaims own locked funds after lock-time expiry and unblocks the
    /// counterpart with `refund completed`.
    async fn try_refund(&self) -> Result<(), SwapError>;

    /// Manual withdrawal with an externally supplied secret, bypassing the
    /// automatic path. Mismatches warn rather than block; chain state is
    /// authoritative.
    async fn try_withdraw(&self, secret: Secret) -> Result<(), SwapError>;

    /// Asks the counterpart to withdraw on this party's behalf (fee
    /// assistance). Only meaningful on the secret-holder side.
    async fn send_withdraw_request(&self) -> Result<(), SwapError> {
        warn!("withdraw request not supported for this flow direction");
        Ok(())
    }

    /// Accepts a counterpart's fee-assistance request and performs the
    /// withdrawal for it once the secret arrives.
    async fn accept_withdraw_request(&self) -> Result<(), SwapError> {
        warn!("accepting withdraw requests not supported for this flow direction");
        Ok(())
    }
}

/// Drives the engine while watching for a counterpart-side cancellation.
/// A cancellation stops the engine and surfaces as [`SwapError::Stopped`].
pub(crate) async fn drive_with_cancel(
    variant: &dyn FlowVariant,
    engine: &Arc<FlowEngine>,
    channel: &Arc<dyn MessageChannel>,
) -> Result<(), SwapError> {
    let mut cancel_rx = channel.subscribe(events::SWAP_CANCELED);
    tokio::select! {
        result = engine.drive(variant) => result,
        _ = cancel_rx.recv() => {
            error!(swap_id = %engine.swap_id(), "swap was canceled by counterpart");
            engine.stop().await?;
            Err(SwapError::Stopped)
        }
    }
}

/// Marks incoming fee-assistance requests in state so the application can
/// surface them. Never resolves.
pub(crate) async fn watch_withdraw_requests(
    engine: Arc<FlowEngine>,
    channel: Arc<dyn MessageChannel>,
) {
    let mut rx = channel.subscribe(events::REQUEST_WITHDRAW);
    while rx.recv().await.is_some() {
        let _ = engine
            .set_state(StatePatch {
                withdraw_request_incoming: Some(true),
                ..Default::default()
            })
            .await;
    }
    futures::future::pending::<()>().await
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Decodes a channel payload, logging and discarding malformed ones.
pub(crate) fn parse_payload<T: DeserializeOwned>(value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(%err, "discarding malformed channel payload");
            None
        }
    }
}

pub(crate) fn state_missing(what: &str) -> SwapError {
    SwapError::Construction(format!("flow state is missing {}", what))
}
