//! Flow engine: executes a flow variant's steps in order, exactly once each,
//! resumable after restart.
//!
//! The engine owns the mutable flow state, persists it after every mutation,
//! and exposes the two state-mutation primitives steps are written against:
//! `set_state` (side-effect only) and `finish_step` (idempotent step
//! completion). Advancement is monotonic; rewinding `step` is never valid.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SwapError;
use crate::persist::StateStore;
use crate::types::{Address, Amount, ScriptValues, Secret, SecretHash, TxId};

/// Persisted state of one flow instance.
///
/// The union of both directions' fields; each variant touches its own subset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowState {
    /// Index of the last completed step (0 = nothing completed yet).
    pub step: usize,
    pub is_stopped: bool,

    pub is_sign_complete: bool,
    pub is_swap_exists: bool,

    pub secret: Option<Secret>,
    pub secret_hash: Option<SecretHash>,
    pub script_values: Option<ScriptValues>,
    pub script_address: Option<Address>,
    pub script_verified: bool,
    pub verification_error: Option<String>,

    pub balance: Option<Amount>,
    pub is_balance_enough: bool,

    pub script_fund_tx_id: Option<TxId>,
    pub is_script_funded: bool,
    pub contract_create_tx_id: Option<TxId>,
    pub is_contract_funded: bool,
    pub can_create_contract: Option<bool>,

    pub contract_withdraw_tx_id: Option<TxId>,
    pub is_contract_withdrawn: bool,
    pub script_withdraw_tx_id: Option<TxId>,
    pub is_script_withdrawn: bool,

    pub withdraw_fee: Option<Amount>,
    pub requires_withdraw_fee: bool,
    pub withdraw_request_sent: bool,
    pub withdraw_request_incoming: bool,
    pub withdraw_request_accepted: bool,

    pub refund_tx_id: Option<TxId>,
    pub is_refunded: bool,
    pub is_finished: bool,
}

/// Partial state merged into [`FlowState`] by the engine's mutation
/// primitives. Unset fields leave the current value untouched.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub is_stopped: Option<bool>,
    pub is_sign_complete: Option<bool>,
    pub is_swap_exists: Option<bool>,
    pub secret: Option<Secret>,
    pub secret_hash: Option<SecretHash>,
    pub script_values: Option<ScriptValues>,
    pub script_address: Option<Address>,
    pub script_verified: Option<bool>,
    pub verification_error: Option<String>,
    pub balance: Option<Amount>,
    pub is_balance_enough: Option<bool>,
    pub script_fund_tx_id: Option<TxId>,
    pub is_script_funded: Option<bool>,
    pub contract_create_tx_id: Option<TxId>,
    pub is_contract_funded: Option<bool>,
    pub can_create_contract: Option<bool>,
    pub contract_withdraw_tx_id: Option<TxId>,
    pub is_contract_withdrawn: Option<bool>,
    pub script_withdraw_tx_id: Option<TxId>,
    pub is_script_withdrawn: Option<bool>,
    pub withdraw_fee: Option<Amount>,
    pub requires_withdraw_fee: Option<bool>,
    pub withdraw_request_sent: Option<bool>,
    pub withdraw_request_incoming: Option<bool>,
    pub withdraw_request_accepted: Option<bool>,
    pub refund_tx_id: Option<TxId>,
    pub is_refunded: Option<bool>,
    pub is_finished: Option<bool>,
}

impl FlowState {
    /// Field-wise merge of a patch. Never touches `step`.
    pub fn apply(&mut self, patch: StatePatch) {
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = patch.$field {
                    self.$field = value.into();
                })*
            };
        }
        macro_rules! merge_flag {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = patch.$field {
                    self.$field = value;
                })*
            };
        }
        merge!(
            secret,
            secret_hash,
            script_values,
            script_address,
            verification_error,
            balance,
            script_fund_tx_id,
            contract_create_tx_id,
            can_create_contract,
            contract_withdraw_tx_id,
            script_withdraw_tx_id,
            withdraw_fee,
            refund_tx_id,
        );
        merge_flag!(
            is_stopped,
            is_sign_complete,
            is_swap_exists,
            script_verified,
            is_balance_enough,
            is_script_funded,
            is_contract_funded,
            is_contract_withdrawn,
            is_script_withdrawn,
            requires_withdraw_fee,
            withdraw_request_sent,
            withdraw_request_incoming,
            withdraw_request_accepted,
            is_refunded,
            is_finished,
        );
    }
}

/// Ordered, 1-indexed table of step names for one flow variant.
///
/// The last entry must be `end`, the terminal step that performs no action.
#[derive(Debug, Clone)]
pub struct StepTable {
    names: Vec<&'static str>,
}

impl StepTable {
    pub fn new(names: Vec<&'static str>) -> Result<Self, SwapError> {
        if names.len() < 2 {
            return Err(SwapError::Construction(
                "step table needs at least one step before `end`".into(),
            ));
        }
        if *names.last().unwrap() != "end" {
            return Err(SwapError::Construction(
                "step table must terminate with `end`".into(),
            ));
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(SwapError::Construction(format!(
                    "duplicate step name {:?}",
                    name
                )));
            }
        }
        Ok(Self { names })
    }

    /// 1-based index of a step name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| *n == name).map(|i| i + 1)
    }

    /// Name of a 1-based step index.
    pub fn name(&self, index: usize) -> Option<&'static str> {
        self.names.get(index.wrapping_sub(1)).copied()
    }

    /// Index of the terminal `end` step.
    pub fn terminal_index(&self) -> usize {
        self.names.len()
    }
}

/// One direction of a swap, expressed as numbered asynchronous steps driven by
/// the engine.
#[async_trait]
pub trait FlowVariant: Send + Sync {
    /// Flow name used in logs (e.g. "btc2eth").
    fn name(&self) -> String;

    /// Executes the step at `index` (1-based). The step's own call to
    /// `finish_step` is what advances the flow; returning without advancing
    /// means the step is blocked.
    async fn execute_step(&self, index: usize) -> Result<(), SwapError>;
}

/// Resumable step-sequencer for one swap instance.
pub struct FlowEngine {
    swap_id: Uuid,
    steps: StepTable,
    store: Arc<dyn StateStore>,
    state: RwLock<FlowState>,
    watch_tx: watch::Sender<FlowState>,
    stopped: AtomicBool,
}

impl FlowEngine {
    /// Creates an engine, resuming from persisted state when present.
    pub fn new(
        swap_id: Uuid,
        steps: StepTable,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, SwapError> {
        let state = store.get(&swap_id)?.unwrap_or_default();
        let stopped = AtomicBool::new(state.is_stopped);
        let (watch_tx, _) = watch::channel(state.clone());
        Ok(Self {
            swap_id,
            steps,
            store,
            state: RwLock::new(state),
            watch_tx,
            stopped,
        })
    }

    pub fn swap_id(&self) -> Uuid {
        self.swap_id
    }

    pub fn steps(&self) -> &StepTable {
        &self.steps
    }

    /// Current state snapshot.
    pub async fn snapshot(&self) -> FlowState {
        self.state.read().await.clone()
    }

    /// Watch channel receiving a snapshot after every state mutation.
    pub fn watch(&self) -> watch::Receiver<FlowState> {
        self.watch_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Merges a patch into the state and persists it. Never advances `step`.
    pub async fn set_state(&self, patch: StatePatch) -> Result<(), SwapError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.apply(patch);
        self.store.set(&self.swap_id, &next)?;
        *state = next.clone();
        drop(state);
        let _ = self.watch_tx.send(next);
        Ok(())
    }

    /// Idempotent step completion.
    ///
    /// Returns `Ok(false)` without any effect when the named step (or a later
    /// one) is already complete; this is the sole guard against duplicate
    /// transitions from racing triggers and from restart mid-step. On
    /// persistence failure the error surfaces unless `silent_error` is set,
    /// in which case it is logged and swallowed.
    pub async fn finish_step(
        &self,
        patch: StatePatch,
        step_name: &str,
        silent_error: bool,
    ) -> Result<bool, SwapError> {
        let index = self.steps.index_of(step_name).ok_or_else(|| {
            SwapError::Construction(format!("unknown step name {:?}", step_name))
        })?;

        let mut state = self.state.write().await;
        if state.step >= index {
            debug!(swap_id = %self.swap_id, step = step_name, "step already complete, ignoring");
            return Ok(false);
        }

        let mut next = state.clone();
        next.apply(patch);
        next.step = index;

        if let Err(err) = self.store.set(&self.swap_id, &next) {
            if silent_error {
                warn!(swap_id = %self.swap_id, step = step_name, %err,
                      "swallowing persistence failure for racy step");
                return Ok(false);
            }
            return Err(err.into());
        }

        *state = next.clone();
        drop(state);
        let _ = self.watch_tx.send(next);
        info!(swap_id = %self.swap_id, step = step_name, index, "step complete");
        Ok(true)
    }

    /// Requests a cooperative stop. In-flight ledger calls are not aborted;
    /// retry loops observe the flag at their next iteration boundary.
    pub async fn stop(&self) -> Result<(), SwapError> {
        self.stopped.store(true, Ordering::SeqCst);
        self.set_state(StatePatch {
            is_stopped: Some(true),
            ..Default::default()
        })
        .await
    }

    /// Executes the variant's steps from `state.step` until the terminal step,
    /// a stop, or a halt.
    ///
    /// Each step's future is raced against external advancement of `step`
    /// (an off-path operation may complete the step the engine is waiting on).
    /// A step that returns `Err` halts progression with that error; a step
    /// that returns without advancing halts progression quietly. Either way
    /// the flow stays resumable at the same step.
    pub async fn drive(&self, variant: &dyn FlowVariant) -> Result<(), SwapError> {
        let flow = variant.name();
        loop {
            if self.is_stopped() {
                info!(swap_id = %self.swap_id, flow, "flow stopped");
                return Ok(());
            }

            let current = self.snapshot().await.step;
            let terminal = self.steps.terminal_index();
            if current >= terminal {
                return Ok(());
            }

            let next = current + 1;
            if next == terminal {
                // The terminal step performs no action.
                self.mark_terminal().await?;
                info!(swap_id = %self.swap_id, flow, "flow reached terminal step");
                return Ok(());
            }

            let name = self.steps.name(next).unwrap_or("?");
            debug!(swap_id = %self.swap_id, flow, step = next, name, "executing step");

            let mut watch_rx = self.watch();
            tokio::select! {
                result = variant.execute_step(next) => result?,
                _ = Self::step_advanced(&mut watch_rx, current) => {}
            }

            if self.is_stopped() {
                info!(swap_id = %self.swap_id, flow, "flow stopped");
                return Ok(());
            }
            let after = self.snapshot().await.step;
            if after <= current {
                warn!(swap_id = %self.swap_id, flow, step = next, name,
                      "step completed without advancing; halting progression");
                return Ok(());
            }
        }
    }

    /// Resolves once `step` moves past `current` or the flow stops.
    async fn step_advanced(rx: &mut watch::Receiver<FlowState>, current: usize) {
        loop {
            let done = {
                let state = rx.borrow();
                state.step > current || state.is_stopped
            };
            if done {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn mark_terminal(&self) -> Result<(), SwapError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.step = self.steps.terminal_index();
        self.store.set(&self.swap_id, &next)?;
        *state = next.clone();
        drop(state);
        let _ = self.watch_tx.send(next);
        Ok(())
    }
}
