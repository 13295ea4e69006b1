//! Owner direction: this party holds the secret and locks the UTXO-side
//! script first, then withdraws from the counterpart's contract lock,
//! revealing the secret on chain.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::adapters::{ContractExpectation, OnTxId};
use crate::config::SwapConfig;
use crate::engine::{FlowEngine, FlowVariant, StatePatch, StepTable};
use crate::error::{LedgerErrorKind, SwapError};
use crate::events;
use crate::persist::StateStore;
use crate::retry::{repeat_until_result, RetryOptions};
use crate::session::SwapSession;
use crate::types::{Role, ScriptValues, Secret, TxId};

use super::{drive_with_cancel, now_unix, parse_payload, state_missing, SwapFlow};

/// Step order for the secret-holder direction.
const STEPS: [&str; 8] = [
    "sign",
    "submit-secret",
    "sync-balance",
    "lock-script",
    "wait-lock-contract",
    "withdraw-contract",
    "finish",
    "end",
];

pub struct ScriptOwnerFlow {
    session: SwapSession,
    engine: Arc<FlowEngine>,
    config: SwapConfig,
}

impl ScriptOwnerFlow {
    pub fn new(
        session: SwapSession,
        store: Arc<dyn StateStore>,
        config: SwapConfig,
    ) -> Result<Self, SwapError> {
        if session.role != Role::Owner {
            return Err(SwapError::Construction(
                "script-owner flow requires the owner role".into(),
            ));
        }
        config.validate()?;
        let steps = StepTable::new(STEPS.to_vec())?;
        let engine = Arc::new(FlowEngine::new(session.id, steps, store)?);
        Ok(Self {
            session,
            engine,
            config,
        })
    }

    fn retry_options(&self) -> RetryOptions {
        RetryOptions::new(self.config.retry_interval(), self.config.max_retry_attempts)
    }

    // 1. Announce intent to swap; wait for the counterpart's signature. A
    // reported live swap defers until the counterpart refunds it.
    async fn step_sign(&self) -> Result<(), SwapError> {
        let channel = &*self.session.channel;
        let mut sign_rx = channel.subscribe(events::SWAP_SIGN);
        let mut exists_rx = channel.subscribe(events::SWAP_EXISTS);
        channel.send(events::REQUEST_SIGN, Value::Null)?;

        loop {
            tokio::select! {
                msg = sign_rx.recv() => {
                    if msg.is_none() {
                        return Ok(());
                    }
                    self.finish_sign().await?;
                    return Ok(());
                }
                msg = exists_rx.recv() => {
                    if msg.is_none() {
                        return Ok(());
                    }
                    warn!(swap_id = %self.session.id,
                          "counterpart reports a live swap; waiting for its refund");
                    self.engine
                        .set_state(StatePatch {
                            is_swap_exists: Some(true),
                            ..Default::default()
                        })
                        .await?;
                    // The counterpart may repeat `swap exists` for every sign
                    // request it refused, so its signature can arrive while
                    // this side still waits on the refund notice.
                    let mut refund_rx = channel.subscribe(events::REFUND_COMPLETED);
                    tokio::select! {
                        refund = refund_rx.recv() => {
                            if refund.is_some() {
                                info!(swap_id = %self.session.id,
                                      "stale swap refunded, re-requesting sign");
                                self.engine
                                    .set_state(StatePatch {
                                        is_swap_exists: Some(false),
                                        ..Default::default()
                                    })
                                    .await?;
                                channel.send(events::REQUEST_SIGN, Value::Null)?;
                            }
                        }
                        msg = sign_rx.recv() => {
                            if msg.is_none() {
                                return Ok(());
                            }
                            self.finish_sign().await?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn finish_sign(&self) -> Result<(), SwapError> {
        self.engine
            .finish_step(
                StatePatch {
                    is_sign_complete: Some(true),
                    is_swap_exists: Some(false),
                    ..Default::default()
                },
                "sign",
                true,
            )
            .await?;
        Ok(())
    }

    // 2. Generate the secret, build the lock script, persist. Nothing leaves
    // the process until this step's state is durable.
    async fn step_submit_secret(&self) -> Result<(), SwapError> {
        let secret = Secret::generate();
        let secret_hash = secret.hash();
        let values = ScriptValues {
            secret_hash,
            owner_public_key: self.session.me.script_public_key.clone(),
            recipient_public_key: self.session.counterpart.script_public_key.clone(),
            lock_time: now_unix() + self.config.script_lock_duration_secs,
        };
        let script_address = self.session.script_chain.create_script(&values)?;
        debug!(swap_id = %self.session.id, %script_address, "lock script prepared");

        self.engine
            .finish_step(
                StatePatch {
                    secret: Some(secret),
                    secret_hash: Some(secret_hash),
                    script_values: Some(values),
                    script_address: Some(script_address),
                    ..Default::default()
                },
                "submit-secret",
                false,
            )
            .await?;
        Ok(())
    }

    // 3. Check the own wallet covers the sell amount. A shortfall is recorded,
    // not fatal: the lock step then waits for external funding of the script.
    async fn step_sync_balance(&self) -> Result<(), SwapError> {
        let address = &self.session.me.script_address;
        let sell_amount = self.session.sell_amount;

        let balance = repeat_until_result(
            &self.retry_options(),
            || self.engine.is_stopped(),
            |_| async move {
                match self.session.script_chain.wallet_balance(address).await {
                    Ok(balance) => {
                        let enough = sell_amount <= balance;
                        if !enough {
                            error!(swap_id = %self.session.id, %balance, %sell_amount,
                                   "not enough funds in own wallet");
                        }
                        Some((balance, enough))
                    }
                    Err(err) => {
                        warn!(swap_id = %self.session.id, %err, "balance fetch failed");
                        None
                    }
                }
            },
        )
        .await;

        if let Some((balance, enough)) = balance {
            self.engine
                .finish_step(
                    StatePatch {
                        balance: Some(balance),
                        is_balance_enough: Some(enough),
                        ..Default::default()
                    },
                    "sync-balance",
                    false,
                )
                .await?;
        }
        Ok(())
    }

    // 4. Fund the lock script, or wait for it to be funded externally, and
    // announce the script to the counterpart once a funding tx is known.
    async fn step_lock_script(&self) -> Result<(), SwapError> {
        let state = self.engine.snapshot().await;
        let values = state
            .script_values
            .clone()
            .ok_or_else(|| state_missing("script values at lock-script"))?;

        let (announce_tx, announce_rx) = oneshot::channel::<TxId>();
        self.spawn_script_announcer(values.clone(), announce_rx);

        if state.is_balance_enough {
            let on_tx_id: OnTxId = Box::new(move |tx_id| {
                let _ = announce_tx.send(tx_id);
            });
            self.session
                .script_chain
                .fund_script(&values, self.session.sell_amount, on_tx_id)
                .await?;

            self.engine
                .finish_step(
                    StatePatch {
                        is_script_funded: Some(true),
                        ..Default::default()
                    },
                    "lock-script",
                    false,
                )
                .await?;
            return Ok(());
        }

        // External-funding path: poll the script address until the unspents
        // cover the sell amount.
        let script_address = self.session.script_chain.create_script(&values)?;
        let script_address = &script_address;
        let values = &values;
        let sell_amount = self.session.sell_amount;
        let funded = repeat_until_result(
            &self.retry_options(),
            || self.engine.is_stopped(),
            |_| async move {
                let unspents = match self
                    .session
                    .script_chain
                    .fetch_unspents(script_address)
                    .await
                {
                    Ok(unspents) if !unspents.is_empty() => unspents,
                    Ok(_) => return None,
                    Err(err) => {
                        warn!(swap_id = %self.session.id, %err, "unspent fetch failed");
                        return None;
                    }
                };
                let funding_tx = unspents[0].tx_id.clone();
                let balance = match self.session.script_chain.script_balance(values).await {
                    Ok(balance) => balance,
                    Err(err) => {
                        warn!(swap_id = %self.session.id, %err, "script balance fetch failed");
                        return None;
                    }
                };
                let _ = self
                    .engine
                    .set_state(StatePatch {
                        balance: Some(balance),
                        ..Default::default()
                    })
                    .await;
                (balance >= sell_amount).then_some(funding_tx)
            },
        )
        .await;

        if let Some(funding_tx) = funded {
            let _ = announce_tx.send(funding_tx);
            self.engine
                .finish_step(
                    StatePatch {
                        is_script_funded: Some(true),
                        ..Default::default()
                    },
                    "lock-script",
                    false,
                )
                .await?;
        }
        Ok(())
    }

    /// Once the funding tx id is known: persist it, announce the script, and
    /// keep answering `request <x> script` resends.
    fn spawn_script_announcer(&self, values: ScriptValues, rx: oneshot::Receiver<TxId>) {
        let engine = self.engine.clone();
        let channel = self.session.channel.clone();
        let asset = self.session.script_asset().clone();
        tokio::spawn(async move {
            let funding_tx_id = match rx.await {
                Ok(tx_id) => tx_id,
                Err(_) => return,
            };
            let _ = engine
                .set_state(StatePatch {
                    script_fund_tx_id: Some(funding_tx_id.clone()),
                    ..Default::default()
                })
                .await;
            let payload = serde_json::to_value(events::ScriptAnnouncement {
                script_values: values,
                funding_tx_id,
            })
            .unwrap_or_default();
            let _ = channel.send(&events::create_script(&asset), payload.clone());
            let mut requests = channel.subscribe(&events::request_script(&asset));
            while requests.recv().await.is_some() {
                let _ = channel.send(&events::create_script(&asset), payload.clone());
            }
        });
    }

    // 5. Wait for the counterpart's contract lock: a one-shot announcement
    // raced against a balance polling loop. `finish_step` idempotence is the
    // only guard against both firing.
    async fn step_wait_lock_contract(&self) -> Result<(), SwapError> {
        let channel = &*self.session.channel;
        let contract_asset = self.session.contract_asset();
        let mut created_rx = channel.subscribe(&events::create_contract(contract_asset));

        let counterpart = &self.session.counterpart.contract_address;
        let options = self.retry_options();
        let poll = repeat_until_result(
            &options,
            || self.engine.is_stopped(),
            |_| async move {
                match self.session.contract_chain.balance_of(counterpart).await {
                    Ok(balance) if !balance.is_zero() => Some(None),
                    Ok(_) => None,
                    Err(err) => {
                        warn!(swap_id = %self.session.id, %err, "contract balance fetch failed");
                        None
                    }
                }
            },
        );

        let creation_tx = tokio::select! {
            msg = created_rx.recv() => match msg {
                Some(value) => parse_payload::<events::ContractAnnouncement>(value)
                    .map(|ann| ann.creation_tx_id),
                None => return Ok(()),
            },
            result = poll => match result {
                Some(tx) => tx,
                None => return Ok(()),
            },
        };

        self.engine
            .finish_step(
                StatePatch {
                    is_contract_funded: Some(true),
                    contract_create_tx_id: creation_tx,
                    ..Default::default()
                },
                "wait-lock-contract",
                true,
            )
            .await?;
        Ok(())
    }

    // 6. Verify the contract lock, then withdraw from it, revealing the
    // secret. Ledger errors are classified; an insufficient fee flips into
    // the counterpart-assistance sub-state.
    async fn step_withdraw_contract(&self) -> Result<(), SwapError> {
        let state = self.engine.snapshot().await;
        let secret = state
            .secret
            .clone()
            .ok_or_else(|| state_missing("secret at withdraw-contract"))?;
        let secret_hash = state
            .secret_hash
            .ok_or_else(|| state_missing("secret hash at withdraw-contract"))?;

        let counterpart = self.session.counterpart.contract_address.clone();
        let chain = &self.session.contract_chain;

        // Never touch funds while the lock doesn't match expectations.
        let expectation = ContractExpectation {
            owner_address: counterpart.clone(),
            participant_address: self.session.me.contract_address.clone(),
            expected_value: self.session.buy_amount,
            expected_hash: secret_hash,
        };
        if let Some(reason) = chain.check_balance(&expectation).await? {
            error!(swap_id = %self.session.id, %reason, "contract lock check failed");
            self.engine
                .set_state(StatePatch {
                    verification_error: Some(reason),
                    ..Default::default()
                })
                .await?;
            return Ok(());
        }

        if chain.has_target_wallet() {
            let target = chain.target_wallet(&counterpart).await?;
            let needed = self
                .session
                .destination_buy_address
                .clone()
                .unwrap_or_else(|| self.session.me.contract_address.clone());
            if target != needed {
                error!(swap_id = %self.session.id, %target, %needed,
                       "contract payout target does not match destination");
                self.engine
                    .set_state(StatePatch {
                        verification_error: Some(format!(
                            "payout target mismatch: needed {}, got {}",
                            needed, target
                        )),
                        ..Default::default()
                    })
                    .await?;
                return Ok(());
            }
        }

        let announcer = self.spawn_withdraw_announcer();

        let withdrawn = repeat_until_result(
            &self.retry_options(),
            || self.engine.is_stopped(),
            |handle| {
                let secret = secret.clone();
                let counterpart = counterpart.clone();
                let announcer = announcer.clone();
                async move {
                    let state = self.engine.snapshot().await;
                    if state.is_contract_withdrawn {
                        handle.stop();
                        return None;
                    }

                    // Estimate the withdrawal fee once and cache it.
                    if state.withdraw_fee.is_none() {
                        match self
                            .session
                            .contract_chain
                            .withdraw_gas(&counterpart, &secret)
                            .await
                        {
                            Ok(fee) => {
                                debug!(swap_id = %self.session.id, %fee, "withdraw fee estimate");
                                let _ = self
                                    .engine
                                    .set_state(StatePatch {
                                        withdraw_fee: Some(fee),
                                        ..Default::default()
                                    })
                                    .await;
                            }
                            Err(err) => {
                                warn!(swap_id = %self.session.id, %err, "withdraw fee estimation failed")
                            }
                        }
                    }

                    let on_tx_id: OnTxId = Box::new(move |tx_id| {
                        let _ = announcer.send(tx_id);
                    });
                    match self
                        .session
                        .contract_chain
                        .withdraw(&counterpart, &secret, on_tx_id)
                        .await
                    {
                        Ok(()) => Some(true),
                        Err(err) => match err.kind {
                            LedgerErrorKind::AlreadyKnown => {
                                warn!(swap_id = %self.session.id, %err, "withdrawal already broadcast");
                                Some(true)
                            }
                            LedgerErrorKind::Reverted => {
                                error!(swap_id = %self.session.id, %err, "withdrawal reverted (wrong secret?)");
                                None
                            }
                            LedgerErrorKind::InsufficientFee => {
                                warn!(swap_id = %self.session.id, %err,
                                      "cannot afford withdrawal fee; requesting counterpart assistance");
                                let _ = self
                                    .engine
                                    .set_state(StatePatch {
                                        requires_withdraw_fee: Some(true),
                                        ..Default::default()
                                    })
                                    .await;
                                handle.stop();
                                None
                            }
                            LedgerErrorKind::Unknown => {
                                error!(swap_id = %self.session.id, %err, "withdrawal failed");
                                None
                            }
                        },
                    }
                }
            },
        )
        .await;

        if withdrawn.is_some() {
            return self.on_withdraw_ready().await;
        }

        // Fee-assistance path: the counterpart performs the withdrawal and
        // reports back with `withdraw ready`.
        let state = self.engine.snapshot().await;
        if state.requires_withdraw_fee && !state.is_contract_withdrawn {
            let mut ready_rx = self.session.channel.subscribe(events::WITHDRAW_READY);
            if let Some(value) = ready_rx.recv().await {
                if let Some(ann) = parse_payload::<events::WithdrawTxAnnouncement>(value) {
                    self.engine
                        .set_state(StatePatch {
                            contract_withdraw_tx_id: Some(ann.withdraw_tx_id),
                            ..Default::default()
                        })
                        .await?;
                }
                return self.on_withdraw_ready().await;
            }
        }
        Ok(())
    }

    /// Persists and announces the contract-withdrawal tx id as soon as it is
    /// broadcast, and keeps answering resend requests.
    fn spawn_withdraw_announcer(&self) -> mpsc::UnboundedSender<TxId> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TxId>();
        let engine = self.engine.clone();
        let channel = self.session.channel.clone();
        let asset = self.session.contract_asset().clone();
        tokio::spawn(async move {
            while let Some(tx_id) = rx.recv().await {
                let _ = engine
                    .set_state(StatePatch {
                        contract_withdraw_tx_id: Some(tx_id.clone()),
                        can_create_contract: Some(true),
                        ..Default::default()
                    })
                    .await;
                let payload = serde_json::to_value(events::WithdrawTxAnnouncement {
                    withdraw_tx_id: tx_id,
                })
                .unwrap_or_default();
                let _ = channel.send(&events::withdraw_tx_hash(&asset), payload);
            }
        });
        tx
    }

    async fn on_withdraw_ready(&self) -> Result<(), SwapError> {
        let channel = self.session.channel.clone();
        let asset = self.session.contract_asset().clone();
        let engine = self.engine.clone();

        // Answer tx-hash resend requests for the rest of the session.
        tokio::spawn(async move {
            let mut requests = channel.subscribe(&events::request_withdraw_tx_hash(&asset));
            while requests.recv().await.is_some() {
                let state = engine.snapshot().await;
                if let Some(tx_id) = state.contract_withdraw_tx_id {
                    let payload = serde_json::to_value(events::WithdrawTxAnnouncement {
                        withdraw_tx_id: tx_id,
                    })
                    .unwrap_or_default();
                    let _ = channel.send(&events::withdraw_tx_hash(&asset), payload);
                }
            }
        });

        self.session.channel.send(
            &events::finish_withdraw(self.session.contract_asset()),
            Value::Null,
        )?;
        self.engine
            .finish_step(
                StatePatch {
                    is_contract_withdrawn: Some(true),
                    ..Default::default()
                },
                "withdraw-contract",
                false,
            )
            .await?;
        Ok(())
    }

    // 7. Both sides notify completion; repeats are absorbed by the step guard.
    async fn step_finish(&self) -> Result<(), SwapError> {
        self.session
            .channel
            .send(events::SWAP_FINISHED, Value::Null)?;
        self.engine
            .finish_step(
                StatePatch {
                    is_finished: Some(true),
                    ..Default::default()
                },
                "finish",
                false,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FlowVariant for ScriptOwnerFlow {
    fn name(&self) -> String {
        self.session.pair.to_string()
    }

    async fn execute_step(&self, index: usize) -> Result<(), SwapError> {
        match self.engine.steps().name(index) {
            Some("sign") => self.step_sign().await,
            Some("submit-secret") => self.step_submit_secret().await,
            Some("sync-balance") => self.step_sync_balance().await,
            Some("lock-script") => self.step_lock_script().await,
            Some("wait-lock-contract") => self.step_wait_lock_contract().await,
            Some("withdraw-contract") => self.step_withdraw_contract().await,
            Some("finish") => self.step_finish().await,
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl SwapFlow for ScriptOwnerFlow {
    fn session(&self) -> &SwapSession {
        &self.session
    }

    fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }

    async fn run(&self) -> Result<(), SwapError> {
        drive_with_cancel(self, &self.engine, &self.session.channel).await
    }

    /// Reclaims the script leg after lock-time expiry; the adapter enforces
    /// the time check.
    async fn try_refund(&self) -> Result<(), SwapError> {
        let state = self.engine.snapshot().await;
        let values = state
            .script_values
            .ok_or_else(|| state_missing("script values at refund"))?;

        let engine = self.engine.clone();
        let (tx, rx) = oneshot::channel::<TxId>();
        tokio::spawn(async move {
            if let Ok(tx_id) = rx.await {
                let _ = engine
                    .set_state(StatePatch {
                        refund_tx_id: Some(tx_id),
                        ..Default::default()
                    })
                    .await;
            }
        });
        let mut sender = Some(tx);
        let on_tx_id: OnTxId = Box::new(move |tx_id| {
            if let Some(sender) = sender.take() {
                let _ = sender.send(tx_id);
            }
        });
        self.session.script_chain.refund(&values, on_tx_id).await?;

        self.engine
            .set_state(StatePatch {
                is_refunded: Some(true),
                is_swap_exists: Some(false),
                ..Default::default()
            })
            .await?;
        self.session
            .channel
            .send(events::REFUND_COMPLETED, Value::Null)?;
        info!(swap_id = %self.session.id, "script refund completed");
        Ok(())
    }

    /// Manual contract withdrawal with an externally supplied secret.
    async fn try_withdraw(&self, secret: Secret) -> Result<(), SwapError> {
        let state = self.engine.snapshot().await;

        if let Some(known) = &state.secret {
            if *known != secret {
                warn!(swap_id = %self.session.id,
                      "supplied secret differs from the known one; proceeding anyway");
            }
        }
        if state.is_contract_withdrawn {
            warn!(swap_id = %self.session.id,
                  "contract funds look already withdrawn; proceeding anyway");
        }
        if let Some(expected) = state.secret_hash {
            let actual = secret.hash();
            if actual != expected {
                warn!(swap_id = %self.session.id, %expected, %actual,
                      "secret hash does not match stored hash");
            }
        }

        let announcer = self.spawn_withdraw_announcer();
        let on_tx_id: OnTxId = Box::new(move |tx_id| {
            let _ = announcer.send(tx_id);
        });
        self.session
            .contract_chain
            .withdraw(
                &self.session.counterpart.contract_address,
                &secret,
                on_tx_id,
            )
            .await?;

        self.engine
            .finish_step(
                StatePatch {
                    is_contract_withdrawn: Some(true),
                    secret: Some(secret),
                    ..Default::default()
                },
                "withdraw-contract",
                false,
            )
            .await?;
        Ok(())
    }

    /// Asks the counterpart to withdraw on this party's behalf once it
    /// accepts; used when the withdrawal fee is unaffordable.
    async fn send_withdraw_request(&self) -> Result<(), SwapError> {
        let state = self.engine.snapshot().await;
        if !state.requires_withdraw_fee || state.withdraw_request_sent {
            return Ok(());
        }
        let secret = state
            .secret
            .ok_or_else(|| state_missing("secret at withdraw request"))?;

        self.engine
            .set_state(StatePatch {
                withdraw_request_sent: Some(true),
                ..Default::default()
            })
            .await?;

        let channel = self.session.channel.clone();
        tokio::spawn(async move {
            let mut accepted = channel.subscribe(events::ACCEPT_WITHDRAW_REQUEST);
            while accepted.recv().await.is_some() {
                let payload = serde_json::to_value(events::DoWithdraw {
                    secret: secret.clone(),
                })
                .unwrap_or_default();
                let _ = channel.send(events::DO_WITHDRAW, payload);
            }
        });

        self.session
            .channel
            .send(events::REQUEST_WITHDRAW, Value::Null)?;
        Ok(())
    }
}
