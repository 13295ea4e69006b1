//! Participant direction: this party waits for the counterpart's script lock,
//! verifies it, locks the contract leg second, and claims the script leg once
//! the counterpart's withdrawal reveals the secret.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::adapters::{ContractParams, OnTxId};
use crate::config::SwapConfig;
use crate::engine::{FlowEngine, FlowVariant, StatePatch, StepTable};
use crate::error::{LedgerErrorKind, SwapError};
use crate::events;
use crate::persist::StateStore;
use crate::retry::{repeat_until_result, RetryOptions};
use crate::session::SwapSession;
use crate::types::{Role, Secret, TxId};

use super::{
    drive_with_cancel, now_unix, parse_payload, state_missing, watch_withdraw_requests, SwapFlow,
};

/// Step order for the secret-learner direction.
const STEPS: [&str; 9] = [
    "sign",
    "wait-lock-script",
    "verify-script",
    "sync-balance",
    "lock-contract",
    "wait-withdraw-contract",
    "withdraw-script",
    "finish",
    "end",
];

pub struct ContractParticipantFlow {
    session: SwapSession,
    engine: Arc<FlowEngine>,
    config: SwapConfig,
}

impl ContractParticipantFlow {
    pub fn new(
        session: SwapSession,
        store: Arc<dyn StateStore>,
        config: SwapConfig,
    ) -> Result<Self, SwapError> {
        if session.role != Role::Participant {
            return Err(SwapError::Construction(
                "contract-participant flow requires the participant role".into(),
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

    // 1. Sign on request. A leftover lock from a previous attempt with the
    // same counterpart blocks signing until it drains; sign requests received
    // meanwhile are refused with `swap exists` so the counterpart never locks
    // funds against a stale swap.
    async fn step_sign(&self) -> Result<(), SwapError> {
        let channel = self.session.channel.clone();
        // Subscribe before any other traffic so no sign request slips past;
        // requests queue here until the stale-lock check has passed.
        let mut requests = channel.subscribe(events::REQUEST_SIGN);

        let me = &self.session.me.contract_address;
        let counterpart = &self.session.counterpart.contract_address;
        let exists = self
            .session
            .contract_chain
            .swap_exists(me, counterpart)
            .await?;
        if exists {
            warn!(swap_id = %self.session.id,
                  "live lock from a previous attempt found, refusing to sign until it drains");
            self.engine
                .set_state(StatePatch {
                    is_swap_exists: Some(true),
                    ..Default::default()
                })
                .await?;
            channel.send(events::SWAP_EXISTS, Value::Null)?;

            let options = self.retry_options();
            let drain = repeat_until_result(
                &options,
                || self.engine.is_stopped(),
                |_| async move {
                    match self.session.contract_chain.swap_exists(me, counterpart).await {
                        Ok(false) => Some(()),
                        Ok(true) => None,
                        Err(err) => {
                            warn!(swap_id = %self.session.id, %err, "lock existence check failed");
                            None
                        }
                    }
                },
            );
            tokio::pin!(drain);
            let drained = loop {
                tokio::select! {
                    result = &mut drain => break result,
                    msg = requests.recv() => {
                        if msg.is_none() {
                            return Ok(());
                        }
                        channel.send(events::SWAP_EXISTS, Value::Null)?;
                    }
                }
            };
            if drained.is_none() {
                return Ok(());
            }
            self.engine
                .set_state(StatePatch {
                    is_swap_exists: Some(false),
                    ..Default::default()
                })
                .await?;
        }

        {
            // Re-answer sign requests for the rest of the session; the
            // counterpart resends after reconnects. Requests queued during
            // the stale-lock wait are answered here too.
            let channel = channel.clone();
            tokio::spawn(async move {
                while requests.recv().await.is_some() {
                    let _ = channel.send(events::SWAP_SIGN, Value::Null);
                }
            });
        }

        channel.send(events::SWAP_SIGN, Value::Null)?;
        self.engine
            .finish_step(
                StatePatch {
                    is_sign_complete: Some(true),
                    ..Default::default()
                },
                "sign",
                true,
            )
            .await?;
        Ok(())
    }

    // 2. Wait for the counterpart's script announcement.
    async fn step_wait_lock_script(&self) -> Result<(), SwapError> {
        let channel = &self.session.channel;
        let script_asset = self.session.script_asset();
        let mut created_rx = channel.subscribe(&events::create_script(script_asset));
        channel.send(&events::request_script(script_asset), Value::Null)?;

        let announcement = match created_rx.recv().await {
            Some(value) => match parse_payload::<events::ScriptAnnouncement>(value) {
                Some(ann) => ann,
                None => return Ok(()),
            },
            None => return Ok(()),
        };

        self.engine
            .finish_step(
                StatePatch {
                    secret_hash: Some(announcement.script_values.secret_hash),
                    script_values: Some(announcement.script_values),
                    script_fund_tx_id: Some(announcement.funding_tx_id),
                    ..Default::default()
                },
                "wait-lock-script",
                true,
            )
            .await?;
        Ok(())
    }

    // 3. Verify the announced script before locking anything. Parameter
    // mismatches block permanently; a short balance is polled, the
    // counterpart's funding tx may still be confirming.
    async fn step_verify_script(&self) -> Result<(), SwapError> {
        let state = self.engine.snapshot().await;
        let values = state
            .script_values
            .ok_or_else(|| state_missing("script values at verify-script"))?;

        if values.recipient_public_key != self.session.me.script_public_key {
            let reason = "script recipient key is not ours".to_string();
            error!(swap_id = %self.session.id, %reason, "script verification failed");
            self.engine
                .set_state(StatePatch {
                    verification_error: Some(reason),
                    ..Default::default()
                })
                .await?;
            return Ok(());
        }
        if values.lock_time <= now_unix() {
            let reason = format!("script lock time {} is already expired", values.lock_time);
            error!(swap_id = %self.session.id, %reason, "script verification failed");
            self.engine
                .set_state(StatePatch {
                    verification_error: Some(reason),
                    ..Default::default()
                })
                .await?;
            return Ok(());
        }

        let script_address = self.session.script_chain.create_script(&values)?;
        debug!(swap_id = %self.session.id, %script_address, "script parameters accepted");

        let buy_amount = self.session.buy_amount;
        let values = &values;
        let funded = repeat_until_result(
            &self.retry_options(),
            || self.engine.is_stopped(),
            |_| async move {
                match self.session.script_chain.script_balance(values).await {
                    Ok(balance) if balance >= buy_amount => Some(()),
                    Ok(balance) => {
                        debug!(swap_id = %self.session.id, %balance, %buy_amount,
                               "script not yet funded to the agreed amount");
                        None
                    }
                    Err(err) => {
                        warn!(swap_id = %self.session.id, %err, "script balance fetch failed");
                        None
                    }
                }
            },
        )
        .await;

        if funded.is_some() {
            self.engine
                .finish_step(
                    StatePatch {
                        script_verified: Some(true),
                        script_address: Some(script_address),
                        ..Default::default()
                    },
                    "verify-script",
                    false,
                )
                .await?;
        }
        Ok(())
    }

    // 4. Wait until the own contract-side wallet covers the sell amount. On
    // an exhausted retry cap the flow halts at this step, resumable once the
    // wallet is topped up.
    async fn step_sync_balance(&self) -> Result<(), SwapError> {
        let address = &self.session.me.contract_address;
        let sell_amount = self.session.sell_amount;
        let options = self.retry_options();

        let balance = repeat_until_result(
            &options,
            || self.engine.is_stopped(),
            |_| async move {
                match self.session.contract_chain.wallet_balance(address).await {
                    Ok(balance) => {
                        let _ = self
                            .engine
                            .set_state(StatePatch {
                                balance: Some(balance),
                                is_balance_enough: Some(sell_amount <= balance),
                                ..Default::default()
                            })
                            .await;
                        if sell_amount <= balance {
                            Some(balance)
                        } else {
                            error!(swap_id = %self.session.id, %balance, %sell_amount,
                                   "not enough funds in own wallet");
                            None
                        }
                    }
                    Err(err) => {
                        warn!(swap_id = %self.session.id, %err, "balance fetch failed");
                        None
                    }
                }
            },
        )
        .await;

        if balance.is_some() {
            self.engine
                .finish_step(
                    StatePatch {
                        is_balance_enough: Some(true),
                        ..Default::default()
                    },
                    "sync-balance",
                    false,
                )
                .await?;
        }
        Ok(())
    }

    // 5. Lock the contract leg, keyed by the counterpart's secret hash, and
    // announce the creation tx.
    async fn step_lock_contract(&self) -> Result<(), SwapError> {
        let state = self.engine.snapshot().await;
        let secret_hash = state
            .secret_hash
            .ok_or_else(|| state_missing("secret hash at lock-contract"))?;

        let params = ContractParams {
            secret_hash,
            participant_address: self.session.counterpart.contract_address.clone(),
            amount: self.session.sell_amount,
            target_wallet: self.session.destination_sell_address.clone(),
        };

        let announcer = self.spawn_contract_announcer();

        let params = &params;
        let created = repeat_until_result(
            &self.retry_options(),
            || self.engine.is_stopped(),
            |_| {
                let announcer = announcer.clone();
                async move {
                    let on_tx_id: OnTxId = Box::new(move |tx_id| {
                        let _ = announcer.send(tx_id);
                    });
                    match self.session.contract_chain.create(params, on_tx_id).await {
                        Ok(()) => Some(true),
                        Err(err) => match err.kind {
                            LedgerErrorKind::AlreadyKnown => {
                                warn!(swap_id = %self.session.id, %err,
                                      "contract creation already broadcast");
                                Some(true)
                            }
                            LedgerErrorKind::Reverted => {
                                error!(swap_id = %self.session.id, %err,
                                       "contract creation reverted");
                                let _ = self
                                    .engine
                                    .set_state(StatePatch {
                                        can_create_contract: Some(false),
                                        ..Default::default()
                                    })
                                    .await;
                                None
                            }
                            _ => {
                                error!(swap_id = %self.session.id, %err,
                                       "contract creation failed");
                                None
                            }
                        },
                    }
                }
            },
        )
        .await;

        if created.is_some() {
            self.engine
                .finish_step(
                    StatePatch {
                        is_contract_funded: Some(true),
                        can_create_contract: Some(true),
                        ..Default::default()
                    },
                    "lock-contract",
                    false,
                )
                .await?;
        }
        Ok(())
    }

    /// Persists and announces the contract-creation tx id as soon as any
    /// attempt broadcasts it. Retried attempts share the one channel, so a
    /// failed first attempt cannot strand the announcement.
    fn spawn_contract_announcer(&self) -> mpsc::UnboundedSender<TxId> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TxId>();
        let engine = self.engine.clone();
        let channel = self.session.channel.clone();
        let asset = self.session.contract_asset().clone();
        tokio::spawn(async move {
            while let Some(creation_tx_id) = rx.recv().await {
                let _ = engine
                    .set_state(StatePatch {
                        contract_create_tx_id: Some(creation_tx_id.clone()),
                        ..Default::default()
                    })
                    .await;
                let payload =
                    serde_json::to_value(events::ContractAnnouncement { creation_tx_id })
                        .unwrap_or_default();
                let _ = channel.send(&events::create_contract(&asset), payload);
            }
        });
        tx
    }

    // 6. Learn the secret: from the counterpart's announced withdrawal tx,
    // from the contract's recorded secret, or nudged by the finish message.
    // Whichever source yields first wins; `finish_step` absorbs the rest.
    async fn step_wait_withdraw_contract(&self) -> Result<(), SwapError> {
        let channel = &self.session.channel;
        let contract_asset = self.session.contract_asset();
        let mut tx_hash_rx = channel.subscribe(&events::withdraw_tx_hash(contract_asset));
        let mut finished_rx = channel.subscribe(&events::finish_withdraw(contract_asset));
        channel.send(&events::request_withdraw_tx_hash(contract_asset), Value::Null)?;

        let me = &self.session.me.contract_address;
        let options = self.retry_options();
        let poll_secret = repeat_until_result(
            &options,
            || self.engine.is_stopped(),
            |handle| async move {
                if self.engine.snapshot().await.is_contract_withdrawn {
                    handle.stop();
                    return None;
                }
                match self.session.contract_chain.secret_of(me).await {
                    Ok(Some(secret)) => Some(secret),
                    Ok(None) => None,
                    Err(err) => {
                        warn!(swap_id = %self.session.id, %err, "secret lookup failed");
                        None
                    }
                }
            },
        );

        let secret = tokio::select! {
            msg = tx_hash_rx.recv() => match msg {
                Some(value) => self.secret_from_announcement(value).await?,
                None => return Ok(()),
            },
            result = poll_secret => match result {
                Some(secret) => Some(secret),
                None => return Ok(()),
            },
            msg = finished_rx.recv() => match msg {
                Some(_) => self.session.contract_chain.secret_of(me).await?,
                None => return Ok(()),
            },
        };

        let Some(secret) = secret else {
            warn!(swap_id = %self.session.id,
                  "withdrawal reported but no secret recovered; halting until resumed");
            return Ok(());
        };

        info!(swap_id = %self.session.id, "secret recovered from counterpart withdrawal");
        self.engine
            .finish_step(
                StatePatch {
                    secret: Some(secret),
                    is_contract_withdrawn: Some(true),
                    ..Default::default()
                },
                "wait-withdraw-contract",
                true,
            )
            .await?;
        Ok(())
    }

    /// Resolves an announced withdrawal tx into the secret, retrying tx-data
    /// extraction against the contract record.
    async fn secret_from_announcement(&self, value: Value) -> Result<Option<Secret>, SwapError> {
        let Some(ann) = parse_payload::<events::WithdrawTxAnnouncement>(value) else {
            return Ok(None);
        };
        self.engine
            .set_state(StatePatch {
                contract_withdraw_tx_id: Some(ann.withdraw_tx_id.clone()),
                ..Default::default()
            })
            .await?;

        let me = &self.session.me.contract_address;
        let tx_id = &ann.withdraw_tx_id;
        let secret = repeat_until_result(
            &self.retry_options(),
            || self.engine.is_stopped(),
            |_| async move {
                match self.session.contract_chain.secret_from_tx(tx_id).await {
                    Ok(Some(secret)) => return Some(secret),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(swap_id = %self.session.id, %err, "secret extraction from tx failed")
                    }
                }
                match self.session.contract_chain.secret_of(me).await {
                    Ok(secret) => secret,
                    Err(err) => {
                        warn!(swap_id = %self.session.id, %err, "secret lookup failed");
                        None
                    }
                }
            },
        )
        .await;
        Ok(secret)
    }

    // 7. Claim the script leg with the learned secret.
    async fn step_withdraw_script(&self) -> Result<(), SwapError> {
        let state = self.engine.snapshot().await;
        let Some(values) = state.script_values else {
            error!(swap_id = %self.session.id, "script values lost; cannot withdraw");
            return Ok(());
        };
        let secret = state
            .secret
            .ok_or_else(|| state_missing("secret at withdraw-script"))?;

        let engine = self.engine.clone();
        let (tx, rx) = oneshot::channel::<TxId>();
        tokio::spawn(async move {
            if let Ok(tx_id) = rx.await {
                let _ = engine
                    .set_state(StatePatch {
                        script_withdraw_tx_id: Some(tx_id),
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

        self.session
            .script_chain
            .withdraw(
                &values,
                &secret,
                self.session.destination_buy_address.as_ref(),
                on_tx_id,
            )
            .await?;

        self.engine
            .finish_step(
                StatePatch {
                    is_script_withdrawn: Some(true),
                    ..Default::default()
                },
                "withdraw-script",
                false,
            )
            .await?;
        Ok(())
    }

    // 8. Both sides notify completion.
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

    /// Marks the refund in state and unblocks the counterpart's sign step.
    async fn after_refund(&self) -> Result<(), SwapError> {
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
        info!(swap_id = %self.session.id, "contract refund completed");
        Ok(())
    }
}

#[async_trait]
impl FlowVariant for ContractParticipantFlow {
    fn name(&self) -> String {
        self.session.pair.to_string()
    }

    async fn execute_step(&self, index: usize) -> Result<(), SwapError> {
        match self.engine.steps().name(index) {
            Some("sign") => self.step_sign().await,
            Some("wait-lock-script") => self.step_wait_lock_script().await,
            Some("verify-script") => self.step_verify_script().await,
            Some("sync-balance") => self.step_sync_balance().await,
            Some("lock-contract") => self.step_lock_contract().await,
            Some("wait-withdraw-contract") => self.step_wait_withdraw_contract().await,
            Some("withdraw-script") => self.step_withdraw_script().await,
            Some("finish") => self.step_finish().await,
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl SwapFlow for ContractParticipantFlow {
    fn session(&self) -> &SwapSession {
        &self.session
    }

    fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }

    async fn run(&self) -> Result<(), SwapError> {
        tokio::select! {
            result = drive_with_cancel(self, &self.engine, &self.session.channel) => result,
            _ = watch_withdraw_requests(self.engine.clone(), self.session.channel.clone()) => Ok(()),
        }
    }

    /// Reclaims the contract leg after its lock window expires. A lock that
    /// was already refunded on chain is only reconciled into local state.
    async fn try_refund(&self) -> Result<(), SwapError> {
        let state = self.engine.snapshot().await;
        if let Some(secret_hash) = state.secret_hash {
            if self
                .session
                .contract_chain
                .was_refunded(&secret_hash)
                .await?
            {
                warn!(swap_id = %self.session.id,
                      "lock already refunded on chain, reconciling state");
                return self.after_refund().await;
            }
        }

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
        self.session
            .contract_chain
            .refund(&self.session.counterpart.contract_address, on_tx_id)
            .await?;

        self.after_refund().await
    }

    /// Manual script withdrawal with an externally supplied secret.
    async fn try_withdraw(&self, secret: Secret) -> Result<(), SwapError> {
        let state = self.engine.snapshot().await;
        let values = state
            .script_values
            .clone()
            .ok_or_else(|| state_missing("script values at manual withdraw"))?;

        if let Some(known) = &state.secret {
            if *known != secret {
                warn!(swap_id = %self.session.id,
                      "supplied secret differs from the known one; proceeding anyway");
            }
        }
        if state.is_script_withdrawn {
            warn!(swap_id = %self.session.id,
                  "script funds look already withdrawn; proceeding anyway");
        }
        let actual = secret.hash();
        if actual != values.secret_hash {
            warn!(swap_id = %self.session.id, expected = %values.secret_hash, %actual,
                  "secret hash does not match the script lock");
        }

        // Chain state is authoritative: a drained script means someone already
        // withdrew, usually this party before a restart.
        let balance = self.session.script_chain.script_balance(&values).await?;
        if balance.is_zero() {
            self.engine
                .finish_step(
                    StatePatch {
                        secret: Some(secret),
                        is_script_withdrawn: Some(true),
                        ..Default::default()
                    },
                    "withdraw-script",
                    false,
                )
                .await?;
            return Err(SwapError::Verification(
                "script already withdrawn, funds should be in the target wallet".into(),
            ));
        }

        let engine = self.engine.clone();
        let (tx, rx) = oneshot::channel::<TxId>();
        tokio::spawn(async move {
            if let Ok(tx_id) = rx.await {
                let _ = engine
                    .set_state(StatePatch {
                        script_withdraw_tx_id: Some(tx_id),
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
        self.session
            .script_chain
            .withdraw(
                &values,
                &secret,
                self.session.destination_buy_address.as_ref(),
                on_tx_id,
            )
            .await?;

        self.engine
            .finish_step(
                StatePatch {
                    secret: Some(secret),
                    is_script_withdrawn: Some(true),
                    ..Default::default()
                },
                "withdraw-script",
                false,
            )
            .await?;
        Ok(())
    }

    /// Accepts the counterpart's fee-assistance request: once its secret
    /// arrives, this party performs the contract withdrawal for it and
    /// reports the tx back.
    async fn accept_withdraw_request(&self) -> Result<(), SwapError> {
        let state = self.engine.snapshot().await;
        if state.withdraw_request_accepted {
            return Ok(());
        }
        self.engine
            .set_state(StatePatch {
                withdraw_request_accepted: Some(true),
                ..Default::default()
            })
            .await?;

        let channel = self.session.channel.clone();
        let contract_chain = self.session.contract_chain.clone();
        let counterpart = self.session.counterpart.contract_address.clone();
        let swap_id = self.session.id;
        tokio::spawn(async move {
            let mut do_rx = channel.subscribe(events::DO_WITHDRAW);
            let Some(value) = do_rx.recv().await else {
                return;
            };
            let Some(request) = parse_payload::<events::DoWithdraw>(value) else {
                return;
            };
            let announce = channel.clone();
            let on_tx_id: OnTxId = Box::new(move |tx_id| {
                let payload = serde_json::to_value(events::WithdrawTxAnnouncement {
                    withdraw_tx_id: tx_id,
                })
                .unwrap_or_default();
                let _ = announce.send(events::WITHDRAW_READY, payload);
            });
            if let Err(err) = contract_chain
                .withdraw_on_behalf(&counterpart, &request.secret, on_tx_id)
                .await
            {
                error!(%swap_id, %err, "withdrawal on counterpart's behalf failed");
            }
        });

        self.session
            .channel
            .send(events::ACCEPT_WITHDRAW_REQUEST, Value::Null)?;
        Ok(())
    }
}
