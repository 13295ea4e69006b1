//! Shared test fixtures: in-memory mock ledgers for both legs, a controllable
//! clock, and session builders for a connected two-party setup.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use swap_engine::adapters::{
    ContractChain, ContractExpectation, ContractParams, OnTxId, ScriptChain,
};
use swap_engine::channel::InMemoryChannel;
use swap_engine::error::{LedgerError, LedgerErrorKind};
use swap_engine::types::{
    Address, Amount, Asset, AssetPair, PublicKey, Role, ScriptValues, Secret, SecretHash, TxId,
    Unspent,
};
use swap_engine::{PartyIdentity, SwapConfig, SwapSession};
use uuid::Uuid;

pub const OWNER_SELL: u64 = 50_000;
pub const OWNER_BUY: u64 = 1_000_000;
pub const CONTRACT_LOCK_SECS: u64 = 3_600;

pub fn amount(n: u64) -> Amount {
    Amount::from(n)
}

pub fn addr(s: &str) -> Address {
    Address(s.to_string())
}

pub fn pk(s: &str) -> PublicKey {
    PublicKey(s.to_string())
}

/// Config tuned for tests: fast retries, bounded attempts so a wedged flow
/// fails the test instead of hanging it.
pub fn test_config() -> SwapConfig {
    SwapConfig {
        retry_interval_ms: 10,
        max_retry_attempts: Some(500),
        script_lock_duration_secs: 2 * CONTRACT_LOCK_SECS,
        contract_lock_duration_secs: CONTRACT_LOCK_SECS,
    }
}

/// Shared mock time in unix seconds, advanced manually by tests.
#[derive(Clone)]
pub struct TestClock(Arc<AtomicU64>);

impl TestClock {
    pub fn new() -> Self {
        // Far enough in the future that real `now_unix` lock times computed by
        // the flows are always below a generously advanced mock clock.
        Self(Arc::new(AtomicU64::new(4_000_000_000)))
    }

    pub fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

fn next_tx(counter: &AtomicU64, prefix: &str) -> TxId {
    TxId(format!("{}-{}", prefix, counter.fetch_add(1, Ordering::SeqCst)))
}

// ============================================================================
// SCRIPT-LEG MOCK LEDGER
// ============================================================================

#[derive(Default)]
struct ScriptLedgerState {
    wallets: HashMap<Address, Amount>,
    scripts: HashMap<Address, Amount>,
    unspents: HashMap<Address, Vec<Unspent>>,
}

/// Mock UTXO-side ledger shared by both parties' adapter handles.
pub struct MockScriptChain {
    state: Mutex<ScriptLedgerState>,
    clock: TestClock,
    tx_counter: AtomicU64,
}

impl MockScriptChain {
    pub fn new(clock: TestClock) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ScriptLedgerState::default()),
            clock,
            tx_counter: AtomicU64::new(1),
        })
    }

    pub fn credit_wallet(&self, address: &Address, value: Amount) {
        let mut state = self.state.lock().unwrap();
        *state.wallets.entry(address.clone()).or_default() += value;
    }

    pub fn script_funds(&self, values: &ScriptValues) -> Amount {
        let address = derive_script_address(values);
        let state = self.state.lock().unwrap();
        state.scripts.get(&address).copied().unwrap_or_default()
    }
}

fn derive_script_address(values: &ScriptValues) -> Address {
    Address(format!("script-{}", &values.secret_hash.to_hex()[..16]))
}

#[async_trait]
impl ScriptChain for MockScriptChain {
    fn create_script(&self, values: &ScriptValues) -> Result<Address, LedgerError> {
        Ok(derive_script_address(values))
    }

    async fn fund_script(
        &self,
        values: &ScriptValues,
        funding: Amount,
        on_tx_id: OnTxId,
    ) -> Result<(), LedgerError> {
        let address = derive_script_address(values);
        let tx_id = next_tx(&self.tx_counter, "fund");
        {
            let mut state = self.state.lock().unwrap();
            *state.scripts.entry(address.clone()).or_default() += funding;
            state.unspents.entry(address).or_default().push(Unspent {
                tx_id: tx_id.clone(),
                amount: funding,
                confirmations: 1,
            });
        }
        on_tx_id(tx_id);
        Ok(())
    }

    async fn fetch_unspents(&self, script_address: &Address) -> Result<Vec<Unspent>, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(state.unspents.get(script_address).cloned().unwrap_or_default())
    }

    async fn script_balance(&self, values: &ScriptValues) -> Result<Amount, LedgerError> {
        Ok(self.script_funds(values))
    }

    async fn wallet_balance(&self, address: &Address) -> Result<Amount, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(state.wallets.get(address).copied().unwrap_or_default())
    }

    async fn withdraw(
        &self,
        values: &ScriptValues,
        secret: &Secret,
        _destination: Option<&Address>,
        on_tx_id: OnTxId,
    ) -> Result<(), LedgerError> {
        if secret.hash() != values.secret_hash {
            return Err(LedgerError::classify("execution reverted: bad preimage"));
        }
        let address = derive_script_address(values);
        let tx_id = next_tx(&self.tx_counter, "script-withdraw");
        {
            let mut state = self.state.lock().unwrap();
            let balance = state.scripts.entry(address).or_default();
            if balance.is_zero() {
                return Err(LedgerError::new(
                    LedgerErrorKind::Unknown,
                    "script has no funds",
                ));
            }
            *balance = Amount::zero();
        }
        on_tx_id(tx_id);
        Ok(())
    }

    async fn refund(&self, values: &ScriptValues, on_tx_id: OnTxId) -> Result<(), LedgerError> {
        if self.clock.now() < values.lock_time {
            return Err(LedgerError::new(
                LedgerErrorKind::Unknown,
                format!("script locked until {}", values.lock_time),
            ));
        }
        let address = derive_script_address(values);
        let tx_id = next_tx(&self.tx_counter, "script-refund");
        {
            let mut state = self.state.lock().unwrap();
            state.scripts.insert(address, Amount::zero());
        }
        on_tx_id(tx_id);
        Ok(())
    }
}

// ============================================================================
// CONTRACT-LEG MOCK LEDGER
// ============================================================================

struct ContractLock {
    participant: Address,
    value: Amount,
    secret_hash: SecretHash,
    target: Option<Address>,
    secret: Option<Secret>,
    refunded: bool,
    created_at: u64,
}

#[derive(Default)]
struct ContractLedgerState {
    wallets: HashMap<Address, Amount>,
    /// Locks keyed by creator address.
    locks: HashMap<Address, ContractLock>,
    tx_secrets: HashMap<String, Secret>,
    refunded_hashes: Vec<SecretHash>,
}

/// Shared contract-side ledger; each party holds a handle bound to its own
/// account address (the address `create` and `refund` act under).
pub struct ContractLedger {
    state: Mutex<ContractLedgerState>,
    clock: TestClock,
    tx_counter: AtomicU64,
    lock_duration_secs: u64,
}

impl ContractLedger {
    pub fn new(clock: TestClock) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ContractLedgerState::default()),
            clock,
            tx_counter: AtomicU64::new(1),
            lock_duration_secs: CONTRACT_LOCK_SECS,
        })
    }

    pub fn credit_wallet(&self, address: &Address, value: Amount) {
        let mut state = self.state.lock().unwrap();
        *state.wallets.entry(address.clone()).or_default() += value;
    }

    pub fn lock_value(&self, creator: &Address) -> Amount {
        let state = self.state.lock().unwrap();
        state
            .locks
            .get(creator)
            .map(|lock| lock.value)
            .unwrap_or_default()
    }
}

pub struct MockContractChain {
    ledger: Arc<ContractLedger>,
    local_address: Address,
    target_wallet_support: bool,
    fail_create_once: AtomicBool,
    withdraw_fee_refused: AtomicBool,
}

impl MockContractChain {
    pub fn new(ledger: Arc<ContractLedger>, local_address: Address) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            local_address,
            target_wallet_support: true,
            fail_create_once: AtomicBool::new(false),
            withdraw_fee_refused: AtomicBool::new(false),
        })
    }

    /// Makes the next `create` fail with a transient node error.
    pub fn fail_next_create(&self) {
        self.fail_create_once.store(true, Ordering::SeqCst);
    }

    /// Makes every `withdraw` through this handle fail with a fee shortfall;
    /// `withdraw_on_behalf` is unaffected.
    pub fn refuse_withdraw_fee(&self) {
        self.withdraw_fee_refused.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContractChain for MockContractChain {
    async fn create(&self, params: &ContractParams, on_tx_id: OnTxId) -> Result<(), LedgerError> {
        if self.fail_create_once.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::new(LedgerErrorKind::Unknown, "nonce too low"));
        }
        let tx_id = next_tx(&self.ledger.tx_counter, "contract-create");
        {
            let mut state = self.ledger.state.lock().unwrap();
            if let Some(existing) = state.locks.get(&self.local_address) {
                if !existing.refunded && !existing.value.is_zero() {
                    return Err(LedgerError::classify("known transaction: lock exists"));
                }
            }
            state.locks.insert(
                self.local_address.clone(),
                ContractLock {
                    participant: params.participant_address.clone(),
                    value: params.amount,
                    secret_hash: params.secret_hash,
                    target: params.target_wallet.clone(),
                    secret: None,
                    refunded: false,
                    created_at: self.ledger.clock.now(),
                },
            );
        }
        on_tx_id(tx_id);
        Ok(())
    }

    async fn check_balance(
        &self,
        expectation: &ContractExpectation,
    ) -> Result<Option<String>, LedgerError> {
        let state = self.ledger.state.lock().unwrap();
        let Some(lock) = state.locks.get(&expectation.owner_address) else {
            return Ok(Some("no lock found for counterpart".into()));
        };
        if lock.secret_hash != expectation.expected_hash {
            return Ok(Some("lock keyed by a different hash".into()));
        }
        if lock.participant != expectation.participant_address {
            return Ok(Some("lock names a different participant".into()));
        }
        if lock.value < expectation.expected_value {
            return Ok(Some(format!(
                "lock value {} below agreed {}",
                lock.value, expectation.expected_value
            )));
        }
        Ok(None)
    }

    async fn balance_of(&self, owner: &Address) -> Result<Amount, LedgerError> {
        Ok(self.ledger.lock_value(owner))
    }

    async fn wallet_balance(&self, address: &Address) -> Result<Amount, LedgerError> {
        let state = self.ledger.state.lock().unwrap();
        Ok(state.wallets.get(address).copied().unwrap_or_default())
    }

    fn has_target_wallet(&self) -> bool {
        self.target_wallet_support
    }

    async fn target_wallet(&self, owner: &Address) -> Result<Address, LedgerError> {
        let state = self.ledger.state.lock().unwrap();
        let lock = state
            .locks
            .get(owner)
            .ok_or_else(|| LedgerError::new(LedgerErrorKind::Unknown, "no lock found"))?;
        Ok(lock
            .target
            .clone()
            .unwrap_or_else(|| lock.participant.clone()))
    }

    async fn withdraw(
        &self,
        owner: &Address,
        secret: &Secret,
        on_tx_id: OnTxId,
    ) -> Result<(), LedgerError> {
        if self.withdraw_fee_refused.load(Ordering::SeqCst) {
            return Err(LedgerError::classify(
                "insufficient funds for gas * price + value",
            ));
        }
        let tx_id = next_tx(&self.ledger.tx_counter, "contract-withdraw");
        {
            let mut state = self.ledger.state.lock().unwrap();
            let lock = state
                .locks
                .get_mut(owner)
                .ok_or_else(|| LedgerError::new(LedgerErrorKind::Unknown, "no lock found"))?;
            if secret.hash() != lock.secret_hash {
                return Err(LedgerError::classify("execution reverted: bad preimage"));
            }
            if lock.value.is_zero() {
                return Err(LedgerError::classify("known transaction: already withdrawn"));
            }
            lock.value = Amount::zero();
            lock.secret = Some(secret.clone());
            state.tx_secrets.insert(tx_id.0.clone(), secret.clone());
        }
        on_tx_id(tx_id);
        Ok(())
    }

    async fn withdraw_on_behalf(
        &self,
        _participant: &Address,
        secret: &Secret,
        on_tx_id: OnTxId,
    ) -> Result<(), LedgerError> {
        // The assisting party spends from the lock it created itself.
        let local = self.local_address.clone();
        let tx_id = next_tx(&self.ledger.tx_counter, "contract-withdraw-behalf");
        {
            let mut state = self.ledger.state.lock().unwrap();
            let lock = state
                .locks
                .get_mut(&local)
                .ok_or_else(|| LedgerError::new(LedgerErrorKind::Unknown, "no lock found"))?;
            if secret.hash() != lock.secret_hash {
                return Err(LedgerError::classify("execution reverted: bad preimage"));
            }
            lock.value = Amount::zero();
            lock.secret = Some(secret.clone());
            state.tx_secrets.insert(tx_id.0.clone(), secret.clone());
        }
        on_tx_id(tx_id);
        Ok(())
    }

    async fn secret_of(&self, participant: &Address) -> Result<Option<Secret>, LedgerError> {
        let state = self.ledger.state.lock().unwrap();
        Ok(state
            .locks
            .get(participant)
            .and_then(|lock| lock.secret.clone()))
    }

    async fn secret_from_tx(&self, tx_id: &TxId) -> Result<Option<Secret>, LedgerError> {
        let state = self.ledger.state.lock().unwrap();
        Ok(state.tx_secrets.get(&tx_id.0).cloned())
    }

    async fn swap_exists(
        &self,
        owner: &Address,
        _participant: &Address,
    ) -> Result<bool, LedgerError> {
        let state = self.ledger.state.lock().unwrap();
        Ok(state
            .locks
            .get(owner)
            .map(|lock| !lock.refunded && !lock.value.is_zero())
            .unwrap_or(false))
    }

    async fn was_refunded(&self, secret_hash: &SecretHash) -> Result<bool, LedgerError> {
        let state = self.ledger.state.lock().unwrap();
        Ok(state.refunded_hashes.contains(secret_hash))
    }

    async fn refund(&self, _participant: &Address, on_tx_id: OnTxId) -> Result<(), LedgerError> {
        let local = self.local_address.clone();
        let tx_id = next_tx(&self.ledger.tx_counter, "contract-refund");
        {
            let mut state = self.ledger.state.lock().unwrap();
            let lock = state
                .locks
                .get_mut(&local)
                .ok_or_else(|| LedgerError::new(LedgerErrorKind::Unknown, "no lock found"))?;
            let unlock_at = lock.created_at + self.ledger.lock_duration_secs;
            if self.ledger.clock.now() < unlock_at {
                return Err(LedgerError::new(
                    LedgerErrorKind::Unknown,
                    format!("lock refundable at {}", unlock_at),
                ));
            }
            lock.refunded = true;
            lock.value = Amount::zero();
            let hash = lock.secret_hash;
            state.refunded_hashes.push(hash);
        }
        on_tx_id(tx_id);
        Ok(())
    }

    async fn withdraw_gas(&self, _owner: &Address, _secret: &Secret) -> Result<Amount, LedgerError> {
        Ok(amount(1_000))
    }
}

// ============================================================================
// TWO-PARTY SETUP
// ============================================================================

pub fn btc2eth() -> AssetPair {
    AssetPair::new(Asset::new("btc").unwrap(), Asset::new("eth").unwrap()).unwrap()
}

pub fn eth2btc() -> AssetPair {
    AssetPair::new(Asset::new("eth").unwrap(), Asset::new("btc").unwrap()).unwrap()
}

pub fn owner_identity() -> PartyIdentity {
    PartyIdentity {
        script_public_key: pk("owner-script-pk"),
        script_address: addr("owner-script-wallet"),
        contract_address: addr("owner-contract-acct"),
    }
}

pub fn participant_identity() -> PartyIdentity {
    PartyIdentity {
        script_public_key: pk("participant-script-pk"),
        script_address: addr("participant-script-wallet"),
        contract_address: addr("participant-contract-acct"),
    }
}

/// Both parties' sessions wired over one in-memory channel and shared mock
/// ledgers, with both wallets funded for the standard amounts.
pub struct TwoPartySetup {
    pub owner_session: SwapSession,
    pub participant_session: SwapSession,
    pub script_chain: Arc<MockScriptChain>,
    pub contract_ledger: Arc<ContractLedger>,
    pub owner_contract: Arc<MockContractChain>,
    pub participant_contract: Arc<MockContractChain>,
    pub clock: TestClock,
}

pub fn two_party_setup() -> TwoPartySetup {
    let clock = TestClock::new();
    let script_chain = MockScriptChain::new(clock.clone());
    let contract_ledger = ContractLedger::new(clock.clone());
    let (owner_channel, participant_channel) = InMemoryChannel::pair();

    let owner_id = owner_identity();
    let participant_id = participant_identity();

    script_chain.credit_wallet(&owner_id.script_address, amount(OWNER_SELL));
    contract_ledger.credit_wallet(&participant_id.contract_address, amount(OWNER_BUY));

    let owner_contract =
        MockContractChain::new(contract_ledger.clone(), owner_id.contract_address.clone());
    let participant_contract = MockContractChain::new(
        contract_ledger.clone(),
        participant_id.contract_address.clone(),
    );

    let owner_session = SwapSession::new(
        Uuid::new_v4(),
        Role::Owner,
        btc2eth(),
        amount(OWNER_SELL),
        amount(OWNER_BUY),
        owner_id.clone(),
        participant_id.clone(),
        owner_channel,
        script_chain.clone(),
        owner_contract.clone(),
    )
    .unwrap();

    let participant_session = SwapSession::new(
        Uuid::new_v4(),
        Role::Participant,
        eth2btc(),
        amount(OWNER_BUY),
        amount(OWNER_SELL),
        participant_id,
        owner_id,
        participant_channel,
        script_chain.clone(),
        participant_contract.clone(),
    )
    .unwrap();

    TwoPartySetup {
        owner_session,
        participant_session,
        script_chain,
        contract_ledger,
        owner_contract,
        participant_contract,
        clock,
    }
}
