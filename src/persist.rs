//! Flow state persistence contract.
//!
//! The engine reads the persisted state once at construction (resume) and
//! writes after every mutation. Keys are swap ids; entries never interfere
//! across swaps.

use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::engine::FlowState;
use crate::error::StoreError;

/// Keyed read/write access to persisted flow state.
pub trait StateStore: Send + Sync {
    fn get(&self, swap_id: &Uuid) -> Result<Option<FlowState>, StoreError>;
    fn set(&self, swap_id: &Uuid, state: &FlowState) -> Result<(), StoreError>;
}

/// In-memory store, the default for tests and embedding without durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<Uuid, FlowState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, swap_id: &Uuid) -> Result<Option<FlowState>, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StoreError("state store poisoned".into()))?;
        Ok(entries.get(swap_id).cloned())
    }

    fn set(&self, swap_id: &Uuid, state: &FlowState) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError("state store poisoned".into()))?;
        entries.insert(*swap_id, state.clone());
        Ok(())
    }
}
