//! Flow registry: maps a directed asset pair to the factory that builds its
//! flow. Resolution happens once, at session setup; an unknown pair is a
//! construction error, never a runtime fallback.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SwapConfig;
use crate::error::SwapError;
use crate::persist::StateStore;
use crate::session::SwapSession;
use crate::types::AssetPair;

use super::SwapFlow;

/// Builds one flow instance for a session.
pub type FlowFactory =
    Box<dyn Fn(SwapSession, Arc<dyn StateStore>, SwapConfig) -> Result<Arc<dyn SwapFlow>, SwapError> + Send + Sync>;

/// Registered flow factories keyed by directed pair.
#[derive(Default)]
pub struct FlowRegistry {
    factories: HashMap<AssetPair, FlowFactory>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for a directed pair, replacing any previous one.
    pub fn register(&mut self, pair: AssetPair, factory: FlowFactory) {
        self.factories.insert(pair, factory);
    }

    pub fn is_registered(&self, pair: &AssetPair) -> bool {
        self.factories.contains_key(pair)
    }

    /// Builds the flow for a session, failing fast on an unregistered pair.
    pub fn create(
        &self,
        session: SwapSession,
        store: Arc<dyn StateStore>,
        config: SwapConfig,
    ) -> Result<Arc<dyn SwapFlow>, SwapError> {
        let factory = self.factories.get(&session.pair).ok_or_else(|| {
            SwapError::Construction(format!("no flow registered for pair {}", session.pair))
        })?;
        factory(session, store, config)
    }
}
