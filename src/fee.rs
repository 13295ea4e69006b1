//! Network fee estimation with an ordered fallback chain.
//!
//! Three strategies are typically configured: primary oracle, secondary
//! oracle, base ledger RPC estimate. The first success short-circuits; each
//! failure is logged and the next strategy tried; exhaustion propagates the
//! last error.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{LedgerError, LedgerErrorKind};
use crate::types::{Amount, FeeSpeed};

/// One fee estimation strategy.
#[async_trait]
pub trait FeeEstimator: Send + Sync {
    /// Strategy name used in logs.
    fn name(&self) -> &str;

    async fn estimate(&self, speed: FeeSpeed) -> Result<Amount, LedgerError>;
}

/// Ordered chain of fee estimation strategies.
pub struct FallbackFeeOracle {
    strategies: Vec<Box<dyn FeeEstimator>>,
}

impl FallbackFeeOracle {
    pub fn new(strategies: Vec<Box<dyn FeeEstimator>>) -> Self {
        Self { strategies }
    }

    /// Tries each strategy in order, returning the first successful estimate.
    pub async fn estimate(&self, speed: FeeSpeed) -> Result<Amount, LedgerError> {
        let mut last_error = LedgerError::new(
            LedgerErrorKind::Unknown,
            "no fee estimation strategies configured",
        );

        for strategy in &self.strategies {
            match strategy.estimate(speed).await {
                Ok(fee) => {
                    debug!(strategy = strategy.name(), %fee, "fee estimate");
                    return Ok(fee);
                }
                Err(err) => {
                    warn!(strategy = strategy.name(), %err, "fee estimation failed, trying next");
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }
}
