//! Per-query runtime state shared by operator instances.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use riffle_common::{EngineConfig, Result, RiffleError};

use crate::filter::RuntimeFilterMode;

/// Runtime state an operator instance executes under: batch sizing, spill
/// configuration, the cancellation token, and query options.
///
/// Operators poll [`RuntimeState::check_cancelled`] between batches; child
/// `get_next` calls are the only other suspension points.
#[derive(Debug)]
pub struct RuntimeState {
    /// Engine-level configuration (batch size, memory budget, spill dir).
    pub config: EngineConfig,
    /// Runtime-filter query option.
    pub runtime_filter_mode: RuntimeFilterMode,
    cancelled: AtomicBool,
}

impl RuntimeState {
    /// Create runtime state from an engine configuration.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            runtime_filter_mode: RuntimeFilterMode::Local,
            cancelled: AtomicBool::new(false),
        })
    }

    /// Target rows per batch.
    pub fn batch_size(&self) -> usize {
        self.config.batch_size_rows.max(1)
    }

    /// Signal cancellation; the next between-batch poll returns an error.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Return [`RiffleError::Cancelled`] if the token fired.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RiffleError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_trips_once_set() {
        let state = RuntimeState::new(EngineConfig::default());
        assert!(state.check_cancelled().is_ok());
        state.cancel();
        assert!(matches!(
            state.check_cancelled(),
            Err(RiffleError::Cancelled)
        ));
    }
}
