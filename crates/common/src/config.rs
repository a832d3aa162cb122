use serde::{Deserialize, Serialize};

/// Global engine/session configuration shared by operator instances.
///
/// Operator-specific knobs (probing scheme, partitioning fanout, join op,
/// streaming mode) live in the per-operator config structs of the execution
/// crate; this struct carries only the engine-wide resource settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Target rows per input/output batch for operators.
    pub batch_size_rows: usize,
    /// Per-operator memory budget enforced by [`crate::memory::MemTracker`].
    pub mem_budget_bytes: usize,
    /// Directory used for spill files.
    pub spill_dir: String,
    /// Byte size of a full-sized row-spool block once a spool has been
    /// promoted past its initial small blocks.
    pub io_block_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: 1024,
            mem_budget_bytes: 512 * 1024 * 1024, // 512MB
            spill_dir: "./riffle_spill".to_string(),
            io_block_bytes: 2 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// An effectively-unlimited budget, for tests and embedded callers.
    pub fn unlimited(spill_dir: impl Into<String>) -> Self {
        Self {
            mem_budget_bytes: usize::MAX,
            spill_dir: spill_dir.into(),
            ..Self::default()
        }
    }
}
