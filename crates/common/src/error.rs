use thiserror::Error;

/// Canonical Riffle error taxonomy used across crates.
///
/// Classification guidance:
/// - [`RiffleError::MemoryBudget`]: a budget reservation was denied; the
///   operator is expected to spill a partition and retry
/// - [`RiffleError::MemoryLimitTooLow`]: no partition left to spill; terminal
/// - [`RiffleError::MaxPartitionDepth`]: repartitioning recursed to the
///   configured cap without fitting; terminal
/// - [`RiffleError::RepartitionIneffective`]: a repartition pass did not
///   shrink the largest spilled partition (pathological key skew); terminal
/// - [`RiffleError::Unsupported`]: keys or aggregates the core cannot handle
/// - [`RiffleError::Execution`]: child-operator or expression failures,
///   propagated untouched
/// - [`RiffleError::Cancelled`]: the runtime cancellation token fired
/// - [`RiffleError::Io`]: raw filesystem IO failures from spill paths
#[derive(Debug, Error)]
pub enum RiffleError {
    /// Recoverable memory-budget denial. The detail names the operator and
    /// the allocation that failed.
    #[error("memory budget exceeded: {0}")]
    MemoryBudget(String),

    /// No resident partition remained to spill; the query memory limit is
    /// below the operator minimum.
    #[error("memory limit too low: {0}")]
    MemoryLimitTooLow(String),

    /// Partition recursion depth hit the configured maximum. Indicates keys
    /// with near-zero entropy.
    #[error("max partition depth reached: {0}")]
    MaxPartitionDepth(String),

    /// Repartitioning failed to shrink the largest spilled partition.
    #[error("repartitioning ineffective: {0}")]
    RepartitionIneffective(String),

    /// Valid request for a key/aggregate shape the core does not handle.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Runtime execution failure in a child operator or expression.
    #[error("execution error: {0}")]
    Execution(String),

    /// The query was cancelled between batches.
    #[error("cancelled")]
    Cancelled,

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RiffleError {
    /// Whether the operator may recover by spilling a partition and retrying.
    pub fn is_recoverable_oom(&self) -> bool {
        matches!(self, Self::MemoryBudget(_))
    }
}

/// Standard Riffle result alias.
pub type Result<T> = std::result::Result<T, RiffleError>;
