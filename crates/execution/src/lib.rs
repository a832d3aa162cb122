//! Partitioned hash aggregation and equi-join core.
//!
//! The operators in this crate group or join streams of tuple rows under a
//! bounded memory budget: input is hash-partitioned into a fixed fanout,
//! partitions spill to disk under pressure, and spilled partitions are
//! recursively repartitioned with independent hash seeds.

pub mod aggregate;
pub mod context;
pub mod exec_node;
pub mod expressions;
pub mod filter;
pub mod hash;
pub mod hash_context;
pub mod hash_table;
pub mod join;
pub mod layout;
pub mod spool;
pub mod value;

// Re-export only what you want at the crate root (no globs).
pub use aggregate::{AggExpr, AggSpec, AggregatorConfig, GroupAggregator};
pub use context::RuntimeState;
pub use exec_node::{MemorySource, RowSource};
pub use expressions::{ColumnRef, ScalarExpr, col};
pub use filter::{BloomFilter, FilterBank, FilterSpec, RuntimeFilterMode};
pub use hash_context::HashContext;
pub use hash_table::HashTable;
pub use join::{EquiJoin, JoinConfig, JoinOp};
pub use spool::{RowSpool, TupleSlot};
pub use value::{DataType, ScalarValue, TupleRow};
