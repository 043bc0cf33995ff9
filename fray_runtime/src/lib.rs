//! fray: a worklist-driven, speculative parallel runtime for irregular,
//! amorphous data-parallel workloads.
//!
//! The core is [executor::for_each]: worker threads pull items from a
//! pluggable [worklist::Worklist], run the operator inside a
//! conflict-detecting iteration scope ([conflict]), commit or abort on
//! collision, re-enqueue aborted items under a package-aware escalation
//! policy, and detect global quiescence through a token-ring termination
//! protocol ([substrate::termination]).
//!
//! This crate is a library, not a process: no I/O, no CLI, no persisted
//! state. The only observable side effects are the operator's own writes,
//! the returned [executor::LoopReport], and `tracing` events.

pub mod conflict;
pub mod executor;
mod loom_testing;
pub mod range;
pub mod substrate;
pub mod worklist;

pub use conflict::{Conflict, ConflictContext, IterResult, Lockable, ReadGuard, WriteGuard};
pub use executor::{
    for_each, for_each_in, on_each, plain_op, AbortPolicy, Config, ConfigError, IterAlloc,
    LoopReport, Operator, UserContext,
};
pub use substrate::{Topology, MAX_THREADS};
pub use worklist::{ChunkedWorkStealing, GlobalFifo, Worklist, DEFAULT_CHUNK_SIZE};
