//! Post-mortem analyzer for parallel-program execution traces.
//!
//! Each rank's event log is replayed several times, forward and backward,
//! with analysis metadata exchanged between ranks at the same communication
//! events the original program used. The passes detect synchronization
//! points and wait states, refine them with completion times, and finally
//! propagate delay costs back to the call paths that caused the waiting.
//!
//! Entry point: [`analysis::run_analysis`], one call per rank, with a
//! [`comm::Communicator`] connecting the ranks.

pub mod analysis;
pub mod comm;
pub mod replay;
pub mod report;
pub mod state;
pub mod team;
