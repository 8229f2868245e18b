//! Core scheduling and lifecycle subsystem of the foreman daemon.
//!
//! Components talk through one in-process [`bus::EventBus`]; state lives in
//! the repositories from `foreman-db`, mirrored where needed by in-memory
//! structures (dependency graph, priority queue, output buffers) that each
//! belong to exactly one component.

pub mod bus;
pub mod capture;
pub mod graph;
pub mod handlers;
pub mod manager;
pub mod monitor;
pub mod pool;
pub mod queue;
pub mod recovery;
pub mod schedule;
pub mod spawn;
pub mod worktree;

pub use foreman_db::{Error, ErrorCode, Result};
