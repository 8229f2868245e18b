//! Event handlers: the subscribers that react to bus events.
//!
//! Registration order matters and is fixed by the boot sequence: status
//! updates land first, checkpoints are written second, dependency
//! resolution runs third, queue bookkeeping and worker spawning last.

pub mod checkpoint;
pub mod dependency;
pub mod status;
pub mod worker;

pub use checkpoint::CheckpointHandler;
pub use dependency::DependencyHandler;
pub use status::StatusHandler;
pub use worker::WorkerHandler;
