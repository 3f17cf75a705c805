//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → hand to coordinator
//!
//! Coordinator (coordinator.rs):
//!     Start server → Serve → await signal → Stop (bounded) → Outcome
//!
//! Signals (signals.rs, shutdown.rs):
//!     SIGTERM/SIGINT, programmatic trigger, or first of several → ShutdownSignal
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has a deadline: forced close after the grace period
//! - Only the first signal counts

pub mod coordinator;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use coordinator::{Coordinator, LifecycleError, Outcome, Phase};
pub use shutdown::Shutdown;
pub use signals::{AnyOf, OsSignals, ShutdownSignal, SignalSource};
