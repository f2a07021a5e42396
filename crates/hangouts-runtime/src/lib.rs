//! # Hangouts Runtime
//!
//! Wires the components together once at startup ([`AppContext`]) and runs
//! them as supervised tasks sharing one cancellation token ([`Supervisor`]).

pub mod context;
pub mod supervisor;

pub use context::AppContext;
pub use supervisor::{Supervisor, SupervisorReport, TaskOutcome};
