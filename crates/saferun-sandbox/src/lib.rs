//! Isolated execution engines for saferun.
//!
//! Every snippet runs in a fresh child process driven by a small Python
//! shim that enforces the capability gate before the snippet's first line:
//! - **Local engine**: one provisioned virtual environment on disk
//! - **Container engine**: a pool of warm, hardened docker containers
//! - **Façade**: [`run`] resolves the policy and dispatches to one engine
//!
//! Wall time, address space, and output size are bounded by the parent
//! regardless of what the snippet does.

pub mod container;
pub mod engine;
pub mod error;
pub mod limits;
pub mod local;
pub mod runner;
pub mod worker;

pub use container::{CleanupSummary, ContainerEngine, ContainerEngineBuilder, DaemonTarget, ManagedContainer};
pub use engine::ExecutionEngine;
pub use error::SandboxError;
pub use limits::ResourceLimits;
pub use local::{EnvCreator, LocalEngine, LocalEngineBuilder};
pub use runner::{run, run_blocking, RunOptions};
pub use worker::{ProcessWorker, WorkerCommand, WorkerRun};

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
