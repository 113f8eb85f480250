//! # saferun-core
//!
//! Policy model, execution contract, and configuration for saferun.
//!
//! This crate holds everything that is pure data or pure validation:
//!
//! - **Policy**: which imports, builtins, and globals a snippet may reach
//! - **Gate**: the closed symbol tables a worker enforces, and the admitted namespace
//! - **Contract**: the request, wire payload, worker envelope, and uniform result
//! - **Packages**: pinned package validation and content-hash image keys
//! - **Paths**: default on-disk locations

pub mod contract;
pub mod error;
pub mod gate;
pub mod packages;
pub mod paths;
pub mod policy;

// Re-exports for convenience
pub use contract::{ExecutionRequest, ExecutionResult, WorkerEnvelope, WorkerPayload};
pub use error::ConfigError;
pub use gate::{AdmittedNamespace, CapabilityGate, SymbolRule};
pub use policy::{Policy, PolicyMode};
