//! haul-core library.
//!
//! Reconciles a JSON snapshot of fleet data into a document store and
//! verifies the result. Entry points are [`migrate::run`] and
//! [`migrate::verify_only`].
//!
//! # Conventions
//!
//! - **Errors**: fatal run errors are [`error::MigrateError`]; store calls
//!   return [`store::StoreError`]. Per-record failures become tallies.
//! - **Logging**: run events go through [`log::Logger`]; diagnostics use
//!   `tracing` macros directly.

pub mod backup;
pub mod catalog;
pub mod config;
pub mod error;
pub mod indexes;
pub mod log;
pub mod migrate;
pub mod objectmap;
pub mod reconcile;
pub mod report;
pub mod source;
pub mod store;
pub mod verify;

pub use config::{MigrateConfig, resolve_config};
pub use error::{ErrorCode, MigrateError};
pub use migrate::{run, run_with_store, verify_only};
pub use report::{RunReport, RunStatus, VerifyReport};
