//! # Fleetcare
//!
//! Async maintenance orchestration for fleets of embedded devices reachable
//! over SFTP.
//!
//! Fleetcare collects logs, compares and updates release payloads, and
//! resets NVRAM across many devices, isolating failures per device and
//! reporting one consolidated result per run.
//!
//! ## Features
//!
//! - Async SSH/SFTP sessions via russh and russh-sftp
//! - Rule-based validation and ordering of operations
//! - Remount-before-write and confirmed reboots on the devices
//! - Bounded-concurrency fan-out across devices
//! - Collision-safe, timestamped archive folders for downloaded logs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fleetcare::{
//!     AppConfig, AutoConfirm, DeviceRegistry, Executor, OperationKind, OperationRequest,
//!     Orchestrator, RunRequest, SftpConnector,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fleetcare::Error> {
//!     let config = AppConfig::from_env()?;
//!     let registry = Arc::new(DeviceRegistry::load(&config.paths.devices_file)?);
//!
//!     let executor = Executor::new(
//!         SftpConnector::new(config.ssh.clone()),
//!         config.remote.clone(),
//!         config.operations.clone(),
//!     );
//!     let orchestrator = Orchestrator::new(executor, registry, config.paths.clone(), AutoConfirm::yes());
//!
//!     let request = RunRequest::new(OperationRequest::new().select(OperationKind::DownloadLogs))
//!         .device("cabinet-01")
//!         .label("site-visit");
//!
//!     let report = orchestrator.run(&request).await;
//!     for (device, outcomes) in report.results.iter() {
//!         for (kind, outcome) in outcomes {
//!             println!("{device}: {kind}: {outcome}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod rules;
pub mod transport;

// Re-export main types for convenience
pub use config::AppConfig;
pub use device::{Device, DeviceRegistry};
pub use error::{Error, Result};
pub use executor::{BatchResult, DeviceOutcome, Executor, VersionReport};
pub use orchestrator::{
    AutoConfirm, Confirm, Orchestrator, Prompt, PromptChannel, Question, RunHandle, RunReport,
    RunRequest, RunStatus,
};
pub use rules::{OperationKind, OperationRequest, RuleSet};
pub use transport::{SessionFactory, SftpConnector, TransferSession};
