//! Orchestration of a maintenance run.
//!
//! A run validates the requested operations, then executes them one at a
//! time in rule order over the selected devices:
//!
//! ```text
//! Idle -> Validating -> Executing(op 1) -> ... -> Executing(op n) -> Complete
//!                  \                \                       \
//!                   Failed           Aborted / Failed        Aborted / Failed
//! ```
//!
//! Device-scoped failures stay inside the [`BatchResult`]. Only run-scoped
//! failures (validation, unreadable master folder, archive folder) end the
//! run as [`RunStatus::Failed`]. Declining a continue prompt ends it as
//! [`RunStatus::Aborted`]; work already done stands.

pub mod prompt;

pub use prompt::{AutoConfirm, Confirm, Prompt, PromptChannel, Question};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::archive::ArchiveNamer;
use crate::config::PathsConfig;
use crate::device::{Device, DeviceRegistry};
use crate::error::{Error, PreconditionError, Result};
use crate::executor::{BatchResult, DeviceOutcome, Executor, VersionReport};
use crate::rules::{OperationKind, OperationRequest, RuleSet};
use crate::transport::SessionFactory;

/// Reason recorded for selected devices the registry does not know.
pub const UNKNOWN_DEVICE: &str = "not in device registry";

/// What to run, and on which devices.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Selected operations.
    pub operations: OperationRequest,

    /// Selected device names.
    pub devices: Vec<String>,

    /// Optional label appended to the archive folder name.
    pub label: Option<String>,
}

impl RunRequest {
    pub fn new(operations: OperationRequest) -> Self {
        Self {
            operations,
            ..Default::default()
        }
    }

    pub fn device(mut self, name: impl Into<String>) -> Self {
        self.devices.push(name.into());
        self
    }

    pub fn devices<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.devices.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Where the run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Validating,
    Executing(OperationKind),
    Complete,
    Aborted,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Validating => write!(f, "validating"),
            RunState::Executing(kind) => write!(f, "executing '{kind}'"),
            RunState::Complete => write!(f, "complete"),
            RunState::Aborted => write!(f, "aborted"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunStatus {
    /// Every operation ran. Individual devices may still have failed.
    Complete,

    /// The user declined to start an operation.
    Aborted { before: OperationKind },

    /// A run-scoped error stopped the run.
    Failed(Error),
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    pub status: RunStatus,

    /// Validated operations in execution order.
    pub operations: Vec<OperationKind>,

    pub results: BatchResult,

    /// Set when compare_file_versions ran.
    pub versions: Option<VersionReport>,

    /// Set when download_logs created an archive folder.
    pub archive: Option<PathBuf>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            status: RunStatus::Complete,
            operations: Vec::new(),
            results: BatchResult::new(),
            versions: None,
            archive: None,
        }
    }

    /// Complete with no failed device.
    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Complete) && !self.results.has_failures()
    }
}

/// Drives runs over a device registry.
pub struct Orchestrator<F, C> {
    executor: Executor<F>,
    registry: Arc<DeviceRegistry>,
    rules: RuleSet,
    paths: PathsConfig,
    confirm: C,
}

impl<F: SessionFactory, C: Confirm> Orchestrator<F, C> {
    pub fn new(executor: Executor<F>, registry: Arc<DeviceRegistry>, paths: PathsConfig, confirm: C) -> Self {
        Self {
            executor,
            registry,
            rules: RuleSet::default(),
            paths,
            confirm,
        }
    }

    /// Replace the standard rule set.
    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Execute a run and return its report.
    pub async fn run(&self, request: &RunRequest) -> RunReport {
        let mut report = RunReport::new();
        let mut state = RunState::Idle;

        transition(&mut state, RunState::Validating);
        let operations = match self.rules.validate(&request.operations) {
            Ok(operations) => operations,
            Err(e) => {
                error!("Validation error: {e}");
                transition(&mut state, RunState::Failed);
                report.status = RunStatus::Failed(e.into());
                return report;
            }
        };
        report.operations = operations.clone();

        let resolution = self.registry.resolve(request.devices.as_slice());
        if resolution.devices.is_empty() {
            warn!("No known device selected");
        }
        info!(
            "Running {} operation(s) on {} device(s)",
            operations.len(),
            resolution.devices.len()
        );

        for kind in operations {
            if self.executor.operations().confirm_each_operation
                && !self.confirm.ask_continue(kind).await
            {
                info!("Operation '{kind}' declined, stopping run");
                transition(&mut state, RunState::Aborted);
                report.status = RunStatus::Aborted { before: kind };
                return report;
            }

            transition(&mut state, RunState::Executing(kind));
            if let Err(e) = self.execute(kind, &resolution.devices, request, &mut report).await {
                error!("'{kind}' stopped the run: {e}");
                transition(&mut state, RunState::Failed);
                report.status = RunStatus::Failed(e.into());
                return report;
            }

            for name in &resolution.unknown {
                report
                    .results
                    .record(name, kind, DeviceOutcome::Skipped(UNKNOWN_DEVICE.to_string()));
            }
        }

        transition(&mut state, RunState::Complete);
        report
    }

    /// Execute a run and hand its report to `on_complete`.
    ///
    /// `on_complete` is called exactly once, whatever way the run ends.
    pub async fn run_with_completion<K>(&self, request: &RunRequest, on_complete: K)
    where
        K: FnOnce(RunReport),
    {
        let report = self.run(request).await;
        on_complete(report);
    }

    async fn execute(
        &self,
        kind: OperationKind,
        devices: &[Arc<Device>],
        request: &RunRequest,
        report: &mut RunReport,
    ) -> std::result::Result<(), PreconditionError> {
        let outcomes = match kind {
            OperationKind::CompareFileVersions => {
                let (versions, outcomes) = self
                    .executor
                    .compare_file_versions(devices, &self.paths.master_payload_dir)
                    .await?;
                report.versions = Some(versions);
                outcomes
            }
            OperationKind::DownloadLogs => {
                let namer = ArchiveNamer::new(&self.paths.download_dir);
                let (archive, outcomes) = self
                    .executor
                    .download_logs(devices, &namer, request.label.as_deref())
                    .await?;
                report.archive = Some(archive);
                outcomes
            }
            OperationKind::UpdateFileVersions => {
                self.executor
                    .update_file_versions(devices, &self.paths.master_payload_dir)
                    .await?
            }
            OperationKind::NvramReset => self.executor.nvram_reset(devices, &self.confirm).await,
            OperationKind::NvramDemoReset => {
                self.executor
                    .nvram_demo_reset(devices, &self.paths.local_demo_file, &self.confirm)
                    .await
            }
        };

        report.results.record_all(kind, outcomes);
        Ok(())
    }
}

impl<F, C> Orchestrator<F, C>
where
    F: SessionFactory + 'static,
    C: Confirm + 'static,
{
    /// Run on a background task. The report arrives through the handle.
    pub fn spawn(self, request: RunRequest) -> RunHandle {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let report = self.run(&request).await;
            if tx.send(report).is_err() {
                debug!("Run finished but nobody is waiting for the report");
            }
        });
        RunHandle { rx, task }
    }
}

/// Handle to a run executing on a background task.
#[derive(Debug)]
pub struct RunHandle {
    rx: oneshot::Receiver<RunReport>,
    task: JoinHandle<()>,
}

impl RunHandle {
    /// Wait for the report.
    pub async fn wait(self) -> Result<RunReport> {
        match self.rx.await {
            Ok(report) => Ok(report),
            Err(_) => match self.task.await {
                Err(e) if e.is_panic() => Err(Error::Worker("run task panicked".to_string())),
                Err(e) => Err(Error::Worker(e.to_string())),
                Ok(()) => Err(Error::Worker("run task ended without a report".to_string())),
            },
        }
    }
}

fn transition(state: &mut RunState, next: RunState) {
    debug!("Run state: {state} -> {next}");
    *state = next;
}
