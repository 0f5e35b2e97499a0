//! Operation executor.
//!
//! Every operation follows the same shape per device: open a session, act,
//! close the session on every path. A failure on one device becomes that
//! device's [`DeviceOutcome::Failed`] and never stops the others. Devices of
//! one operation are processed with bounded concurrency and their outcomes
//! come back in device order.
//!
//! The operations themselves live in their own modules:
//!
//! - [`download`]: log collection and the payload manifest
//! - [`compare`]: read-only version comparison
//! - [`update`]: payload update on the flash area
//! - [`nvram`]: NVRAM reset and demo reset

mod compare;
mod download;
mod nvram;
mod outcome;
mod payload;
mod update;

pub use compare::VersionReport;
pub use outcome::{BatchResult, DeviceOutcome, Outcomes};
pub use payload::{MasterSet, PayloadDiff};

use std::future::Future;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};

use crate::config::{OperationsConfig, RemoteLayout};
use crate::device::Device;
use crate::error::SessionError;
use crate::orchestrator::Confirm;
use crate::rules::OperationKind;
use crate::transport::{SessionFactory, SessionResult, TransferOptions, TransferSession};

/// Runs operations against devices through a [`SessionFactory`].
#[derive(Debug)]
pub struct Executor<F> {
    factory: F,
    layout: RemoteLayout,
    operations: OperationsConfig,
    transfer: TransferOptions,
}

impl<F: SessionFactory> Executor<F> {
    pub fn new(factory: F, layout: RemoteLayout, operations: OperationsConfig) -> Self {
        Self {
            factory,
            layout,
            transfer: TransferOptions {
                rate_limit: operations.transfer_rate_limit,
                ..Default::default()
            },
            operations,
        }
    }

    pub fn operations(&self) -> &OperationsConfig {
        &self.operations
    }

    /// Run `per_device` for every device, at most `max_concurrent_devices`
    /// at a time. Results keep device order.
    async fn fan_out<'a, T, P, Fut>(&self, devices: &'a [Arc<Device>], per_device: P) -> Vec<(String, T)>
    where
        P: Fn(&'a Device) -> Fut,
        Fut: Future<Output = T>,
    {
        // Collect first. Mapping the stream over borrowed devices makes the
        // run future non-Send.
        let work: Vec<_> = devices
            .iter()
            .map(|device| {
                let name = device.name.clone();
                let result = per_device(device.as_ref());
                async move { (name, result.await) }
            })
            .collect();

        stream::iter(work)
            .buffered(self.operations.concurrency())
            .collect()
            .await
    }

    async fn open(&self, device: &Device) -> SessionResult<F::Session> {
        debug!("{}: opening session", device.name);
        let session = self.factory.open(device).await?;
        debug!("{}: session open", device.name);
        Ok(session)
    }

    /// Close the session and hand back the action's result.
    async fn finish<T>(
        &self,
        device: &Device,
        session: F::Session,
        result: SessionResult<T>,
    ) -> SessionResult<T> {
        match session.close().await {
            Ok(()) => debug!("{}: session closed", device.name),
            Err(e) => warn!("{}: error while closing session: {e}", device.name),
        }
        result
    }

    /// Remount a mount point read-write. Nothing may be written before this
    /// succeeds.
    async fn remount(
        &self,
        session: &mut F::Session,
        device: &Device,
        mount_point: &str,
    ) -> SessionResult<()> {
        let command = self.layout.remount(mount_point);
        session.exec(&command).await?.check()?;
        info!("{}: remounted {mount_point} read-write", device.name);
        Ok(())
    }

    /// Reboot the device, asking first when configured to.
    ///
    /// Returns whether the reboot was sent. The connection usually drops
    /// before an exit status arrives, which still counts as sent.
    async fn reboot<C: Confirm>(
        &self,
        session: &mut F::Session,
        device: &Device,
        confirm: &C,
    ) -> SessionResult<bool> {
        if self.operations.confirm_before_reboot && !confirm.ask_reboot(&device.name).await {
            info!("{}: reboot declined", device.name);
            return Ok(false);
        }

        info!("{}: initiating reboot", device.name);
        session
            .exec(&self.layout.reboot_command)
            .await?
            .check_sent()?;
        info!("{}: reboot command sent", device.name);
        Ok(true)
    }
}

/// Turn per-device results into outcomes, logging each failure.
fn settle(kind: OperationKind, results: Vec<(String, SessionResult<()>)>) -> Outcomes {
    results
        .into_iter()
        .map(|(name, result)| {
            let outcome = match result {
                Ok(()) => {
                    debug!("{name}: {kind} succeeded");
                    DeviceOutcome::Success
                }
                Err(e) => {
                    log_failure(&name, kind, &e);
                    DeviceOutcome::Failed(e)
                }
            };
            (name, outcome)
        })
        .collect()
}

fn log_failure(device: &str, kind: OperationKind, e: &SessionError) {
    if e.is_connection() {
        error!("{device}: session could not be established, skipping device: {e}");
    } else {
        error!("{device}: {kind} failed: {e}");
    }
}
