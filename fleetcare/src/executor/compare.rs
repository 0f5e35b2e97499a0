//! Read-only comparison of device payloads against the master set.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use log::{info, warn};

use super::payload::{MasterSet, PayloadDiff, artifact_names};
use super::{Executor, Outcomes, settle};
use crate::device::Device;
use crate::error::PreconditionError;
use crate::rules::OperationKind;
use crate::transport::{SessionFactory, SessionResult, TransferSession};

/// Consolidated result of a version comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionReport {
    /// Device name to the files it carries that master does not.
    /// Only devices with such files appear.
    pub outdated: IndexMap<String, Vec<String>>,

    /// Sorted master file names.
    pub master: Vec<String>,

    /// Devices whose payload could not be listed, in device order.
    pub not_compared: Vec<String>,
}

impl VersionReport {
    /// No outdated files, and every device was compared.
    pub fn is_up_to_date(&self) -> bool {
        self.outdated.is_empty() && self.not_compared.is_empty()
    }
}

impl fmt::Display for VersionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_up_to_date() {
            return writeln!(f, "All files are up-to-date.");
        }

        if self.outdated.is_empty() {
            writeln!(f, "No outdated files found on the compared devices.")?;
        } else {
            writeln!(f, "The following devices have outdated files:")?;
            for (device, files) in &self.outdated {
                writeln!(f)?;
                writeln!(f, "{device}:")?;
                for file in files {
                    writeln!(f, "  {file}")?;
                }
            }
            writeln!(f)?;
            writeln!(f, "Master files:")?;
            for file in &self.master {
                writeln!(f, "  {file}")?;
            }
        }

        if !self.not_compared.is_empty() {
            writeln!(f)?;
            writeln!(f, "Could not compare:")?;
            for device in &self.not_compared {
                writeln!(f, "  {device}")?;
            }
        }
        Ok(())
    }
}

impl<F: SessionFactory> Executor<F> {
    /// Compare every device's payload directory with the master folder.
    ///
    /// The master folder is read once up front; if it is unreadable no
    /// device is contacted.
    pub async fn compare_file_versions(
        &self,
        devices: &[Arc<Device>],
        master_dir: &Path,
    ) -> Result<(VersionReport, Outcomes), PreconditionError> {
        let master = MasterSet::read(master_dir, |name| self.layout.is_compared(name))?;
        info!(
            "Starting file version comparison against {} master file(s)",
            master.len()
        );

        let results = self
            .fan_out(devices, |device| self.compare_device(device, &master))
            .await;

        let mut report = VersionReport {
            master: master.names().iter().cloned().collect(),
            ..Default::default()
        };
        let results: Vec<_> = results
            .into_iter()
            .map(|(name, result)| {
                let result = match result {
                    Ok(outdated) => {
                        if !outdated.is_empty() {
                            report.outdated.insert(name.clone(), outdated);
                        }
                        Ok(())
                    }
                    Err(e) => {
                        report.not_compared.push(name.clone());
                        Err(e)
                    }
                };
                (name, result)
            })
            .collect();

        info!("Completed file version comparison");
        Ok((report, settle(OperationKind::CompareFileVersions, results)))
    }

    async fn compare_device(&self, device: &Device, master: &MasterSet) -> SessionResult<Vec<String>> {
        let mut session = self.open(device).await?;
        let result = self.outdated_on(&mut session, device, master).await;
        self.finish(device, session, result).await
    }

    async fn outdated_on(
        &self,
        session: &mut F::Session,
        device: &Device,
        master: &MasterSet,
    ) -> SessionResult<Vec<String>> {
        let entries = session.list(&self.layout.payload_dir).await?;
        let on_device = artifact_names(&entries, |name| self.layout.is_compared(name));
        let outdated = PayloadDiff::between(&on_device, master.names()).outdated;

        if outdated.is_empty() {
            info!("{}: all files are up-to-date", device.name);
        } else {
            warn!("{}: outdated files found: {outdated:?}", device.name);
        }
        Ok(outdated)
    }
}
