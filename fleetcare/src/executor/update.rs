//! Payload update on the flash area.
//!
//! Files on the device that master does not have are deleted, then the
//! whole master set is uploaded. Re-uploading current files is harmless, so
//! only the deletions depend on the difference.

use std::path::Path;
use std::sync::Arc;

use log::{error, info};

use super::payload::{MasterSet, PayloadDiff, artifact_names};
use super::{Executor, Outcomes, settle};
use crate::device::Device;
use crate::error::{PreconditionError, SessionError, TransferFailure};
use crate::rules::OperationKind;
use crate::transport::pattern::join_remote;
use crate::transport::{SessionFactory, SessionResult, TransferResult, TransferSession};

impl<F: SessionFactory> Executor<F> {
    /// Bring every device's payload directory in line with the master folder.
    pub async fn update_file_versions(
        &self,
        devices: &[Arc<Device>],
        master_dir: &Path,
    ) -> Result<Outcomes, PreconditionError> {
        let master = MasterSet::read(master_dir, |name| self.layout.is_artifact(name))?;
        info!(
            "Starting file version update with {} master file(s)",
            master.len()
        );

        let results = self
            .fan_out(devices, |device| self.update_device(device, &master))
            .await;

        info!("Completed file version update");
        Ok(settle(OperationKind::UpdateFileVersions, results))
    }

    async fn update_device(&self, device: &Device, master: &MasterSet) -> SessionResult<()> {
        let mut session = self.open(device).await?;
        let result = self.update_on(&mut session, device, master).await;
        self.finish(device, session, result).await
    }

    async fn update_on(
        &self,
        session: &mut F::Session,
        device: &Device,
        master: &MasterSet,
    ) -> SessionResult<()> {
        let flash = &self.layout.payload_dir;

        info!("{}: checking for outdated or missing files", device.name);
        let entries = session.list(flash).await?;
        let on_device = artifact_names(&entries, |name| self.layout.is_artifact(name));
        let diff = PayloadDiff::between(&on_device, master.names());

        if diff.is_empty() {
            info!("{}: no outdated or missing files found", device.name);
            return Ok(());
        }

        self.remount(session, device, flash).await?;

        let mut delete_failures = Vec::new();
        if !diff.outdated.is_empty() {
            info!("{}: deleting outdated files: {:?}", device.name, diff.outdated);
        }
        for name in &diff.outdated {
            let path = join_remote(flash, name);
            if let Err(e) = session.remove(&path).await.and_then(TransferResult::check) {
                error!("{}: could not delete {path}: {e}", device.name);
                delete_failures.push(TransferFailure::new(path, e));
            }
        }

        info!("{}: uploading {} master file(s)", device.name, master.len());
        for name in master.names() {
            let remote = join_remote(flash, name);
            session
                .put(&master.path(name), &remote, &self.transfer)
                .await?
                .check()?;
            info!("{}: uploaded {remote}", device.name);
        }

        if self.operations.verify_after_update {
            self.verify_payload(session, device, master).await?;
        }

        if delete_failures.is_empty() {
            Ok(())
        } else {
            Err(SessionError::Transfer {
                pattern: join_remote(flash, "*"),
                failures: delete_failures,
            })
        }
    }

    /// Check that the payload directory now holds exactly the master set.
    async fn verify_payload(
        &self,
        session: &mut F::Session,
        device: &Device,
        master: &MasterSet,
    ) -> SessionResult<()> {
        let entries = session.list(&self.layout.payload_dir).await?;
        let on_device = artifact_names(&entries, |name| self.layout.is_artifact(name));
        let diff = PayloadDiff::between(&on_device, master.names());

        if !diff.is_empty() {
            return Err(SessionError::Verification {
                missing: diff.missing,
                unexpected: diff.outdated,
            });
        }
        info!("{}: payload verified", device.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::super::testing::*;
    use crate::config::OperationsConfig;
    use crate::error::SessionError;
    use crate::executor::DeviceOutcome;
    use crate::transport::mock::{Call, MockFleet};

    fn master() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("A.iso"), b"new-a").unwrap();
        fs::write(dir.path().join("B.iso"), b"new-b").unwrap();
        dir
    }

    fn fleet() -> MockFleet {
        let fleet = MockFleet::new();
        fleet
            .add_file("d1", "/mnt/flash/A.iso", b"old-a")
            .add_file("d1", "/mnt/flash/C.iso", b"old-c")
            .add_file("d1", "/mnt/flash/boot.cfg", b"keep");
        fleet
    }

    #[tokio::test]
    async fn test_update_matches_master() {
        let fleet = fleet();
        let master = master();

        let outcomes = executor(&fleet)
            .update_file_versions(&devices(&["d1"]), master.path())
            .await
            .unwrap();

        assert!(outcomes[0].1.is_success());
        assert_eq!(fleet.files_in("d1", "/mnt/flash"), vec!["A.iso", "B.iso", "boot.cfg"]);

        let calls = fleet.calls_for("d1");
        let remount = calls
            .iter()
            .position(|c| matches!(c, Call::Exec(_, cmd) if cmd == "mount /mnt/flash -o remount,rw"))
            .unwrap();
        let delete = calls
            .iter()
            .position(|c| *c == Call::Remove("d1".into(), "/mnt/flash/C.iso".into()))
            .unwrap();
        let uploads: Vec<_> = calls.iter().filter(|c| matches!(c, Call::Put(..))).collect();

        assert!(remount < delete);
        // Full master set, not only the missing file.
        assert_eq!(uploads.len(), 2);
    }

    #[tokio::test]
    async fn test_up_to_date_device_untouched() {
        let fleet = MockFleet::new();
        fleet
            .add_file("d1", "/mnt/flash/A.iso", b"a")
            .add_file("d1", "/mnt/flash/B.iso", b"b");
        let master = master();

        let outcomes = executor(&fleet)
            .update_file_versions(&devices(&["d1"]), master.path())
            .await
            .unwrap();

        assert!(outcomes[0].1.is_success());
        assert!(fleet.commands("d1").is_empty());
    }

    #[tokio::test]
    async fn test_failed_remount_blocks_mutation() {
        let fleet = fleet();
        fleet.fail_command("d1", "remount");
        let master = master();

        let outcomes = executor(&fleet)
            .update_file_versions(&devices(&["d1"]), master.path())
            .await
            .unwrap();

        assert!(matches!(&outcomes[0].1, DeviceOutcome::Failed(SessionError::Command { .. })));
        let calls = fleet.calls_for("d1");
        assert!(!calls.iter().any(|c| matches!(c, Call::Remove(..) | Call::Put(..))));
        assert_eq!(calls.last(), Some(&Call::Close("d1".into())));
    }

    #[tokio::test]
    async fn test_delete_failure_continues_then_fails() {
        let fleet = fleet();
        fleet.fail_remove("d1", "C.iso");
        let master = master();

        let exec = executor_with(
            &fleet,
            OperationsConfig {
                verify_after_update: false,
                ..Default::default()
            },
        );
        let outcomes = exec
            .update_file_versions(&devices(&["d1"]), master.path())
            .await
            .unwrap();

        assert!(matches!(&outcomes[0].1, DeviceOutcome::Failed(SessionError::Transfer { .. })));
        assert!(fleet.has_file("d1", "/mnt/flash/B.iso"));
    }

    #[tokio::test]
    async fn test_upload_failure_stops_remaining_uploads() {
        let fleet = fleet();
        fleet.fail_put("d1", "A.iso").add_file("d2", "/mnt/flash/C.iso", b"c");
        let master = master();

        let outcomes = executor(&fleet)
            .update_file_versions(&devices(&["d1", "d2"]), master.path())
            .await
            .unwrap();

        assert!(matches!(&outcomes[0].1, DeviceOutcome::Failed(SessionError::Transfer { .. })));
        let puts: Vec<_> = fleet
            .calls_for("d1")
            .into_iter()
            .filter(|c| matches!(c, Call::Put(..)))
            .collect();
        assert_eq!(puts, vec![Call::Put("d1".into(), "/mnt/flash/A.iso".into())]);
        assert!(!fleet.has_file("d1", "/mnt/flash/B.iso"));
        assert_eq!(fleet.calls_for("d1").last(), Some(&Call::Close("d1".into())));

        assert!(outcomes[1].1.is_success());
        assert_eq!(fleet.files_in("d2", "/mnt/flash"), vec!["A.iso", "B.iso"]);
    }

    #[tokio::test]
    async fn test_verification_catches_leftovers() {
        let fleet = fleet();
        fleet.fail_remove("d1", "C.iso");
        let master = master();

        let outcomes = executor(&fleet)
            .update_file_versions(&devices(&["d1"]), master.path())
            .await
            .unwrap();

        match &outcomes[0].1 {
            DeviceOutcome::Failed(SessionError::Verification { missing, unexpected }) => {
                assert!(missing.is_empty());
                assert_eq!(unexpected, &vec!["C.iso".to_string()]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
