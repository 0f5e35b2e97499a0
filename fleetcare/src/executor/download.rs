//! Log download.
//!
//! One archive folder per run, one subfolder per device. Each log root is
//! fetched recursively, then a manifest of the release artifacts found in
//! the payload directory is written next to the logs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use super::payload::{artifact_names, render_manifest};
use super::{Executor, Outcomes, settle};
use crate::archive::{ArchiveNamer, create_device_dir};
use crate::device::Device;
use crate::error::{PreconditionError, SessionError};
use crate::rules::OperationKind;
use crate::transport::pattern::join_remote;
use crate::transport::{SessionFactory, SessionResult, TransferSession};

impl<F: SessionFactory> Executor<F> {
    /// Download logs from every device into a new archive folder.
    ///
    /// The archive folder is created before any session opens; failing to
    /// create it fails the whole operation.
    pub async fn download_logs(
        &self,
        devices: &[Arc<Device>],
        namer: &ArchiveNamer,
        label: Option<&str>,
    ) -> Result<(PathBuf, Outcomes), PreconditionError> {
        info!("Starting log download for {} device(s)", devices.len());
        let archive = namer.create(label)?;

        let results = self
            .fan_out(devices, |device| self.download_device(device, &archive))
            .await;

        info!("Completed log download into {}", archive.display());
        Ok((archive, settle(OperationKind::DownloadLogs, results)))
    }

    async fn download_device(&self, device: &Device, archive: &Path) -> SessionResult<()> {
        let mut session = self.open(device).await?;
        let result = self.collect_logs(&mut session, device, archive).await;
        self.finish(device, session, result).await
    }

    async fn collect_logs(
        &self,
        session: &mut F::Session,
        device: &Device,
        archive: &Path,
    ) -> SessionResult<()> {
        let target = create_device_dir(archive, &device.name).map_err(SessionError::io(archive))?;
        info!("{}: downloading logs into {}", device.name, target.display());

        for root in &self.layout.log_roots {
            let pattern = join_remote(root, "*");
            let fetched = session.get(&pattern, &target, &self.transfer).await?.check()?;
            debug!("{}: {} file(s) from {root}", device.name, fetched.transferred.len());
        }
        info!("{}: logs downloaded", device.name);

        self.write_manifest(session, device, &target).await
    }

    /// Write the sorted artifact names found in the payload directory.
    async fn write_manifest(
        &self,
        session: &mut F::Session,
        device: &Device,
        target: &Path,
    ) -> SessionResult<()> {
        let entries = session.list(&self.layout.payload_dir).await?;
        let names = artifact_names(&entries, |name| self.layout.is_artifact(name));

        let path = target.join(&self.layout.manifest_name);
        tokio::fs::write(&path, render_manifest(&names))
            .await
            .map_err(SessionError::io(&path))?;
        debug!("{}: {} written to {}", device.name, self.layout.manifest_name, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::super::testing::*;
    use crate::archive::ArchiveNamer;
    use crate::error::SessionError;
    use crate::executor::DeviceOutcome;
    use crate::transport::mock::{Call, MockFleet};

    fn fleet() -> MockFleet {
        let fleet = MockFleet::new();
        fleet
            .add_file("d1", "/tmp/logs/app.log", b"app")
            .add_file("d1", "/tmp/logs/crash/core.txt", b"core")
            .add_file("d1", "/mnt/log/persist.log", b"persist")
            .add_file("d1", "/mnt/flash/b.iso", b"b")
            .add_file("d1", "/mnt/flash/B.sig", b"B")
            .add_file("d1", "/mnt/flash/a.iso", b"a")
            .add_file("d1", "/mnt/flash/readme.txt", b"r");
        fleet
    }

    #[tokio::test]
    async fn test_download_and_manifest() {
        let fleet = fleet();
        let out = tempfile::tempdir().unwrap();
        let namer = ArchiveNamer::new(out.path());

        let (archive, outcomes) = executor(&fleet)
            .download_logs(&devices(&["d1"]), &namer, Some("site:7"))
            .await
            .unwrap();

        assert!(archive.starts_with(out.path()));
        assert!(archive.file_name().unwrap().to_string_lossy().ends_with("-site7"));
        assert!(matches!(outcomes[0].1, DeviceOutcome::Success));

        let dev = archive.join("d1");
        assert_eq!(fs::read(dev.join("app.log")).unwrap(), b"app");
        assert_eq!(fs::read(dev.join("crash/core.txt")).unwrap(), b"core");
        assert_eq!(fs::read(dev.join("persist.log")).unwrap(), b"persist");
        assert_eq!(
            fs::read_to_string(dev.join("PAYLOAD.txt")).unwrap(),
            "B.sig\na.iso\nb.iso\n"
        );
        assert_eq!(fleet.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_connection_failure_is_isolated() {
        let fleet = fleet();
        fleet.refuse("d0");
        let out = tempfile::tempdir().unwrap();

        let (archive, outcomes) = executor(&fleet)
            .download_logs(&devices(&["d0", "d1"]), &ArchiveNamer::new(out.path()), None)
            .await
            .unwrap();

        assert!(matches!(&outcomes[0].1, DeviceOutcome::Failed(e) if e.is_connection()));
        assert!(matches!(outcomes[1].1, DeviceOutcome::Success));
        assert!(archive.join("d1/PAYLOAD.txt").exists());
        assert!(!fleet.calls_for("d0").contains(&Call::Close("d0".into())));
    }

    #[tokio::test]
    async fn test_get_failure_stops_device_only() {
        let fleet = fleet();
        fleet
            .fail_get("d1", "/mnt/log/")
            .add_file("d2", "/tmp/logs/app.log", b"d2")
            .add_file("d2", "/mnt/flash/a.iso", b"a");
        let out = tempfile::tempdir().unwrap();

        let (archive, outcomes) = executor(&fleet)
            .download_logs(&devices(&["d1", "d2"]), &ArchiveNamer::new(out.path()), None)
            .await
            .unwrap();

        assert!(matches!(&outcomes[0].1, DeviceOutcome::Failed(SessionError::Transfer { .. })));
        assert!(matches!(outcomes[1].1, DeviceOutcome::Success));
        assert!(!archive.join("d1/PAYLOAD.txt").exists());
        assert!(!fleet.calls_for("d1").contains(&Call::List("d1".into(), "/mnt/flash".into())));
        assert_eq!(fleet.calls_for("d1").last(), Some(&Call::Close("d1".into())));
        assert_eq!(fs::read_to_string(archive.join("d2/PAYLOAD.txt")).unwrap(), "a.iso\n");
    }

    #[tokio::test]
    async fn test_colliding_device_names_get_own_folders() {
        let fleet = MockFleet::new();
        fleet
            .add_file("cab:1", "/tmp/logs/app.log", b"from cab:1")
            .add_file("cab1", "/tmp/logs/app.log", b"from cab1")
            .add_file("..", "/tmp/logs/app.log", b"from dots");
        let out = tempfile::tempdir().unwrap();
        let base = out.path().join("downloads");

        let (archive, outcomes) = executor(&fleet)
            .download_logs(&devices(&["cab:1", "cab1", ".."]), &ArchiveNamer::new(&base), None)
            .await
            .unwrap();

        assert!(outcomes.iter().all(|(_, o)| o.is_success()));
        assert_eq!(fs::read(archive.join("cab1/app.log")).unwrap(), b"from cab:1");
        assert_eq!(fs::read(archive.join("cab1_2/app.log")).unwrap(), b"from cab1");
        assert_eq!(fs::read(archive.join("device/app.log")).unwrap(), b"from dots");
        assert!(!base.join("PAYLOAD.txt").exists());
    }

    #[tokio::test]
    async fn test_archive_failure_stops_before_sessions() {
        let fleet = fleet();
        let out = tempfile::tempdir().unwrap();
        let blocker = out.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        let result = executor(&fleet)
            .download_logs(&devices(&["d1"]), &ArchiveNamer::new(&blocker), None)
            .await;

        assert!(result.is_err());
        assert!(fleet.calls().is_empty());
    }
}
