//! NVRAM reset and demo reset.

use std::path::Path;
use std::sync::Arc;

use log::info;

use super::{Executor, Outcomes, settle};
use crate::device::Device;
use crate::error::SessionError;
use crate::orchestrator::Confirm;
use crate::rules::OperationKind;
use crate::transport::pattern::join_remote;
use crate::transport::{SessionFactory, SessionResult, TransferSession};

impl<F: SessionFactory> Executor<F> {
    /// Wipe the NVRAM directory on every device and reboot it.
    pub async fn nvram_reset<C: Confirm>(&self, devices: &[Arc<Device>], confirm: &C) -> Outcomes {
        info!("Starting NVRAM reset");
        let results = self
            .fan_out(devices, |device| self.nvram_reset_device(device, confirm))
            .await;
        info!("Completed NVRAM reset");
        settle(OperationKind::NvramReset, results)
    }

    /// Put every device's NVRAM into demo configuration and reboot it.
    ///
    /// Devices that already carry the demo sentinel keep only that file.
    /// Devices without it get the local demo file uploaded; if that file is
    /// missing locally the device fails without being touched.
    pub async fn nvram_demo_reset<C: Confirm>(
        &self,
        devices: &[Arc<Device>],
        demo_file: &Path,
        confirm: &C,
    ) -> Outcomes {
        info!("Starting NVRAM demo reset");
        let results = self
            .fan_out(devices, |device| {
                self.demo_reset_device(device, demo_file, confirm)
            })
            .await;
        info!("Completed NVRAM demo reset");
        settle(OperationKind::NvramDemoReset, results)
    }

    async fn nvram_reset_device<C: Confirm>(&self, device: &Device, confirm: &C) -> SessionResult<()> {
        let mut session = self.open(device).await?;
        let result = self.nvram_reset_on(&mut session, device, confirm).await;
        self.finish(device, session, result).await
    }

    async fn nvram_reset_on<C: Confirm>(
        &self,
        session: &mut F::Session,
        device: &Device,
        confirm: &C,
    ) -> SessionResult<()> {
        let nvram = &self.layout.nvram_dir;
        self.remount(session, device, nvram).await?;

        info!("{}: resetting NVRAM at {nvram}", device.name);
        let removed = session.remove(&join_remote(nvram, "*")).await?.check()?;
        info!("{}: NVRAM reset, {} entries removed", device.name, removed.transferred.len());

        self.reboot(session, device, confirm).await?;
        Ok(())
    }

    async fn demo_reset_device<C: Confirm>(
        &self,
        device: &Device,
        demo_file: &Path,
        confirm: &C,
    ) -> SessionResult<()> {
        let mut session = self.open(device).await?;
        let result = self.demo_reset_on(&mut session, device, demo_file, confirm).await;
        self.finish(device, session, result).await
    }

    async fn demo_reset_on<C: Confirm>(
        &self,
        session: &mut F::Session,
        device: &Device,
        demo_file: &Path,
        confirm: &C,
    ) -> SessionResult<()> {
        let nvram = &self.layout.nvram_dir;
        let sentinel = &self.layout.demo_file_name;

        info!("{}: checking for '{sentinel}'", device.name);
        let entries = session.list(nvram).await?;

        if entries.iter().any(|entry| entry.name == *sentinel) {
            info!("{}: '{sentinel}' found, deleting other files", device.name);
            self.remount(session, device, nvram).await?;
            for entry in entries.iter().filter(|entry| entry.name != *sentinel) {
                let path = join_remote(nvram, &entry.name);
                session.remove(&path).await?.check()?;
                info!("{}: deleted {path}", device.name);
            }
        } else {
            info!("{}: '{sentinel}' not found, uploading {}", device.name, demo_file.display());
            let present = tokio::fs::metadata(demo_file)
                .await
                .is_ok_and(|meta| meta.is_file());
            if !present {
                return Err(SessionError::MissingDemoFile(demo_file.to_path_buf()));
            }

            self.remount(session, device, nvram).await?;
            let remote = join_remote(nvram, sentinel);
            session.put(demo_file, &remote, &self.transfer).await?.check()?;
            info!("{}: '{sentinel}' uploaded", device.name);
        }

        info!("{}: NVRAM demo reset completed", device.name);
        self.reboot(session, device, confirm).await?;
        Ok(())
    }
}
