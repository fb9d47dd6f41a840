//! Mount and unmount orchestration.
//!
//! A mount claims a registry slot, opens and elevates a dedicated client
//! session, optionally attaches the device, learns its geometry and
//! registers an [`FsaDevice`] under the virtual name. Any failure unwinds
//! everything done so far.

use std::fmt;
use std::sync::{Arc, OnceLock};

use fsabridge_shim::{ClientHandle, FsaClient, FsaTransport, MountFlags, UnmountFlags};

use crate::adapter::FsaDevice;
use crate::config::{BridgeConfig, ConfigError};
use crate::dispatch::{DeviceTable, Vfs};
use crate::error::MountError;
use crate::registry::{MountInfo, MountRegistry, MountSetup, SlotId};

/// Longest accepted virtual name, exclusive.
pub const MAX_NAME_LEN: usize = 32;
/// Longest accepted mount path, exclusive.
pub const MAX_MOUNT_PATH_LEN: usize = 256;

static GLOBAL: OnceLock<FsaBridge> = OnceLock::new();

fn validate_name(name: &str) -> Result<(), MountError> {
    if name.is_empty() || name.len() >= MAX_NAME_LEN || name.contains([':', '/']) {
        return Err(MountError::InvalidArgument(format!("virtual name {name:?}")));
    }
    Ok(())
}

fn validate_mount_path(path: &str) -> Result<(), MountError> {
    if path.is_empty() || path.len() >= MAX_MOUNT_PATH_LEN {
        return Err(MountError::InvalidArgument(format!("mount path {path:?}")));
    }
    Ok(())
}

/// Owns the client, the mount registry and the device table.
pub struct FsaBridge {
    client: FsaClient,
    config: BridgeConfig,
    registry: Arc<MountRegistry>,
    devices: Arc<DeviceTable>,
    vfs: Vfs,
}

impl fmt::Debug for FsaBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsaBridge")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl FsaBridge {
    pub fn new(
        transport: Arc<dyn FsaTransport>,
        config: BridgeConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let devices = Arc::new(DeviceTable::new());
        Ok(Self {
            client: FsaClient::new(transport),
            registry: Arc::new(MountRegistry::new(config.mount_slots)),
            vfs: Vfs::new(devices.clone()),
            devices,
            config,
        })
    }

    /// Install the process-wide bridge. Only the first call succeeds.
    pub fn install_global(bridge: FsaBridge) -> Result<&'static FsaBridge, MountError> {
        GLOBAL.set(bridge).map_err(|_| MountError::AlreadyInitialized)?;
        Self::global()
    }

    /// The process-wide bridge.
    pub fn global() -> Result<&'static FsaBridge, MountError> {
        GLOBAL.get().ok_or(MountError::Uninitialized)
    }

    pub fn client(&self) -> &FsaClient {
        &self.client
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &MountRegistry {
        &self.registry
    }

    pub fn devices(&self) -> &Arc<DeviceTable> {
        &self.devices
    }

    /// Descriptor-based file API over every mounted device.
    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    /// Snapshot of a live mount.
    pub fn mount_info(&self, name: &str) -> Option<MountInfo> {
        self.registry.info(name)
    }

    // ========================================================================
    // Mount
    // ========================================================================

    /// Expose `mount_path` as the device `name`.
    ///
    /// With `device_path`, the device is first attached at `mount_path` and
    /// detached again on unmount. Without it, `mount_path` must already be
    /// mounted.
    #[tracing::instrument(skip(self), name = "bridge.mount")]
    pub fn mount(
        &self,
        name: &str,
        device_path: Option<&str>,
        mount_path: &str,
    ) -> Result<(), MountError> {
        validate_name(name)?;
        validate_mount_path(mount_path)?;

        let slot = self.registry.allocate(name)?;
        let result = self.bring_up(slot, name, device_path, mount_path);
        if result.is_err() {
            self.registry.release(slot);
        }
        result
    }

    fn bring_up(
        &self,
        slot: SlotId,
        name: &str,
        device_path: Option<&str>,
        mount_path: &str,
    ) -> Result<(), MountError> {
        let client = self.client.add_client().map_err(|e| {
            tracing::error!(name, error = %e, "failed to open client session");
            MountError::AddClient(e)
        })?;

        let mut mounted = false;
        let result = self.attach(slot, name, client, device_path, mount_path, &mut mounted);
        if result.is_err() {
            self.abandon(client, mounted.then_some(mount_path));
        }
        result
    }

    fn attach(
        &self,
        slot: SlotId,
        name: &str,
        client: ClientHandle,
        device_path: Option<&str>,
        mount_path: &str,
        mounted: &mut bool,
    ) -> Result<(), MountError> {
        self.client.unlock_client(client).map_err(|e| {
            tracing::error!(name, %client, error = %e, "failed to elevate client");
            MountError::Elevation(e)
        })?;

        if let Some(device) = device_path {
            self.client
                .mount(client, device, mount_path, MountFlags::Global, &[])
                .map_err(|e| {
                    tracing::error!(name, device, mount_path, error = %e, "mount failed");
                    MountError::Mount(e)
                })?;
            *mounted = true;
        }

        if let Err(e) = self.client.change_dir(client, mount_path) {
            tracing::warn!(name, mount_path, error = %e, "failed to change into mount path");
        }

        let info = self.client.get_device_info(client, mount_path).map_err(|e| {
            tracing::error!(name, mount_path, error = %e, "device info query failed");
            MountError::DeviceInfo(e)
        })?;

        let setup = MountSetup {
            client,
            mount_path: mount_path.to_string(),
            mounted: *mounted,
            info,
        };
        let context = self
            .registry
            .prepare(slot, setup)
            .ok_or_else(|| MountError::Register(name.to_string()))?;
        let device = FsaDevice::new(
            name,
            slot,
            self.client.clone(),
            self.registry.clone(),
            context.clone(),
            &self.config,
        );
        if self.devices.add_device(name, Arc::new(device)).is_err() {
            context.lock().live = false;
            tracing::error!(name, "device name already registered");
            return Err(MountError::Register(name.to_string()));
        }
        self.registry.commit(slot);

        tracing::info!(
            name,
            mount_path,
            slot = slot.index,
            sectors = info.device_size_in_sectors,
            sector_size = info.device_sector_size,
            "mounted"
        );
        Ok(())
    }

    /// Best-effort release of a client session and, if given, the mount it made.
    fn abandon(&self, client: ClientHandle, mounted_at: Option<&str>) {
        if let Some(path) = mounted_at {
            if let Err(e) = self.client.unmount(client, path, UnmountFlags::FORCE) {
                tracing::warn!(%client, path, error = %e, "forced unmount failed");
            }
        }
        if let Err(e) = self.client.del_client(client) {
            tracing::warn!(%client, error = %e, "failed to close client session");
        }
    }

    // ========================================================================
    // Unmount
    // ========================================================================

    /// Remove the device `name`, detaching the volume if this bridge
    /// attached it. Waits for in-flight operations on the mount to finish.
    #[tracing::instrument(skip(self), name = "bridge.unmount")]
    pub fn unmount(&self, name: &str) -> Result<(), MountError> {
        let not_found = || MountError::NotFound(name.to_string());
        let slot = self.registry.find_by_name(name).ok_or_else(not_found)?;
        let teardown = self.registry.begin_teardown(slot).ok_or_else(not_found)?;

        self.devices.remove_device(name);
        if let Some(context) = &teardown.context {
            context.lock().live = false;
        }
        if let Some(client) = teardown.client {
            self.abandon(client, teardown.mounted.then_some(teardown.mount_path.as_str()));
        }
        self.registry.release(slot);

        tracing::info!(name, slot = slot.index, "unmounted");
        Ok(())
    }
}
