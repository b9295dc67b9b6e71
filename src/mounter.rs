//! Filesystem mount capability.
//!
//! [`Mounter`] covers everything the staging state machine does to a block
//! device once multipath has mapped it: inspect, format, mount at the
//! staging path, and bind-mount into workload paths.  [`HostMounter`] is the
//! production implementation; bind mounts and unmounts go through `nix`
//! syscalls, formatting and device inspection shell out through a
//! [`CommandRunner`].

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::attacher::CommandRunner;
use crate::error::CsiError;

/// The one filesystem type this plugin formats and mounts.
pub const SUPPORTED_FS_TYPE: &str = "ext4";
/// Directory where multipath surfaces mapped device nodes.
pub const DEVICE_MAPPER_DIR: &str = "/dev/mapper";

const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Block-device facts from `lsblk`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Kernel device name.
    pub name: String,
    /// Detected filesystem type; `None` on an unformatted device.
    #[serde(rename = "fstype", default)]
    pub fs_type: Option<String>,
    /// Filesystem label.
    #[serde(default)]
    pub label: Option<String>,
    /// Filesystem UUID.
    #[serde(default)]
    pub uuid: Option<String>,
    /// Current mountpoint, if mounted.
    #[serde(default)]
    pub mountpoint: Option<String>,
}

/// `lsblk -J` top-level document.
#[derive(Debug, Default, Deserialize)]
struct BlockDeviceList {
    #[serde(rename = "blockdevices", default)]
    block_devices: Vec<BlockInfo>,
}

/// Capability for mount, unmount, format, and block-device inspection.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Bind-mount `src` at `target`, creating `target` when absent.
    async fn bindmount(&self, src: &str, target: &str, read_only: bool) -> Result<(), CsiError>;

    /// Unmount `target`.  A target that is not mounted is success.
    async fn unmount(&self, target: &str) -> Result<(), CsiError>;

    /// Mount the mapped device for `alias` at `target` with the supported
    /// filesystem type, creating `target` when absent.
    async fn mount_mapped_device(&self, alias: &str, target: &str) -> Result<(), CsiError>;

    /// Format the mapped device for `alias` with the supported filesystem
    /// type.  Callers must only invoke this on unformatted devices.
    async fn format_mapped_device(&self, alias: &str) -> Result<(), CsiError>;

    /// Inspect the mapped device for `alias`.  A missing device node is the
    /// distinct [`CsiError::DeviceNotFound`]; inspection failures are not.
    async fn get_mapped_device(&self, alias: &str) -> Result<BlockInfo, CsiError>;
}

/// The production [`Mounter`].
pub struct HostMounter<R> {
    runner: R,
    mapper_dir: PathBuf,
    proc_mounts: PathBuf,
}

impl<R: CommandRunner> HostMounter<R> {
    /// Mounter using the fixed host paths.
    pub fn new(runner: R) -> Self {
        Self::with_paths(runner, DEVICE_MAPPER_DIR, PROC_MOUNTS)
    }

    /// Mounter with alternate paths, for tests.
    pub fn with_paths(
        runner: R,
        mapper_dir: impl Into<PathBuf>,
        proc_mounts: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            mapper_dir: mapper_dir.into(),
            proc_mounts: proc_mounts.into(),
        }
    }

    fn mapped_device_path(&self, alias: &str) -> PathBuf {
        self.mapper_dir.join(alias)
    }

    /// Whether `path` is currently listed as a mount point.
    ///
    /// Note: the mounts table uses octal escapes (`\040` for space, etc.).
    /// CSI target paths must not contain whitespace, so direct string
    /// comparison is safe here.
    async fn is_mountpoint(&self, path: &str) -> bool {
        let contents = match tokio::fs::read_to_string(&self.proc_mounts).await {
            Ok(c) => c,
            Err(_) => return false,
        };
        // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
        contents
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(path))
    }
}

#[async_trait]
impl<R: CommandRunner> Mounter for HostMounter<R> {
    async fn bindmount(&self, src: &str, target: &str, read_only: bool) -> Result<(), CsiError> {
        if tokio::fs::metadata(target).await.is_err() {
            tokio::fs::create_dir_all(target)
                .await
                .map_err(|e| CsiError::MountFailed {
                    path: target.to_owned(),
                    reason: e.to_string(),
                })?;
        }
        // The target must be stat-able before mounting over it.
        tokio::fs::metadata(target)
            .await
            .map_err(|e| CsiError::MountFailed {
                path: target.to_owned(),
                reason: format!("stat: {e}"),
            })?;

        let mut flags = nix::mount::MsFlags::MS_BIND;
        if read_only {
            flags |= nix::mount::MsFlags::MS_RDONLY;
        }
        nix::mount::mount(Some(src), target, None::<&str>, flags, None::<&str>).map_err(|e| {
            CsiError::MountFailed {
                path: target.to_owned(),
                reason: e.to_string(),
            }
        })?;

        // Some kernels ignore MS_RDONLY on the initial bind-mount call; a
        // separate remount is required to actually enforce read-only access.
        if read_only {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                nix::mount::MsFlags::MS_BIND
                    | nix::mount::MsFlags::MS_REMOUNT
                    | nix::mount::MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| CsiError::MountFailed {
                path: target.to_owned(),
                reason: format!("remount read-only: {e}"),
            })?;
        }

        info!(src, target, read_only, "bind mount complete");
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), CsiError> {
        if !self.is_mountpoint(target).await {
            debug!(target, "not mounted, nothing to unmount");
            return Ok(());
        }
        nix::mount::umount(target).map_err(|e| CsiError::UnmountFailed {
            path: target.to_owned(),
            reason: e.to_string(),
        })?;
        info!(target, "unmounted");
        Ok(())
    }

    async fn mount_mapped_device(&self, alias: &str, target: &str) -> Result<(), CsiError> {
        let device = self.mapped_device_path(alias);
        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| CsiError::MountFailed {
                path: target.to_owned(),
                reason: e.to_string(),
            })?;
        self.runner
            .run(
                "mount",
                &[
                    "-t",
                    SUPPORTED_FS_TYPE,
                    "--source",
                    &device.to_string_lossy(),
                    "--target",
                    target,
                ],
            )
            .await?;
        info!(alias, target, "mapped device mounted");
        Ok(())
    }

    async fn format_mapped_device(&self, alias: &str) -> Result<(), CsiError> {
        let device = self.mapped_device_path(alias);
        let command = format!("mkfs.{SUPPORTED_FS_TYPE}");
        self.runner
            .run(&command, &["-F", &device.to_string_lossy()])
            .await?;
        info!(alias, "mapped device formatted");
        Ok(())
    }

    async fn get_mapped_device(&self, alias: &str) -> Result<BlockInfo, CsiError> {
        let device = self.mapped_device_path(alias);
        // Distinguish "no device node at all" before invoking the
        // inspection tool.
        if tokio::fs::metadata(&device).await.is_err() {
            return Err(CsiError::DeviceNotFound(device.display().to_string()));
        }

        let out = self
            .runner
            .run(
                "lsblk",
                &[
                    "-J",
                    "-i",
                    "--output",
                    "NAME,FSTYPE,LABEL,UUID,MOUNTPOINT",
                    &device.to_string_lossy(),
                ],
            )
            .await?;
        let devices: BlockDeviceList = serde_json::from_str(&out)
            .map_err(|e| CsiError::Internal(format!("cannot parse lsblk output: {e}")))?;

        devices
            .block_devices
            .into_iter()
            .find(|info| info.name == alias)
            .ok_or_else(|| {
                CsiError::Internal(format!("device {alias} not in lsblk output"))
            })
    }
}
