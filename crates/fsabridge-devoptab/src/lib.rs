//! # fsabridge-devoptab
//!
//! POSIX file I/O over the privileged filesystem service.
//!
//! A volume mounted through [`FsaBridge::mount`] becomes a device named by
//! its virtual name. Paths like `storage_sd:/dir/file` then route through
//! the [`Vfs`] to that device, which rebases them onto the volume and
//! translates every service status into an errno.
//!
//! ```ignore
//! let bridge = FsaBridge::new(transport, BridgeConfig::default())?;
//! bridge.mount("storage_sd", Some("/dev/sdcard01"), "/vol/storage_sd")?;
//! let fd = bridge.vfs().open("storage_sd:/README", libc::O_RDONLY, 0)?;
//! ```

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod path;
pub mod registry;
pub mod translate;
pub mod types;

pub use adapter::{FsaDevice, FsaDir, FsaFile, FS_DIRITER_MAGIC};
pub use bridge::{FsaBridge, MAX_MOUNT_PATH_LEN, MAX_NAME_LEN};
pub use config::{BridgeConfig, ConfigError, MAX_CHUNK, MAX_MOUNT_SLOTS};
pub use dispatch::{DeviceOps, DeviceTable, DirState, DirStream, FileState, Vfs, FIRST_FD};
pub use error::{Errno, MochaStatus, MountError, PosixResult};
pub use path::{fix_path, split_device};
pub use registry::{MountEntry, MountInfo, MountRegistry, SlotId};
pub use translate::translate_error;
pub use types::{DirEntry, Stat, StatVfs, Whence};
