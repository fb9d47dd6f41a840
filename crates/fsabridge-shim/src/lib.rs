//! Client side of the privileged filesystem service.
//!
//! Every command is marshaled into an aligned [`ShimBuffer`] and handed to an
//! [`FsaTransport`]. [`FsaClient`] wraps that in typed calls: sessions,
//! volumes, namespace, directories, files, and raw block devices.
//!
//! ```ignore
//! let fsa = FsaClient::new(transport);
//! let client = fsa.add_client()?;
//! fsa.unlock_client(client)?;
//! fsa.mount(client, "/dev/sdcard01", "/vol/storage_sd", MountFlags::Global, &[])?;
//! ```

pub mod aligned;
pub mod buffer;
pub mod client;
pub mod command;
pub mod status;
pub mod testing;
pub mod transport;
pub mod types;

pub use aligned::{AlignedBuffer, StagedRead, StagedWrite};
pub use buffer::{FsaRequest, FsaResponse, IoVector, ShimBuffer, VectorLayout};
pub use client::{validate_mount_paths, FsaClient, DEVICE_PREFIX, STORAGE_PREFIX, VOLUME_PREFIX};
pub use command::{FsaCommand, IpcRequestType, MountFlags, QueryType, ReadWriteFlags, UnmountFlags};
pub use status::{check, FsaStatus, MochaError, ShimError, ShimResult};
pub use transport::{FsaTransport, Payload};
pub use types::{
    ClientHandle, DeviceInfo, DirHandle, FileHandle, FsaDirEntry, FsaMode, FsaStat, FsaTime,
    RawHandle, StatFlags,
};

/// Alignment required of shims and bulk data segments.
pub const SHIM_ALIGNMENT: usize = 0x40;

/// Longest path the service accepts, in bytes.
pub const MAX_PATH_LEN: usize = 0x27F;

/// Bulk segments at least this long must be aligned.
pub const RAW_STAGING_THRESHOLD: usize = 0x40;
