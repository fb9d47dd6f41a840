//! Wire-level value types exchanged with the filesystem service.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Generate a handle newtype over the service's raw `i32` handle values.
macro_rules! impl_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i32);

        impl $name {
            pub fn raw(self) -> i32 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

impl_handle!(
    /// A session with the filesystem service.
    ClientHandle
);
impl_handle!(
    /// An open file on the service side.
    FileHandle
);
impl_handle!(
    /// An open directory iterator on the service side.
    DirHandle
);
impl_handle!(
    /// An open raw block device.
    RawHandle
);

/// Timestamps are microseconds since 2000-01-01T00:00:00Z.
pub type FsaTime = i64;

bitflags! {
    /// Entry classification bits carried in [`FsaStat::flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct StatFlags: u32 {
        const DIRECTORY = 0x8000_0000;
        const QUOTA = 0x6000_0000;
        const FILE = 0x0100_0000;
        const ENCRYPTED = 0x0080_0000;
        const LINK = 0x0001_0000;
    }
}

bitflags! {
    /// Permission bits: one hex nibble per class, read/write/execute.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FsaMode: u32 {
        const READ_OWNER = 0x400;
        const WRITE_OWNER = 0x200;
        const EXECUTE_OWNER = 0x100;
        const READ_GROUP = 0x040;
        const WRITE_GROUP = 0x020;
        const EXECUTE_GROUP = 0x010;
        const READ_OTHER = 0x004;
        const WRITE_OTHER = 0x002;
        const EXECUTE_OTHER = 0x001;
    }
}

impl FsaMode {
    /// Mask covering every permission nibble, used with `change_mode`.
    pub const ALL: u32 = 0x777;
}

/// Metadata for a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FsaStat {
    pub flags: StatFlags,
    pub mode: FsaMode,
    pub owner: u32,
    pub group: u32,
    pub size: u32,
    pub alloc_size: u32,
    pub quota_size: u64,
    pub entry_id: u32,
    pub created: FsaTime,
    pub modified: FsaTime,
}

impl FsaStat {
    pub fn is_directory(&self) -> bool {
        self.flags.contains(StatFlags::DIRECTORY)
    }
}

/// A single directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsaDirEntry {
    pub stat: FsaStat,
    pub name: String,
}

/// Geometry of the block device behind a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_size_in_sectors: u64,
    pub device_sector_size: u32,
}

impl DeviceInfo {
    pub fn size_in_bytes(&self) -> u64 {
        self.device_size_in_sectors
            .saturating_mul(self.device_sector_size as u64)
    }
}
