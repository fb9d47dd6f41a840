//! Command identifiers and command-level flags.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoStaticStr};

/// Filesystem service command identifiers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, IntoStaticStr,
)]
#[repr(u32)]
pub enum FsaCommand {
    Invalid = 0x00,
    Mount = 0x01,
    Unmount = 0x02,
    ChangeDir = 0x05,
    GetCwd = 0x06,
    MakeDir = 0x07,
    Remove = 0x08,
    Rename = 0x09,
    OpenDir = 0x0A,
    ReadDir = 0x0B,
    RewindDir = 0x0C,
    CloseDir = 0x0D,
    OpenFile = 0x0E,
    ReadFile = 0x0F,
    WriteFile = 0x10,
    GetPosFile = 0x11,
    SetPosFile = 0x12,
    IsEof = 0x13,
    GetStatFile = 0x14,
    CloseFile = 0x15,
    FlushFile = 0x17,
    GetInfoByQuery = 0x18,
    TruncateFile = 0x1A,
    FlushVolume = 0x1B,
    ChangeMode = 0x20,
    RawOpen = 0x106,
    RawRead = 0x107,
    RawWrite = 0x108,
    RawClose = 0x109,
}

impl FsaCommand {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// How the shim is delivered to the service.
///
/// `Open` and `Close` create and destroy a client session; every other
/// command travels as `Ioctl` or, when it carries bulk data, `Ioctlv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum IpcRequestType {
    Open = 1,
    Close = 2,
    Ioctl = 6,
    Ioctlv = 7,
}

/// Mount visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum MountFlags {
    /// Visible only to the mounting client.
    #[default]
    Local = 0,
    /// Re-exposes an already mounted volume under a second target.
    Bind = 1,
    /// Visible to every client of the service.
    Global = 2,
}

impl MountFlags {
    /// Global and bind mounts must land under the shared storage prefix.
    pub fn requires_storage_target(self) -> bool {
        matches!(self, Self::Global | Self::Bind)
    }
}

bitflags! {
    /// Unmount behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct UnmountFlags: u32 {
        const FORCE = 0x0000_0002;
        const BIND_MOUNT = 0x8000_0000;
    }
}

bitflags! {
    /// Per-transfer flags for file reads and writes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ReadWriteFlags: u32 {
        /// Use the explicit position instead of the handle cursor.
        const WITH_POS = 0x0000_0001;
    }
}

/// What a `GetInfoByQuery` request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum QueryType {
    FreeSpaceSize = 0,
    DirSize = 1,
    EntryNum = 2,
    FileSystemInfo = 3,
    DeviceInfo = 4,
    Stat = 5,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use strum::IntoEnumIterator;

    #[test]
    fn test_command_ids_unique() {
        let ids: HashSet<u32> = FsaCommand::iter().map(|c| c as u32).collect();
        assert_eq!(ids.len(), FsaCommand::iter().count());
    }

    #[test]
    fn test_storage_target_rule() {
        assert!(MountFlags::Global.requires_storage_target());
        assert!(MountFlags::Bind.requires_storage_target());
        assert!(!MountFlags::Local.requires_storage_target());
    }
}
