//! Conversions between the filesystem service's vocabulary and POSIX:
//! status codes, timestamps, permission bits, stat records and open flags.

use fsabridge_shim::{FsaMode, FsaStat, FsaStatus, FsaTime, ShimError, StatFlags};

use crate::error::Errno;
use crate::types::Stat;

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z.
pub const EPOCH_DIFF_SECS: i64 = 946_684_800;

const MICROS_PER_SEC: i64 = 1_000_000;
const STAT_BLOCK_SIZE: u64 = 512;

/// POSIX errno for a defined service status.
pub fn status_errno(status: FsaStatus) -> Errno {
    match status {
        FsaStatus::NotInit => Errno::ENODEV,
        FsaStatus::Busy => Errno::EBUSY,
        FsaStatus::Cancelled => Errno::ECANCELED,
        FsaStatus::EndOfDir => Errno::ENOENT,
        FsaStatus::EndOfFile => Errno::ENOENT,
        FsaStatus::MaxMountPoints => Errno::EMFILE,
        FsaStatus::MaxVolumes => Errno::EMFILE,
        FsaStatus::MaxClients => Errno::EMFILE,
        FsaStatus::MaxFiles => Errno::ENFILE,
        FsaStatus::MaxDirs => Errno::ENFILE,
        FsaStatus::AlreadyOpen => Errno::EBUSY,
        FsaStatus::AlreadyExists => Errno::EEXIST,
        FsaStatus::NotFound => Errno::ENOENT,
        FsaStatus::NotEmpty => Errno::ENOTEMPTY,
        FsaStatus::AccessError => Errno::EACCES,
        FsaStatus::PermissionError => Errno::EPERM,
        FsaStatus::DataCorrupted => Errno::EBADMSG,
        FsaStatus::StorageFull => Errno::ENOSPC,
        FsaStatus::JournalFull => Errno::ENOSPC,
        FsaStatus::UnavailableCommand => Errno::ENOSYS,
        FsaStatus::UnsupportedCommand => Errno::ENOTSUP,
        FsaStatus::InvalidParam => Errno::EINVAL,
        FsaStatus::InvalidPath => Errno::ENAMETOOLONG,
        FsaStatus::InvalidBuffer => Errno::EFAULT,
        FsaStatus::InvalidAlignment => Errno::EINVAL,
        FsaStatus::InvalidClientHandle => Errno::EBADF,
        FsaStatus::InvalidFileHandle => Errno::EBADF,
        FsaStatus::InvalidDirHandle => Errno::EBADF,
        FsaStatus::NotFile => Errno::EISDIR,
        FsaStatus::NotDir => Errno::ENOTDIR,
        FsaStatus::FileTooBig => Errno::EFBIG,
        FsaStatus::OutOfRange => Errno::ESPIPE,
        FsaStatus::OutOfResources => Errno::ENOMEM,
        FsaStatus::MediaNotReady => Errno::EAGAIN,
        FsaStatus::MediaError => Errno::ENXIO,
        FsaStatus::WriteProtected => Errno::EROFS,
        FsaStatus::InvalidMedia => Errno::ENODEV,
    }
}

/// POSIX errno for any raw service code. Undefined codes become `EIO`.
pub fn translate_error(code: i32) -> Errno {
    match FsaStatus::from_code(code) {
        Some(status) => status_errno(status),
        None => Errno::EIO,
    }
}

impl From<ShimError> for Errno {
    fn from(e: ShimError) -> Self {
        match e {
            ShimError::Status(status) => status_errno(status),
            ShimError::Unknown(_) => Errno::EIO,
        }
    }
}

/// Service time (µs since 2000) to Unix seconds.
pub fn fsa_time_to_unix(time: FsaTime) -> i64 {
    time.div_euclid(MICROS_PER_SEC) + EPOCH_DIFF_SECS
}

/// Unix seconds to service time.
pub fn unix_to_fsa_time(secs: i64) -> FsaTime {
    secs.saturating_sub(EPOCH_DIFF_SECS).saturating_mul(MICROS_PER_SEC)
}

/// POSIX `rwxrwxrwx` octal bits to the service's one-nibble-per-class form.
pub fn posix_to_fsa_mode(mode: u32) -> FsaMode {
    let owner = ((mode >> 6) & 0o7) << 8;
    let group = ((mode >> 3) & 0o7) << 4;
    let other = mode & 0o7;
    FsaMode::from_bits_truncate(owner | group | other)
}

/// The service's permission nibbles back to POSIX octal bits.
pub fn fsa_to_posix_mode(mode: FsaMode) -> u32 {
    let bits = mode.bits();
    ((bits >> 2) & 0o700) | ((bits >> 1) & 0o070) | (bits & 0o007)
}

/// `S_IF*` file type for an entry.
pub fn stat_file_type(stat: &FsaStat) -> u32 {
    if stat.flags.contains(StatFlags::LINK) {
        libc::S_IFLNK as u32
    } else if stat.flags.contains(StatFlags::DIRECTORY) {
        libc::S_IFDIR as u32
    } else if stat.flags.contains(StatFlags::FILE) {
        libc::S_IFREG as u32
    } else if stat.size == 0 {
        // Mounted volume roots carry no type flags.
        libc::S_IFDIR as u32
    } else {
        libc::S_IFREG as u32
    }
}

/// Full `st_mode` for an entry.
pub fn stat_mode(stat: &FsaStat) -> u32 {
    stat_file_type(stat) | fsa_to_posix_mode(stat.mode)
}

/// Build a POSIX stat record. `dev` identifies the owning mount.
pub fn translate_stat(stat: &FsaStat, dev: u64) -> Stat {
    let size = stat.size as u64;
    let mtime = fsa_time_to_unix(stat.modified);
    Stat {
        dev,
        ino: stat.entry_id as u64,
        mode: stat_mode(stat),
        nlink: 1,
        uid: stat.owner,
        gid: stat.group,
        rdev: dev,
        size,
        blksize: STAT_BLOCK_SIZE as u32,
        blocks: size.div_ceil(STAT_BLOCK_SIZE),
        atime: mtime,
        mtime,
        ctime: fsa_time_to_unix(stat.created),
    }
}

fn access_mode(flags: i32) -> i32 {
    flags & libc::O_ACCMODE
}

/// Service open mode for `open(2)` flags, assuming the file exists.
pub fn open_mode(flags: i32) -> &'static str {
    let access = access_mode(flags);
    if access == libc::O_RDONLY {
        return "r";
    }
    let rdwr = access == libc::O_RDWR;
    if flags & libc::O_APPEND != 0 {
        if rdwr { "a+" } else { "a" }
    } else if flags & libc::O_TRUNC != 0 {
        if rdwr { "w+" } else { "w" }
    } else {
        "r+"
    }
}

/// Service open mode that creates a missing file for `open(2)` flags.
pub fn create_mode(flags: i32) -> &'static str {
    if access_mode(flags) == libc::O_WRONLY {
        "w"
    } else {
        "w+"
    }
}

/// Whether `flags` permit reading.
pub fn can_read(flags: i32) -> bool {
    access_mode(flags) != libc::O_WRONLY
}

/// Whether `flags` permit writing.
pub fn can_write(flags: i32) -> bool {
    access_mode(flags) != libc::O_RDONLY
}
