//! Status codes returned by the filesystem service and the privilege helper.

use strum::{EnumIter, IntoEnumIterator, IntoStaticStr};
use thiserror::Error;

/// Every failure status the filesystem service is defined to produce.
///
/// Discriminants are the raw (negative) codes carried in the IPC return
/// value. Zero and positive values are success and never appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, IntoStaticStr)]
#[repr(i32)]
pub enum FsaStatus {
    #[strum(serialize = "FS_ERROR_NOT_INIT")]
    NotInit = -0x30001,
    #[strum(serialize = "FS_ERROR_BUSY")]
    Busy = -0x30002,
    #[strum(serialize = "FS_ERROR_CANCELLED")]
    Cancelled = -0x30003,
    #[strum(serialize = "FS_ERROR_END_OF_DIR")]
    EndOfDir = -0x30004,
    #[strum(serialize = "FS_ERROR_END_OF_FILE")]
    EndOfFile = -0x30005,
    #[strum(serialize = "FS_ERROR_MAX_MOUNT_POINTS")]
    MaxMountPoints = -0x30010,
    #[strum(serialize = "FS_ERROR_MAX_VOLUMES")]
    MaxVolumes = -0x30011,
    #[strum(serialize = "FS_ERROR_MAX_CLIENTS")]
    MaxClients = -0x30012,
    #[strum(serialize = "FS_ERROR_MAX_FILES")]
    MaxFiles = -0x30013,
    #[strum(serialize = "FS_ERROR_MAX_DIRS")]
    MaxDirs = -0x30014,
    #[strum(serialize = "FS_ERROR_ALREADY_OPEN")]
    AlreadyOpen = -0x30015,
    #[strum(serialize = "FS_ERROR_ALREADY_EXISTS")]
    AlreadyExists = -0x30016,
    #[strum(serialize = "FS_ERROR_NOT_FOUND")]
    NotFound = -0x30017,
    #[strum(serialize = "FS_ERROR_NOT_EMPTY")]
    NotEmpty = -0x30018,
    #[strum(serialize = "FS_ERROR_ACCESS_ERROR")]
    AccessError = -0x30019,
    #[strum(serialize = "FS_ERROR_PERMISSION_ERROR")]
    PermissionError = -0x3001A,
    #[strum(serialize = "FS_ERROR_DATA_CORRUPTED")]
    DataCorrupted = -0x3001B,
    #[strum(serialize = "FS_ERROR_STORAGE_FULL")]
    StorageFull = -0x3001C,
    #[strum(serialize = "FS_ERROR_JOURNAL_FULL")]
    JournalFull = -0x3001D,
    #[strum(serialize = "FS_ERROR_UNAVAILABLE_COMMAND")]
    UnavailableCommand = -0x3001F,
    #[strum(serialize = "FS_ERROR_UNSUPPORTED_COMMAND")]
    UnsupportedCommand = -0x30020,
    #[strum(serialize = "FS_ERROR_INVALID_PARAM")]
    InvalidParam = -0x30021,
    #[strum(serialize = "FS_ERROR_INVALID_PATH")]
    InvalidPath = -0x30022,
    #[strum(serialize = "FS_ERROR_INVALID_BUFFER")]
    InvalidBuffer = -0x30023,
    #[strum(serialize = "FS_ERROR_INVALID_ALIGNMENT")]
    InvalidAlignment = -0x30024,
    #[strum(serialize = "FS_ERROR_INVALID_CLIENTHANDLE")]
    InvalidClientHandle = -0x30025,
    #[strum(serialize = "FS_ERROR_INVALID_FILEHANDLE")]
    InvalidFileHandle = -0x30026,
    #[strum(serialize = "FS_ERROR_INVALID_DIRHANDLE")]
    InvalidDirHandle = -0x30027,
    #[strum(serialize = "FS_ERROR_NOT_FILE")]
    NotFile = -0x30028,
    #[strum(serialize = "FS_ERROR_NOT_DIR")]
    NotDir = -0x30029,
    #[strum(serialize = "FS_ERROR_FILE_TOO_BIG")]
    FileTooBig = -0x3002A,
    #[strum(serialize = "FS_ERROR_OUT_OF_RANGE")]
    OutOfRange = -0x3002B,
    #[strum(serialize = "FS_ERROR_OUT_OF_RESOURCES")]
    OutOfResources = -0x3002C,
    #[strum(serialize = "FS_ERROR_MEDIA_NOT_READY")]
    MediaNotReady = -0x30040,
    #[strum(serialize = "FS_ERROR_MEDIA_ERROR")]
    MediaError = -0x30041,
    #[strum(serialize = "FS_ERROR_WRITE_PROTECTED")]
    WriteProtected = -0x30042,
    #[strum(serialize = "FS_ERROR_INVALID_MEDIA")]
    InvalidMedia = -0x30043,
}

impl FsaStatus {
    /// The raw code as carried over IPC.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a raw code. Returns `None` for codes the service never defines.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::iter().find(|s| s.code() == code)
    }

    /// Status string for diagnostics.
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

impl std::fmt::Display for FsaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single shim command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShimError {
    /// The service answered with a defined failure status.
    #[error("{0}")]
    Status(FsaStatus),

    /// The service answered with a negative code outside the defined set.
    #[error("unrecognized service status {0}")]
    Unknown(i32),
}

impl ShimError {
    /// Classify a raw negative return code.
    pub fn from_code(code: i32) -> Self {
        match FsaStatus::from_code(code) {
            Some(status) => Self::Status(status),
            None => Self::Unknown(code),
        }
    }

    /// The raw code, for translation tables and logging.
    pub fn code(&self) -> i32 {
        match self {
            Self::Status(status) => status.code(),
            Self::Unknown(code) => *code,
        }
    }

    /// The defined status, if this is one.
    pub fn status(&self) -> Option<FsaStatus> {
        match self {
            Self::Status(status) => Some(*status),
            Self::Unknown(_) => None,
        }
    }

    /// True when the service reported the entry as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status(FsaStatus::NotFound))
    }
}

impl From<FsaStatus> for ShimError {
    fn from(status: FsaStatus) -> Self {
        Self::Status(status)
    }
}

/// Shim command result.
pub type ShimResult<T> = Result<T, ShimError>;

/// Split a raw IPC return value into success payload or error.
pub fn check(code: i32) -> ShimResult<u32> {
    if code < 0 {
        Err(ShimError::from_code(code))
    } else {
        Ok(code as u32)
    }
}

/// Result of a call to the privilege helper (client elevation, mount helper).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, EnumIter)]
pub enum MochaError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("maximum number of clients reached")]
    MaxClient,
    #[error("out of memory")]
    OutOfMemory,
    #[error("already exists")]
    AlreadyExists,
    #[error("failed to register device")]
    AddDevoptabFailed,
    #[error("not found")]
    NotFound,
    #[error("unsupported API version")]
    UnsupportedApiVersion,
    #[error("unsupported command")]
    UnsupportedCommand,
    #[error("library not initialized")]
    LibUninitialized,
    #[error("unknown error")]
    UnknownError,
}

impl MochaError {
    /// The raw helper result code.
    pub fn code(self) -> i32 {
        match self {
            Self::InvalidArgument => -0x01,
            Self::MaxClient => -0x02,
            Self::OutOfMemory => -0x03,
            Self::AlreadyExists => -0x04,
            Self::AddDevoptabFailed => -0x05,
            Self::NotFound => -0x06,
            Self::UnsupportedApiVersion => -0x10,
            Self::UnsupportedCommand => -0x11,
            Self::LibUninitialized => -0x20,
            Self::UnknownError => -0x100,
        }
    }

    /// Classify a raw helper result; anything undefined is `UnknownError`.
    /// Zero and positive values are success.
    pub fn check(code: i32) -> Result<(), MochaError> {
        if code >= 0 {
            return Ok(());
        }
        Err(Self::iter()
            .find(|e| e.code() == code)
            .unwrap_or(Self::UnknownError))
    }
}
