//! Error types for the POSIX bridge.

use std::io;

use fsabridge_shim::{MochaError, ShimError};
use thiserror::Error;

fn describe(code: &i32) -> String {
    io::Error::from_raw_os_error(*code).to_string()
}

/// A POSIX error number, as reported through a call's error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("{}", describe(.0))]
pub struct Errno(pub i32);

macro_rules! errno_consts {
    ($($name:ident),* $(,)?) => {
        impl Errno {
            $(pub const $name: Errno = Errno(libc::$name);)*
        }
    };
}

errno_consts!(
    EPERM, ENOENT, EIO, ENXIO, EBADF, EAGAIN, ENOMEM, EACCES, EFAULT, EBUSY, EEXIST, EXDEV, ENODEV,
    ENOTDIR, EISDIR, EINVAL, ENFILE, EMFILE, EFBIG, ENOSPC, ESPIPE, EROFS, ERANGE, ENAMETOOLONG,
    ENOSYS, ENOTEMPTY, EBADMSG, ENOTSUP, ECANCELED,
);

impl Errno {
    pub fn code(self) -> i32 {
        self.0
    }
}

impl From<Errno> for io::Error {
    fn from(e: Errno) -> Self {
        io::Error::from_raw_os_error(e.0)
    }
}

/// Result of a POSIX-shaped operation.
pub type PosixResult<T> = Result<T, Errno>;

/// Result codes of the mount surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MochaStatus {
    Success = 0,
    InvalidArgument = -0x01,
    MaxClient = -0x02,
    OutOfMemory = -0x03,
    AlreadyExists = -0x04,
    AddDevoptabFailed = -0x05,
    NotFound = -0x06,
    UnsupportedApiVersion = -0x10,
    UnsupportedCommand = -0x11,
    LibUninitialized = -0x20,
    UnknownError = -0x100,
}

impl MochaStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<MochaError> for MochaStatus {
    fn from(e: MochaError) -> Self {
        match e {
            MochaError::InvalidArgument => Self::InvalidArgument,
            MochaError::MaxClient => Self::MaxClient,
            MochaError::OutOfMemory => Self::OutOfMemory,
            MochaError::AlreadyExists => Self::AlreadyExists,
            MochaError::AddDevoptabFailed => Self::AddDevoptabFailed,
            MochaError::NotFound => Self::NotFound,
            MochaError::UnsupportedApiVersion => Self::UnsupportedApiVersion,
            MochaError::UnsupportedCommand => Self::UnsupportedCommand,
            MochaError::LibUninitialized => Self::LibUninitialized,
            MochaError::UnknownError => Self::UnknownError,
        }
    }
}

/// Failure of a mount or unmount request.
///
/// Every failure leaves the registry as it was: no slot stays claimed and
/// no client session stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MountError {
    /// Malformed virtual name or mount path.
    #[error("invalid mount argument: {0}")]
    InvalidArgument(String),

    /// A mount with this virtual name is already live.
    #[error("already mounted: {0}")]
    AlreadyExists(String),

    /// Every mount slot is in use.
    #[error("all {0} mount slots are in use")]
    SlotsExhausted(usize),

    /// No mount with this virtual name.
    #[error("not mounted: {0}")]
    NotFound(String),

    /// The service refused a new client session.
    #[error("failed to open a client session: {0}")]
    AddClient(ShimError),

    /// The privilege helper refused to elevate the session.
    #[error("failed to elevate client: {0}")]
    Elevation(MochaError),

    /// The service rejected the mount itself, or a path-prefix rule did.
    #[error("mount failed: {0}")]
    Mount(ShimError),

    /// The device geometry query failed after the volume was reachable.
    #[error("device info query failed: {0}")]
    DeviceInfo(ShimError),

    /// The device table refused the new device.
    #[error("failed to register device {0}")]
    Register(String),

    /// No process-wide bridge has been installed.
    #[error("bridge not initialized")]
    Uninitialized,

    /// A process-wide bridge was already installed.
    #[error("bridge already initialized")]
    AlreadyInitialized,
}

impl MountError {
    /// The result code reported for this failure.
    pub fn status(&self) -> MochaStatus {
        match self {
            Self::InvalidArgument(_) => MochaStatus::InvalidArgument,
            Self::AlreadyExists(_) | Self::AlreadyInitialized => MochaStatus::AlreadyExists,
            Self::SlotsExhausted(_) => MochaStatus::OutOfMemory,
            Self::NotFound(_) => MochaStatus::NotFound,
            Self::AddClient(_) => MochaStatus::MaxClient,
            Self::Elevation(e) => (*e).into(),
            Self::Mount(_) | Self::DeviceInfo(_) => MochaStatus::UnknownError,
            Self::Register(_) => MochaStatus::AddDevoptabFailed,
            Self::Uninitialized => MochaStatus::LibUninitialized,
        }
    }
}
