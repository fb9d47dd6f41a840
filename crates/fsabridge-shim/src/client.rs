//! Typed client commands.
//!
//! Each method builds one [`ShimBuffer`], hands it to the transport, and
//! decodes the result. Path-prefix rules for mounts and raw devices are
//! checked here, before anything is sent.

use std::sync::Arc;

use crate::aligned::{is_aligned, StagedRead, StagedWrite};
use crate::buffer::{FsaRequest, FsaResponse, ShimBuffer, VectorLayout};
use crate::command::{
    FsaCommand, IpcRequestType, MountFlags, QueryType, ReadWriteFlags, UnmountFlags,
};
use crate::status::{check, FsaStatus, MochaError, ShimError, ShimResult};
use crate::transport::{FsaTransport, Payload};
use crate::types::{
    ClientHandle, DeviceInfo, DirHandle, FileHandle, FsaDirEntry, FsaMode, FsaStat, RawHandle,
};
use crate::MAX_PATH_LEN;

/// Raw devices live here.
pub const DEVICE_PREFIX: &str = "/dev/";
/// Every mount target lives here.
pub const VOLUME_PREFIX: &str = "/vol/";
/// Global and bind mount targets live here.
pub const STORAGE_PREFIX: &str = "/vol/storage_";

fn invalid_path() -> ShimError {
    ShimError::Status(FsaStatus::InvalidPath)
}

fn unexpected(command: FsaCommand) -> ShimError {
    tracing::warn!(command = command.as_str(), "response does not match command");
    ShimError::Status(FsaStatus::DataCorrupted)
}

fn check_path(path: &str) -> ShimResult<()> {
    if path.is_empty() || path.len() > MAX_PATH_LEN {
        return Err(invalid_path());
    }
    Ok(())
}

/// Enforce the mount path-prefix rules.
pub fn validate_mount_paths(source: &str, target: &str, flags: MountFlags) -> ShimResult<()> {
    check_path(source)?;
    check_path(target)?;
    if !source.starts_with(DEVICE_PREFIX) || !target.starts_with(VOLUME_PREFIX) {
        return Err(invalid_path());
    }
    if flags.requires_storage_target() != target.starts_with(STORAGE_PREFIX) {
        return Err(invalid_path());
    }
    Ok(())
}

/// Issues commands to the filesystem service over a shared transport.
#[derive(Clone)]
pub struct FsaClient {
    transport: Arc<dyn FsaTransport>,
}

impl FsaClient {
    pub fn new(transport: Arc<dyn FsaTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn FsaTransport> {
        &self.transport
    }

    fn dispatch(&self, shim: &mut ShimBuffer, payload: Payload<'_>) -> ShimResult<u32> {
        let command = shim.command();
        check(self.transport.send(shim, payload)).inspect_err(|e| {
            tracing::debug!(
                command = command.as_str(),
                code = e.code(),
                error = %e,
                "command failed"
            );
        })
    }

    fn call(
        &self,
        client: ClientHandle,
        command: FsaCommand,
        request: FsaRequest,
    ) -> ShimResult<(u32, FsaResponse)> {
        let mut shim = ShimBuffer::new(client, command, IpcRequestType::Ioctl);
        shim.encode_request(&request)?;
        let value = self.dispatch(&mut shim, Payload::None)?;
        Ok((value, shim.decode_response()?))
    }

    fn call_vectored(
        &self,
        client: ClientHandle,
        command: FsaCommand,
        request: FsaRequest,
        payload: Payload<'_>,
        layout: VectorLayout,
    ) -> ShimResult<u32> {
        let mut shim = ShimBuffer::new(client, command, IpcRequestType::Ioctlv);
        shim.encode_request(&request)?;
        shim.set_vectored(payload.vector(), layout);
        self.dispatch(&mut shim, payload)
    }

    fn simple(
        &self,
        client: ClientHandle,
        command: FsaCommand,
        request: FsaRequest,
    ) -> ShimResult<()> {
        self.call(client, command, request).map(|_| ())
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Open a new client session.
    pub fn add_client(&self) -> ShimResult<ClientHandle> {
        let mut shim = ShimBuffer::new(ClientHandle(0), FsaCommand::Invalid, IpcRequestType::Open);
        let handle = self.dispatch(&mut shim, Payload::None)?;
        Ok(ClientHandle(handle as i32))
    }

    pub fn del_client(&self, client: ClientHandle) -> ShimResult<()> {
        let mut shim = ShimBuffer::new(client, FsaCommand::Invalid, IpcRequestType::Close);
        self.dispatch(&mut shim, Payload::None).map(|_| ())
    }

    /// Elevate `client` through the privilege helper.
    pub fn unlock_client(&self, client: ClientHandle) -> Result<(), MochaError> {
        self.transport.unlock_client(client)
    }

    // ========================================================================
    // Volumes
    // ========================================================================

    #[tracing::instrument(skip(self, args), name = "fsa.mount")]
    pub fn mount(
        &self,
        client: ClientHandle,
        source: &str,
        target: &str,
        flags: MountFlags,
        args: &[u8],
    ) -> ShimResult<()> {
        validate_mount_paths(source, target, flags)?;
        let request = FsaRequest::Mount {
            source: source.to_string(),
            target: target.to_string(),
            flags,
            args: args.to_vec(),
        };
        self.simple(client, FsaCommand::Mount, request)
    }

    #[tracing::instrument(skip(self), name = "fsa.unmount")]
    pub fn unmount(
        &self,
        client: ClientHandle,
        target: &str,
        flags: UnmountFlags,
    ) -> ShimResult<()> {
        check_path(target)?;
        if !target.starts_with(VOLUME_PREFIX) {
            return Err(invalid_path());
        }
        let request = FsaRequest::Unmount {
            target: target.to_string(),
            flags,
        };
        self.simple(client, FsaCommand::Unmount, request)
    }

    pub fn flush_volume(&self, client: ClientHandle, path: &str) -> ShimResult<()> {
        check_path(path)?;
        let request = FsaRequest::FlushVolume {
            path: path.to_string(),
        };
        self.simple(client, FsaCommand::FlushVolume, request)
    }

    fn query(&self, client: ClientHandle, path: &str, query: QueryType) -> ShimResult<FsaResponse> {
        check_path(path)?;
        let request = FsaRequest::GetInfoByQuery {
            path: path.to_string(),
            query,
        };
        self.call(client, FsaCommand::GetInfoByQuery, request).map(|(_, r)| r)
    }

    pub fn get_device_info(&self, client: ClientHandle, path: &str) -> ShimResult<DeviceInfo> {
        match self.query(client, path, QueryType::DeviceInfo)? {
            FsaResponse::DeviceInfo { info } => Ok(info),
            _ => Err(unexpected(FsaCommand::GetInfoByQuery)),
        }
    }

    pub fn get_free_space(&self, client: ClientHandle, path: &str) -> ShimResult<u64> {
        match self.query(client, path, QueryType::FreeSpaceSize)? {
            FsaResponse::FreeSpace { bytes } => Ok(bytes),
            _ => Err(unexpected(FsaCommand::GetInfoByQuery)),
        }
    }

    pub fn get_stat(&self, client: ClientHandle, path: &str) -> ShimResult<FsaStat> {
        match self.query(client, path, QueryType::Stat)? {
            FsaResponse::Stat { stat } => Ok(stat),
            _ => Err(unexpected(FsaCommand::GetInfoByQuery)),
        }
    }

    // ========================================================================
    // Namespace
    // ========================================================================

    pub fn change_dir(&self, client: ClientHandle, path: &str) -> ShimResult<()> {
        check_path(path)?;
        self.simple(client, FsaCommand::ChangeDir, FsaRequest::ChangeDir { path: path.to_string() })
    }

    pub fn get_cwd(&self, client: ClientHandle) -> ShimResult<String> {
        match self.call(client, FsaCommand::GetCwd, FsaRequest::GetCwd)?.1 {
            FsaResponse::Cwd { path } => Ok(path),
            _ => Err(unexpected(FsaCommand::GetCwd)),
        }
    }

    pub fn make_dir(&self, client: ClientHandle, path: &str, mode: FsaMode) -> ShimResult<()> {
        check_path(path)?;
        let request = FsaRequest::MakeDir {
            path: path.to_string(),
            mode,
        };
        self.simple(client, FsaCommand::MakeDir, request)
    }

    pub fn remove(&self, client: ClientHandle, path: &str) -> ShimResult<()> {
        check_path(path)?;
        self.simple(client, FsaCommand::Remove, FsaRequest::Remove { path: path.to_string() })
    }

    pub fn rename(&self, client: ClientHandle, old_path: &str, new_path: &str) -> ShimResult<()> {
        check_path(old_path)?;
        check_path(new_path)?;
        let request = FsaRequest::Rename {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
        };
        self.simple(client, FsaCommand::Rename, request)
    }

    /// Replace the permission bits selected by `mask`.
    pub fn change_mode(
        &self,
        client: ClientHandle,
        path: &str,
        mode: FsaMode,
        mask: u32,
    ) -> ShimResult<()> {
        check_path(path)?;
        let request = FsaRequest::ChangeMode {
            path: path.to_string(),
            mode,
            mask,
        };
        self.simple(client, FsaCommand::ChangeMode, request)
    }

    // ========================================================================
    // Directories
    // ========================================================================

    pub fn open_dir(&self, client: ClientHandle, path: &str) -> ShimResult<DirHandle> {
        check_path(path)?;
        let request = FsaRequest::OpenDir {
            path: path.to_string(),
        };
        match self.call(client, FsaCommand::OpenDir, request)?.1 {
            FsaResponse::OpenDir { handle } => Ok(handle),
            _ => Err(unexpected(FsaCommand::OpenDir)),
        }
    }

    /// Next entry, or `END_OF_DIR` once the listing is exhausted.
    pub fn read_dir(&self, client: ClientHandle, handle: DirHandle) -> ShimResult<FsaDirEntry> {
        match self.call(client, FsaCommand::ReadDir, FsaRequest::ReadDir { handle })?.1 {
            FsaResponse::ReadDir { entry } => Ok(entry),
            _ => Err(unexpected(FsaCommand::ReadDir)),
        }
    }

    pub fn rewind_dir(&self, client: ClientHandle, handle: DirHandle) -> ShimResult<()> {
        self.simple(client, FsaCommand::RewindDir, FsaRequest::RewindDir { handle })
    }

    pub fn close_dir(&self, client: ClientHandle, handle: DirHandle) -> ShimResult<()> {
        self.simple(client, FsaCommand::CloseDir, FsaRequest::CloseDir { handle })
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Open `path` with an fopen-style mode string (`r`, `r+`, `w`, `w+`,
    /// `a`, `a+`).
    pub fn open_file(
        &self,
        client: ClientHandle,
        path: &str,
        mode: &str,
        create_mode: FsaMode,
        open_flags: u32,
        prealloc_size: u32,
    ) -> ShimResult<FileHandle> {
        check_path(path)?;
        let request = FsaRequest::OpenFile {
            path: path.to_string(),
            mode: mode.to_string(),
            create_mode,
            open_flags,
            prealloc_size,
        };
        match self.call(client, FsaCommand::OpenFile, request)?.1 {
            FsaResponse::OpenFile { handle } => Ok(handle),
            _ => Err(unexpected(FsaCommand::OpenFile)),
        }
    }

    pub fn close_file(&self, client: ClientHandle, handle: FileHandle) -> ShimResult<()> {
        self.simple(client, FsaCommand::CloseFile, FsaRequest::CloseFile { handle })
    }

    /// Bytes covered by a `size * count` transfer, checked against the buffer.
    fn transfer_len(buf_len: usize, size: u32, count: u32) -> ShimResult<usize> {
        let len = (size as usize)
            .checked_mul(count as usize)
            .ok_or(ShimError::Status(FsaStatus::InvalidParam))?;
        if len > buf_len || len > u32::MAX as usize {
            return Err(ShimError::Status(FsaStatus::InvalidBuffer));
        }
        Ok(len)
    }

    /// Read `count` elements of `size` bytes. `buf` must be 0x40-aligned;
    /// returns the number of whole elements read.
    #[allow(clippy::too_many_arguments)]
    pub fn read_file(
        &self,
        client: ClientHandle,
        handle: FileHandle,
        buf: &mut [u8],
        size: u32,
        count: u32,
        pos: u32,
        flags: ReadWriteFlags,
    ) -> ShimResult<u32> {
        let len = Self::transfer_len(buf.len(), size, count)?;
        let data = &mut buf[..len];
        if !data.is_empty() && !is_aligned(data.as_ptr() as usize) {
            return Err(ShimError::Status(FsaStatus::InvalidAlignment));
        }
        let request = FsaRequest::ReadFile {
            handle,
            size,
            count,
            pos,
            flags,
        };
        self.call_vectored(
            client,
            FsaCommand::ReadFile,
            request,
            Payload::Read(data),
            VectorLayout::Read,
        )
    }

    /// Write `count` elements of `size` bytes. `buf` must be 0x40-aligned;
    /// returns the number of whole elements written.
    #[allow(clippy::too_many_arguments)]
    pub fn write_file(
        &self,
        client: ClientHandle,
        handle: FileHandle,
        buf: &[u8],
        size: u32,
        count: u32,
        pos: u32,
        flags: ReadWriteFlags,
    ) -> ShimResult<u32> {
        let len = Self::transfer_len(buf.len(), size, count)?;
        let data = &buf[..len];
        if !data.is_empty() && !is_aligned(data.as_ptr() as usize) {
            return Err(ShimError::Status(FsaStatus::InvalidAlignment));
        }
        let request = FsaRequest::WriteFile {
            handle,
            size,
            count,
            pos,
            flags,
        };
        self.call_vectored(
            client,
            FsaCommand::WriteFile,
            request,
            Payload::Write(data),
            VectorLayout::Write,
        )
    }

    pub fn get_pos_file(&self, client: ClientHandle, handle: FileHandle) -> ShimResult<u32> {
        match self.call(client, FsaCommand::GetPosFile, FsaRequest::GetPosFile { handle })?.1 {
            FsaResponse::GetPosFile { pos } => Ok(pos),
            _ => Err(unexpected(FsaCommand::GetPosFile)),
        }
    }

    pub fn set_pos_file(
        &self,
        client: ClientHandle,
        handle: FileHandle,
        pos: u32,
    ) -> ShimResult<()> {
        self.simple(client, FsaCommand::SetPosFile, FsaRequest::SetPosFile { handle, pos })
    }

    /// True once the cursor has reached the end of the file.
    pub fn is_eof(&self, client: ClientHandle, handle: FileHandle) -> ShimResult<bool> {
        match self.call(client, FsaCommand::IsEof, FsaRequest::IsEof { handle }) {
            Ok(_) => Ok(false),
            Err(ShimError::Status(FsaStatus::EndOfFile)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    pub fn get_stat_file(&self, client: ClientHandle, handle: FileHandle) -> ShimResult<FsaStat> {
        match self.call(client, FsaCommand::GetStatFile, FsaRequest::GetStatFile { handle })?.1 {
            FsaResponse::GetStatFile { stat } => Ok(stat),
            _ => Err(unexpected(FsaCommand::GetStatFile)),
        }
    }

    pub fn flush_file(&self, client: ClientHandle, handle: FileHandle) -> ShimResult<()> {
        self.simple(client, FsaCommand::FlushFile, FsaRequest::FlushFile { handle })
    }

    /// Cut the file at the handle's current position.
    pub fn truncate_file(&self, client: ClientHandle, handle: FileHandle) -> ShimResult<()> {
        self.simple(client, FsaCommand::TruncateFile, FsaRequest::TruncateFile { handle })
    }

    // ========================================================================
    // Raw block devices
    // ========================================================================

    pub fn raw_open(&self, client: ClientHandle, device_path: &str) -> ShimResult<RawHandle> {
        check_path(device_path)?;
        if !device_path.starts_with(DEVICE_PREFIX) {
            return Err(invalid_path());
        }
        let request = FsaRequest::RawOpen {
            path: device_path.to_string(),
        };
        match self.call(client, FsaCommand::RawOpen, request)?.1 {
            FsaResponse::RawOpen { handle } => Ok(handle),
            _ => Err(unexpected(FsaCommand::RawOpen)),
        }
    }

    pub fn raw_close(&self, client: ClientHandle, handle: RawHandle) -> ShimResult<()> {
        self.simple(client, FsaCommand::RawClose, FsaRequest::RawClose { handle })
    }

    /// Read `count` blocks of `block_size` bytes starting at block
    /// `block_offset`. Any caller buffer works; misaligned ones are staged.
    pub fn raw_read(
        &self,
        client: ClientHandle,
        handle: RawHandle,
        buf: &mut [u8],
        block_offset: u64,
        count: u32,
        block_size: u32,
    ) -> ShimResult<()> {
        let len = Self::transfer_len(buf.len(), block_size, count)?;
        let mut staged = StagedRead::new(&mut buf[..len], "raw_read")?;
        let request = FsaRequest::RawRead {
            block_offset,
            count,
            block_size,
            handle,
        };
        self.call_vectored(
            client,
            FsaCommand::RawRead,
            request,
            Payload::Read(staged.target()),
            VectorLayout::Read,
        )?;
        staged.finish();
        Ok(())
    }

    /// Write `count` blocks of `block_size` bytes starting at block
    /// `block_offset`. Any caller buffer works; misaligned ones are staged.
    pub fn raw_write(
        &self,
        client: ClientHandle,
        handle: RawHandle,
        buf: &[u8],
        block_offset: u64,
        count: u32,
        block_size: u32,
    ) -> ShimResult<()> {
        let len = Self::transfer_len(buf.len(), block_size, count)?;
        let staged = StagedWrite::new(&buf[..len], "raw_write")?;
        let request = FsaRequest::RawWrite {
            block_offset,
            count,
            block_size,
            handle,
        };
        self.call_vectored(
            client,
            FsaCommand::RawWrite,
            request,
            Payload::Write(staged.source()),
            VectorLayout::Write,
        )
        .map(|_| ())
    }
}

impl std::fmt::Debug for FsaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsaClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligned::AlignedBuffer;
    use crate::testing::MemoryService;

    fn setup() -> (Arc<MemoryService>, FsaClient, ClientHandle) {
        let service = Arc::new(MemoryService::new());
        service.add_device("/dev/sdcard01", 512, 64);
        let fsa = FsaClient::new(service.clone());
        let client = fsa.add_client().unwrap();
        fsa.unlock_client(client).unwrap();
        (service, fsa, client)
    }

    #[test]
    fn test_mount_path_rules() {
        assert!(
            validate_mount_paths("/dev/sdcard01", "/vol/storage_sd", MountFlags::Global).is_ok()
        );
        assert!(validate_mount_paths("/dev/sdcard01", "/vol/storage_sd", MountFlags::Bind).is_ok());
        assert!(validate_mount_paths("/dev/sdcard01", "/vol/sd", MountFlags::Local).is_ok());

        let bad = [
            ("sdcard01", "/vol/storage_sd", MountFlags::Global),
            ("/dev/sdcard01", "/mnt/storage_sd", MountFlags::Global),
            ("/dev/sdcard01", "/vol/sd", MountFlags::Global),
            ("/dev/sdcard01", "/vol/storage_sd", MountFlags::Local),
        ];
        for (source, target, flags) in bad {
            assert_eq!(
                validate_mount_paths(source, target, flags),
                Err(ShimError::Status(FsaStatus::InvalidPath)),
                "{source} -> {target} ({flags:?})"
            );
        }
    }

    #[test]
    fn test_rejected_paths_never_sent() {
        let (service, fsa, client) = setup();
        let before = service.total_requests();
        assert!(fsa.mount(client, "/dev/sdcard01", "/vol/sd", MountFlags::Global, &[]).is_err());
        assert!(fsa.unmount(client, "/storage_sd", UnmountFlags::FORCE).is_err());
        assert!(fsa.raw_open(client, "/vol/storage_sd").is_err());
        let long = format!("/vol/{}", "x".repeat(MAX_PATH_LEN));
        assert!(fsa.open_file(client, &long, "r", FsaMode::empty(), 0, 0).is_err());
        assert_eq!(service.total_requests(), before);
    }

    #[test]
    fn test_mount_and_device_info() {
        let (_service, fsa, client) = setup();
        fsa.mount(client, "/dev/sdcard01", "/vol/storage_sd", MountFlags::Global, &[])
            .unwrap();
        let info = fsa.get_device_info(client, "/vol/storage_sd").unwrap();
        assert_eq!(info.device_sector_size, 512);
        assert_eq!(info.device_size_in_sectors, 64);
        fsa.unmount(client, "/vol/storage_sd", UnmountFlags::FORCE).unwrap();
        assert!(fsa.get_device_info(client, "/vol/storage_sd").is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let (_service, fsa, client) = setup();
        fsa.mount(client, "/dev/sdcard01", "/vol/storage_sd", MountFlags::Global, &[])
            .unwrap();

        let handle = fsa
            .open_file(client, "/vol/storage_sd/a.bin", "w+", FsaMode::empty(), 0, 0)
            .unwrap();
        let mut buf = AlignedBuffer::new(128).unwrap();
        buf.as_mut_slice().copy_from_slice(&[0xAB; 128]);
        let written = fsa
            .write_file(client, handle, buf.as_slice(), 1, 128, 0, ReadWriteFlags::empty())
            .unwrap();
        assert_eq!(written, 128);
        assert_eq!(fsa.get_pos_file(client, handle).unwrap(), 128);
        assert!(fsa.is_eof(client, handle).unwrap());

        let mut out = AlignedBuffer::new(128).unwrap();
        let read = fsa
            .read_file(client, handle, out.as_mut_slice(), 1, 128, 0, ReadWriteFlags::WITH_POS)
            .unwrap();
        assert_eq!(read, 128);
        assert_eq!(out.as_slice(), buf.as_slice());
        fsa.close_file(client, handle).unwrap();
    }

    #[test]
    fn test_unaligned_file_read_rejected_locally() {
        let (service, fsa, client) = setup();
        let mut backing = AlignedBuffer::new(129).unwrap();
        let before = service.total_requests();
        let err = fsa
            .read_file(
                client,
                FileHandle(1),
                &mut backing.as_mut_slice()[1..],
                1,
                128,
                0,
                ReadWriteFlags::empty(),
            )
            .unwrap_err();
        assert_eq!(err, ShimError::Status(FsaStatus::InvalidAlignment));
        assert_eq!(service.total_requests(), before);
    }

    #[test]
    fn test_raw_transfer_misaligned_is_transparent() {
        let (_service, fsa, client) = setup();
        let handle = fsa.raw_open(client, "/dev/sdcard01").unwrap();

        let mut src = AlignedBuffer::new(1024 + 3).unwrap();
        for (i, b) in src.as_mut_slice().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        fsa.raw_write(client, handle, &src.as_slice()[3..], 2, 2, 512).unwrap();

        let mut dst = AlignedBuffer::new(1024 + 5).unwrap();
        fsa.raw_read(client, handle, &mut dst.as_mut_slice()[5..], 2, 2, 512)
            .unwrap();
        assert_eq!(&dst.as_slice()[5..], &src.as_slice()[3..]);
        fsa.raw_close(client, handle).unwrap();
    }

    #[test]
    fn test_raw_out_of_range() {
        let (_service, fsa, client) = setup();
        let handle = fsa.raw_open(client, "/dev/sdcard01").unwrap();
        let mut buf = AlignedBuffer::new(512).unwrap();
        let err = fsa
            .raw_read(client, handle, buf.as_mut_slice(), 64, 1, 512)
            .unwrap_err();
        assert_eq!(err, ShimError::Status(FsaStatus::OutOfRange));
    }

    #[test]
    fn test_short_buffer_rejected() {
        let (_service, fsa, client) = setup();
        let handle = fsa.raw_open(client, "/dev/sdcard01").unwrap();
        let mut buf = AlignedBuffer::new(100).unwrap();
        let err = fsa
            .raw_read(client, handle, buf.as_mut_slice(), 0, 1, 512)
            .unwrap_err();
        assert_eq!(err, ShimError::Status(FsaStatus::InvalidBuffer));
    }

    #[test]
    fn test_directory_listing() {
        let (service, fsa, client) = setup();
        fsa.mount(client, "/dev/sdcard01", "/vol/storage_sd", MountFlags::Global, &[])
            .unwrap();
        service.put_file("/vol/storage_sd/b.txt", b"bb");
        service.put_file("/vol/storage_sd/a.txt", b"a");
        fsa.make_dir(client, "/vol/storage_sd/sub", FsaMode::from_bits_truncate(0x777))
            .unwrap();

        let dir = fsa.open_dir(client, "/vol/storage_sd").unwrap();
        let mut names = Vec::new();
        loop {
            match fsa.read_dir(client, dir) {
                Ok(entry) => names.push(entry.name),
                Err(ShimError::Status(FsaStatus::EndOfDir)) => break,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);

        fsa.rewind_dir(client, dir).unwrap();
        assert_eq!(fsa.read_dir(client, dir).unwrap().name, "a.txt");
        fsa.close_dir(client, dir).unwrap();
    }

    #[test]
    fn test_cwd_and_relative_paths() {
        let (service, fsa, client) = setup();
        fsa.mount(client, "/dev/sdcard01", "/vol/storage_sd", MountFlags::Global, &[])
            .unwrap();
        service.put_file("/vol/storage_sd/notes.txt", b"hi");
        fsa.change_dir(client, "/vol/storage_sd").unwrap();
        assert_eq!(fsa.get_cwd(client).unwrap(), "/vol/storage_sd");
        let stat = fsa.get_stat(client, "notes.txt").unwrap();
        assert_eq!(stat.size, 2);
    }

    #[test]
    fn test_elevation_denied() {
        let service = Arc::new(MemoryService::new());
        service.deny_elevation(MochaError::UnsupportedCommand);
        let fsa = FsaClient::new(service.clone());
        let client = fsa.add_client().unwrap();
        assert_eq!(fsa.unlock_client(client), Err(MochaError::UnsupportedCommand));
    }
}
