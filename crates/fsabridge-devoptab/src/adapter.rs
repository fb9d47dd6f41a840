//! POSIX operations for one mounted volume, carried out through the
//! filesystem service.
//!
//! Every operation takes the mount's lock for its whole duration and first
//! checks that the mount is still the one the device was created for. A
//! device that outlived its mount answers `ENODEV` without contacting the
//! service.

use std::fmt;
use std::sync::Arc;

use fsabridge_shim::aligned::is_aligned;
use fsabridge_shim::{
    DirHandle, FileHandle, FsaClient, FsaDirEntry, FsaMode, FsaStatus, ReadWriteFlags, ShimError,
    MAX_PATH_LEN, SHIM_ALIGNMENT,
};
use parking_lot::{Mutex, MutexGuard};

use crate::config::BridgeConfig;
use crate::dispatch::{DeviceOps, DirState, FileState};
use crate::error::{Errno, PosixResult};
use crate::path::fix_path;
use crate::registry::{MountContext, MountRegistry, SlotId};
use crate::translate::{
    can_read, can_write, create_mode, open_mode, posix_to_fsa_mode, translate_stat,
};
use crate::types::{DirEntry, Stat, StatVfs, Whence};

/// Tag stored in every directory stream this adapter creates.
pub const FS_DIRITER_MAGIC: u32 = 0x7769_6975;

/// State of one open file.
#[derive(Debug)]
pub struct FsaFile {
    slot: SlotId,
    handle: FileHandle,
    flags: i32,
    offset: u32,
    /// Rebased path, kept for `fchmod`.
    path: String,
}

impl FsaFile {
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// State of one directory stream.
#[derive(Debug)]
pub struct FsaDir {
    magic: u32,
    slot: SlotId,
    handle: DirHandle,
    /// Last entry returned.
    entry: Option<FsaDirEntry>,
}

impl FsaDir {
    /// The entry most recently returned by the stream.
    pub fn last_entry(&self) -> Option<&FsaDirEntry> {
        self.entry.as_ref()
    }
}

#[derive(Debug, Clone, Copy)]
struct Chunks {
    max_read: usize,
    max_write: usize,
    staging: usize,
}

/// Length of the next transfer and whether it can use the caller's memory.
fn plan_chunk(addr: usize, remaining: usize, max_direct: usize, staging: usize) -> (usize, bool) {
    if is_aligned(addr) && remaining >= SHIM_ALIGNMENT {
        let len = remaining.min(max_direct);
        (len - len % SHIM_ALIGNMENT, true)
    } else {
        (remaining.min(staging), false)
    }
}

/// One mounted volume as a device.
pub struct FsaDevice {
    name: String,
    slot: SlotId,
    client: FsaClient,
    registry: Arc<MountRegistry>,
    context: Arc<Mutex<MountContext>>,
    chunks: Chunks,
}

impl fmt::Debug for FsaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsaDevice")
            .field("name", &self.name)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl FsaDevice {
    pub fn new(
        name: &str,
        slot: SlotId,
        client: FsaClient,
        registry: Arc<MountRegistry>,
        context: Arc<Mutex<MountContext>>,
        config: &BridgeConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            slot,
            client,
            registry,
            context,
            chunks: Chunks {
                max_read: config.max_read_chunk,
                max_write: config.max_write_chunk,
                staging: config.staging_chunk,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Take the mount lock, failing if the mount is gone.
    fn enter(&self) -> PosixResult<MutexGuard<'_, MountContext>> {
        let ctx = self.context.lock();
        if !ctx.live || !self.registry.is_current(self.slot) {
            return Err(Errno::ENODEV);
        }
        Ok(ctx)
    }

    fn fail(&self, op: &'static str, target: &dyn fmt::Display, e: ShimError) -> Errno {
        tracing::error!(
            device = %self.name,
            op,
            target = %target,
            code = e.code(),
            status = %e,
            "filesystem request failed"
        );
        e.into()
    }

    /// Logged once per call that falls back to the scratch buffer.
    fn warn_staging(&self, operation: &'static str, len: usize) {
        tracing::warn!(
            device = %self.name,
            operation,
            len,
            "caller buffer is not 0x40-aligned, staging through a bounce buffer"
        );
    }

    fn file<'a>(&self, state: &'a mut FileState) -> PosixResult<&'a mut FsaFile> {
        let file = state.downcast_mut::<FsaFile>().ok_or(Errno::EBADF)?;
        if file.slot != self.slot {
            return Err(Errno::EBADF);
        }
        Ok(file)
    }

    fn dir<'a>(&self, state: &'a mut DirState) -> PosixResult<&'a mut FsaDir> {
        let dir = state.downcast_mut::<FsaDir>().ok_or(Errno::EBADF)?;
        if dir.magic != FS_DIRITER_MAGIC {
            return Err(Errno::EINVAL);
        }
        if dir.slot != self.slot {
            return Err(Errno::EBADF);
        }
        Ok(dir)
    }

    fn dev(&self) -> u64 {
        self.slot.index as u64
    }
}

impl DeviceOps for FsaDevice {
    // ========================================================================
    // Open files
    // ========================================================================

    fn open(&self, path: &str, flags: i32, mode: u32) -> PosixResult<FileState> {
        let ctx = self.enter()?;
        let fixed = fix_path(path, &ctx.mount_path)?;
        let client = ctx.client;

        let mut fsa_mode = open_mode(flags);
        if flags & libc::O_CREAT != 0 {
            let exclusive = flags & libc::O_EXCL != 0;
            if exclusive || fsa_mode.starts_with('r') {
                match self.client.get_stat(client, &fixed) {
                    Ok(_) if exclusive => return Err(Errno::EEXIST),
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {
                        if fsa_mode.starts_with('r') {
                            fsa_mode = create_mode(flags);
                        }
                    }
                    Err(e) => return Err(self.fail("open", &fixed, e)),
                }
            }
        }

        let handle = self
            .client
            .open_file(client, &fixed, fsa_mode, posix_to_fsa_mode(mode), 0, 0)
            .map_err(|e| self.fail("open", &fixed, e))?;

        let mut offset = 0;
        if flags & libc::O_APPEND != 0 {
            match self.client.get_stat_file(client, handle) {
                Ok(stat) => offset = stat.size,
                Err(e) => {
                    if let Err(close) = self.client.close_file(client, handle) {
                        tracing::warn!(
                            device = %self.name,
                            path = %fixed,
                            %handle,
                            error = %close,
                            "failed to close file after open error"
                        );
                    }
                    return Err(self.fail("open", &fixed, e));
                }
            }
        }

        tracing::trace!(
            device = %self.name,
            path = %fixed,
            mode = fsa_mode,
            %handle,
            "opened file"
        );
        Ok(Box::new(FsaFile {
            slot: self.slot,
            handle,
            flags,
            offset,
            path: fixed,
        }))
    }

    fn close(&self, mut file: FileState) -> PosixResult<()> {
        let ctx = self.enter()?;
        let file = self.file(&mut file)?;
        self.client
            .close_file(ctx.client, file.handle)
            .map_err(|e| self.fail("close", &file.path, e))
    }

    fn read(&self, file: &mut FileState, buf: &mut [u8]) -> PosixResult<usize> {
        let mut ctx = self.enter()?;
        let client = ctx.client;
        let file = self.file(file)?;
        if !can_read(file.flags) {
            return Err(Errno::EBADF);
        }

        let mut done = 0;
        let mut staging = false;
        while done < buf.len() {
            let remaining = &mut buf[done..];
            let (len, direct) = plan_chunk(
                remaining.as_ptr() as usize,
                remaining.len(),
                self.chunks.max_read,
                self.chunks.staging,
            );
            let size = u32::try_from(len).map_err(|_| Errno::EINVAL)?;
            let result = if direct {
                self.client.read_file(
                    client,
                    file.handle,
                    &mut remaining[..len],
                    1,
                    size,
                    file.offset,
                    ReadWriteFlags::WITH_POS,
                )
            } else {
                if !staging {
                    self.warn_staging("read", remaining.len());
                    staging = true;
                }
                let scratch = ctx.scratch(self.chunks.staging).ok_or(Errno::ENOMEM)?;
                let staged = &mut scratch.as_mut_slice()[..len];
                self.client
                    .read_file(
                        client,
                        file.handle,
                        staged,
                        1,
                        size,
                        file.offset,
                        ReadWriteFlags::WITH_POS,
                    )
                    .inspect(|&n| {
                        let n = (n as usize).min(len);
                        remaining[..n].copy_from_slice(&staged[..n]);
                    })
            };

            match result {
                Ok(n) => {
                    let n = (n as usize).min(len);
                    done += n;
                    file.offset = file.offset.saturating_add(n as u32);
                    if n < len {
                        break;
                    }
                }
                Err(e) if done > 0 => {
                    tracing::debug!(device = %self.name, done, error = %e, "short read");
                    break;
                }
                Err(e) => return Err(self.fail("read", &file.path, e)),
            }
        }
        Ok(done)
    }

    fn write(&self, file: &mut FileState, buf: &[u8]) -> PosixResult<usize> {
        let mut ctx = self.enter()?;
        let client = ctx.client;
        let file = self.file(file)?;
        if !can_write(file.flags) {
            return Err(Errno::EBADF);
        }

        let mut done = 0;
        let mut staging = false;
        while done < buf.len() {
            let remaining = &buf[done..];
            let (len, direct) = plan_chunk(
                remaining.as_ptr() as usize,
                remaining.len(),
                self.chunks.max_write,
                self.chunks.staging,
            );
            let size = u32::try_from(len).map_err(|_| Errno::EINVAL)?;
            let result = if direct {
                self.client.write_file(
                    client,
                    file.handle,
                    &remaining[..len],
                    1,
                    size,
                    file.offset,
                    ReadWriteFlags::WITH_POS,
                )
            } else {
                if !staging {
                    self.warn_staging("write", remaining.len());
                    staging = true;
                }
                let scratch = ctx.scratch(self.chunks.staging).ok_or(Errno::ENOMEM)?;
                let staged = &mut scratch.as_mut_slice()[..len];
                staged.copy_from_slice(&remaining[..len]);
                self.client
                    .write_file(
                        client,
                        file.handle,
                        staged,
                        1,
                        size,
                        file.offset,
                        ReadWriteFlags::WITH_POS,
                    )
            };

            match result {
                Ok(n) => {
                    let n = (n as usize).min(len);
                    done += n;
                    file.offset = file.offset.saturating_add(n as u32);
                    if n < len {
                        break;
                    }
                }
                Err(e) if done > 0 => {
                    tracing::debug!(device = %self.name, done, error = %e, "short write");
                    break;
                }
                Err(e) => return Err(self.fail("write", &file.path, e)),
            }
        }
        Ok(done)
    }

    fn seek(&self, file: &mut FileState, pos: i64, whence: Whence) -> PosixResult<u64> {
        let ctx = self.enter()?;
        let file = self.file(file)?;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => i64::from(file.offset),
            Whence::End => {
                let stat = self
                    .client
                    .get_stat_file(ctx.client, file.handle)
                    .map_err(|e| self.fail("seek", &file.path, e))?;
                i64::from(stat.size)
            }
        };
        let target = base.checked_add(pos).ok_or(Errno::EINVAL)?;
        let offset = u32::try_from(target).map_err(|_| Errno::EINVAL)?;
        file.offset = offset;
        Ok(u64::from(offset))
    }

    fn fstat(&self, file: &mut FileState) -> PosixResult<Stat> {
        let ctx = self.enter()?;
        let file = self.file(file)?;
        let stat = self
            .client
            .get_stat_file(ctx.client, file.handle)
            .map_err(|e| self.fail("fstat", &file.path, e))?;
        Ok(translate_stat(&stat, self.dev()))
    }

    fn ftruncate(&self, file: &mut FileState, len: i64) -> PosixResult<()> {
        let ctx = self.enter()?;
        let file = self.file(file)?;
        let len = u32::try_from(len).map_err(|_| Errno::EINVAL)?;
        if !can_write(file.flags) {
            return Err(Errno::EBADF);
        }
        self.client
            .set_pos_file(ctx.client, file.handle, len)
            .and_then(|()| self.client.truncate_file(ctx.client, file.handle))
            .map_err(|e| self.fail("ftruncate", &file.path, e))
    }

    fn fsync(&self, file: &mut FileState) -> PosixResult<()> {
        let ctx = self.enter()?;
        let file = self.file(file)?;
        self.client
            .flush_file(ctx.client, file.handle)
            .map_err(|e| self.fail("fsync", &file.path, e))
    }

    fn fchmod(&self, file: &mut FileState, mode: u32) -> PosixResult<()> {
        let ctx = self.enter()?;
        let file = self.file(file)?;
        self.client
            .change_mode(ctx.client, &file.path, posix_to_fsa_mode(mode), FsaMode::ALL)
            .map_err(|e| self.fail("fchmod", &file.path, e))
    }

    // ========================================================================
    // Namespace
    // ========================================================================

    fn stat(&self, path: &str) -> PosixResult<Stat> {
        let ctx = self.enter()?;
        let fixed = fix_path(path, &ctx.mount_path)?;
        let stat = self
            .client
            .get_stat(ctx.client, &fixed)
            .map_err(|e| self.fail("stat", &fixed, e))?;
        Ok(translate_stat(&stat, self.dev()))
    }

    fn link(&self, _existing: &str, _new: &str) -> PosixResult<()> {
        let _ctx = self.enter()?;
        Err(Errno::ENOSYS)
    }

    fn unlink(&self, path: &str) -> PosixResult<()> {
        let ctx = self.enter()?;
        let fixed = fix_path(path, &ctx.mount_path)?;
        self.client
            .remove(ctx.client, &fixed)
            .map_err(|e| self.fail("unlink", &fixed, e))
    }

    fn chdir(&self, path: &str) -> PosixResult<()> {
        let ctx = self.enter()?;
        let fixed = fix_path(path, &ctx.mount_path)?;
        self.client
            .change_dir(ctx.client, &fixed)
            .map_err(|e| self.fail("chdir", &fixed, e))
    }

    fn rename(&self, old: &str, new: &str) -> PosixResult<()> {
        let ctx = self.enter()?;
        let old_fixed = fix_path(old, &ctx.mount_path)?;
        let new_fixed = fix_path(new, &ctx.mount_path)?;
        self.client
            .rename(ctx.client, &old_fixed, &new_fixed)
            .map_err(|e| self.fail("rename", &old_fixed, e))
    }

    fn mkdir(&self, path: &str, mode: u32) -> PosixResult<()> {
        let ctx = self.enter()?;
        let fixed = fix_path(path, &ctx.mount_path)?;
        self.client
            .make_dir(ctx.client, &fixed, posix_to_fsa_mode(mode))
            .map_err(|e| self.fail("mkdir", &fixed, e))
    }

    fn rmdir(&self, path: &str) -> PosixResult<()> {
        let ctx = self.enter()?;
        let fixed = fix_path(path, &ctx.mount_path)?;
        self.client
            .remove(ctx.client, &fixed)
            .map_err(|e| self.fail("rmdir", &fixed, e))
    }

    fn statvfs(&self, path: &str) -> PosixResult<StatVfs> {
        let ctx = self.enter()?;
        let fixed = fix_path(path, &ctx.mount_path)?;
        let free = self
            .client
            .get_free_space(ctx.client, &fixed)
            .map_err(|e| self.fail("statvfs", &fixed, e))?;
        let sector_size = u64::from(ctx.sector_size);
        let free_blocks = free.checked_div(sector_size).unwrap_or(0);
        Ok(StatVfs {
            bsize: sector_size,
            frsize: sector_size,
            blocks: ctx.size_in_sectors,
            bfree: free_blocks,
            bavail: free_blocks,
            files: u64::from(u32::MAX),
            ffree: u64::from(u32::MAX),
            favail: u64::from(u32::MAX),
            fsid: self.dev(),
            flag: libc::ST_NOSUID as u64,
            namemax: MAX_PATH_LEN as u64,
        })
    }

    fn chmod(&self, path: &str, mode: u32) -> PosixResult<()> {
        let ctx = self.enter()?;
        let fixed = fix_path(path, &ctx.mount_path)?;
        self.client
            .change_mode(ctx.client, &fixed, posix_to_fsa_mode(mode), FsaMode::ALL)
            .map_err(|e| self.fail("chmod", &fixed, e))
    }

    // ========================================================================
    // Directory streams
    // ========================================================================

    fn diropen(&self, path: &str) -> PosixResult<DirState> {
        let ctx = self.enter()?;
        let fixed = fix_path(path, &ctx.mount_path)?;
        let handle = self
            .client
            .open_dir(ctx.client, &fixed)
            .map_err(|e| self.fail("diropen", &fixed, e))?;
        Ok(Box::new(FsaDir {
            magic: FS_DIRITER_MAGIC,
            slot: self.slot,
            handle,
            entry: None,
        }))
    }

    fn dirreset(&self, dir: &mut DirState) -> PosixResult<()> {
        let ctx = self.enter()?;
        let dir = self.dir(dir)?;
        dir.entry = None;
        self.client
            .rewind_dir(ctx.client, dir.handle)
            .map_err(|e| self.fail("dirreset", &dir.handle, e))
    }

    fn dirnext(&self, dir: &mut DirState) -> PosixResult<DirEntry> {
        let ctx = self.enter()?;
        let dir = self.dir(dir)?;
        let entry = match self.client.read_dir(ctx.client, dir.handle) {
            Ok(entry) => entry,
            Err(ShimError::Status(FsaStatus::EndOfDir)) => {
                dir.entry = None;
                return Err(Errno::ENOENT);
            }
            Err(e) => return Err(self.fail("dirnext", &dir.handle, e)),
        };
        let next = DirEntry {
            name: entry.name.clone(),
            stat: translate_stat(&entry.stat, self.dev()),
        };
        dir.entry = Some(entry);
        Ok(next)
    }

    fn dirclose(&self, mut dir: DirState) -> PosixResult<()> {
        let ctx = self.enter()?;
        let dir = self.dir(&mut dir)?;
        self.client
            .close_dir(ctx.client, dir.handle)
            .map_err(|e| self.fail("dirclose", &dir.handle, e))
    }
}
