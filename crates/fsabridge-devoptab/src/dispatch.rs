//! Device-prefixed path dispatch.
//!
//! A path of the form `name:/rest` is routed to the device registered
//! under `name`. Paths without a device prefix go to the default device,
//! which is whichever device last accepted a `chdir`.
//!
//! [`Vfs`] layers a descriptor table on top of the [`DeviceTable`], so
//! callers work with small integers the way they would with `open(2)`.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Errno, PosixResult};
use crate::path::split_device;
use crate::types::{DirEntry, Stat, StatVfs, Whence};

/// Per-open-file state owned by a device. Opaque to the dispatcher.
pub type FileState = Box<dyn Any + Send>;

/// Per-directory-stream state owned by a device. Opaque to the dispatcher.
pub type DirState = Box<dyn Any + Send>;

/// First descriptor handed out; 0 to 2 are the standard streams.
pub const FIRST_FD: i32 = 3;

/// The operation table a device exposes to the dispatcher.
///
/// Paths arrive as the caller wrote them, device prefix included.
pub trait DeviceOps: Send + Sync {
    // ========================================================================
    // Open files
    // ========================================================================

    /// Open a file with `open(2)` flags. `mode` applies if it is created.
    fn open(&self, path: &str, flags: i32, mode: u32) -> PosixResult<FileState>;

    fn close(&self, file: FileState) -> PosixResult<()>;

    /// Read at the file's offset, advancing it. Returns bytes read.
    fn read(&self, file: &mut FileState, buf: &mut [u8]) -> PosixResult<usize>;

    /// Write at the file's offset, advancing it. Returns bytes written.
    fn write(&self, file: &mut FileState, buf: &[u8]) -> PosixResult<usize>;

    /// Move the file offset. Returns the new offset.
    fn seek(&self, file: &mut FileState, pos: i64, whence: Whence) -> PosixResult<u64>;

    fn fstat(&self, file: &mut FileState) -> PosixResult<Stat>;

    fn ftruncate(&self, file: &mut FileState, len: i64) -> PosixResult<()>;

    fn fsync(&self, file: &mut FileState) -> PosixResult<()>;

    fn fchmod(&self, file: &mut FileState, mode: u32) -> PosixResult<()>;

    // ========================================================================
    // Namespace
    // ========================================================================

    fn stat(&self, path: &str) -> PosixResult<Stat>;

    fn link(&self, existing: &str, new: &str) -> PosixResult<()>;

    fn unlink(&self, path: &str) -> PosixResult<()>;

    fn chdir(&self, path: &str) -> PosixResult<()>;

    fn rename(&self, old: &str, new: &str) -> PosixResult<()>;

    fn mkdir(&self, path: &str, mode: u32) -> PosixResult<()>;

    fn rmdir(&self, path: &str) -> PosixResult<()>;

    fn statvfs(&self, path: &str) -> PosixResult<StatVfs>;

    fn chmod(&self, path: &str, mode: u32) -> PosixResult<()>;

    // ========================================================================
    // Directory streams
    // ========================================================================

    fn diropen(&self, path: &str) -> PosixResult<DirState>;

    fn dirreset(&self, dir: &mut DirState) -> PosixResult<()>;

    /// Next entry, or `ENOENT` once the stream is exhausted.
    fn dirnext(&self, dir: &mut DirState) -> PosixResult<DirEntry>;

    fn dirclose(&self, dir: DirState) -> PosixResult<()>;
}

/// Registered devices, keyed by name.
pub struct DeviceTable {
    devices: RwLock<BTreeMap<String, Arc<dyn DeviceOps>>>,
    default: RwLock<Option<String>>,
}

impl fmt::Debug for DeviceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTable")
            .field("devices", &self.device_names())
            .field("default", &*self.default.read())
            .finish()
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTable {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
            default: RwLock::new(None),
        }
    }

    /// Register a device. Fails with `EEXIST` if the name is taken.
    pub fn add_device(&self, name: &str, device: Arc<dyn DeviceOps>) -> PosixResult<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        devices.insert(name.to_string(), device);
        tracing::debug!(device = name, "registered device");
        Ok(())
    }

    /// Unregister a device, clearing it as the default if it was.
    pub fn remove_device(&self, name: &str) -> Option<Arc<dyn DeviceOps>> {
        let removed = self.devices.write().remove(name);
        let mut default = self.default.write();
        if default.as_deref() == Some(name) {
            *default = None;
        }
        if removed.is_some() {
            tracing::debug!(device = name, "unregistered device");
        }
        removed
    }

    pub fn find_device(&self, name: &str) -> Option<Arc<dyn DeviceOps>> {
        self.devices.read().get(name).cloned()
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }

    pub fn default_device(&self) -> Option<String> {
        self.default.read().clone()
    }

    fn set_default(&self, name: &str) {
        *self.default.write() = Some(name.to_string());
    }

    /// The device a path routes to, and that device's name.
    pub fn resolve(&self, path: &str) -> PosixResult<(String, Arc<dyn DeviceOps>)> {
        let name = match split_device(path) {
            (Some(name), _) => name.to_string(),
            (None, _) => self.default_device().ok_or(Errno::ENOENT)?,
        };
        let device = self.find_device(&name).ok_or(Errno::ENOENT)?;
        Ok((name, device))
    }
}

struct OpenFile {
    device: Arc<dyn DeviceOps>,
    state: Arc<Mutex<FileState>>,
}

/// An open directory stream.
pub struct DirStream {
    device: Arc<dyn DeviceOps>,
    state: DirState,
}

impl fmt::Debug for DirStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirStream").finish_non_exhaustive()
    }
}

/// Descriptor-based file API over a [`DeviceTable`].
pub struct Vfs {
    devices: Arc<DeviceTable>,
    files: Mutex<HashMap<i32, OpenFile>>,
}

impl fmt::Debug for Vfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vfs")
            .field("devices", &self.devices)
            .field("open_files", &self.files.lock().len())
            .finish()
    }
}

impl Vfs {
    pub fn new(devices: Arc<DeviceTable>) -> Self {
        Self {
            devices,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn devices(&self) -> &Arc<DeviceTable> {
        &self.devices
    }

    fn file(&self, fd: i32) -> PosixResult<(Arc<dyn DeviceOps>, Arc<Mutex<FileState>>)> {
        let files = self.files.lock();
        let open = files.get(&fd).ok_or(Errno::EBADF)?;
        Ok((open.device.clone(), open.state.clone()))
    }

    fn with_file<R>(
        &self,
        fd: i32,
        f: impl FnOnce(&dyn DeviceOps, &mut FileState) -> PosixResult<R>,
    ) -> PosixResult<R> {
        let (device, state) = self.file(fd)?;
        let mut state = state.lock();
        f(device.as_ref(), &mut state)
    }

    // ========================================================================
    // Descriptors
    // ========================================================================

    /// Open `path` and return the lowest free descriptor.
    pub fn open(&self, path: &str, flags: i32, mode: u32) -> PosixResult<i32> {
        let (_, device) = self.devices.resolve(path)?;
        let state = device.open(path, flags, mode)?;
        let mut files = self.files.lock();
        let fd = (FIRST_FD..)
            .find(|fd| !files.contains_key(fd))
            .ok_or(Errno::EMFILE)?;
        files.insert(
            fd,
            OpenFile {
                device,
                state: Arc::new(Mutex::new(state)),
            },
        );
        Ok(fd)
    }

    /// Close a descriptor. The descriptor is released even if the device
    /// reports an error.
    pub fn close(&self, fd: i32) -> PosixResult<()> {
        let open = {
            let mut files = self.files.lock();
            let open = files.get(&fd).ok_or(Errno::EBADF)?;
            // Another thread is mid-call on this descriptor.
            if Arc::strong_count(&open.state) > 1 {
                return Err(Errno::EBUSY);
            }
            files.remove(&fd).ok_or(Errno::EBADF)?
        };
        let state = Arc::try_unwrap(open.state).map_err(|_| Errno::EBUSY)?;
        open.device.close(state.into_inner())
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> PosixResult<usize> {
        self.with_file(fd, |dev, file| dev.read(file, buf))
    }

    pub fn write(&self, fd: i32, buf: &[u8]) -> PosixResult<usize> {
        self.with_file(fd, |dev, file| dev.write(file, buf))
    }

    /// `lseek(2)`: `whence` is a raw `SEEK_*` constant.
    pub fn lseek(&self, fd: i32, pos: i64, whence: i32) -> PosixResult<u64> {
        let whence = Whence::from_raw(whence).ok_or(Errno::EINVAL)?;
        self.with_file(fd, |dev, file| dev.seek(file, pos, whence))
    }

    pub fn fstat(&self, fd: i32) -> PosixResult<Stat> {
        self.with_file(fd, |dev, file| dev.fstat(file))
    }

    pub fn ftruncate(&self, fd: i32, len: i64) -> PosixResult<()> {
        self.with_file(fd, |dev, file| dev.ftruncate(file, len))
    }

    pub fn fsync(&self, fd: i32) -> PosixResult<()> {
        self.with_file(fd, |dev, file| dev.fsync(file))
    }

    pub fn fchmod(&self, fd: i32, mode: u32) -> PosixResult<()> {
        self.with_file(fd, |dev, file| dev.fchmod(file, mode))
    }

    pub fn open_count(&self) -> usize {
        self.files.lock().len()
    }

    // ========================================================================
    // Paths
    // ========================================================================

    pub fn stat(&self, path: &str) -> PosixResult<Stat> {
        self.devices.resolve(path)?.1.stat(path)
    }

    pub fn unlink(&self, path: &str) -> PosixResult<()> {
        self.devices.resolve(path)?.1.unlink(path)
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> PosixResult<()> {
        self.devices.resolve(path)?.1.mkdir(path, mode)
    }

    pub fn rmdir(&self, path: &str) -> PosixResult<()> {
        self.devices.resolve(path)?.1.rmdir(path)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> PosixResult<()> {
        self.devices.resolve(path)?.1.chmod(path, mode)
    }

    pub fn statvfs(&self, path: &str) -> PosixResult<StatVfs> {
        self.devices.resolve(path)?.1.statvfs(path)
    }

    /// Change directory; on success the device becomes the default.
    pub fn chdir(&self, path: &str) -> PosixResult<()> {
        let (name, device) = self.devices.resolve(path)?;
        device.chdir(path)?;
        self.devices.set_default(&name);
        Ok(())
    }

    /// Both paths must resolve to the same device.
    pub fn rename(&self, old: &str, new: &str) -> PosixResult<()> {
        let (old_name, device) = self.devices.resolve(old)?;
        let (new_name, _) = self.devices.resolve(new)?;
        if old_name != new_name {
            return Err(Errno::EXDEV);
        }
        device.rename(old, new)
    }

    pub fn link(&self, existing: &str, new: &str) -> PosixResult<()> {
        let (old_name, device) = self.devices.resolve(existing)?;
        let (new_name, _) = self.devices.resolve(new)?;
        if old_name != new_name {
            return Err(Errno::EXDEV);
        }
        device.link(existing, new)
    }

    // ========================================================================
    // Directory streams
    // ========================================================================

    pub fn opendir(&self, path: &str) -> PosixResult<DirStream> {
        let (_, device) = self.devices.resolve(path)?;
        let state = device.diropen(path)?;
        Ok(DirStream { device, state })
    }

    /// Next entry, or `None` at the end of the stream.
    pub fn readdir(&self, dir: &mut DirStream) -> PosixResult<Option<DirEntry>> {
        match dir.device.dirnext(&mut dir.state) {
            Ok(entry) => Ok(Some(entry)),
            Err(Errno::ENOENT) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn rewinddir(&self, dir: &mut DirStream) -> PosixResult<()> {
        dir.device.dirreset(&mut dir.state)
    }

    pub fn closedir(&self, dir: DirStream) -> PosixResult<()> {
        dir.device.dirclose(dir.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records which paths reach it; files are a bare counter.
    #[derive(Default)]
    struct EchoDevice {
        seen: Mutex<Vec<String>>,
    }

    impl EchoDevice {
        fn saw(&self, path: &str) -> PosixResult<()> {
            self.seen.lock().push(path.to_string());
            Ok(())
        }
    }

    impl DeviceOps for EchoDevice {
        fn open(&self, path: &str, _flags: i32, _mode: u32) -> PosixResult<FileState> {
            self.saw(path)?;
            Ok(Box::new(0u64))
        }
        fn close(&self, _file: FileState) -> PosixResult<()> {
            Ok(())
        }
        fn read(&self, file: &mut FileState, buf: &mut [u8]) -> PosixResult<usize> {
            let n = file.downcast_mut::<u64>().ok_or(Errno::EBADF)?;
            *n += 1;
            Ok(buf.len())
        }
        fn write(&self, _file: &mut FileState, buf: &[u8]) -> PosixResult<usize> {
            Ok(buf.len())
        }
        fn seek(&self, _file: &mut FileState, pos: i64, _whence: Whence) -> PosixResult<u64> {
            Ok(pos as u64)
        }
        fn fstat(&self, file: &mut FileState) -> PosixResult<Stat> {
            let n = file.downcast_mut::<u64>().ok_or(Errno::EBADF)?;
            Ok(Stat {
                size: *n,
                ..Default::default()
            })
        }
        fn ftruncate(&self, _file: &mut FileState, _len: i64) -> PosixResult<()> {
            Ok(())
        }
        fn fsync(&self, _file: &mut FileState) -> PosixResult<()> {
            Ok(())
        }
        fn fchmod(&self, _file: &mut FileState, _mode: u32) -> PosixResult<()> {
            Ok(())
        }
        fn stat(&self, path: &str) -> PosixResult<Stat> {
            self.saw(path)?;
            Ok(Stat::default())
        }
        fn link(&self, _existing: &str, _new: &str) -> PosixResult<()> {
            Err(Errno::ENOSYS)
        }
        fn unlink(&self, path: &str) -> PosixResult<()> {
            self.saw(path)
        }
        fn chdir(&self, path: &str) -> PosixResult<()> {
            self.saw(path)
        }
        fn rename(&self, old: &str, _new: &str) -> PosixResult<()> {
            self.saw(old)
        }
        fn mkdir(&self, path: &str, _mode: u32) -> PosixResult<()> {
            self.saw(path)
        }
        fn rmdir(&self, path: &str) -> PosixResult<()> {
            self.saw(path)
        }
        fn statvfs(&self, _path: &str) -> PosixResult<StatVfs> {
            Ok(StatVfs::default())
        }
        fn chmod(&self, path: &str, _mode: u32) -> PosixResult<()> {
            self.saw(path)
        }
        fn diropen(&self, _path: &str) -> PosixResult<DirState> {
            Ok(Box::new(2u32))
        }
        fn dirreset(&self, dir: &mut DirState) -> PosixResult<()> {
            *dir.downcast_mut::<u32>().ok_or(Errno::EBADF)? = 2;
            Ok(())
        }
        fn dirnext(&self, dir: &mut DirState) -> PosixResult<DirEntry> {
            let left = dir.downcast_mut::<u32>().ok_or(Errno::EBADF)?;
            if *left == 0 {
                return Err(Errno::ENOENT);
            }
            *left -= 1;
            Ok(DirEntry {
                name: format!("e{left}"),
                stat: Stat::default(),
            })
        }
        fn dirclose(&self, _dir: DirState) -> PosixResult<()> {
            Ok(())
        }
    }

    fn table_with(names: &[&str]) -> (Arc<DeviceTable>, Vec<Arc<EchoDevice>>) {
        let table = Arc::new(DeviceTable::new());
        let devices = names
            .iter()
            .map(|name| {
                let device = Arc::new(EchoDevice::default());
                table.add_device(name, device.clone()).unwrap();
                device
            })
            .collect();
        (table, devices)
    }

    #[test]
    fn test_add_remove_find() {
        let (table, _) = table_with(&["sd"]);
        assert!(table.find_device("sd").is_some());
        assert_eq!(
            table.add_device("sd", Arc::new(EchoDevice::default())).unwrap_err(),
            Errno::EEXIST
        );
        assert!(table.remove_device("sd").is_some());
        assert!(table.find_device("sd").is_none());
        assert!(table.remove_device("sd").is_none());
    }

    #[test]
    fn test_routes_by_prefix() {
        let (table, devices) = table_with(&["sd", "usb"]);
        let vfs = Vfs::new(table);
        vfs.stat("usb:/a").unwrap();
        vfs.mkdir("sd:/b", 0o755).unwrap();
        assert_eq!(*devices[0].seen.lock(), vec!["sd:/b".to_string()]);
        assert_eq!(*devices[1].seen.lock(), vec!["usb:/a".to_string()]);
        assert_eq!(vfs.stat("nope:/a").unwrap_err(), Errno::ENOENT);
    }

    #[test]
    fn test_default_device_follows_chdir() {
        let (table, devices) = table_with(&["sd", "usb"]);
        let vfs = Vfs::new(table.clone());
        assert_eq!(vfs.stat("/x").unwrap_err(), Errno::ENOENT);

        vfs.chdir("usb:/dir").unwrap();
        assert_eq!(table.default_device().as_deref(), Some("usb"));
        vfs.unlink("plain.txt").unwrap();
        assert!(devices[1].seen.lock().contains(&"plain.txt".to_string()));

        table.remove_device("usb");
        assert_eq!(table.default_device(), None);
        assert_eq!(vfs.unlink("plain.txt").unwrap_err(), Errno::ENOENT);
    }

    #[test]
    fn test_cross_device_rejected() {
        let (table, _) = table_with(&["sd", "usb"]);
        let vfs = Vfs::new(table);
        assert_eq!(vfs.rename("sd:/a", "usb:/a").unwrap_err(), Errno::EXDEV);
        assert_eq!(vfs.link("sd:/a", "usb:/a").unwrap_err(), Errno::EXDEV);
        vfs.rename("sd:/a", "sd:/b").unwrap();
        assert_eq!(vfs.link("sd:/a", "sd:/b").unwrap_err(), Errno::ENOSYS);
    }

    #[test]
    fn test_descriptors() {
        let (table, _) = table_with(&["sd"]);
        let vfs = Vfs::new(table);
        let a = vfs.open("sd:/a", libc::O_RDONLY, 0).unwrap();
        let b = vfs.open("sd:/b", libc::O_RDONLY, 0).unwrap();
        assert_eq!((a, b), (FIRST_FD, FIRST_FD + 1));

        let mut buf = [0u8; 8];
        assert_eq!(vfs.read(a, &mut buf).unwrap(), 8);
        vfs.read(a, &mut buf).unwrap();
        assert_eq!(vfs.fstat(a).unwrap().size, 2);
        assert_eq!(vfs.fstat(b).unwrap().size, 0);

        vfs.close(a).unwrap();
        assert_eq!(vfs.read(a, &mut buf).unwrap_err(), Errno::EBADF);
        assert_eq!(vfs.close(a).unwrap_err(), Errno::EBADF);
        // Lowest free descriptor is reused.
        assert_eq!(vfs.open("sd:/c", libc::O_RDONLY, 0).unwrap(), a);
        assert_eq!(vfs.open_count(), 2);
    }

    #[test]
    fn test_lseek_rejects_bad_whence() {
        let (table, _) = table_with(&["sd"]);
        let vfs = Vfs::new(table);
        let fd = vfs.open("sd:/a", libc::O_RDONLY, 0).unwrap();
        assert_eq!(vfs.lseek(fd, 0, 99).unwrap_err(), Errno::EINVAL);
        assert_eq!(vfs.lseek(fd, 5, libc::SEEK_SET).unwrap(), 5);
    }

    #[test]
    fn test_dir_stream() {
        let (table, _) = table_with(&["sd"]);
        let vfs = Vfs::new(table);
        let mut dir = vfs.opendir("sd:/").unwrap();
        let mut names = Vec::new();
        while let Some(entry) = vfs.readdir(&mut dir).unwrap() {
            names.push(entry.name);
        }
        assert_eq!(names, ["e1", "e0"]);
        vfs.rewinddir(&mut dir).unwrap();
        assert!(vfs.readdir(&mut dir).unwrap().is_some());
        vfs.closedir(dir).unwrap();
    }
}
