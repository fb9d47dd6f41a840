//! POSIX file and namespace operations through the descriptor API.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use fsabridge_devoptab::translate::EPOCH_DIFF_SECS;
use fsabridge_devoptab::{BridgeConfig, Errno, FsaBridge, Vfs};
use fsabridge_shim::testing::MemoryService;
use fsabridge_shim::{FsaCommand, FsaMode, FsaStatus, MAX_PATH_LEN, SHIM_ALIGNMENT};

const ROOT: &str = "/vol/storage_sd";
const SECTOR: u32 = 512;
const SECTORS: u64 = 4096;

// ============================================================================
// Shared test setup
// ============================================================================

/// A bridge with `sd` mounted, using small chunk sizes so multi-chunk
/// transfers show up with modest buffers.
fn mounted() -> (Arc<MemoryService>, FsaBridge) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let service = Arc::new(MemoryService::new());
    service.add_device("/dev/sdcard01", SECTOR, SECTORS);
    let config = BridgeConfig::default()
        .with_staging_chunk(0x100)
        .with_max_chunks(0x400, 0x400);
    let bridge = FsaBridge::new(service.clone(), config).expect("valid config");
    bridge
        .mount("sd", Some("/dev/sdcard01"), ROOT)
        .expect("mount sd");
    (service, bridge)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// A `len`-byte window of `storage`, 0x40-aligned or deliberately not.
fn window(storage: &mut [u8], len: usize, aligned: bool) -> &mut [u8] {
    let addr = storage.as_ptr() as usize;
    let mut start = (SHIM_ALIGNMENT - addr % SHIM_ALIGNMENT) % SHIM_ALIGNMENT;
    if !aligned {
        start += 3;
    }
    &mut storage[start..start + len]
}

fn read_all(vfs: &Vfs, path: &str, aligned: bool, len: usize) -> Vec<u8> {
    let fd = vfs.open(path, libc::O_RDONLY, 0).unwrap();
    let mut storage = vec![0u8; len + 2 * SHIM_ALIGNMENT];
    let buf = window(&mut storage, len, aligned);
    assert_eq!(buf.as_ptr() as usize % SHIM_ALIGNMENT == 0, aligned);
    let n = vfs.read(fd, buf).unwrap();
    assert_eq!(n, len);
    let out = buf.to_vec();
    vfs.close(fd).unwrap();
    out
}

// ============================================================================
// Alignment transparency
// ============================================================================

#[test]
fn test_reads_match_regardless_of_alignment() {
    let (service, bridge) = mounted();
    let data = pattern(10_000);
    service.put_file(&format!("{ROOT}/blob"), &data);

    let before = service.request_count(FsaCommand::ReadFile);
    let aligned = read_all(bridge.vfs(), "sd:/blob", true, data.len());
    let aligned_requests = service.request_count(FsaCommand::ReadFile) - before;
    let misaligned = read_all(bridge.vfs(), "sd:/blob", false, data.len());

    assert_eq!(aligned, data);
    assert_eq!(misaligned, data);
    // Nine 0x400 chunks, one 0x300 chunk, then a staged 0x10 tail.
    assert_eq!(aligned_requests, 11);
}

#[test]
fn test_writes_match_regardless_of_alignment() {
    let (service, bridge) = mounted();
    let vfs = bridge.vfs();
    let data = pattern(5_000);

    for (name, aligned) in [("a", true), ("m", false)] {
        let path = format!("sd:/{name}");
        let fd = vfs
            .open(&path, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, 0o644)
            .unwrap();
        let mut storage = vec![0u8; data.len() + 2 * SHIM_ALIGNMENT];
        let buf = window(&mut storage, data.len(), aligned);
        buf.copy_from_slice(&data);
        assert_eq!(vfs.write(fd, buf).unwrap(), data.len());
        vfs.close(fd).unwrap();
        assert_eq!(service.file_contents(&format!("{ROOT}/{name}")).unwrap(), data);
    }
}

#[test]
fn test_short_read_at_eof() {
    let (service, bridge) = mounted();
    service.put_file(&format!("{ROOT}/small"), b"abc");
    let vfs = bridge.vfs();
    let fd = vfs.open("sd:/small", libc::O_RDONLY, 0).unwrap();
    let mut buf = [0u8; 100];
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 3);
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 0);
}

#[test]
fn test_partial_transfer_returns_count() {
    let (service, bridge) = mounted();
    let data = pattern(0x300);
    service.put_file(&format!("{ROOT}/part"), &data);
    let vfs = bridge.vfs();
    let fd = vfs.open("sd:/part", libc::O_RDWR, 0).unwrap();

    // Misaligned, so the read goes out in 0x100-byte staged chunks.
    let mut storage = vec![0u8; data.len() + 2 * SHIM_ALIGNMENT];
    let buf = window(&mut storage, data.len(), false);
    service.fail_command_after(FsaCommand::ReadFile, FsaStatus::MediaError, 1);
    assert_eq!(vfs.read(fd, buf).unwrap(), 0x100);
    assert_eq!(&buf[..0x100], &data[..0x100]);
    assert_eq!(vfs.lseek(fd, 0, libc::SEEK_CUR).unwrap(), 0x100);

    // Nothing moved at all: the error comes through.
    assert_eq!(vfs.read(fd, buf).unwrap_err(), Errno::ENXIO);
    service.clear_fault(FsaCommand::ReadFile);
    assert_eq!(vfs.read(fd, buf).unwrap(), 0x200);
    assert_eq!(&buf[..0x200], &data[0x100..]);

    vfs.lseek(fd, 0, libc::SEEK_SET).unwrap();
    let mut storage = vec![0xAAu8; data.len() + 2 * SHIM_ALIGNMENT];
    let buf = window(&mut storage, data.len(), false);
    service.fail_command_after(FsaCommand::WriteFile, FsaStatus::StorageFull, 2);
    assert_eq!(vfs.write(fd, buf).unwrap(), 0x200);
    assert_eq!(vfs.lseek(fd, 0, libc::SEEK_CUR).unwrap(), 0x200);
    let contents = service.file_contents(&format!("{ROOT}/part")).unwrap();
    assert_eq!(&contents[..0x200], &[0xAA; 0x200][..]);
    assert_eq!(&contents[0x200..], &data[0x200..]);
}

/// Collects formatted log lines.
#[derive(Clone, Default)]
struct LogSink(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogSink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogSink {
    fn count(&self, needle: &str) -> usize {
        String::from_utf8_lossy(&self.0.lock()).matches(needle).count()
    }
}

#[test]
fn test_staging_is_logged_once_per_call() {
    let (service, bridge) = mounted();
    service.put_file(&format!("{ROOT}/blob"), &pattern(0x400));
    let sink = LogSink::default();
    let writer = sink.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        read_all(bridge.vfs(), "sd:/blob", true, 0x400);
        assert_eq!(sink.count("bounce buffer"), 0);
        read_all(bridge.vfs(), "sd:/blob", false, 0x400);
    });
    assert_eq!(sink.count("bounce buffer"), 1);
}

#[test]
fn test_failed_cleanup_close_is_logged() {
    let (service, bridge) = mounted();
    service.put_file(&format!("{ROOT}/log"), b"x");
    service.fail_command(FsaCommand::GetStatFile, FsaStatus::MediaError);
    service.fail_command(FsaCommand::CloseFile, FsaStatus::MediaError);
    let sink = LogSink::default();
    let writer = sink.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .finish();

    let err = tracing::subscriber::with_default(subscriber, || {
        bridge
            .vfs()
            .open("sd:/log", libc::O_WRONLY | libc::O_APPEND, 0)
            .unwrap_err()
    });
    assert_eq!(err, Errno::ENXIO);
    assert_eq!(sink.count("failed to close file after open error"), 1);
    assert_eq!(bridge.vfs().open_count(), 0);
}

// ============================================================================
// Open flags
// ============================================================================

#[test]
fn test_access_mode_enforced() {
    let (service, bridge) = mounted();
    service.put_file(&format!("{ROOT}/f"), b"data");
    let vfs = bridge.vfs();

    let ro = vfs.open("sd:/f", libc::O_RDONLY, 0).unwrap();
    assert_eq!(vfs.write(ro, b"x").unwrap_err(), Errno::EBADF);
    assert_eq!(vfs.ftruncate(ro, 0).unwrap_err(), Errno::EBADF);

    let wo = vfs.open("sd:/f", libc::O_WRONLY, 0).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(vfs.read(wo, &mut buf).unwrap_err(), Errno::EBADF);
    assert_eq!(service.request_count(FsaCommand::ReadFile), 0);
    assert_eq!(service.request_count(FsaCommand::WriteFile), 0);
}

#[test]
fn test_missing_file() {
    let (_service, bridge) = mounted();
    assert_eq!(
        bridge.vfs().open("sd:/nope", libc::O_RDONLY, 0).unwrap_err(),
        Errno::ENOENT
    );
}

#[test]
fn test_create_exclusive() {
    let (service, bridge) = mounted();
    let vfs = bridge.vfs();
    let flags = libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL;

    let fd = vfs.open("sd:/new", flags, 0o640).unwrap();
    vfs.write(fd, b"first").unwrap();
    vfs.close(fd).unwrap();
    assert_eq!(service.mode_of(&format!("{ROOT}/new")), Some(FsaMode::from_bits_truncate(0x640)));

    assert_eq!(vfs.open("sd:/new", flags, 0o640).unwrap_err(), Errno::EEXIST);
    assert_eq!(service.file_contents(&format!("{ROOT}/new")).unwrap(), b"first");
}

#[test]
fn test_create_read_write_keeps_existing() {
    let (service, bridge) = mounted();
    let vfs = bridge.vfs();
    let flags = libc::O_RDWR | libc::O_CREAT;

    let fd = vfs.open("sd:/rw", flags, 0o644).unwrap();
    vfs.write(fd, b"0123456789").unwrap();
    vfs.close(fd).unwrap();

    // Reopening without O_TRUNC must not clobber the contents.
    let fd = vfs.open("sd:/rw", flags, 0o644).unwrap();
    vfs.write(fd, b"ab").unwrap();
    vfs.close(fd).unwrap();
    assert_eq!(service.file_contents(&format!("{ROOT}/rw")).unwrap(), b"ab23456789");
}

#[test]
fn test_append() {
    let (service, bridge) = mounted();
    service.put_file(&format!("{ROOT}/log"), b"abc");
    let vfs = bridge.vfs();

    let fd = vfs.open("sd:/log", libc::O_WRONLY | libc::O_APPEND, 0).unwrap();
    assert_eq!(vfs.lseek(fd, 0, libc::SEEK_CUR).unwrap(), 3);
    vfs.write(fd, b"def").unwrap();
    assert_eq!(vfs.lseek(fd, 0, libc::SEEK_CUR).unwrap(), 6);
    vfs.close(fd).unwrap();
    assert_eq!(service.file_contents(&format!("{ROOT}/log")).unwrap(), b"abcdef");
}

// ============================================================================
// Offsets and metadata
// ============================================================================

#[test]
fn test_seek() {
    let (service, bridge) = mounted();
    service.put_file(&format!("{ROOT}/f"), b"0123456789");
    let vfs = bridge.vfs();
    let fd = vfs.open("sd:/f", libc::O_RDONLY, 0).unwrap();

    assert_eq!(vfs.lseek(fd, -2, libc::SEEK_END).unwrap(), 8);
    let mut buf = [0u8; 8];
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"89");

    assert_eq!(vfs.lseek(fd, 3, libc::SEEK_SET).unwrap(), 3);
    assert_eq!(vfs.lseek(fd, 2, libc::SEEK_CUR).unwrap(), 5);
    assert_eq!(vfs.lseek(fd, -6, libc::SEEK_CUR).unwrap_err(), Errno::EINVAL);
    assert_eq!(vfs.lseek(fd, 1 << 32, libc::SEEK_SET).unwrap_err(), Errno::EINVAL);
    // Failed seeks leave the offset alone.
    assert_eq!(vfs.lseek(fd, 0, libc::SEEK_CUR).unwrap(), 5);
}

#[test]
fn test_stat_and_fstat() {
    let (service, bridge) = mounted();
    let path = format!("{ROOT}/f");
    service.put_file(&path, b"0123456789");
    service.set_times(&path, 0, 10_000_000);
    let vfs = bridge.vfs();

    let st = vfs.stat("sd:/f").unwrap();
    assert!(st.is_file());
    assert_eq!(st.size, 10);
    assert_eq!(st.mtime, EPOCH_DIFF_SECS + 10);
    assert_eq!(st.ctime, EPOCH_DIFF_SECS);

    let fd = vfs.open("sd:/f", libc::O_RDONLY, 0).unwrap();
    assert_eq!(vfs.fstat(fd).unwrap(), st);

    // Volume roots carry no type flags but are directories.
    assert!(vfs.stat("sd:/").unwrap().is_dir());
}

#[test]
fn test_ftruncate() {
    let (service, bridge) = mounted();
    let vfs = bridge.vfs();
    let fd = vfs.open("sd:/t", libc::O_RDWR | libc::O_CREAT, 0o644).unwrap();
    vfs.write(fd, &pattern(100)).unwrap();

    assert_eq!(vfs.ftruncate(fd, -1).unwrap_err(), Errno::EINVAL);
    vfs.ftruncate(fd, 10).unwrap();
    assert_eq!(service.file_contents(&format!("{ROOT}/t")).unwrap(), pattern(10));
    assert_eq!(vfs.fstat(fd).unwrap().size, 10);
    vfs.fsync(fd).unwrap();
}

#[test]
fn test_chmod_and_fchmod() {
    let (service, bridge) = mounted();
    let path = format!("{ROOT}/f");
    service.put_file(&path, b"x");
    let vfs = bridge.vfs();

    vfs.chmod("sd:/f", 0o600).unwrap();
    assert_eq!(service.mode_of(&path), Some(FsaMode::from_bits_truncate(0x600)));
    assert_eq!(vfs.stat("sd:/f").unwrap().perm(), 0o600);

    let fd = vfs.open("sd:/f", libc::O_RDONLY, 0).unwrap();
    vfs.fchmod(fd, 0o755).unwrap();
    assert_eq!(service.mode_of(&path), Some(FsaMode::from_bits_truncate(0x755)));
}

#[test]
fn test_statvfs() {
    let (service, bridge) = mounted();
    service.put_file(&format!("{ROOT}/f"), &pattern(1024));
    let st = bridge.vfs().statvfs("sd:/").unwrap();

    assert_eq!(st.bsize, SECTOR as u64);
    assert_eq!(st.frsize, SECTOR as u64);
    assert_eq!(st.blocks, SECTORS);
    assert_eq!(st.bfree, SECTORS - 2);
    assert_eq!(st.bavail, st.bfree);
    assert_eq!(st.files, u32::MAX as u64);
    assert_eq!(st.flag, libc::ST_NOSUID as u64);
    assert_eq!(st.namemax, MAX_PATH_LEN as u64);
}

// ============================================================================
// Namespace
// ============================================================================

#[test]
fn test_directory_iteration() {
    let (service, bridge) = mounted();
    let vfs = bridge.vfs();
    vfs.mkdir("sd:/d", 0o755).unwrap();
    vfs.mkdir("sd:/d/sub", 0o755).unwrap();
    service.put_file(&format!("{ROOT}/d/a"), b"1");
    service.put_file(&format!("{ROOT}/d/b"), b"22");

    let mut dir = vfs.opendir("sd:/d").unwrap();
    let mut entries = Vec::new();
    while let Some(entry) = vfs.readdir(&mut dir).unwrap() {
        entries.push(entry);
    }
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["a", "b", "sub"]);
    assert_eq!(entries[1].stat.size, 2);
    assert!(entries[2].stat.is_dir());

    vfs.rewinddir(&mut dir).unwrap();
    assert_eq!(vfs.readdir(&mut dir).unwrap().unwrap().name, "a");
    vfs.closedir(dir).unwrap();
    assert_eq!(service.open_handle_count(), 0);
}

#[test]
fn test_rename_unlink_rmdir() {
    let (service, bridge) = mounted();
    let vfs = bridge.vfs();
    vfs.mkdir("sd:/d", 0o755).unwrap();
    service.put_file(&format!("{ROOT}/d/f"), b"x");

    assert_eq!(vfs.rmdir("sd:/d").unwrap_err(), Errno::ENOTEMPTY);
    vfs.rename("sd:/d/f", "sd:/g").unwrap();
    assert!(service.exists(&format!("{ROOT}/g")));
    vfs.rmdir("sd:/d").unwrap();
    vfs.unlink("sd:/g").unwrap();
    assert_eq!(vfs.stat("sd:/g").unwrap_err(), Errno::ENOENT);
    assert_eq!(vfs.mkdir("sd:/", 0o755).unwrap_err(), Errno::EEXIST);
}

#[test]
fn test_link_is_unsupported() {
    let (_service, bridge) = mounted();
    assert_eq!(bridge.vfs().link("sd:/a", "sd:/b").unwrap_err(), Errno::ENOSYS);
}

#[test]
fn test_relative_paths_follow_chdir() {
    let (service, bridge) = mounted();
    service.put_file(&format!("{ROOT}/docs/readme.txt"), b"relative");
    let vfs = bridge.vfs();

    vfs.chdir("sd:/docs").unwrap();
    let fd = vfs.open("readme.txt", libc::O_RDONLY, 0).unwrap();
    let mut buf = [0u8; 16];
    let n = vfs.read(fd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"relative");
}

#[test]
fn test_path_errors_are_local() {
    let (service, bridge) = mounted();
    let vfs = bridge.vfs();
    let requests = service.total_requests();

    let long = format!("sd:/{}", "x".repeat(MAX_PATH_LEN));
    assert_eq!(vfs.open(&long, libc::O_RDONLY, 0).unwrap_err(), Errno::ENAMETOOLONG);
    assert_eq!(vfs.stat("sd:").unwrap_err(), Errno::ENOENT);
    assert_eq!(service.total_requests(), requests);
}

#[test]
fn test_service_errors_are_translated() {
    let (service, bridge) = mounted();
    service.put_file(&format!("{ROOT}/f"), b"data");
    let vfs = bridge.vfs();
    let fd = vfs.open("sd:/f", libc::O_RDONLY, 0).unwrap();

    service.fail_command(FsaCommand::ReadFile, FsaStatus::MediaError);
    let mut buf = [0u8; 4];
    assert_eq!(vfs.read(fd, &mut buf).unwrap_err(), Errno::ENXIO);

    service.fail_command(FsaCommand::GetStatFile, FsaStatus::WriteProtected);
    assert_eq!(vfs.fstat(fd).unwrap_err(), Errno::EROFS);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_slow_mount_does_not_block_another() {
    let (service, bridge) = mounted();
    service.add_volume("/vol/storage_usb", SECTOR, 64);
    bridge.mount("usb", None, "/vol/storage_usb").unwrap();
    service.put_file(&format!("{ROOT}/f"), b"slow data");
    let vfs = bridge.vfs();
    let fd = vfs.open("sd:/f", libc::O_RDONLY, 0).unwrap();

    service.hold_command(FsaCommand::ReadFile);
    std::thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = [0u8; 16];
            vfs.read(fd, &mut buf).map(|n| buf[..n].to_vec())
        });
        service.wait_for_parked(1);

        // `sd` is stuck inside a read while holding its mount lock.
        let out = vfs
            .open("usb:/new", libc::O_WRONLY | libc::O_CREAT, 0o644)
            .unwrap();
        assert_eq!(vfs.write(out, b"fast").unwrap(), 4);
        vfs.close(out).unwrap();
        assert_eq!(vfs.stat("usb:/new").unwrap().size, 4);

        service.release_command(FsaCommand::ReadFile);
        assert_eq!(reader.join().unwrap().unwrap(), b"slow data");
    });
}
