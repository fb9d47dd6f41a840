//! In-memory filesystem service.
//!
//! Implements [`FsaTransport`] by decoding each shim and applying it to an
//! in-process model of raw devices, mounted volumes and open handles. Used by
//! the test suites of this workspace and by anything that wants to drive the
//! bridge without real hardware. All data is lost when dropped.
//!
//! Besides the filesystem itself it enforces the transport rules the real
//! service does (aligned shims, consistent vector tables, aligned bulk
//! segments) and offers fault injection and request counting.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::{Condvar, Mutex};

use crate::aligned::round_up;
use crate::buffer::{FsaRequest, FsaResponse, ShimBuffer, MAX_VECTORS};
use crate::command::{FsaCommand, IpcRequestType, MountFlags, QueryType, ReadWriteFlags};
use crate::status::{FsaStatus, MochaError};
use crate::transport::{FsaTransport, Payload};
use crate::types::{
    ClientHandle, DeviceInfo, DirHandle, FileHandle, FsaDirEntry, FsaMode, FsaStat, FsaTime,
    RawHandle, StatFlags,
};
use crate::{RAW_STAGING_THRESHOLD, SHIM_ALIGNMENT};

type Status<T> = Result<T, FsaStatus>;

/// 2022-01-01T00:00:00Z in service time.
const BASE_TIME: FsaTime = 694_224_000 * 1_000_000;
const DEFAULT_FILE_MODE: u32 = 0x666;
const DEFAULT_MAX_CLIENTS: usize = 64;

#[derive(Debug, Clone)]
enum NodeKind {
    File(Vec<u8>),
    Directory,
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    mode: FsaMode,
    entry_id: u32,
    created: FsaTime,
    modified: FsaTime,
}

#[derive(Debug)]
struct RawDevice {
    sector_size: u32,
    sectors: u64,
    data: Vec<u8>,
}

#[derive(Debug)]
struct Volume {
    info: DeviceInfo,
}

#[derive(Debug)]
struct Session {
    cwd: String,
    unlocked: bool,
}

#[derive(Debug, Clone, Copy)]
struct OpenMode {
    read: bool,
    write: bool,
    append: bool,
    create: bool,
    truncate: bool,
}

impl OpenMode {
    fn parse(mode: &str) -> Option<Self> {
        let (read, write, append, create, truncate) = match mode {
            "r" => (true, false, false, false, false),
            "r+" => (true, true, false, false, false),
            "w" => (false, true, false, true, true),
            "w+" => (true, true, false, true, true),
            "a" => (false, true, true, true, false),
            "a+" => (true, true, true, true, false),
            _ => return None,
        };
        Some(Self {
            read,
            write,
            append,
            create,
            truncate,
        })
    }
}

#[derive(Debug, Clone)]
struct OpenFile {
    owner: ClientHandle,
    path: String,
    mode: OpenMode,
    pos: u32,
}

#[derive(Debug)]
struct OpenDir {
    owner: ClientHandle,
    path: String,
    entries: Vec<String>,
    cursor: usize,
}

#[derive(Debug)]
struct OpenRaw {
    owner: ClientHandle,
    device: String,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    status: FsaStatus,
    allow: usize,
}

#[derive(Debug)]
struct ServiceState {
    next_handle: i32,
    next_entry_id: u32,
    clock: FsaTime,
    max_clients: usize,
    elevation_denied: Option<MochaError>,
    sessions: HashMap<ClientHandle, Session>,
    devices: BTreeMap<String, RawDevice>,
    volumes: BTreeMap<String, Volume>,
    nodes: BTreeMap<String, Node>,
    files: HashMap<FileHandle, OpenFile>,
    dirs: HashMap<DirHandle, OpenDir>,
    raws: HashMap<RawHandle, OpenRaw>,
    faults: HashMap<FsaCommand, Fault>,
    counts: HashMap<FsaCommand, usize>,
    total: usize,
}

/// Commands currently held back, and the requests parked on them.
#[derive(Debug, Default)]
struct Gate {
    held: HashSet<FsaCommand>,
    parked: usize,
}

/// In-memory filesystem service.
///
/// Thread-safe via an internal mutex; every request is applied atomically.
/// Requests parked by [`hold_command`](Self::hold_command) wait outside that
/// mutex, so other requests keep flowing.
#[derive(Debug)]
pub struct MemoryService {
    state: Mutex<ServiceState>,
    gate: Mutex<Gate>,
    gate_changed: Condvar,
}

impl Default for MemoryService {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn child_prefix(dir: &str) -> String {
    if dir == "/" {
        "/".to_string()
    } else {
        format!("{dir}/")
    }
}

impl MemoryService {
    /// Create a service with no devices, volumes or sessions.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState {
                next_handle: 1,
                next_entry_id: 1,
                clock: BASE_TIME,
                max_clients: DEFAULT_MAX_CLIENTS,
                elevation_denied: None,
                sessions: HashMap::new(),
                devices: BTreeMap::new(),
                volumes: BTreeMap::new(),
                nodes: BTreeMap::new(),
                files: HashMap::new(),
                dirs: HashMap::new(),
                raws: HashMap::new(),
                faults: HashMap::new(),
                counts: HashMap::new(),
                total: 0,
            }),
            gate: Mutex::new(Gate::default()),
            gate_changed: Condvar::new(),
        }
    }

    // ========================================================================
    // Fixtures
    // ========================================================================

    /// Register a zero-filled raw block device, e.g. `/dev/sdcard01`.
    pub fn add_device(&self, path: &str, sector_size: u32, sectors: u64) {
        let len = sector_size as usize * sectors as usize;
        self.state.lock().devices.insert(
            path.to_string(),
            RawDevice {
                sector_size,
                sectors,
                data: vec![0; len],
            },
        );
    }

    /// Register a volume that is already mounted outside of any client.
    pub fn add_volume(&self, target: &str, sector_size: u32, sectors: u64) {
        let mut state = self.state.lock();
        let info = DeviceInfo {
            device_size_in_sectors: sectors,
            device_sector_size: sector_size,
        };
        state.volumes.insert(target.to_string(), Volume { info });
        state.ensure_dir(target);
    }

    /// Create or replace a file, creating missing parent directories.
    pub fn put_file(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock();
        state.ensure_dir(parent_of(path));
        let mode = FsaMode::from_bits_truncate(DEFAULT_FILE_MODE);
        let node = state.new_node(NodeKind::File(data.to_vec()), mode);
        state.nodes.insert(path.to_string(), node);
    }

    /// Current contents of a file.
    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().nodes.get(path).map(|n| &n.kind) {
            Some(NodeKind::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Current permission bits of an entry.
    pub fn mode_of(&self, path: &str) -> Option<FsaMode> {
        self.state.lock().nodes.get(path).map(|n| n.mode)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    /// Override an entry's timestamps.
    pub fn set_times(&self, path: &str, created: FsaTime, modified: FsaTime) {
        if let Some(node) = self.state.lock().nodes.get_mut(path) {
            node.created = created;
            node.modified = modified;
        }
    }

    /// Current contents of a raw device.
    pub fn device_contents(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().devices.get(path).map(|d| d.data.clone())
    }

    pub fn is_mounted(&self, target: &str) -> bool {
        self.state.lock().volumes.contains_key(target)
    }

    // ========================================================================
    // Fault injection and accounting
    // ========================================================================

    /// Fail every future `command` with `status`.
    pub fn fail_command(&self, command: FsaCommand, status: FsaStatus) {
        self.fail_command_after(command, status, 0);
    }

    /// Let `successes` more `command` requests through, then fail with `status`.
    pub fn fail_command_after(&self, command: FsaCommand, status: FsaStatus, successes: usize) {
        self.state.lock().faults.insert(
            command,
            Fault {
                status,
                allow: successes,
            },
        );
    }

    pub fn clear_fault(&self, command: FsaCommand) {
        self.state.lock().faults.remove(&command);
    }

    /// Park every future `command` request until [`release_command`](Self::release_command).
    pub fn hold_command(&self, command: FsaCommand) {
        self.gate.lock().held.insert(command);
    }

    /// Let parked and future `command` requests through.
    pub fn release_command(&self, command: FsaCommand) {
        self.gate.lock().held.remove(&command);
        self.gate_changed.notify_all();
    }

    /// Block until at least `count` requests are parked.
    pub fn wait_for_parked(&self, count: usize) {
        let mut gate = self.gate.lock();
        while gate.parked < count {
            self.gate_changed.wait(&mut gate);
        }
    }

    fn pass_gate(&self, command: FsaCommand) {
        let mut gate = self.gate.lock();
        if !gate.held.contains(&command) {
            return;
        }
        gate.parked += 1;
        self.gate_changed.notify_all();
        while gate.held.contains(&command) {
            self.gate_changed.wait(&mut gate);
        }
        gate.parked -= 1;
    }

    /// Refuse client elevation with `error`.
    pub fn deny_elevation(&self, error: MochaError) {
        self.state.lock().elevation_denied = Some(error);
    }

    /// Refuse new sessions once `max` are open.
    pub fn set_max_clients(&self, max: usize) {
        self.state.lock().max_clients = max;
    }

    /// Requests received for `command`. Session opens and closes count
    /// under [`FsaCommand::Invalid`].
    pub fn request_count(&self, command: FsaCommand) -> usize {
        self.state.lock().counts.get(&command).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.state.lock().total
    }

    /// Sessions currently open.
    pub fn client_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// File, directory and raw handles currently open.
    pub fn open_handle_count(&self) -> usize {
        let state = self.state.lock();
        state.files.len() + state.dirs.len() + state.raws.len()
    }
}

impl ServiceState {
    fn tick(&mut self) -> FsaTime {
        self.clock += 1_000_000;
        self.clock
    }

    fn next_handle(&mut self) -> i32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn new_node(&mut self, kind: NodeKind, mode: FsaMode) -> Node {
        let now = self.tick();
        let entry_id = self.next_entry_id;
        self.next_entry_id += 1;
        Node {
            kind,
            mode,
            entry_id,
            created: now,
            modified: now,
        }
    }

    fn ensure_dir(&mut self, path: &str) {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            if !self.nodes.contains_key(&current) {
                let mode = FsaMode::from_bits_truncate(FsaMode::ALL);
                let node = self.new_node(NodeKind::Directory, mode);
                self.nodes.insert(current.clone(), node);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------------

    fn session(&self, client: ClientHandle) -> Status<&Session> {
        self.sessions.get(&client).ok_or(FsaStatus::InvalidClientHandle)
    }

    /// Absolute, normalized form of `path` relative to the client's cwd.
    fn absolute(&self, client: ClientHandle, path: &str) -> Status<String> {
        let joined = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.session(client)?.cwd, path)
        };
        let mut parts: Vec<&str> = Vec::new();
        for part in joined.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                p => parts.push(p),
            }
        }
        Ok(format!("/{}", parts.join("/")))
    }

    fn volume_of(&self, path: &str) -> Status<(&str, &Volume)> {
        self.volumes
            .iter()
            .find(|(target, _)| path == target.as_str() || path.starts_with(&format!("{target}/")))
            .map(|(target, volume)| (target.as_str(), volume))
            .ok_or(FsaStatus::NotFound)
    }

    /// Resolve a path that must live on a mounted volume.
    fn resolve(&self, client: ClientHandle, path: &str) -> Status<String> {
        let abs = self.absolute(client, path)?;
        self.volume_of(&abs)?;
        Ok(abs)
    }

    fn require_parent_dir(&self, path: &str) -> Status<()> {
        match self.nodes.get(parent_of(path)).map(|n| &n.kind) {
            Some(NodeKind::Directory) => Ok(()),
            Some(NodeKind::File(_)) => Err(FsaStatus::NotDir),
            None => Err(FsaStatus::NotFound),
        }
    }

    fn children(&self, dir: &str) -> Vec<String> {
        let prefix = child_prefix(dir);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| &k[prefix.len()..])
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    fn descendants(&self, path: &str) -> Vec<String> {
        let prefix = child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn used_bytes(&self, target: &str) -> u64 {
        let mut used = 0u64;
        for key in self.descendants(target) {
            if let Some(NodeKind::File(data)) = self.nodes.get(&key).map(|n| &n.kind) {
                used += data.len() as u64;
            }
        }
        used
    }

    fn stat_of(&self, path: &str) -> Status<FsaStat> {
        let node = self.nodes.get(path).ok_or(FsaStatus::NotFound)?;
        let (flags, size) = match &node.kind {
            // Volume roots report no type flags at all.
            NodeKind::Directory if self.volumes.contains_key(path) => (StatFlags::empty(), 0),
            NodeKind::Directory => (StatFlags::DIRECTORY, 0),
            NodeKind::File(data) => (StatFlags::FILE, data.len() as u32),
        };
        Ok(FsaStat {
            flags,
            mode: node.mode,
            owner: 0,
            group: 0,
            size,
            alloc_size: round_up(size as usize, 512) as u32,
            quota_size: 0,
            entry_id: node.entry_id,
            created: node.created,
            modified: node.modified,
        })
    }

    // ------------------------------------------------------------------------
    // Transport rules
    // ------------------------------------------------------------------------

    fn check_vectors(shim: &ShimBuffer, payload: &Payload<'_>) -> Status<()> {
        let vectors = shim.vectors();
        if vectors.len() != MAX_VECTORS {
            return Err(FsaStatus::InvalidParam);
        }
        let expected = match payload {
            Payload::Read(_) => (1, 2),
            Payload::Write(_) => (2, 1),
            Payload::None => return Err(FsaStatus::InvalidBuffer),
        };
        if shim.vector_counts() != expected {
            return Err(FsaStatus::InvalidParam);
        }
        if !vectors[0].is_aligned() || !vectors[2].is_aligned() {
            return Err(FsaStatus::InvalidAlignment);
        }
        let data = vectors[1];
        if data != payload.vector() {
            return Err(FsaStatus::InvalidBuffer);
        }
        if data.len as usize >= RAW_STAGING_THRESHOLD && !data.is_aligned() {
            return Err(FsaStatus::InvalidAlignment);
        }
        Ok(())
    }

    fn handle(&mut self, shim: &ShimBuffer, payload: Payload<'_>) -> Status<(u32, FsaResponse)> {
        if shim.address() % SHIM_ALIGNMENT != 0 {
            return Err(FsaStatus::InvalidAlignment);
        }
        if let Some(fault) = self.faults.get_mut(&shim.command()) {
            if fault.allow == 0 {
                return Err(fault.status);
            }
            fault.allow -= 1;
        }

        let client = shim.client();
        match shim.ipc_type() {
            IpcRequestType::Open => return self.open_session(),
            IpcRequestType::Close => return self.close_session(client),
            IpcRequestType::Ioctlv => Self::check_vectors(shim, &payload)?,
            IpcRequestType::Ioctl => {}
        }
        self.session(client)?;

        let request = shim.decode_request().map_err(|_| FsaStatus::InvalidParam)?;
        let none = |(): ()| (0u32, FsaResponse::None);
        match request {
            FsaRequest::None => Err(FsaStatus::UnsupportedCommand),
            FsaRequest::Mount {
                source,
                target,
                flags,
                ..
            } => self.mount(client, &source, &target, flags).map(none),
            FsaRequest::Unmount { target, .. } => self.unmount(&target).map(none),
            FsaRequest::ChangeDir { path } => self.change_dir(client, &path).map(none),
            FsaRequest::GetCwd => {
                let path = self.session(client)?.cwd.clone();
                Ok((0, FsaResponse::Cwd { path }))
            }
            FsaRequest::MakeDir { path, mode } => self.make_dir(client, &path, mode).map(none),
            FsaRequest::Remove { path } => self.remove(client, &path).map(none),
            FsaRequest::Rename { old_path, new_path } => {
                self.rename(client, &old_path, &new_path).map(none)
            }
            FsaRequest::ChangeMode { path, mode, mask } => {
                let path = self.resolve(client, &path)?;
                let node = self.nodes.get_mut(&path).ok_or(FsaStatus::NotFound)?;
                let bits = (node.mode.bits() & !mask) | (mode.bits() & mask);
                node.mode = FsaMode::from_bits_truncate(bits);
                Ok((0, FsaResponse::None))
            }
            FsaRequest::GetInfoByQuery { path, query } => {
                self.query(client, &path, query).map(|r| (0, r))
            }
            FsaRequest::FlushVolume { path } => {
                self.resolve(client, &path).map(|_| (0, FsaResponse::None))
            }
            FsaRequest::OpenDir { path } => self.open_dir(client, &path),
            FsaRequest::ReadDir { handle } => self.read_dir(client, handle),
            FsaRequest::RewindDir { handle } => {
                self.dir_mut(client, handle)?.cursor = 0;
                Ok((0, FsaResponse::None))
            }
            FsaRequest::CloseDir { handle } => {
                self.dir_mut(client, handle)?;
                self.dirs.remove(&handle);
                Ok((0, FsaResponse::None))
            }
            FsaRequest::OpenFile {
                path,
                mode,
                create_mode,
                ..
            } => self.open_file(client, &path, &mode, create_mode),
            FsaRequest::ReadFile {
                handle,
                size,
                count,
                pos,
                flags,
            } => match payload {
                Payload::Read(buf) => self.read_file(client, handle, buf, size, count, pos, flags),
                _ => Err(FsaStatus::InvalidBuffer),
            },
            FsaRequest::WriteFile {
                handle,
                size,
                count,
                pos,
                flags,
            } => match payload {
                Payload::Write(buf) => {
                    self.write_file(client, handle, buf, size, count, pos, flags)
                }
                _ => Err(FsaStatus::InvalidBuffer),
            },
            FsaRequest::GetPosFile { handle } => {
                let pos = self.file(client, handle)?.pos;
                Ok((0, FsaResponse::GetPosFile { pos }))
            }
            FsaRequest::SetPosFile { handle, pos } => {
                self.file_mut(client, handle)?.pos = pos;
                Ok((0, FsaResponse::None))
            }
            FsaRequest::IsEof { handle } => {
                let (pos, len) = self.file_len(client, handle)?;
                if pos as usize >= len {
                    Err(FsaStatus::EndOfFile)
                } else {
                    Ok((0, FsaResponse::None))
                }
            }
            FsaRequest::GetStatFile { handle } => {
                let path = self.file(client, handle)?.path.clone();
                let stat = self.stat_of(&path)?;
                Ok((0, FsaResponse::GetStatFile { stat }))
            }
            FsaRequest::CloseFile { handle } => {
                self.file(client, handle)?;
                self.files.remove(&handle);
                Ok((0, FsaResponse::None))
            }
            FsaRequest::FlushFile { handle } => {
                self.file(client, handle).map(|_| (0, FsaResponse::None))
            }
            FsaRequest::TruncateFile { handle } => self.truncate_file(client, handle),
            FsaRequest::RawOpen { path } => {
                if !self.devices.contains_key(&path) {
                    return Err(FsaStatus::NotFound);
                }
                let handle = RawHandle(self.next_handle());
                self.raws.insert(
                    handle,
                    OpenRaw {
                        owner: client,
                        device: path,
                    },
                );
                Ok((0, FsaResponse::RawOpen { handle }))
            }
            FsaRequest::RawRead {
                block_offset,
                count,
                block_size,
                handle,
            } => match payload {
                Payload::Read(buf) => {
                    let device = self.raw_device(client, handle)?;
                    let range =
                        Self::raw_range(device, block_offset, count, block_size, buf.len())?;
                    buf[..range.len()].copy_from_slice(&device.data[range]);
                    Ok((0, FsaResponse::None))
                }
                _ => Err(FsaStatus::InvalidBuffer),
            },
            FsaRequest::RawWrite {
                block_offset,
                count,
                block_size,
                handle,
            } => match payload {
                Payload::Write(buf) => {
                    let device = self.raw_device(client, handle)?;
                    let range =
                        Self::raw_range(device, block_offset, count, block_size, buf.len())?;
                    let len = range.len();
                    let name = self.raws[&handle].device.clone();
                    if let Some(device) = self.devices.get_mut(&name) {
                        device.data[range].copy_from_slice(&buf[..len]);
                    }
                    Ok((0, FsaResponse::None))
                }
                _ => Err(FsaStatus::InvalidBuffer),
            },
            FsaRequest::RawClose { handle } => {
                self.raw_device(client, handle)?;
                self.raws.remove(&handle);
                Ok((0, FsaResponse::None))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Sessions and volumes
    // ------------------------------------------------------------------------

    fn open_session(&mut self) -> Status<(u32, FsaResponse)> {
        if self.sessions.len() >= self.max_clients {
            return Err(FsaStatus::MaxClients);
        }
        let handle = ClientHandle(self.next_handle());
        self.sessions.insert(
            handle,
            Session {
                cwd: "/".to_string(),
                unlocked: false,
            },
        );
        Ok((handle.0 as u32, FsaResponse::None))
    }

    fn close_session(&mut self, client: ClientHandle) -> Status<(u32, FsaResponse)> {
        self.sessions.remove(&client).ok_or(FsaStatus::InvalidClientHandle)?;
        self.files.retain(|_, f| f.owner != client);
        self.dirs.retain(|_, d| d.owner != client);
        self.raws.retain(|_, r| r.owner != client);
        Ok((0, FsaResponse::None))
    }

    fn mount(
        &mut self,
        client: ClientHandle,
        source: &str,
        target: &str,
        _flags: MountFlags,
    ) -> Status<()> {
        if !self.session(client)?.unlocked {
            return Err(FsaStatus::PermissionError);
        }
        let device = self.devices.get(source).ok_or(FsaStatus::NotFound)?;
        if self.volumes.contains_key(target) {
            return Err(FsaStatus::AlreadyExists);
        }
        let info = DeviceInfo {
            device_size_in_sectors: device.sectors,
            device_sector_size: device.sector_size,
        };
        self.volumes.insert(target.to_string(), Volume { info });
        self.ensure_dir(target);
        Ok(())
    }

    fn unmount(&mut self, target: &str) -> Status<()> {
        self.volumes.remove(target).map(|_| ()).ok_or(FsaStatus::NotFound)
    }

    fn query(&self, client: ClientHandle, path: &str, query: QueryType) -> Status<FsaResponse> {
        let path = self.resolve(client, path)?;
        let (target, volume) = self.volume_of(&path)?;
        match query {
            QueryType::DeviceInfo => Ok(FsaResponse::DeviceInfo { info: volume.info }),
            QueryType::FreeSpaceSize => {
                let bytes = volume.info.size_in_bytes().saturating_sub(self.used_bytes(target));
                Ok(FsaResponse::FreeSpace { bytes })
            }
            QueryType::Stat => self.stat_of(&path).map(|stat| FsaResponse::Stat { stat }),
            _ => Err(FsaStatus::UnsupportedCommand),
        }
    }

    // ------------------------------------------------------------------------
    // Namespace
    // ------------------------------------------------------------------------

    fn change_dir(&mut self, client: ClientHandle, path: &str) -> Status<()> {
        let path = self.resolve(client, path)?;
        match self.nodes.get(&path).map(|n| &n.kind) {
            Some(NodeKind::Directory) => {}
            Some(NodeKind::File(_)) => return Err(FsaStatus::NotDir),
            None => return Err(FsaStatus::NotFound),
        }
        if let Some(session) = self.sessions.get_mut(&client) {
            session.cwd = path;
        }
        Ok(())
    }

    fn make_dir(&mut self, client: ClientHandle, path: &str, mode: FsaMode) -> Status<()> {
        let path = self.resolve(client, path)?;
        if self.nodes.contains_key(&path) {
            return Err(FsaStatus::AlreadyExists);
        }
        self.require_parent_dir(&path)?;
        let node = self.new_node(NodeKind::Directory, mode);
        self.nodes.insert(path, node);
        Ok(())
    }

    fn remove(&mut self, client: ClientHandle, path: &str) -> Status<()> {
        let path = self.resolve(client, path)?;
        if self.volumes.contains_key(&path) {
            return Err(FsaStatus::AccessError);
        }
        match self.nodes.get(&path).map(|n| &n.kind) {
            None => return Err(FsaStatus::NotFound),
            Some(NodeKind::Directory) if !self.children(&path).is_empty() => {
                return Err(FsaStatus::NotEmpty);
            }
            Some(_) => {}
        }
        self.nodes.remove(&path);
        Ok(())
    }

    fn rename(&mut self, client: ClientHandle, old_path: &str, new_path: &str) -> Status<()> {
        let from = self.resolve(client, old_path)?;
        let to = self.resolve(client, new_path)?;
        if self.volume_of(&from)?.0 != self.volume_of(&to)?.0 {
            return Err(FsaStatus::UnsupportedCommand);
        }
        if !self.nodes.contains_key(&from) {
            return Err(FsaStatus::NotFound);
        }
        if self.nodes.contains_key(&to) {
            return Err(FsaStatus::AlreadyExists);
        }
        self.require_parent_dir(&to)?;

        let mut moved = self.descendants(&from);
        moved.push(from.clone());
        for old in moved {
            if let Some(node) = self.nodes.remove(&old) {
                let new = format!("{to}{}", &old[from.len()..]);
                self.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Directories
    // ------------------------------------------------------------------------

    fn dir_mut(&mut self, client: ClientHandle, handle: DirHandle) -> Status<&mut OpenDir> {
        self.dirs
            .get_mut(&handle)
            .filter(|d| d.owner == client)
            .ok_or(FsaStatus::InvalidDirHandle)
    }

    fn open_dir(&mut self, client: ClientHandle, path: &str) -> Status<(u32, FsaResponse)> {
        let path = self.resolve(client, path)?;
        match self.nodes.get(&path).map(|n| &n.kind) {
            Some(NodeKind::Directory) => {}
            Some(NodeKind::File(_)) => return Err(FsaStatus::NotDir),
            None => return Err(FsaStatus::NotFound),
        }
        let entries = self.children(&path);
        let handle = DirHandle(self.next_handle());
        self.dirs.insert(
            handle,
            OpenDir {
                owner: client,
                path,
                entries,
                cursor: 0,
            },
        );
        Ok((0, FsaResponse::OpenDir { handle }))
    }

    fn read_dir(&mut self, client: ClientHandle, handle: DirHandle) -> Status<(u32, FsaResponse)> {
        let dir = self.dir_mut(client, handle)?;
        let Some(name) = dir.entries.get(dir.cursor).cloned() else {
            return Err(FsaStatus::EndOfDir);
        };
        dir.cursor += 1;
        let full = format!("{}{}", child_prefix(&dir.path), name);
        let stat = self.stat_of(&full)?;
        Ok((0, FsaResponse::ReadDir {
            entry: FsaDirEntry { stat, name },
        }))
    }

    // ------------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------------

    fn file(&self, client: ClientHandle, handle: FileHandle) -> Status<&OpenFile> {
        self.files
            .get(&handle)
            .filter(|f| f.owner == client)
            .ok_or(FsaStatus::InvalidFileHandle)
    }

    fn file_mut(&mut self, client: ClientHandle, handle: FileHandle) -> Status<&mut OpenFile> {
        self.files
            .get_mut(&handle)
            .filter(|f| f.owner == client)
            .ok_or(FsaStatus::InvalidFileHandle)
    }

    fn file_len(&self, client: ClientHandle, handle: FileHandle) -> Status<(u32, usize)> {
        let file = self.file(client, handle)?;
        match self.nodes.get(&file.path).map(|n| &n.kind) {
            Some(NodeKind::File(data)) => Ok((file.pos, data.len())),
            _ => Err(FsaStatus::NotFound),
        }
    }

    fn open_file(
        &mut self,
        client: ClientHandle,
        path: &str,
        mode: &str,
        create_mode: FsaMode,
    ) -> Status<(u32, FsaResponse)> {
        let path = self.resolve(client, path)?;
        let mode = OpenMode::parse(mode).ok_or(FsaStatus::InvalidParam)?;

        if self.nodes.contains_key(&path) {
            let now = self.tick();
            if let Some(node) = self.nodes.get_mut(&path) {
                match &mut node.kind {
                    NodeKind::Directory => return Err(FsaStatus::NotFile),
                    NodeKind::File(data) if mode.truncate => {
                        data.clear();
                        node.modified = now;
                    }
                    NodeKind::File(_) => {}
                }
            }
        } else {
            if !mode.create {
                return Err(FsaStatus::NotFound);
            }
            self.require_parent_dir(&path)?;
            let bits = if create_mode.is_empty() {
                FsaMode::from_bits_truncate(DEFAULT_FILE_MODE)
            } else {
                create_mode
            };
            let node = self.new_node(NodeKind::File(Vec::new()), bits);
            self.nodes.insert(path.clone(), node);
        }

        let handle = FileHandle(self.next_handle());
        self.files.insert(
            handle,
            OpenFile {
                owner: client,
                path,
                mode,
                pos: 0,
            },
        );
        Ok((0, FsaResponse::OpenFile { handle }))
    }

    #[allow(clippy::too_many_arguments)]
    fn read_file(
        &mut self,
        client: ClientHandle,
        handle: FileHandle,
        buf: &mut [u8],
        size: u32,
        count: u32,
        pos: u32,
        flags: ReadWriteFlags,
    ) -> Status<(u32, FsaResponse)> {
        let file = self.file(client, handle)?.clone();
        if !file.mode.read {
            return Err(FsaStatus::AccessError);
        }
        let want = size as usize * count as usize;
        if want > buf.len() {
            return Err(FsaStatus::InvalidBuffer);
        }
        let data = match self.nodes.get(&file.path).map(|n| &n.kind) {
            Some(NodeKind::File(data)) => data,
            _ => return Err(FsaStatus::NotFound),
        };
        let start = if flags.contains(ReadWriteFlags::WITH_POS) {
            pos
        } else {
            file.pos
        } as usize;
        let avail = data.len().saturating_sub(start);
        let mut n = want.min(avail);
        if size > 0 {
            n -= n % size as usize;
        }
        if n > 0 {
            buf[..n].copy_from_slice(&data[start..start + n]);
        }
        let elements = if size == 0 { 0 } else { n / size as usize };
        self.file_mut(client, handle)?.pos = (start + n) as u32;
        Ok((elements as u32, FsaResponse::None))
    }

    #[allow(clippy::too_many_arguments)]
    fn write_file(
        &mut self,
        client: ClientHandle,
        handle: FileHandle,
        buf: &[u8],
        size: u32,
        count: u32,
        pos: u32,
        flags: ReadWriteFlags,
    ) -> Status<(u32, FsaResponse)> {
        let file = self.file(client, handle)?.clone();
        if !file.mode.write {
            return Err(FsaStatus::AccessError);
        }
        let n = size as usize * count as usize;
        if n > buf.len() {
            return Err(FsaStatus::InvalidBuffer);
        }
        let (_, len) = self.file_len(client, handle)?;
        let start = if file.mode.append {
            len
        } else if flags.contains(ReadWriteFlags::WITH_POS) {
            pos as usize
        } else {
            file.pos as usize
        };
        let end = start + n;
        if end > u32::MAX as usize {
            return Err(FsaStatus::FileTooBig);
        }

        let (target, volume) = self.volume_of(&file.path)?;
        let growth = end.saturating_sub(len) as u64;
        if self.used_bytes(target) + growth > volume.info.size_in_bytes() {
            return Err(FsaStatus::StorageFull);
        }

        let now = self.tick();
        if let Some(node) = self.nodes.get_mut(&file.path) {
            if let NodeKind::File(data) = &mut node.kind {
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[start..end].copy_from_slice(&buf[..n]);
                node.modified = now;
            }
        }
        self.file_mut(client, handle)?.pos = end as u32;
        let elements = if size == 0 { 0 } else { n / size as usize };
        Ok((elements as u32, FsaResponse::None))
    }

    fn truncate_file(
        &mut self,
        client: ClientHandle,
        handle: FileHandle,
    ) -> Status<(u32, FsaResponse)> {
        let file = self.file(client, handle)?.clone();
        if !file.mode.write {
            return Err(FsaStatus::AccessError);
        }
        let now = self.tick();
        match self.nodes.get_mut(&file.path) {
            Some(Node {
                kind: NodeKind::File(data),
                modified,
                ..
            }) => {
                data.resize(file.pos as usize, 0);
                *modified = now;
                Ok((0, FsaResponse::None))
            }
            _ => Err(FsaStatus::NotFound),
        }
    }

    // ------------------------------------------------------------------------
    // Raw devices
    // ------------------------------------------------------------------------

    fn raw_device(&self, client: ClientHandle, handle: RawHandle) -> Status<&RawDevice> {
        let raw = self
            .raws
            .get(&handle)
            .filter(|r| r.owner == client)
            .ok_or(FsaStatus::InvalidParam)?;
        self.devices.get(&raw.device).ok_or(FsaStatus::MediaNotReady)
    }

    fn raw_range(
        device: &RawDevice,
        block_offset: u64,
        count: u32,
        block_size: u32,
        buf_len: usize,
    ) -> Status<std::ops::Range<usize>> {
        let len = block_size as usize * count as usize;
        if len > buf_len {
            return Err(FsaStatus::InvalidBuffer);
        }
        let start = block_offset
            .checked_mul(block_size as u64)
            .ok_or(FsaStatus::OutOfRange)? as usize;
        let end = start.checked_add(len).ok_or(FsaStatus::OutOfRange)?;
        if end > device.data.len() {
            return Err(FsaStatus::OutOfRange);
        }
        Ok(start..end)
    }
}

impl FsaTransport for MemoryService {
    fn send(&self, shim: &mut ShimBuffer, payload: Payload<'_>) -> i32 {
        self.pass_gate(shim.command());
        let mut state = self.state.lock();
        state.total += 1;
        *state.counts.entry(shim.command()).or_default() += 1;
        match state.handle(shim, payload) {
            Ok((value, response)) => match shim.encode_response(&response) {
                Ok(()) => value as i32,
                Err(e) => e.code(),
            },
            Err(status) => status.code(),
        }
    }

    fn unlock_client(&self, client: ClientHandle) -> Result<(), MochaError> {
        let mut state = self.state.lock();
        if let Some(error) = state.elevation_denied {
            return Err(error);
        }
        let session = state.sessions.get_mut(&client).ok_or(MochaError::InvalidArgument)?;
        session.unlocked = true;
        Ok(())
    }
}
