//! The shim buffer: one fixed-layout, aligned request/response record per
//! command, plus the I/O vector table used by bulk transfers.

use serde::{Deserialize, Serialize};

use crate::command::{
    FsaCommand, IpcRequestType, MountFlags, QueryType, ReadWriteFlags, UnmountFlags,
};
use crate::status::{FsaStatus, ShimError, ShimResult};
use crate::types::{
    ClientHandle, DeviceInfo, DirHandle, FileHandle, FsaDirEntry, FsaMode, FsaStat, RawHandle,
};
use crate::SHIM_ALIGNMENT;

/// Bytes reserved for the encoded request.
pub const REQUEST_AREA_SIZE: usize = 0x520;
/// Bytes reserved for the encoded response.
pub const RESPONSE_AREA_SIZE: usize = 0x293;
/// Offset of the response area. Both framing vectors start aligned.
pub const RESPONSE_AREA_OFFSET: usize = REQUEST_AREA_SIZE.next_multiple_of(SHIM_ALIGNMENT);
/// Request, data and response segments.
pub const MAX_VECTORS: usize = 3;

/// One I/O vector segment: a caller address and its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct IoVector {
    pub addr: usize,
    pub len: u32,
}

impl IoVector {
    pub fn is_aligned(&self) -> bool {
        self.addr % SHIM_ALIGNMENT == 0
    }
}

/// Direction of the bulk data segment in a vectored request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorLayout {
    /// The service fills the data segment: 1 input vector, 2 output vectors.
    Read,
    /// The service consumes the data segment: 2 input vectors, 1 output vector.
    Write,
}

impl VectorLayout {
    fn counts(self) -> (u32, u32) {
        match self {
            Self::Read => (1, 2),
            Self::Write => (2, 1),
        }
    }
}

/// Command-specific request payload, encoded into the request area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FsaRequest {
    None,
    Mount {
        source: String,
        target: String,
        flags: MountFlags,
        args: Vec<u8>,
    },
    Unmount {
        target: String,
        flags: UnmountFlags,
    },
    ChangeDir {
        path: String,
    },
    GetCwd,
    MakeDir {
        path: String,
        mode: FsaMode,
    },
    Remove {
        path: String,
    },
    Rename {
        old_path: String,
        new_path: String,
    },
    OpenDir {
        path: String,
    },
    ReadDir {
        handle: DirHandle,
    },
    RewindDir {
        handle: DirHandle,
    },
    CloseDir {
        handle: DirHandle,
    },
    OpenFile {
        path: String,
        mode: String,
        create_mode: FsaMode,
        open_flags: u32,
        prealloc_size: u32,
    },
    ReadFile {
        handle: FileHandle,
        size: u32,
        count: u32,
        pos: u32,
        flags: ReadWriteFlags,
    },
    WriteFile {
        handle: FileHandle,
        size: u32,
        count: u32,
        pos: u32,
        flags: ReadWriteFlags,
    },
    GetPosFile {
        handle: FileHandle,
    },
    SetPosFile {
        handle: FileHandle,
        pos: u32,
    },
    IsEof {
        handle: FileHandle,
    },
    GetStatFile {
        handle: FileHandle,
    },
    CloseFile {
        handle: FileHandle,
    },
    FlushFile {
        handle: FileHandle,
    },
    TruncateFile {
        handle: FileHandle,
    },
    GetInfoByQuery {
        path: String,
        query: QueryType,
    },
    FlushVolume {
        path: String,
    },
    ChangeMode {
        path: String,
        mode: FsaMode,
        mask: u32,
    },
    RawOpen {
        path: String,
    },
    RawRead {
        block_offset: u64,
        count: u32,
        block_size: u32,
        handle: RawHandle,
    },
    RawWrite {
        block_offset: u64,
        count: u32,
        block_size: u32,
        handle: RawHandle,
    },
    RawClose {
        handle: RawHandle,
    },
}

/// Command-specific response payload, decoded from the response area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FsaResponse {
    None,
    Cwd { path: String },
    OpenDir { handle: DirHandle },
    ReadDir { entry: FsaDirEntry },
    OpenFile { handle: FileHandle },
    GetPosFile { pos: u32 },
    GetStatFile { stat: FsaStat },
    FreeSpace { bytes: u64 },
    DeviceInfo { info: DeviceInfo },
    Stat { stat: FsaStat },
    RawOpen { handle: RawHandle },
}

/// Fixed-layout command record shared with the service.
///
/// Always 0x40-aligned. Allocated on the heap per command and dropped once
/// the response has been decoded.
#[repr(C, align(64))]
pub struct ShimBuffer {
    request: [u8; REQUEST_AREA_SIZE],
    _pad: [u8; RESPONSE_AREA_OFFSET - REQUEST_AREA_SIZE],
    response: [u8; RESPONSE_AREA_SIZE],
    vectors: [IoVector; MAX_VECTORS],
    client: ClientHandle,
    command: FsaCommand,
    ipc_type: IpcRequestType,
    vec_in: u32,
    vec_out: u32,
}

const _: () = assert!(std::mem::align_of::<ShimBuffer>() == SHIM_ALIGNMENT);
const _: () = assert!(std::mem::offset_of!(ShimBuffer, response) == RESPONSE_AREA_OFFSET);
const _: () = assert!(RESPONSE_AREA_OFFSET % SHIM_ALIGNMENT == 0);

impl ShimBuffer {
    /// A zeroed shim for `command`. The response area decodes as
    /// [`FsaResponse::None`] until the service writes one.
    pub fn new(client: ClientHandle, command: FsaCommand, ipc_type: IpcRequestType) -> Box<Self> {
        Box::new(Self {
            request: [0; REQUEST_AREA_SIZE],
            _pad: [0; RESPONSE_AREA_OFFSET - REQUEST_AREA_SIZE],
            response: [0; RESPONSE_AREA_SIZE],
            vectors: [IoVector::default(); MAX_VECTORS],
            client,
            command,
            ipc_type,
            vec_in: 0,
            vec_out: 0,
        })
    }

    pub fn client(&self) -> ClientHandle {
        self.client
    }

    pub fn command(&self) -> FsaCommand {
        self.command
    }

    pub fn ipc_type(&self) -> IpcRequestType {
        self.ipc_type
    }

    /// Address of the shim itself.
    pub fn address(&self) -> usize {
        self as *const Self as usize
    }

    pub fn encode_request(&mut self, request: &FsaRequest) -> ShimResult<()> {
        postcard::to_slice(request, &mut self.request)
            .map(|_| ())
            .map_err(|e| {
                tracing::warn!(
                    command = self.command.as_str(),
                    error = %e,
                    "request does not fit the shim"
                );
                ShimError::Status(FsaStatus::InvalidBuffer)
            })
    }

    pub fn decode_request(&self) -> ShimResult<FsaRequest> {
        postcard::from_bytes(&self.request).map_err(|_| ShimError::Status(FsaStatus::InvalidParam))
    }

    pub fn encode_response(&mut self, response: &FsaResponse) -> ShimResult<()> {
        postcard::to_slice(response, &mut self.response)
            .map(|_| ())
            .map_err(|_| ShimError::Status(FsaStatus::InvalidBuffer))
    }

    pub fn decode_response(&self) -> ShimResult<FsaResponse> {
        postcard::from_bytes(&self.response).map_err(|e| {
            tracing::warn!(command = self.command.as_str(), error = %e, "undecodable response");
            ShimError::Status(FsaStatus::DataCorrupted)
        })
    }

    /// Switch the shim to a vectored request with `data` as the middle
    /// segment, framed by the request and response areas.
    pub fn set_vectored(&mut self, data: IoVector, layout: VectorLayout) {
        let (vec_in, vec_out) = layout.counts();
        self.vectors = [
            IoVector {
                addr: self.request.as_ptr() as usize,
                len: REQUEST_AREA_SIZE as u32,
            },
            data,
            IoVector {
                addr: self.response.as_ptr() as usize,
                len: RESPONSE_AREA_SIZE as u32,
            },
        ];
        self.vec_in = vec_in;
        self.vec_out = vec_out;
        self.ipc_type = IpcRequestType::Ioctlv;
    }

    /// The active vector table (empty for plain requests).
    pub fn vectors(&self) -> &[IoVector] {
        &self.vectors[..(self.vec_in + self.vec_out) as usize]
    }

    /// Input and output vector counts.
    pub fn vector_counts(&self) -> (u32, u32) {
        (self.vec_in, self.vec_out)
    }

    /// The bulk data segment of a vectored request.
    pub fn data_vector(&self) -> Option<IoVector> {
        self.vectors().get(1).copied()
    }
}

impl std::fmt::Debug for ShimBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShimBuffer")
            .field("client", &self.client)
            .field("command", &self.command)
            .field("ipc_type", &self.ipc_type)
            .field("vectors", &self.vectors())
            .finish()
    }
}
