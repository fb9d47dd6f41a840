//! The seam between client commands and whatever carries them to the
//! filesystem service.

use crate::buffer::IoVector;
use crate::status::MochaError;
use crate::types::ClientHandle;

/// Bulk data accompanying a vectored request.
///
/// The vector table records the address; the slice travels alongside so the
/// service side never has to dereference raw addresses.
#[derive(Debug)]
pub enum Payload<'a> {
    None,
    /// Bytes the service consumes.
    Write(&'a [u8]),
    /// Bytes the service fills.
    Read(&'a mut [u8]),
}

impl Payload<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Write(data) => data.len(),
            Self::Read(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector segment describing this payload.
    pub fn vector(&self) -> IoVector {
        let addr = match self {
            Self::None => 0,
            Self::Write(data) => data.as_ptr() as usize,
            Self::Read(data) => data.as_ptr() as usize,
        };
        IoVector {
            addr,
            len: self.len() as u32,
        }
    }
}

/// Delivers shim buffers to the filesystem service.
///
/// `send` blocks until the service has answered and returns the raw IPC
/// result: negative for failure, otherwise a command-specific value (the
/// new handle for session opens, the element count for transfers). Any
/// response payload has been written into the shim by then.
pub trait FsaTransport: Send + Sync {
    fn send(&self, shim: &mut crate::buffer::ShimBuffer, payload: Payload<'_>) -> i32;

    /// Ask the privilege helper to lift the restrictions on `client`.
    fn unlock_client(&self, client: ClientHandle) -> Result<(), MochaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_vector() {
        let data = [1u8, 2, 3];
        let payload = Payload::Write(&data);
        let vector = payload.vector();
        assert_eq!(vector.addr, data.as_ptr() as usize);
        assert_eq!(vector.len, 3);
        assert_eq!(Payload::None.vector(), IoVector::default());
    }
}
