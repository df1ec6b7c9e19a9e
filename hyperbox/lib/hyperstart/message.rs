use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{HyperboxError, HyperboxResult};

use super::codes;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The size of a control frame header: command code and total length.
pub const CTL_HEADER_LEN: usize = 8;

/// The size of a stream frame header: session id and total length.
pub const STREAM_HEADER_LEN: usize = 12;

/// The largest frame accepted from the guest.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A frame on the control socket.
///
/// Wire layout (big-endian): `[u32 code][u32 total length][payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlMessage {
    /// The command or reply code.
    pub code: u32,

    /// The frame payload.
    pub payload: Bytes,
}

/// A frame on the stream socket.
///
/// Wire layout (big-endian): `[u64 session][u32 total length][payload]`. An empty payload
/// ends the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// The session the payload belongs to.
    pub session: u64,

    /// The frame payload.
    pub payload: Bytes,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CtlMessage {
    /// Creates a control frame.
    pub fn new(code: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(CTL_HEADER_LEN + self.payload.len());
        buf.put_u32(self.code);
        buf.put_u32((CTL_HEADER_LEN + self.payload.len()) as u32);
        buf.put_slice(&self.payload);
    }

    /// Encodes the frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Reads one frame.
    pub async fn read_from<R>(reader: &mut R) -> HyperboxResult<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; CTL_HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let mut header = &header[..];
        let code = header.get_u32();
        let length = header.get_u32() as usize;
        let payload = read_payload(reader, length, CTL_HEADER_LEN).await?;

        tracing::trace!(code = codes::code_name(code), len = payload.len(), "read control frame");
        Ok(Self { code, payload })
    }
}

impl StreamMessage {
    /// Creates a stream frame.
    pub fn new(session: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            session,
            payload: payload.into(),
        }
    }

    /// Returns `true` if the frame ends its session.
    pub fn is_eof(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encodes the frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(STREAM_HEADER_LEN + self.payload.len());
        buf.put_u64(self.session);
        buf.put_u32((STREAM_HEADER_LEN + self.payload.len()) as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Reads one frame.
    pub async fn read_from<R>(reader: &mut R) -> HyperboxResult<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; STREAM_HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let mut header = &header[..];
        let session = header.get_u64();
        let length = header.get_u32() as usize;
        let payload = read_payload(reader, length, STREAM_HEADER_LEN).await?;

        Ok(Self { session, payload })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn read_payload<R>(reader: &mut R, length: usize, header_len: usize) -> HyperboxResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    // A declared length shorter than the header carries no payload.
    if length <= header_len {
        return Ok(Bytes::new());
    }

    if length > MAX_FRAME_LEN {
        return Err(HyperboxError::Protocol(format!(
            "frame length {length} exceeds the limit of {MAX_FRAME_LEN}"
        )));
    }

    let mut payload = vec![0u8; length - header_len];
    reader.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
