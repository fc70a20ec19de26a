//! Wire protocol between the farm and its workers.
//!
//! Frames are `u32` little-endian length followed by a bincode payload.
//! Requests and responses are correlated by id; a `Cancel` frame may
//! arrive while the worker is mid-request and makes it finish with
//! [`super::WarpResponse::Cancelled`].

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{WarpRequest, WarpResponse};

/// Frames travelling parent → worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ToWorker {
    Request { id: u64, request: WarpRequest },
    Cancel { id: u64 },
    Shutdown,
}

/// Frames travelling worker → parent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FromWorker {
    Response { id: u64, response: WarpResponse },
}

/// Upper bound on a single frame; a warped 4096² RGBA float tile stays
/// well below this.
pub const MAX_FRAME_LEN: u32 = 512 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("channel closed")]
    Closed,

    #[error("frame too large: {0} bytes")]
    Oversized(u32),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Blocking frame write (worker side).
pub fn write_frame<T: Serialize>(writer: &mut impl Write, frame: &T) -> Result<(), ProtocolError> {
    let payload = bincode::serialize(frame)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized(len));
    }
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Blocking frame read (worker side). `Ok(None)` signals a clean EOF.
pub fn read_frame<T: for<'de> Deserialize<'de>>(
    reader: &mut impl Read,
) -> Result<Option<T>, ProtocolError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some(bincode::deserialize(&payload)?))
}

/// Async frame write (parent side).
pub async fn write_frame_async<T: Serialize, W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &T,
) -> Result<(), ProtocolError> {
    let payload = bincode::serialize(frame)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized(len));
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Async frame read (parent side). `Ok(None)` signals a clean EOF.
pub async fn read_frame_async<T: for<'de> Deserialize<'de>, R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, ProtocolError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{Extents2, Size2};
    use crate::raster::Resampling;
    use crate::warper::MaskRequest;

    #[test]
    fn test_sync_round_trip() {
        let frame = ToWorker::Request {
            id: 42,
            request: WarpRequest::Mask(MaskRequest {
                dataset: "/data/x".to_string(),
                srs: "EPSG:3857".to_string(),
                extents: Extents2::new(0.0, 0.0, 1.0, 1.0),
                size: Size2::new(16, 16),
                resampling: Resampling::Nearest,
            }),
        };

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &frame).unwrap();
        let mut cursor = std::io::Cursor::new(buffer);
        let back: ToWorker = read_frame(&mut cursor).unwrap().unwrap();
        match back {
            ToWorker::Request { id, .. } => assert_eq!(id, 42),
            other => panic!("wrong frame: {other:?}"),
        }
        // EOF after the single frame
        let eof: Option<ToWorker> = read_frame(&mut cursor).unwrap();
        assert!(eof.is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buffer);
        let result: Result<Option<ToWorker>, _> = read_frame(&mut cursor);
        assert!(matches!(result, Err(ProtocolError::Oversized(_))));
    }

    #[tokio::test]
    async fn test_async_round_trip() {
        let frame = FromWorker::Response {
            id: 7,
            response: WarpResponse::Cancelled,
        };
        let mut buffer = Vec::new();
        write_frame_async(&mut buffer, &frame).await.unwrap();
        let mut cursor = std::io::Cursor::new(buffer);
        let back: FromWorker = read_frame_async(&mut cursor).await.unwrap().unwrap();
        let FromWorker::Response { id, response } = back;
        assert_eq!(id, 7);
        assert!(matches!(response, WarpResponse::Cancelled));
    }
}
