//! Length-prefixed framing: a 4-byte big-endian payload length, then the
//! payload.

use std::io::{Read, Write};

use {
    bytes::Bytes,
    flate2::{
        Compression,
        read::DeflateDecoder,
        write::DeflateEncoder,
    },
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

use crate::{error::TransportError, session::CompressType};

pub const HEADER_LEN: usize = 4;

/// Read one frame. `Ok(None)` means the peer closed between frames.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Bytes>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut header[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("frame header cut off after {filled} bytes"),
                )
                .into());
            },
            n => filled += n,
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(TransportError::FrameTooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub fn compress(kind: CompressType, payload: Bytes) -> Result<Bytes, TransportError> {
    match kind {
        CompressType::None => Ok(payload),
        CompressType::Zip => {
            let mut enc = DeflateEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::fast());
            enc.write_all(&payload)?;
            Ok(Bytes::from(enc.finish()?))
        },
    }
}

/// Inverse of [`compress`]; the inflated size is bounded by `max_len`.
pub fn decompress(kind: CompressType, payload: Bytes, max_len: usize) -> Result<Bytes, TransportError> {
    match kind {
        CompressType::None => Ok(payload),
        CompressType::Zip => {
            let mut out = Vec::with_capacity(payload.len() * 2);
            DeflateDecoder::new(&payload[..])
                .take(max_len as u64 + 1)
                .read_to_end(&mut out)?;
            if out.len() > max_len {
                return Err(TransportError::FrameTooLarge {
                    len: out.len(),
                    max: max_len,
                });
            }
            Ok(Bytes::from(out))
        },
    }
}
