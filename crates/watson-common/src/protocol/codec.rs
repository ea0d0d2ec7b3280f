//! Header codec for the framed wire format.
//!
//! Reads scan one byte at a time for the `\r\n\r\n` terminator; callers
//! wrap the connection in a [`tokio::io::BufReader`] so the scan does
//! not pay a syscall per byte. The scan preserves the all-zero sentinel
//! check at frame boundaries: a peer that went away can surface as four
//! NUL bytes where a header should begin.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::message::Message;
use crate::protocol::{MAX_HEADER_SIZE, TERMINATOR};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Serialize `msg` as the JSON header followed by the terminator.
pub fn encode_header(msg: &Message) -> Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(msg)?;
    buf.extend_from_slice(&TERMINATOR);
    Ok(buf)
}

/// Read one header from `r`, leaving the payload unconsumed.
///
/// Fails with [`Error::PeerDisconnected`] when the first four bytes at a
/// frame boundary are all zero or the stream ends cleanly at the
/// boundary, with [`Error::Io`] on end-of-stream or failure mid-header,
/// and with [`Error::InvalidMessage`] on malformed JSON, an oversized
/// header, or a negative declared length.
pub async fn read_header<R>(r: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = BytesMut::with_capacity(128);
    let mut byte = [0u8; 1];
    loop {
        match r.read(&mut byte).await {
            Ok(0) => {
                // Clean close between frames; anything later is a cut-off
                // header.
                if header.is_empty() {
                    return Err(Error::PeerDisconnected);
                }
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            Ok(_) => header.put_u8(byte[0]),
            Err(err) => return Err(Error::Io(err)),
        }

        if header.len() == TERMINATOR.len() && header[..] == [0, 0, 0, 0] {
            return Err(Error::PeerDisconnected);
        }
        if header.len() >= TERMINATOR.len()
            && header[header.len() - TERMINATOR.len()..] == TERMINATOR
        {
            break;
        }
        if header.len() > MAX_HEADER_SIZE {
            return Err(Error::InvalidMessage(format!(
                "header exceeds {} bytes",
                MAX_HEADER_SIZE
            )));
        }
    }

    let json = &header[..header.len() - TERMINATOR.len()];
    let msg: Message = serde_json::from_slice(json)?;
    if msg.content_length < 0 {
        return Err(Error::InvalidMessage(format!(
            "negative content length {}",
            msg.content_length
        )));
    }
    Ok(msg)
}

/// Read one header and its fully buffered payload.
pub async fn read_frame<R>(r: &mut R) -> Result<(Message, Vec<u8>)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let msg = read_header(r).await?;
    let mut payload = vec![0u8; msg.content_length as usize];
    r.read_exact(&mut payload).await?;
    Ok((msg, payload))
}

/// Write one frame: the encoded header, then the payload. Returns the
/// total bytes written for the sender's counters.
///
/// Callers serialize concurrent writers with the connection's write
/// mutex; this function assumes it holds the stream exclusively.
pub async fn write_frame<W>(w: &mut W, msg: &Message, payload: &[u8]) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let header = encode_header(msg)?;
    w.write_all(&header).await?;
    if !payload.is_empty() {
        w.write_all(payload).await?;
    }
    w.flush().await?;
    Ok((header.len() + payload.len()) as u64)
}

/// Copy exactly `length` payload bytes from `reader` into `w`.
///
/// A reader that ends early yields [`Error::StreamTruncated`]; bytes
/// beyond `length` are left unconsumed.
pub async fn copy_payload<W, R>(w: &mut W, reader: &mut R, length: i64) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + Unpin + ?Sized,
{
    let expected = length.max(0) as u64;
    let mut remaining = expected;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(Error::StreamTruncated {
                copied: expected - remaining,
                expected,
            });
        }
        w.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    w.flush().await?;
    Ok(())
}

/// Discard exactly `n` bytes from `r`. Used to restore frame alignment
/// after a streaming callback leaves part of a payload unread.
pub async fn drain<R>(r: &mut R, n: u64) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut take = r.take(n);
    let copied = tokio::io::copy(&mut take, &mut tokio::io::sink()).await?;
    if copied < n {
        return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(())
}
