//! overpass/src/protocol.rs
//! Frame encoding for the bundled packet transport

use crate::packet::Packet;
use std::io::{Error, ErrorKind, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Largest frame body accepted from a peer (2 MiB).
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Reads a VarInt (max 5 bytes) from the provided stream.
pub async fn read_varint<R>(stream: &mut R) -> Result<i32>
where
    R: AsyncReadExt + Unpin,
{
    let mut num_read = 0;
    let mut result = 0;
    loop {
        if num_read == 5 {
            return Err(Error::new(ErrorKind::InvalidData, "VarInt too big"));
        }
        let byte = stream.read_u8().await?;
        let value = (byte & 0x7F) as i32;
        result |= value << (7 * num_read);
        num_read += 1;
        if (byte & 0x80) == 0 {
            break;
        }
    }
    Ok(result)
}

/// Writes a VarInt to the buffer.
pub fn write_varint(buf: &mut Vec<u8>, mut value: i32) {
    loop {
        if (value & !0x7F) == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push(((value & 0x7F) | 0x80) as u8);
        value = ((value as u32) >> 7) as i32;
    }
}

/// Reads one length-prefixed frame body.
pub async fn read_frame<R>(stream: &mut R) -> Result<Vec<u8>>
where
    R: AsyncReadExt + Unpin,
{
    let len = read_varint(stream).await?;
    if len < 0 || len as usize > MAX_FRAME_LEN {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("frame length {len} out of range"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes `body` as one length-prefixed frame and flushes the stream.
pub async fn write_frame<W>(stream: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("frame length {} out of range", body.len()),
        ));
    }
    let mut frame = Vec::with_capacity(body.len() + 5);
    write_varint(&mut frame, body.len() as i32);
    frame.extend_from_slice(body);
    stream.write_all(&frame).await?;
    stream.flush().await
}

pub fn encode_packet(pk: &Packet) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(pk)
}

pub fn decode_packet(body: &[u8]) -> serde_json::Result<Packet> {
    serde_json::from_slice(body)
}
