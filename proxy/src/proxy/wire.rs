//! Raw message-level I/O shared by the handshake, the upstream SCRAM
//! client, and the pump. Every backend/frontend message on the wire is
//! `<1-byte tag><4-byte big-endian length, inclusive of itself><payload>`,
//! except the very first client message, which has no tag byte.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A message read off the wire with its tag already stripped.
pub struct Message {
    pub tag: u8,
    pub payload: Vec<u8>,
}

/// Read one tagged message: 1 tag byte, 4 length bytes (inclusive of
/// themselves), then `length - 4` payload bytes.
pub async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Message> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    let tag = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len.saturating_sub(4)];
    stream.read_exact(&mut payload).await?;
    Ok(Message { tag, payload })
}

/// Read a message with no leading tag byte, as the very first thing the
/// server sees from a client (the startup packet / SSLRequest).
pub async fn read_untagged<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len.saturating_sub(4)];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one tagged message, computing the length prefix fresh.
pub async fn write_message<S: AsyncWrite + Unpin>(
    stream: &mut S,
    tag: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(tag);
    buf.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await?;
    stream.flush().await
}

/// Write a raw, already-framed (tagged, length-prefixed) message verbatim.
pub async fn write_raw<S: AsyncWrite + Unpin>(stream: &mut S, raw: &[u8]) -> std::io::Result<()> {
    stream.write_all(raw).await?;
    stream.flush().await
}
