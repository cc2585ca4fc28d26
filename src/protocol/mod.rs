//! Control-protocol framing
//!
//! Every frame on the control connection is plaintext and begins with a
//! single tag byte. `START` carries a big-endian `u64` length and a JSON
//! [`ClientConfig`](crate::config::ClientConfig); `NEWSOCKET` and the
//! `NEWCONN` side-channel preamble carry a 3-byte `port | slot` body; all
//! other tags have no payload. Short reads are errors: a frame either
//! arrives whole or kills the connection.

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ClientConfig;

/// Hard ceiling on the `START` payload length (1 MiB)
pub const MAX_START_LEN: u64 = 1024 * 1024;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown tag: {0}")]
    UnknownTag(u8),

    #[error("Start payload too large: {0} bytes")]
    StartTooLarge(u64),

    #[error("Malformed start payload: {0}")]
    MalformedStart(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control-frame tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    /// Client handshake carrying the JSON client configuration
    Start = 1,
    /// Server notification: an external connection is waiting
    NewSocket = 2,
    /// Side-channel preamble naming the pending slot to pair with
    NewConn = 3,
    /// Legacy generic failure
    Error = 4,
    /// Post-auth acknowledgement, also the heartbeat reply
    Success = 5,
    /// Server heartbeat
    Idle = 6,
    /// Session end
    Kill = 7,
    /// Key mismatch
    ErrorPwd = 8,
    /// An outer port could not be bound
    ErrorBusy = 9,
    /// An outer port lies outside the allowed range
    ErrorLimitPort = 10,
}

impl TryFrom<u8> for Tag {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(Tag::Start),
            2 => Ok(Tag::NewSocket),
            3 => Ok(Tag::NewConn),
            4 => Ok(Tag::Error),
            5 => Ok(Tag::Success),
            6 => Ok(Tag::Idle),
            7 => Ok(Tag::Kill),
            8 => Ok(Tag::ErrorPwd),
            9 => Ok(Tag::ErrorBusy),
            10 => Ok(Tag::ErrorLimitPort),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// Names one pending external connection: the outer port it arrived on
/// and its slot index. The shared body of `NEWSOCKET` and `NEWCONN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnId {
    pub port: u16,
    pub slot: u8,
}

impl ConnId {
    /// Encode the full 4-byte frame: `tag | port (BE) | slot`.
    ///
    /// Callers write this with a single `write_all` so the frame stays
    /// atomic on a shared control connection.
    pub fn encode(&self, tag: Tag) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u8(tag as u8);
        buf.put_u16(self.port);
        buf.put_u8(self.slot);
        buf
    }
}

/// Read one tag byte.
pub async fn read_tag<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Tag, ProtocolError> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte).await?;
    Tag::try_from(byte[0])
}

/// Write one payload-less frame.
pub async fn write_tag<W: AsyncWrite + Unpin>(writer: &mut W, tag: Tag) -> std::io::Result<()> {
    writer.write_all(&[tag as u8]).await
}

/// Read the 3-byte `port | slot` body following `NEWSOCKET` or `NEWCONN`.
pub async fn read_conn_id<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<ConnId> {
    let mut body = [0u8; 3];
    reader.read_exact(&mut body).await?;
    Ok(ConnId {
        port: u16::from_be_bytes([body[0], body[1]]),
        slot: body[2],
    })
}

/// Write the `START` frame: tag, `u64` big-endian payload length, then
/// the JSON-serialized client configuration.
pub async fn write_start<W: AsyncWrite + Unpin>(
    writer: &mut W,
    config: &ClientConfig,
) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(config)?;
    let mut buf = BytesMut::with_capacity(1 + 8 + payload.len());
    buf.put_u8(Tag::Start as u8);
    buf.put_u64(payload.len() as u64);
    buf.extend_from_slice(&payload);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read the `START` payload; the tag byte itself has already been
/// consumed. Oversize lengths are rejected before any payload is read.
pub async fn read_start<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ClientConfig, ProtocolError> {
    let mut len_buf = [0u8; 8];
    reader.read_exact(&mut len_buf).await?;
    let len = u64::from_be_bytes(len_buf);
    if len > MAX_START_LEN {
        return Err(ProtocolError::StartTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mapping;

    #[test]
    fn tag_roundtrip() {
        for value in 1u8..=10 {
            let tag = Tag::try_from(value).unwrap();
            assert_eq!(tag as u8, value);
        }
        assert!(matches!(
            Tag::try_from(0),
            Err(ProtocolError::UnknownTag(0))
        ));
        assert!(matches!(
            Tag::try_from(11),
            Err(ProtocolError::UnknownTag(11))
        ));
    }

    #[test]
    fn conn_id_byte_layout() {
        let frame = ConnId { port: 9100, slot: 7 }.encode(Tag::NewSocket);
        assert_eq!(&frame[..], &[2, 0x23, 0x8c, 7]);

        let frame = ConnId { port: 9100, slot: 7 }.encode(Tag::NewConn);
        assert_eq!(frame[0], 3);
    }

    #[tokio::test]
    async fn conn_id_read_back() {
        let frame = ConnId { port: 443, slot: 9 }.encode(Tag::NewSocket);
        let mut reader = &frame[1..];
        let id = read_conn_id(&mut reader).await.unwrap();
        assert_eq!(id, ConnId { port: 443, slot: 9 });
    }

    #[tokio::test]
    async fn start_roundtrip() {
        let config = ClientConfig {
            key: "helloworld".to_string(),
            server: "127.0.0.1:8808".to_string(),
            map: vec![Mapping {
                inner: "127.0.0.1:9000".to_string(),
                outer: 9100,
            }],
        };

        let mut wire = Vec::new();
        write_start(&mut wire, &config).await.unwrap();
        assert_eq!(wire[0], Tag::Start as u8);

        let mut reader = &wire[1..];
        let parsed = read_start(&mut reader).await.unwrap();
        assert_eq!(parsed.key, config.key);
        assert_eq!(parsed.map.len(), 1);
        assert_eq!(parsed.map[0].outer, 9100);
    }

    #[tokio::test]
    async fn start_rejects_oversize_payload() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_START_LEN + 1).to_be_bytes());
        wire.extend_from_slice(b"ignored");

        let mut reader = &wire[..];
        assert!(matches!(
            read_start(&mut reader).await,
            Err(ProtocolError::StartTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn start_rejects_bad_json() {
        let payload = b"not json at all";
        let mut wire = Vec::new();
        wire.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        wire.extend_from_slice(payload);

        let mut reader = &wire[..];
        assert!(matches!(
            read_start(&mut reader).await,
            Err(ProtocolError::MalformedStart(_))
        ));
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        // A NEWSOCKET body cut short must fail, not return a partial id.
        let mut reader: &[u8] = &[0x23];
        assert!(read_conn_id(&mut reader).await.is_err());
    }
}
