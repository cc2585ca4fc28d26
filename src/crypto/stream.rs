//! AES-128-CTR stream wrappers for side-channel connections
//!
//! A wrapped connection holds two independent CTR keystreams, one per
//! direction, both starting from the same `(key, iv)` at counter zero.
//! Peer A's write stream therefore XORs identically to peer B's read
//! stream and vice versa, with no per-connection handshake.

use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{IV_LEN, KEY_LEN};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Buffer size for the splice copy loops
const COPY_BUF_SIZE: usize = 10 * 1024;

/// Decrypting wrapper around the read half of a side-channel
pub struct CipherReader<R> {
    inner: R,
    keystream: Aes128Ctr,
}

impl<R: AsyncRead + Unpin> CipherReader<R> {
    pub fn new(inner: R, key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Self {
        Self {
            inner,
            keystream: Aes128Ctr::new(key.into(), iv.into()),
        }
    }

    /// Read ciphertext from the underlying stream and decrypt in place.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf).await?;
        self.keystream.apply_keystream(&mut buf[..n]);
        Ok(n)
    }
}

/// Encrypting wrapper around the write half of a side-channel
pub struct CipherWriter<W> {
    inner: W,
    keystream: Aes128Ctr,
}

impl<W: AsyncWrite + Unpin> CipherWriter<W> {
    pub fn new(inner: W, key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Self {
        Self {
            inner,
            keystream: Aes128Ctr::new(key.into(), iv.into()),
        }
    }

    /// Encrypt `buf` in place and write the whole ciphertext.
    pub async fn write_all(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.keystream.apply_keystream(buf);
        self.inner.write_all(buf).await
    }
}

/// Read plaintext from `src` and write it encrypted to `dst` until EOF or
/// the first error.
pub async fn copy_encrypting<R, W>(
    src: &mut R,
    dst: &mut CipherWriter<W>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        dst.write_all(&mut buf[..n]).await?;
    }
}

/// Read ciphertext from `src` and write the decrypted bytes to `dst`
/// until EOF or the first error.
pub async fn copy_decrypting<R, W>(
    src: &mut CipherReader<R>,
    dst: &mut W,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        dst.write_all(&buf[..n]).await?;
    }
}

/// Splice a plaintext connection and a cipher-wrapped side-channel into
/// one relayed bytestream.
///
/// Returns when either direction hits EOF or an error; both connections
/// are dropped on return, so the far ends observe a close no matter which
/// side finished first.
pub async fn splice(
    plain: TcpStream,
    wrapped: TcpStream,
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
) {
    let (mut plain_read, mut plain_write) = plain.into_split();
    let (wrapped_read, wrapped_write) = wrapped.into_split();
    let mut cipher_read = CipherReader::new(wrapped_read, key, iv);
    let mut cipher_write = CipherWriter::new(wrapped_write, key, iv);

    tokio::select! {
        _ = copy_encrypting(&mut plain_read, &mut cipher_write) => {}
        _ = copy_decrypting(&mut cipher_read, &mut plain_write) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_key_iv;

    #[tokio::test]
    async fn wrapped_write_decrypts_on_wrapped_read() {
        let (key, iv) = derive_key_iv(b"helloworld");
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (_a_read, a_write) = tokio::io::split(a);
        let (b_read, _b_write) = tokio::io::split(b);

        let mut writer = CipherWriter::new(a_write, &key, &iv);
        let mut reader = CipherReader::new(b_read, &key, &iv);

        let mut payload = b"attack at dawn".to_vec();
        writer.write_all(&mut payload).await.unwrap();
        // The caller's buffer now holds ciphertext.
        assert_ne!(&payload[..], b"attack at dawn");

        let mut buf = [0u8; 14];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"attack at dawn");
    }

    #[tokio::test]
    async fn directions_use_independent_keystreams() {
        // Both peers start read and write streams at counter zero, so
        // traffic in one direction must not advance the other direction's
        // keystream.
        let (key, iv) = derive_key_iv(b"helloworld");
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let mut a_writer = CipherWriter::new(a_write, &key, &iv);
        let mut a_reader = CipherReader::new(a_read, &key, &iv);
        let mut b_writer = CipherWriter::new(b_write, &key, &iv);
        let mut b_reader = CipherReader::new(b_read, &key, &iv);

        let mut forward = b"a long first message from peer a".to_vec();
        a_writer.write_all(&mut forward).await.unwrap();
        let mut buf = vec![0u8; forward.len()];
        b_reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..], b"a long first message from peer a");

        let mut reverse = b"short reply".to_vec();
        b_writer.write_all(&mut reverse).await.unwrap();
        let mut buf = [0u8; 11];
        let n = a_reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"short reply");
    }

    #[tokio::test]
    async fn copy_helpers_roundtrip() {
        let (key, iv) = derive_key_iv(b"helloworld");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let (cipher_side, mut far_end) = tokio::io::duplex(64 * 1024);
        let (cipher_read, cipher_write) = tokio::io::split(cipher_side);
        let mut writer = CipherWriter::new(cipher_write, &key, &iv);
        let mut reader = CipherReader::new(cipher_read, &key, &iv);

        // far_end plays the remote peer: decrypt what arrives, echo it
        // back encrypted, with its own independent keystreams.
        let expected = payload.clone();
        let echo = tokio::spawn(async move {
            let (far_read, far_write) = tokio::io::split(&mut far_end);
            let mut far_reader = CipherReader::new(far_read, &key, &iv);
            let mut far_writer = CipherWriter::new(far_write, &key, &iv);

            let mut received = vec![0u8; expected.len()];
            let mut filled = 0;
            while filled < received.len() {
                let n = far_reader.read(&mut received[filled..]).await.unwrap();
                assert_ne!(n, 0);
                filled += n;
            }
            assert_eq!(received, expected);
            far_writer.write_all(&mut received).await.unwrap();
        });

        let mut outbound = payload.clone();
        writer.write_all(&mut outbound).await.unwrap();

        let mut echoed = vec![0u8; payload.len()];
        let mut filled = 0;
        while filled < echoed.len() {
            let n = reader.read(&mut echoed[filled..]).await.unwrap();
            assert_ne!(n, 0);
            filled += n;
        }
        assert_eq!(echoed, payload);
        echo.await.unwrap();
    }
}
