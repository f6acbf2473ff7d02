//! Encrypted, integrity-checked frame transport.
//!
//! Each direction of a connection has its own [`DirectionKeys`] and its own
//! frame sequence number starting at zero. A frame is sealed as follows:
//!
//! 1. The payload is optionally compressed ([`compress_payload`]).
//! 2. It is encrypted with ChaCha20-Poly1305 under the direction's encryption
//!    key, using the nonce `0u32 || seq` and the frame header as associated
//!    data.
//! 3. HMAC-SHA256 under the direction's integrity key is computed over
//!    `seq || header || ciphertext` and appended.
//!
//! The reader verifies the MAC before attempting decryption. Sequence numbers
//! are implicit, so replayed, dropped or reordered frames fail verification.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};
use crate::framing::{
    compress_payload, decompress_payload, Frame, FrameHeader, FrameTag, FRAME_HEADER_SIZE,
    MAC_SIZE, MAX_FRAME_SIZE,
};
use crate::keyex::{DirectionKeys, KeySet, Role};

type HmacSha256 = Hmac<Sha256>;

/// Poly1305 tag appended by the AEAD.
const AEAD_TAG_SIZE: usize = 16;

/// Reader half of a boxed transport.
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Writer half of a boxed transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

fn nonce_for(seq: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

fn frame_mac(
    key: &[u8],
    seq: u64,
    header: &[u8; FRAME_HEADER_SIZE],
    ciphertext: &[u8],
) -> Result<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| ProtocolError::InvalidKey(format!("integrity key: {}", e)))?;
    mac.update(&seq.to_be_bytes());
    mac.update(header);
    mac.update(ciphertext);
    Ok(mac)
}

fn next_seq(seq: &mut u64) -> Result<u64> {
    let current = *seq;
    *seq = current.checked_add(1).ok_or_else(|| {
        ProtocolError::ConnectionClosed("frame sequence number exhausted".to_string())
    })?;
    Ok(current)
}

/// Sealing half of a secure channel.
pub struct SecureWriter<W> {
    inner: W,
    cipher: ChaCha20Poly1305,
    keys: DirectionKeys,
    seq: u64,
}

impl<W: AsyncWrite + Unpin> SecureWriter<W> {
    /// Wraps a writer with outbound keys.
    pub fn new(inner: W, keys: DirectionKeys) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.encryption));
        Self {
            inner,
            cipher,
            keys,
            seq: 0,
        }
    }

    /// Seals and writes one frame, then flushes.
    ///
    /// Fails with [`ProtocolError::FrameTooLarge`] before anything is written
    /// if the sealed payload would exceed [`MAX_FRAME_SIZE`].
    pub async fn write_frame(
        &mut self,
        tag: FrameTag,
        payload: &[u8],
        compress: bool,
    ) -> Result<()> {
        let (body, flags) = compress_payload(payload, compress);
        let length = body.len() + AEAD_TAG_SIZE;
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let header = FrameHeader {
            tag,
            flags,
            length: length as u32,
        }
        .to_bytes();

        let seq = next_seq(&mut self.seq)?;
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_for(seq)),
                Payload {
                    msg: &body,
                    aad: &header,
                },
            )
            .map_err(|e| ProtocolError::Encryption(e.to_string()))?;
        let mac = frame_mac(&self.keys.integrity, seq, &header, &ciphertext)?
            .finalize()
            .into_bytes();

        self.inner.write_all(&header).await?;
        self.inner.write_all(&ciphertext).await?;
        self.inner.write_all(&mac).await?;
        self.inner.flush().await?;

        tracing::trace!(?tag, seq, len = length, compressed = flags.is_compressed(), "frame sent");
        Ok(())
    }

    /// Shuts down the underlying writer.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Opening half of a secure channel.
pub struct SecureReader<R> {
    inner: R,
    cipher: ChaCha20Poly1305,
    keys: DirectionKeys,
    seq: u64,
}

impl<R: AsyncRead + Unpin> SecureReader<R> {
    /// Wraps a reader with inbound keys.
    pub fn new(inner: R, keys: DirectionKeys) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.encryption));
        Self {
            inner,
            cipher,
            keys,
            seq: 0,
        }
    }

    /// Reads, verifies and opens one frame.
    ///
    /// A clean end of stream before the first header byte is reported as
    /// [`ProtocolError::ConnectionClosed`]. Any integrity or decryption
    /// failure leaves the reader in an undefined position; callers must
    /// treat the channel as unusable afterwards.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
        self.inner.read_exact(&mut header_bytes).await?;
        let header = FrameHeader::from_bytes(&header_bytes)?;

        let length = header.length as usize;
        if length < AEAD_TAG_SIZE {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext of {} bytes is shorter than its tag",
                length
            )));
        }
        let mut ciphertext = vec![0u8; length];
        self.inner.read_exact(&mut ciphertext).await?;
        let mut tag = [0u8; MAC_SIZE];
        self.inner.read_exact(&mut tag).await?;

        let seq = next_seq(&mut self.seq)?;
        frame_mac(&self.keys.integrity, seq, &header_bytes, &ciphertext)?
            .verify_slice(&tag)
            .map_err(|_| ProtocolError::Integrity)?;

        let body = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce_for(seq)),
                Payload {
                    msg: &ciphertext,
                    aad: &header_bytes,
                },
            )
            .map_err(|e| ProtocolError::Decryption(e.to_string()))?;
        let payload = decompress_payload(body, header.flags)?;

        tracing::trace!(tag = ?header.tag, seq, len = length, "frame received");
        Ok(Frame::new(header.tag, payload))
    }
}

/// Splits a transport into sealing and opening halves for the given role.
pub fn secure_split<S>(
    stream: S,
    keys: &KeySet,
    role: Role,
) -> (SecureReader<BoxedReader>, SecureWriter<BoxedWriter>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (inbound, outbound) = keys.split(role);
    let (read_half, write_half) = tokio::io::split(stream);
    (
        SecureReader::new(Box::new(read_half), inbound),
        SecureWriter::new(Box::new(write_half), outbound),
    )
}
