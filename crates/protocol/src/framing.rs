//! Frame layout and payload compression.
//!
//! # Frame Format
//!
//! Each frame on the wire consists of:
//! - 1 byte: tag (message, command or auth)
//! - 1 byte: flags (bit 0 = compressed)
//! - 4 bytes: ciphertext length (big-endian)
//! - N bytes: ciphertext (payload, possibly LZ4 compressed, then encrypted)
//! - 32 bytes: MAC over sequence number, header and ciphertext
//!
//! The first six bytes form the [`FrameHeader`]. They travel in the clear but
//! are covered by both the AEAD and the MAC, see [`crate::channel`].
//!
//! # Compression
//!
//! Compression is requested per frame by the caller. It is only applied when
//! the LZ4 output is actually smaller than the input; the flag in the header
//! records whether the payload was compressed.

use crate::error::{ProtocolError, Result};

/// Maximum ciphertext length of a single frame (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size: 1 (tag) + 1 (flags) + 4 (length) = 6 bytes.
pub const FRAME_HEADER_SIZE: usize = 6;

/// Size of the trailing MAC.
pub const MAC_SIZE: usize = 32;

/// Kind of payload carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameTag {
    /// An application [`crate::Message`].
    Message = 0,
    /// A protocol [`crate::Command`].
    Command = 1,
    /// Authentication request or acknowledgement, only during connection setup.
    Auth = 2,
}

impl TryFrom<u8> for FrameTag {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(FrameTag::Message),
            1 => Ok(FrameTag::Command),
            2 => Ok(FrameTag::Auth),
            other => Err(ProtocolError::InvalidFrameTag(other)),
        }
    }
}

/// Flags indicating frame properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Flag indicating the payload is LZ4 compressed.
    pub const COMPRESSED: u8 = 0b0000_0001;

    /// Create a new empty flags set.
    #[inline]
    pub fn new() -> Self {
        Self(0)
    }

    /// Create flags from a raw byte value.
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value of the flags.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if the compressed flag is set.
    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Set the compressed flag.
    #[inline]
    pub fn set_compressed(&mut self, compressed: bool) {
        if compressed {
            self.0 |= Self::COMPRESSED;
        } else {
            self.0 &= !Self::COMPRESSED;
        }
    }

    /// Return a new flags with compressed set.
    #[inline]
    pub fn with_compressed(mut self, compressed: bool) -> Self {
        self.set_compressed(compressed);
        self
    }
}

/// The cleartext header preceding every frame's ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub tag: FrameTag,
    pub flags: FrameFlags,
    /// Length of the ciphertext that follows.
    pub length: u32,
}

impl FrameHeader {
    /// Encodes the header into its six-byte wire form.
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut out = [0u8; FRAME_HEADER_SIZE];
        out[0] = self.tag as u8;
        out[1] = self.flags.as_byte();
        out[2..].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// Decodes and validates a header.
    pub fn from_bytes(bytes: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let tag = FrameTag::try_from(bytes[0])?;
        let flags = FrameFlags::from_byte(bytes[1]);
        let length = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        if length as usize > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length as usize,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(Self { tag, flags, length })
    }
}

/// A decoded frame: its tag and plaintext payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: FrameTag,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame with the given tag and payload.
    pub fn new(tag: FrameTag, payload: Vec<u8>) -> Self {
        Self { tag, payload }
    }
}

/// Compresses a payload if asked to and if that makes it smaller.
///
/// Returns the bytes to encrypt and the flags describing them.
pub fn compress_payload(payload: &[u8], compress: bool) -> (Vec<u8>, FrameFlags) {
    if compress {
        let compressed = lz4_flex::compress_prepend_size(payload);
        if compressed.len() < payload.len() {
            return (compressed, FrameFlags::new().with_compressed(true));
        }
    }
    (payload.to_vec(), FrameFlags::new())
}

/// Reverses [`compress_payload`] according to the frame flags.
pub fn decompress_payload(data: Vec<u8>, flags: FrameFlags) -> Result<Vec<u8>> {
    if !flags.is_compressed() {
        return Ok(data);
    }
    // lz4_flex prepends the uncompressed size as a little-endian u32.
    let Some(prefix) = data.get(..4) else {
        return Err(ProtocolError::Deserialization(
            "failed to decompress payload: missing size prefix".to_string(),
        ));
    };
    let size = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    lz4_flex::decompress_size_prepended(&data).map_err(|e| {
        ProtocolError::Deserialization(format!("failed to decompress payload: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_flags_default() {
        let flags = FrameFlags::new();
        assert_eq!(flags.as_byte(), 0);
        assert!(!flags.is_compressed());
    }

    #[test]
    fn test_frame_flags_compressed() {
        let mut flags = FrameFlags::new();
        flags.set_compressed(true);
        assert!(flags.is_compressed());
        assert_eq!(flags.as_byte(), 0b0000_0001);

        flags.set_compressed(false);
        assert!(!flags.is_compressed());
        assert_eq!(flags.as_byte(), 0);
    }

    #[test]
    fn test_frame_flags_from_byte() {
        let flags = FrameFlags::from_byte(0b0000_0001);
        assert!(flags.is_compressed());

        let flags = FrameFlags::from_byte(0b1111_1110);
        assert!(!flags.is_compressed());
    }

    #[test]
    fn test_frame_tag_from_byte() {
        assert_eq!(FrameTag::try_from(0).unwrap(), FrameTag::Message);
        assert_eq!(FrameTag::try_from(1).unwrap(), FrameTag::Command);
        assert_eq!(FrameTag::try_from(2).unwrap(), FrameTag::Auth);
        assert!(matches!(
            FrameTag::try_from(9),
            Err(ProtocolError::InvalidFrameTag(9))
        ));
    }

    #[test]
    fn test_frame_header_format() {
        let header = FrameHeader {
            tag: FrameTag::Command,
            flags: FrameFlags::new().with_compressed(true),
            length: 0x0001_0203,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes, [1, 1, 0, 1, 2, 3]);
        assert_eq!(FrameHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_frame_header_rejects_oversized_length() {
        let mut bytes = [0u8; FRAME_HEADER_SIZE];
        bytes[2..].copy_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_frame_header_rejects_unknown_tag() {
        let bytes = [0x7f, 0, 0, 0, 0, 0];
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(ProtocolError::InvalidFrameTag(0x7f))
        ));
    }

    #[test]
    fn test_compress_repetitive_payload() {
        let payload: Vec<u8> = (0..2048).map(|i| (i % 16) as u8).collect();
        let (data, flags) = compress_payload(&payload, true);
        assert!(flags.is_compressed());
        assert!(data.len() < payload.len());
        assert_eq!(decompress_payload(data, flags).unwrap(), payload);
    }

    #[test]
    fn test_compress_not_requested() {
        let payload = vec![0u8; 4096];
        let (data, flags) = compress_payload(&payload, false);
        assert!(!flags.is_compressed());
        assert_eq!(data, payload);
    }

    #[test]
    fn test_compression_not_used_when_not_beneficial() {
        let payload = vec![1, 2, 3];
        let (data, flags) = compress_payload(&payload, true);
        assert!(!flags.is_compressed());
        assert_eq!(data, payload);
    }

    #[test]
    fn test_decompress_corrupted_data() {
        let flags = FrameFlags::new().with_compressed(true);
        let mut data = 64u32.to_le_bytes().to_vec();
        data.extend_from_slice(&[0xFF; 9]);
        let result = decompress_payload(data, flags);
        assert!(result.unwrap_err().to_string().contains("decompress"));
    }

    #[test]
    fn test_decompress_rejects_oversized_prefix() {
        let flags = FrameFlags::new().with_compressed(true);
        let result = decompress_payload(vec![0xFF; 9], flags);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }
}
