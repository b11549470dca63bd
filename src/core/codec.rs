//! Length-prefixed encrypted frames
//!
//! ```text
//! [Length(4, big-endian)] [IV(16)] [AES-128-CFB output(N)]
//! ```
//!
//! The length covers IV and ciphertext. Without a cipher the body is the plaintext
//! itself. A frame is handed to the cipher only once all declared bytes are buffered.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_FRAME_SIZE;
use crate::error::{ChannelError, Result};
use crate::utils::crypto::Cipher;

/// Size of the big-endian length header
pub const LENGTH_PREFIX: usize = 4;

/// Tokio codec for encrypted frames.
///
/// Decodes to plaintext payloads and encodes plaintext payloads. The cipher can be
/// replaced mid-stream with [`FrameCodec::set_cipher`]; frames already buffered are
/// decoded with whatever cipher is active when they complete.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    cipher: Option<Cipher>,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(cipher: Option<Cipher>) -> Self {
        Self {
            cipher,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Codec with a custom size limit for the frame body
    pub fn with_max_frame_size(cipher: Option<Cipher>, max_frame_size: usize) -> Self {
        Self {
            cipher,
            max_frame_size,
        }
    }

    /// Replace the active cipher
    pub fn set_cipher(&mut self, cipher: Option<Cipher>) {
        self.cipher = cipher;
    }

    pub fn cipher(&self) -> Option<&Cipher> {
        self.cipher.as_ref()
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Decoder for FrameCodec {
    type Item = Vec<u8>;
    type Error = ChannelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut header = [0u8; LENGTH_PREFIX];
        header.copy_from_slice(&src[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(header) as usize;

        if len > self.max_frame_size {
            return Err(ChannelError::OversizedFrame(len));
        }

        let total = LENGTH_PREFIX + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let body = src.split_to(len);
        open_frame(self.cipher.as_ref(), &body).map(Some)
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = ChannelError;

    fn encode(&mut self, payload: Vec<u8>, dst: &mut BytesMut) -> Result<()> {
        let body = seal_frame(self.cipher.as_ref(), &payload)?;
        check_length(body.len(), self.max_frame_size)?;
        dst.reserve(LENGTH_PREFIX + body.len());
        dst.extend_from_slice(&(body.len() as u32).to_be_bytes());
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Encrypt a payload into a frame body
pub fn seal_frame(cipher: Option<&Cipher>, payload: &[u8]) -> Result<Vec<u8>> {
    match cipher {
        Some(cipher) => cipher.encrypt(payload),
        None => Ok(payload.to_vec()),
    }
}

/// Decrypt a complete frame body.
///
/// Any cipher failure is reported as a protocol error, which closes the connection.
pub fn open_frame(cipher: Option<&Cipher>, body: &[u8]) -> Result<Vec<u8>> {
    match cipher {
        Some(cipher) => cipher
            .decrypt(body)
            .map_err(|e| ChannelError::Protocol(format!("Frame decryption failed: {e}"))),
        None => Ok(body.to_vec()),
    }
}

fn check_length(len: usize, max: usize) -> Result<()> {
    if len > max || len > u32::MAX as usize {
        return Err(ChannelError::OversizedFrame(len));
    }
    Ok(())
}

/// Read exactly one frame and return its plaintext.
///
/// Blocks until the header and every declared body byte have arrived. A clean EOF
/// before the header is reported as [`ChannelError::ConnectionClosed`].
pub async fn read_frame<R>(
    reader: &mut R,
    cipher: Option<&Cipher>,
    max_frame_size: usize,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LENGTH_PREFIX];
    if let Err(e) = reader.read_exact(&mut header).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ChannelError::ConnectionClosed,
            _ => ChannelError::Io(e),
        });
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_size {
        return Err(ChannelError::OversizedFrame(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    open_frame(cipher, &body)
}

/// Encrypt `payload` and write header plus body as one buffered write.
pub async fn write_frame<W>(
    writer: &mut W,
    cipher: Option<&Cipher>,
    payload: &[u8],
    max_frame_size: usize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = seal_frame(cipher, payload)?;
    check_length(body.len(), max_frame_size)?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::utils::crypto::IV_SIZE;

    fn cipher() -> Cipher {
        Cipher::new(b"1234567897654321").unwrap()
    }

    #[test]
    fn test_codec_roundtrip_encrypted() {
        let mut codec = FrameCodec::new(Some(cipher()));
        let mut buf = BytesMut::new();
        codec.encode(b"{\"type\":\"ack\"}".to_vec(), &mut buf).unwrap();

        // header + IV + body
        assert_eq!(buf.len(), LENGTH_PREFIX + IV_SIZE + 14);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, b"{\"type\":\"ack\"}");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_empty_payload() {
        let mut codec = FrameCodec::new(Some(cipher()));
        let mut buf = BytesMut::new();
        codec.encode(Vec::new(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_partial_frame_not_parsed() {
        let mut codec = FrameCodec::new(Some(cipher()));
        let mut full = BytesMut::new();
        codec.encode(b"hello".to_vec(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), full.len() - 1);

        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), b"hello");
    }

    #[test]
    fn test_body_shorter_than_iv_is_protocol_error() {
        let mut codec = FrameCodec::new(Some(cipher()));
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3, 4, 5]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(_)));
        assert!(err.is_fatal_to_connection());
    }

    #[test]
    fn test_oversized_rejected_before_body_arrives() {
        let mut codec = FrameCodec::with_max_frame_size(None, 1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&4096u32.to_be_bytes());

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ChannelError::OversizedFrame(4096))
        ));
    }

    #[test]
    fn test_plaintext_mode() {
        let mut codec = FrameCodec::new(None);
        let mut buf = BytesMut::new();
        codec.encode(b"clear".to_vec(), &mut buf).unwrap();
        assert_eq!(&buf[LENGTH_PREFIX..], b"clear");
    }

    #[test]
    fn test_cipher_switch() {
        let session = Cipher::from_session_key("00112233445566778899aabbccddeeff").unwrap();
        let mut writer = FrameCodec::new(Some(cipher()));
        let mut reader = FrameCodec::new(Some(cipher()));
        let mut buf = BytesMut::new();

        writer.encode(b"before".to_vec(), &mut buf).unwrap();
        writer.set_cipher(Some(session.clone()));
        writer.encode(b"after".to_vec(), &mut buf).unwrap();

        assert_eq!(reader.decode(&mut buf).unwrap().unwrap(), b"before");
        reader.set_cipher(Some(session));
        assert_eq!(reader.decode(&mut buf).unwrap().unwrap(), b"after");
    }

    #[tokio::test]
    async fn test_read_write_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let c = cipher();

        let writer = tokio::spawn(async move {
            let payload = vec![7u8; 300];
            write_frame(&mut a, Some(&cipher()), &payload, MAX_FRAME_SIZE)
                .await
                .unwrap();
        });

        let got = read_frame(&mut b, Some(&c), MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(got, vec![7u8; 300]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_frame_eof_is_connection_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_frame(&mut b, None, MAX_FRAME_SIZE).await.unwrap_err();
        assert!(matches!(err, ChannelError::ConnectionClosed));
    }
}
