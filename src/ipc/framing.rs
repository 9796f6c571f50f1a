//! Length-prefixed message framing.
//!
//! Every message on the wire is a 4-byte unsigned length in network byte
//! order followed by exactly that many bytes of UTF-8 JSON. Frames larger
//! than 1 MiB are a fatal framing error for the connection.

use crate::defaults::MAX_FRAME_LEN;
use crate::error::{Result, RtSttError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encode a payload into a single length-prefixed frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(RtSttError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Read one frame, blocking until both the prefix and the full payload
/// arrive. An oversized length prefix is a framing error; the caller is
/// expected to drop the connection.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(RtSttError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prefixes_length_big_endian() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 5]);
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![b'x'; MAX_FRAME_LEN + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(RtSttError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_accepts_exact_max() {
        let payload = vec![b'x'; MAX_FRAME_LEN];
        let frame = encode_frame(&payload).unwrap();
        assert_eq!(frame.len(), 4 + MAX_FRAME_LEN);
    }

    #[tokio::test]
    async fn test_roundtrip_byte_for_byte() {
        let payload = serde_json::to_vec(&serde_json::json!({
            "type": 3,
            "id": "17",
            "data": { "text": "hello world", "confidence": 0.92 }
        }))
        .unwrap();

        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        write_frame(&mut client, &payload).await.unwrap();
        let decoded = read_frame(&mut server).await.unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn test_multiple_frames_in_sequence() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        write_frame(&mut client, b"first").await.unwrap();
        write_frame(&mut client, b"second").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();

        assert_eq!(read_frame(&mut server).await.unwrap(), b"first");
        assert_eq!(read_frame(&mut server).await.unwrap(), b"second");
        assert_eq!(read_frame(&mut server).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_oversized_prefix_is_framing_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        // 2 GiB length prefix, no payload
        let prefix = (2u32 * 1024 * 1024 * 1024).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &prefix)
            .await
            .unwrap();

        match read_frame(&mut server).await {
            Err(RtSttError::FrameTooLarge { len, max }) => {
                assert_eq!(len, 2 * 1024 * 1024 * 1024);
                assert_eq!(max, MAX_FRAME_LEN);
            }
            other => panic!("expected FrameTooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_one_mib_boundary() {
        let (mut client, mut server) = tokio::io::duplex(4 * 1024 * 1024);

        // 1 MiB exactly: accepted
        let payload = vec![b'a'; MAX_FRAME_LEN];
        write_frame(&mut client, &payload).await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap().len(), MAX_FRAME_LEN);

        // 1 MiB + 1: rejected at the prefix
        let prefix = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &prefix)
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(RtSttError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_stream_errors() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        // Announce 100 bytes but deliver only 10, then close
        tokio::io::AsyncWriteExt::write_all(&mut client, &100u32.to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0u8; 10])
            .await
            .unwrap();
        drop(client);

        assert!(matches!(
            read_frame(&mut server).await,
            Err(RtSttError::Io(_))
        ));
    }
}
