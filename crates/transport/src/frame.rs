// Path: crates/transport/src/frame.rs
//! Length-prefixed framing.
//!
//! Frame = 4-byte big-endian unsigned length ‖ envelope bytes. A frame
//! announcing more than the configured maximum fails the connection with a
//! protocol error before any allocation happens.

use herd_types::error::TransportError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Writes one frame.
pub async fn write_frame<W>(w: &mut W, bytes: &[u8], max: usize) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if bytes.len() > max {
        return Err(TransportError::FrameTooLarge {
            size: bytes.len(),
            max,
        });
    }
    let len = bytes.len() as u32;
    w.write_all(&len.to_be_bytes())
        .await
        .map_err(|_| TransportError::Disconnected)?;
    w.write_all(bytes)
        .await
        .map_err(|_| TransportError::Disconnected)?;
    w.flush().await.map_err(|_| TransportError::Disconnected)?;
    Ok(())
}

/// Reads one frame.
pub async fn read_frame<R>(r: &mut R, max: usize) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)
        .await
        .map_err(|_| TransportError::Disconnected)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 {
        return Err(TransportError::ProtocolViolation("zero-length frame".into()));
    }
    if len > max {
        return Err(TransportError::FrameTooLarge { size: len, max });
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .await
        .map_err(|_| TransportError::Disconnected)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello frame", 1024).await.unwrap();
        let got = read_frame(&mut b, 1024).await.unwrap();
        assert_eq!(got, b"hello frame");
    }

    #[tokio::test]
    async fn test_oversized_frame_refused_on_read() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        // Hand-craft a frame that announces more than the max.
        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        a.write_all(&[0u8; 100]).await.unwrap();
        let err = read_frame(&mut b, 16).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { size: 100, max: 16 }));
    }

    #[tokio::test]
    async fn test_oversized_frame_refused_on_write() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let err = write_frame(&mut a, &[0u8; 64], 16).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_disconnect() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&8u32.to_be_bytes()).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);
        assert_eq!(
            read_frame(&mut b, 1024).await.unwrap_err(),
            TransportError::Disconnected
        );
    }
}
