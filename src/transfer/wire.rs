use super::types::TransferMessage;
use bincode::config;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one frame. Chunks are at most 1 MiB by config, so any
/// larger length prefix means the stream is corrupt or hostile.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Read-side framing errors, split by how the session must react.
#[derive(Error, Debug)]
pub enum WireError {
    /// Socket-level failure or EOF; the connection is done.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Length prefix beyond the cap; framing is lost, close the connection.
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte cap")]
    FrameTooLarge(usize),

    /// The frame arrived whole but does not decode. Stream alignment is
    /// intact, so the message can be dropped and the connection kept.
    #[error("undecodable frame: {0}")]
    Decode(bincode::error::DecodeError),
}

impl WireError {
    /// Whether the caller may keep reading from the same stream.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WireError::Decode(_))
    }
}

/// Write one message: 4-byte big-endian length, then the bincode payload.
pub async fn write_message<W>(io: &mut W, message: &TransferMessage) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let data = bincode::encode_to_vec(message, config::standard())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let len = data.len() as u32;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&data).await?;
    io.flush().await?;

    Ok(())
}

/// Read one length-prefixed message.
pub async fn read_message<R>(io: &mut R) -> Result<TransferMessage, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut buffer = vec![0u8; len];
    io.read_exact(&mut buffer).await?;

    let (message, _) =
        bincode::decode_from_slice(&buffer, config::standard()).map_err(WireError::Decode)?;

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::{BatchId, FileId};
    use crate::transfer::types::FileEntry;

    #[tokio::test]
    async fn test_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let message = TransferMessage::BatchStart {
            batch_id: BatchId::from_string("batch-1".to_string()),
            files: vec![FileEntry {
                name: "photo.jpg".to_string(),
                size: 12345,
            }],
        };

        write_message(&mut a, &message).await.unwrap();
        let decoded = read_message(&mut b).await.unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn test_chunk_roundtrip_preserves_bytes() {
        let (mut a, mut b) = tokio::io::duplex(256 * 1024);
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let message = TransferMessage::FileChunk {
            file_id: FileId::new(),
            data: data.clone(),
        };

        write_message(&mut a, &message).await.unwrap();
        match read_message(&mut b).await.unwrap() {
            TransferMessage::FileChunk { data: got, .. } => assert_eq!(got, data),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &len).await.unwrap();

        match read_message(&mut b).await {
            Err(WireError::FrameTooLarge(n)) => {
                assert_eq!(n, MAX_FRAME_LEN + 1);
            }
            other => panic!("expected FrameTooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_recoverable() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        // Valid length prefix over garbage, then a valid message behind it.
        let garbage = [0xffu8; 7];
        tokio::io::AsyncWriteExt::write_all(&mut a, &(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, &garbage)
            .await
            .unwrap();
        let next = TransferMessage::FileEnd {
            file_id: FileId::from_string("f-1".to_string()),
        };
        write_message(&mut a, &next).await.unwrap();

        let err = read_message(&mut b).await.unwrap_err();
        assert!(err.is_recoverable());
        // Alignment held: the following frame still decodes.
        assert_eq!(read_message(&mut b).await.unwrap(), next);
    }

    #[tokio::test]
    async fn test_eof_is_io_error() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        match read_message(&mut b).await {
            Err(WireError::Io(_)) => {}
            other => panic!("expected Io, got {:?}", other.map(|_| ())),
        }
    }
}
