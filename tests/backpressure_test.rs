use lanbeam::core::domain::{BatchId, FileId};
use lanbeam::core::events::EventBus;
use lanbeam::transfer::coordinator::{stream_file, AbortToken, StreamEnd};
use lanbeam::transfer::types::{FileEntry, TransferMessage};
use lanbeam::transfer::wire;
use std::time::Duration;

const CHUNK_SIZE: usize = 64 * 1024;

fn entry(name: &str, size: u64) -> FileEntry {
    FileEntry {
        name: name.to_string(),
        size,
    }
}

/// Strict per-file backpressure: with a receiver that delays every ack, the
/// next chunk must never arrive before the previous one is acknowledged.
#[tokio::test]
async fn at_most_one_unacknowledged_chunk_in_flight() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let size = (CHUNK_SIZE * 3 + 100) as u64; // four chunks
    let path = dir.path().join("big.bin");
    std::fs::write(&path, vec![0xabu8; size as usize])?;

    // Buffer large enough to hold several chunks, so if the sender were
    // pipelining, the extra chunks would be readable immediately.
    let (mut sender_io, mut receiver_io) = tokio::io::duplex(1024 * 1024);

    let receiver = tokio::spawn(async move {
        // Metadata first.
        match wire::read_message(&mut receiver_io).await.unwrap() {
            TransferMessage::FileMetadata { .. } => {}
            other => panic!("expected metadata, got {}", other.kind()),
        }

        let mut chunks = 0u32;
        loop {
            match wire::read_message(&mut receiver_io).await.unwrap() {
                TransferMessage::FileChunk { .. } => {
                    chunks += 1;
                    // Hold the ack. Nothing else may arrive in the meantime.
                    let quiet = tokio::time::timeout(
                        Duration::from_millis(150),
                        wire::read_message(&mut receiver_io),
                    )
                    .await;
                    assert!(
                        quiet.is_err(),
                        "sender transmitted ahead of the acknowledgment"
                    );
                    wire::write_message(&mut receiver_io, &TransferMessage::ack_received())
                        .await
                        .unwrap();
                }
                TransferMessage::FileEnd { .. } => return chunks,
                other => panic!("unexpected {}", other.kind()),
            }
        }
    });

    let events = EventBus::new();
    let mut sent_total = 0u64;
    stream_file(
        &mut sender_io,
        &events,
        &BatchId::new(),
        &FileId::new(),
        &entry("big.bin", size),
        &path,
        CHUNK_SIZE,
        &AbortToken::new(),
        &mut sent_total,
        size,
    )
    .await
    .map_err(|e| anyhow::anyhow!("stream failed: {:?}", e))?;

    assert_eq!(receiver.await?, 4);
    assert_eq!(sent_total, size);
    Ok(())
}

/// A flipped abort token stops the pipeline before the next chunk read; no
/// cancel message crosses the wire.
#[tokio::test]
async fn canceled_token_stops_before_first_chunk() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("doomed.bin");
    std::fs::write(&path, vec![1u8; 10_000])?;

    let (mut sender_io, mut receiver_io) = tokio::io::duplex(256 * 1024);
    let token = AbortToken::new();
    token.cancel();

    let events = EventBus::new();
    let mut sent_total = 0u64;
    let result = stream_file(
        &mut sender_io,
        &events,
        &BatchId::new(),
        &FileId::new(),
        &entry("doomed.bin", 10_000),
        &path,
        CHUNK_SIZE,
        &token,
        &mut sent_total,
        10_000,
    )
    .await;

    assert!(matches!(result, Err(StreamEnd::Canceled)));
    assert_eq!(sent_total, 0);

    // The receiver saw the metadata and then silence: no chunk, no cancel
    // frame, just nothing.
    match wire::read_message(&mut receiver_io).await? {
        TransferMessage::FileMetadata { .. } => {}
        other => panic!("unexpected {}", other.kind()),
    }
    drop(sender_io);
    assert!(matches!(
        wire::read_message(&mut receiver_io).await,
        Err(wire::WireError::Io(_))
    ));
    Ok(())
}

/// An ack carrying `Error` fails that file without touching the connection.
#[tokio::test]
async fn error_ack_fails_the_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("unwanted.bin");
    std::fs::write(&path, vec![2u8; 5000])?;

    let (mut sender_io, mut receiver_io) = tokio::io::duplex(256 * 1024);

    let receiver = tokio::spawn(async move {
        loop {
            match wire::read_message(&mut receiver_io).await.unwrap() {
                TransferMessage::FileChunk { .. } => {
                    wire::write_message(&mut receiver_io, &TransferMessage::ack_error("disk full"))
                        .await
                        .unwrap();
                    return;
                }
                _ => {}
            }
        }
    });

    let events = EventBus::new();
    let mut sent_total = 0u64;
    let result = stream_file(
        &mut sender_io,
        &events,
        &BatchId::new(),
        &FileId::new(),
        &entry("unwanted.bin", 5000),
        &path,
        CHUNK_SIZE,
        &AbortToken::new(),
        &mut sent_total,
        5000,
    )
    .await;

    match result {
        Err(StreamEnd::Failed(reason)) => assert_eq!(reason, "disk full"),
        other => panic!("expected Failed, got {:?}", other),
    }
    receiver.await?;
    Ok(())
}

/// Progress events fire after every acknowledgment and end exactly at 100.
#[tokio::test]
async fn progress_fires_per_ack_and_reaches_100() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let size = (CHUNK_SIZE * 2 + 10) as u64; // three chunks
    let path = dir.path().join("steady.bin");
    std::fs::write(&path, vec![3u8; size as usize])?;

    let (mut sender_io, mut receiver_io) = tokio::io::duplex(1024 * 1024);
    let receiver = tokio::spawn(async move {
        loop {
            match wire::read_message(&mut receiver_io).await.unwrap() {
                TransferMessage::FileChunk { .. } => {
                    wire::write_message(&mut receiver_io, &TransferMessage::ack_received())
                        .await
                        .unwrap();
                }
                TransferMessage::FileEnd { .. } => return,
                _ => {}
            }
        }
    });

    let events = EventBus::new();
    let mut progress = events.subscribe();
    let mut sent_total = 0u64;
    stream_file(
        &mut sender_io,
        &events,
        &BatchId::new(),
        &FileId::new(),
        &entry("steady.bin", size),
        &path,
        CHUNK_SIZE,
        &AbortToken::new(),
        &mut sent_total,
        size,
    )
    .await
    .map_err(|e| anyhow::anyhow!("stream failed: {:?}", e))?;
    receiver.await?;

    let mut file_percents = Vec::new();
    while let Ok(event) = progress.try_recv() {
        if let lanbeam::CoreEvent::FileProgress { percent, .. } = event {
            file_percents.push(percent);
        }
    }
    assert_eq!(file_percents.len(), 3);
    assert!(file_percents.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(*file_percents.last().unwrap(), 100.0);
    Ok(())
}
