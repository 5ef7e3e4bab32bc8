use anyhow::{Context, Result};
use bytes::Bytes;

use crate::error::IngestError;
use crate::utils;
use crate::wal::WalStore;

#[tokio::test]
async fn append_and_read_round_trip() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
    let wal = WalStore::open(tmpdir.path(), 60_000).await?;

    let handle = wal.append(Bytes::from_static(b"first record")).await?;
    let payload = wal.read(handle).await?;
    assert_eq!(payload.as_ref(), b"first record");
    Ok(())
}

#[tokio::test]
async fn read_all_preserves_order_across_segments() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
    {
        // A zero rotation interval forces a fresh segment per append.
        let wal = WalStore::open(tmpdir.path(), 0).await?;
        for idx in 0..5u32 {
            wal.append(Bytes::from(idx.to_string())).await?;
        }
        assert!(wal.segment_count() > 1, "expected multiple segments, got {}", wal.segment_count());
    }

    let wal = WalStore::open(tmpdir.path(), 60_000).await?;
    let records = wal.read_all().await?;
    let expected: Vec<Bytes> = (0..5u32).map(|idx| Bytes::from(idx.to_string())).collect();
    assert_eq!(records, expected);
    Ok(())
}

#[tokio::test]
async fn partial_tail_frame_is_discarded() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
    {
        let wal = WalStore::open(tmpdir.path(), 60_000).await?;
        for idx in 0..3u32 {
            wal.append(Bytes::from(format!("record-{}", idx))).await?;
        }
    }

    // Chop bytes off the tail, as a crash mid-append would.
    let segment = only_segment(tmpdir.path())?;
    let len = std::fs::metadata(&segment)?.len();
    let file = std::fs::OpenOptions::new().write(true).open(&segment)?;
    file.set_len(len - 3)?;

    let wal = WalStore::open(tmpdir.path(), 60_000).await?;
    let records = wal.read_all().await?;
    let expected: Vec<Bytes> = (0..2u32).map(|idx| Bytes::from(format!("record-{}", idx))).collect();
    assert_eq!(records, expected);
    Ok(())
}

#[tokio::test]
async fn corruption_outside_the_tail_is_fatal() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
    let (first_segment, _) = {
        let wal = WalStore::open(tmpdir.path(), 0).await?;
        let first = wal.append(Bytes::from_static(b"first")).await?;
        let second = wal.append(Bytes::from_static(b"second")).await?;
        assert_ne!(first.segment_seq, second.segment_seq, "expected two segments");
        (first, second)
    };

    // Flip a payload byte in the first (non-tail) segment.
    let segment = segment_with_seq(tmpdir.path(), first_segment.segment_seq)?;
    let mut data = std::fs::read(&segment)?;
    let last = data.len() - 1;
    data[last] ^= 0xFF;
    std::fs::write(&segment, data)?;

    let wal = WalStore::open(tmpdir.path(), 60_000).await?;
    let err = wal.read_all().await.expect_err("expected recovery to fail on corrupt segment");
    assert!(
        matches!(err.downcast_ref::<IngestError>(), Some(IngestError::RecoveryCorruption { .. })),
        "unexpected error: {:?}",
        err
    );
    Ok(())
}

#[tokio::test]
async fn clean_removes_rotated_out_segments() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
    let wal = WalStore::open(tmpdir.path(), 0).await?;
    for idx in 0..3u32 {
        wal.append(Bytes::from(idx.to_string())).await?;
    }
    assert_eq!(wal.segment_count(), 3);

    wal.clean(utils::now_millis() + 1_000, true).await?;
    // Only the segment still accepting appends survives.
    assert_eq!(wal.segment_count(), 1);
    assert_eq!(segment_paths(tmpdir.path())?.len(), 1);
    Ok(())
}

fn segment_paths(dir: &std::path::Path) -> Result<Vec<std::path::PathBuf>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|entry| entry.path())
        .collect();
    paths.sort();
    Ok(paths)
}

fn only_segment(dir: &std::path::Path) -> Result<std::path::PathBuf> {
    let paths = segment_paths(dir)?;
    anyhow::ensure!(paths.len() == 1, "expected exactly one segment, got {}", paths.len());
    Ok(paths[0].clone())
}

fn segment_with_seq(dir: &std::path::Path, seq: u64) -> Result<std::path::PathBuf> {
    let needle = format!("-{}.wal", seq);
    segment_paths(dir)?
        .into_iter()
        .find(|path| path.to_string_lossy().ends_with(&needle))
        .context("segment not found")
}
