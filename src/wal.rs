//! Write-ahead log engine.
//!
//! An append-only log of checksummed, length-prefixed frames spread across
//! time-rotated segment files named `seg-{start_ms}-{seq}.wal`. Appends always
//! land in a segment opened by this process; segments found on disk at open
//! are only ever read (recovery) or deleted (cleanup). Recovery scans forward
//! and discards a partial frame at the tail of the final segment; a malformed
//! frame anywhere else aborts recovery.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;

use crate::error::{IngestError, ShutdownError, ShutdownResult, ERR_WAL_APPEND, ERR_WAL_READ};
use crate::models::WalRecordHandle;
use crate::utils;

/// Frame header size: u32 BE payload length followed by u32 BE checksum.
const FRAME_HEADER_SIZE: u64 = 8;
/// The file name prefix of WAL segments.
const SEGMENT_PREFIX: &str = "seg";
/// The file name extension of WAL segments.
const SEGMENT_EXT: &str = "wal";

/// An append-only durable record log with segment rotation.
pub struct WalStore {
    inner: Arc<Mutex<WalInner>>,
}

struct WalInner {
    dir: PathBuf,
    rotation_ms: i64,
    /// Segments no longer accepting appends, in log order.
    closed: Vec<SegmentMeta>,
    /// The segment currently accepting appends.
    current: Option<OpenSegment>,
    next_seq: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct SegmentMeta {
    start_ms: i64,
    seq: u64,
    path: PathBuf,
}

struct OpenSegment {
    meta: SegmentMeta,
    file: File,
    offset: u64,
}

impl WalStore {
    /// Open the log rooted at the given directory, scanning any segments left
    /// behind by a previous incarnation.
    pub async fn open(dir: impl Into<PathBuf>, rotation_ms: i64) -> Result<Arc<Self>> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .context("error creating dir for write-ahead log")?;
        let inner = Self::spawn_blocking(move || -> Result<WalInner> {
            let mut closed = vec![];
            for entry in fs::read_dir(&dir).context("error scanning write-ahead log dir")? {
                let path = entry.context("error scanning write-ahead log dir")?.path();
                if let Some(meta) = SegmentMeta::parse(&path) {
                    closed.push(meta);
                }
            }
            closed.sort_by_key(|meta| meta.seq);
            let next_seq = closed.last().map(|meta| meta.seq + 1).unwrap_or(0);
            Ok(WalInner {
                dir,
                rotation_ms,
                closed,
                current: None,
                next_seq,
            })
        })
        .await??;
        Ok(Arc::new(Self {
            inner: Arc::new(Mutex::new(inner)),
        }))
    }

    /// Append the given record payload, returning its durable locator.
    ///
    /// The frame is fsynced before the handle is returned.
    pub async fn append(&self, data: Bytes) -> Result<WalRecordHandle> {
        let inner = self.inner.clone();
        Self::spawn_blocking(move || -> Result<WalRecordHandle> {
            let mut inner = lock(&inner);
            let now = utils::now_millis();
            inner.rotate_if_needed(now)?;
            let segment = inner.current.as_mut().ok_or_else(|| anyhow!(ERR_WAL_APPEND))?;

            let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE as usize + data.len());
            frame.extend_from_slice(&utils::encode_u32(data.len() as u32));
            frame.extend_from_slice(&utils::encode_u32(checksum(&data)));
            frame.extend_from_slice(&data);
            segment.file.write_all(&frame).context(ERR_WAL_APPEND)?;
            segment.file.sync_data().context(ERR_WAL_APPEND)?;

            let handle = WalRecordHandle {
                segment_start_ms: segment.meta.start_ms,
                segment_seq: segment.meta.seq,
                offset: segment.offset,
                len: data.len() as u32,
            };
            segment.offset += frame.len() as u64;
            Ok(handle)
        })
        .await?
    }

    /// Read back the record payload at the given locator.
    pub async fn read(&self, handle: WalRecordHandle) -> Result<Bytes> {
        let inner = self.inner.clone();
        Self::spawn_blocking(move || -> Result<Bytes> {
            let path = {
                let inner = lock(&inner);
                inner
                    .segment_path(handle.segment_start_ms, handle.segment_seq)
                    .ok_or_else(|| anyhow!("wal segment {}-{} not found", handle.segment_start_ms, handle.segment_seq))?
            };
            let data = fs::read(&path).context(ERR_WAL_READ)?;
            let frame_start = handle.offset as usize;
            let payload_start = frame_start + FRAME_HEADER_SIZE as usize;
            let payload_end = payload_start + handle.len as usize;
            if data.len() < payload_end {
                anyhow::bail!("wal record at {}:{} extends past segment end", path.display(), handle.offset);
            }
            let len = utils::decode_u32(&data[frame_start..frame_start + 4])?;
            let crc = utils::decode_u32(&data[frame_start + 4..frame_start + 8])?;
            let payload = &data[payload_start..payload_end];
            if len != handle.len || crc != checksum(payload) {
                anyhow::bail!("wal record at {}:{} failed verification", path.display(), handle.offset);
            }
            Ok(Bytes::copy_from_slice(payload))
        })
        .await?
    }

    /// Scan every segment forward in log order, returning all record payloads.
    ///
    /// A truncated or corrupt frame at the tail of the final segment is
    /// discarded; anywhere else it is a fatal [`IngestError::RecoveryCorruption`].
    pub async fn read_all(&self) -> Result<Vec<Bytes>> {
        let inner = self.inner.clone();
        Self::spawn_blocking(move || -> Result<Vec<Bytes>> {
            let segments = {
                let inner = lock(&inner);
                let mut segments = inner.closed.clone();
                if let Some(current) = &inner.current {
                    segments.push(current.meta.clone());
                }
                segments
            };
            let mut records = vec![];
            let last_idx = match segments.len() {
                0 => return Ok(records),
                len => len - 1,
            };
            for (idx, meta) in segments.iter().enumerate() {
                if !scan_segment(meta, idx == last_idx, &mut records)? {
                    break;
                }
            }
            Ok(records)
        })
        .await?
    }

    /// Delete segments which rotated out before the given threshold.
    ///
    /// Best-effort: deletion failures are logged and skipped. When
    /// `wait_for_completion` is unset the deletion proceeds in the background.
    pub async fn clean(&self, threshold_ms: i64, wait_for_completion: bool) -> Result<()> {
        let inner = self.inner.clone();
        let task = tokio::task::spawn_blocking(move || clean_blocking(&inner, threshold_ms));
        if wait_for_completion {
            task.await.map_err(|err| anyhow!("error joining wal cleanup task: {}", err))?;
        } else {
            tokio::spawn(async move {
                if let Err(err) = task.await {
                    tracing::warn!(error = ?err, "error joining wal cleanup task");
                }
            });
        }
        Ok(())
    }

    /// The number of segments currently known to the log.
    pub fn segment_count(&self) -> usize {
        let inner = lock(&self.inner);
        inner.closed.len() + usize::from(inner.current.is_some())
    }

    /// Spawn a blocking log-related function, returning a ShutdownError if
    /// anything goes wrong related to spawning & joining.
    async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }
}

impl WalInner {
    fn rotate_if_needed(&mut self, now: i64) -> Result<()> {
        let needs_rotation = match &self.current {
            Some(segment) => now.saturating_sub(segment.meta.start_ms) >= self.rotation_ms,
            None => true,
        };
        if !needs_rotation {
            return Ok(());
        }
        if let Some(old) = self.current.take() {
            self.closed.push(old.meta);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let path = self.dir.join(format!("{}-{}-{}.{}", SEGMENT_PREFIX, now, seq, SEGMENT_EXT));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("error creating wal segment {}", path.display()))?;
        tracing::debug!(path = %path.display(), "rotated to new wal segment");
        self.current = Some(OpenSegment {
            meta: SegmentMeta { start_ms: now, seq, path },
            file,
            offset: 0,
        });
        Ok(())
    }

    fn segment_path(&self, start_ms: i64, seq: u64) -> Option<PathBuf> {
        if let Some(current) = &self.current {
            if current.meta.start_ms == start_ms && current.meta.seq == seq {
                return Some(current.meta.path.clone());
            }
        }
        self.closed
            .iter()
            .find(|meta| meta.start_ms == start_ms && meta.seq == seq)
            .map(|meta| meta.path.clone())
    }
}

impl SegmentMeta {
    /// Parse a segment file name of the form `seg-{start_ms}-{seq}.wal`.
    fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_suffix(&format!(".{}", SEGMENT_EXT))?;
        let mut parts = stem.strip_prefix(&format!("{}-", SEGMENT_PREFIX))?.splitn(2, '-');
        let start_ms = parts.next()?.parse().ok()?;
        let seq = parts.next()?.parse().ok()?;
        Some(Self {
            start_ms,
            seq,
            path: path.to_path_buf(),
        })
    }
}

/// Scan one segment's frames into `records`.
///
/// Returns `false` when a tail frame was discarded and scanning should stop.
fn scan_segment(meta: &SegmentMeta, is_last: bool, records: &mut Vec<Bytes>) -> Result<bool> {
    let data = fs::read(&meta.path).with_context(|| format!("error reading wal segment {}", meta.path.display()))?;
    let mut pos = 0usize;
    loop {
        if pos == data.len() {
            return Ok(true);
        }
        let corrupt_at = |pos: usize| IngestError::RecoveryCorruption {
            segment: meta.path.display().to_string(),
            offset: pos as u64,
        };
        let frame_ok = (|| -> Option<(usize, &[u8])> {
            let header = data.get(pos..pos + FRAME_HEADER_SIZE as usize)?;
            let len = utils::decode_u32(&header[..4]).ok()? as usize;
            let crc = utils::decode_u32(&header[4..]).ok()?;
            let payload = data.get(pos + FRAME_HEADER_SIZE as usize..pos + FRAME_HEADER_SIZE as usize + len)?;
            (checksum(payload) == crc).then_some((len, payload))
        })();
        match frame_ok {
            Some((len, payload)) => {
                records.push(Bytes::copy_from_slice(payload));
                pos += FRAME_HEADER_SIZE as usize + len;
            }
            None if is_last => {
                tracing::warn!(
                    segment = %meta.path.display(),
                    offset = pos,
                    "discarding partial frame at tail of write-ahead log"
                );
                return Ok(false);
            }
            None => return Err(corrupt_at(pos).into()),
        }
    }
}

fn clean_blocking(inner: &Arc<Mutex<WalInner>>, threshold_ms: i64) {
    let mut inner = lock(inner);
    let rotation_ms = inner.rotation_ms;
    let (old, keep): (Vec<_>, Vec<_>) = inner
        .closed
        .drain(..)
        .partition(|meta| meta.start_ms.saturating_add(rotation_ms) <= threshold_ms);
    inner.closed = keep;
    drop(inner);
    for meta in old {
        tracing::debug!(path = %meta.path.display(), "deleting old wal segment");
        if let Err(err) = fs::remove_file(&meta.path) {
            tracing::warn!(error = ?err, path = %meta.path.display(), "error deleting old wal segment");
        }
    }
}

fn lock(inner: &Arc<Mutex<WalInner>>) -> MutexGuard<'_, WalInner> {
    // The lock only guards metadata and file handles; poisoning leaves both usable.
    inner.lock().unwrap_or_else(|err| err.into_inner())
}

/// The first four bytes of the payload's blake3 hash as a u32 checksum.
fn checksum(data: &[u8]) -> u32 {
    let hash = blake3::hash(data);
    let bytes = hash.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
