use crate::frame::{FrameError, VideoFrame};
use crate::reader::{FrameReader, LatestFrame};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// `HHh_MMm_SSs_mmmms.jpg` from a UTC timestamp. Millisecond granularity
/// and no date component, so runs crossing midnight can overwrite files
/// from the previous day.
pub fn snapshot_file_name(ts: DateTime<Utc>) -> String {
    ts.format("%Hh_%Mm_%Ss_%3fms.jpg").to_string()
}

/// Convert a frame to RGB and encode it as JPEG into an in-memory buffer.
/// A failed encode leaves nothing behind the buffer's scope.
pub fn encode_jpeg(frame: &VideoFrame) -> Result<Vec<u8>, SnapshotError> {
    let rgb = frame.to_rgb()?;
    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new(&mut jpeg);
    encoder.encode_image(&rgb).map_err(SnapshotError::Encode)?;
    Ok(jpeg)
}

/// One handler invocation: take the latest frame, encode it, write it.
///
/// The timestamp is captured before anything else — invocations may
/// overlap, and deferring it would let two of them compute the same
/// truncated timestamp and collide on the output name. `Ok(None)` means
/// the invocation was a no-op (nothing pending, or a non-video sample).
pub async fn write_snapshot(
    latest: &LatestFrame,
    dir: &Path,
) -> Result<Option<PathBuf>, SnapshotError> {
    let now = Utc::now();

    let frame = match latest.take() {
        Some(frame) => frame,
        None => return Ok(None),
    };
    let frame = match frame.into_video() {
        Some(frame) => frame,
        None => return Ok(None),
    };

    let jpeg = encode_jpeg(&frame)?;
    let path = dir.join(snapshot_file_name(now));
    tokio::fs::write(&path, &jpeg)
        .await
        .map_err(|e| SnapshotError::Write {
            path: path.display().to_string(),
            source: e,
        })?;
    Ok(Some(path))
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("JPEG encode failed: {0}")]
    Encode(image::ImageError),
    #[error("failed to write snapshot {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

/// Outcome tallies for one capture window.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub written: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            written: self.written.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Run the reader for a bounded wall-clock window.
///
/// Each arrival notification spawns one handler task, so invocations can
/// overlap just like the backend's own delivery would. When the window
/// elapses the reader is stopped explicitly and in-flight handlers are
/// drained before the stats are returned.
pub async fn run_capture(mut reader: FrameReader, dir: &Path, window: Duration) -> CaptureStats {
    if let Err(e) = reader.start() {
        warn!(error = %e, "failed to start frame reader");
        return CaptureStats::default();
    }
    info!(
        dir = %dir.display(),
        window_secs = window.as_secs_f64(),
        "capture running"
    );

    let counters = Arc::new(Counters::default());
    let mut handlers = Vec::new();
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            arrived = reader.frame_arrived() => match arrived {
                Some(()) => handlers.push(spawn_handler(&reader, dir, &counters)),
                // Every sender is gone; no further frame can arrive.
                None => break,
            },
        }
    }

    if let Err(e) = reader.stop() {
        warn!(error = %e, "failed to stop frame reader");
    }
    for handler in handlers {
        record_handler_exit(handler.await, &counters);
    }

    let stats = counters.snapshot();
    info!(
        written = stats.written,
        skipped = stats.skipped,
        failed = stats.failed,
        "capture window closed"
    );
    stats
}

/// A handler that panicked still counts as a failed invocation; it must
/// not vanish from the tallies just because the task died.
fn record_handler_exit(exit: Result<(), tokio::task::JoinError>, counters: &Counters) {
    if let Err(e) = exit {
        if e.is_panic() {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "snapshot handler panicked");
        }
    }
}

fn spawn_handler(reader: &FrameReader, dir: &Path, counters: &Arc<Counters>) -> JoinHandle<()> {
    let latest = reader.latest();
    let dir = dir.to_path_buf();
    let counters = Arc::clone(counters);
    tokio::spawn(async move {
        match write_snapshot(&latest, &dir).await {
            Ok(Some(path)) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
                debug!(path = %path.display(), "snapshot written");
            }
            Ok(None) => {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                debug!("no video frame pending, skipping");
            }
            Err(e) => {
                // One bad frame must not affect any other in-flight or
                // future frame; the failure stops here.
                counters.failed.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "snapshot abandoned");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CapturedFrame, PixelFormat};
    use chrono::TimeZone;

    fn gray_nv12(width: u32, height: u32) -> VideoFrame {
        let y_plane = (width * height) as usize;
        let mut data = vec![90u8; y_plane];
        data.extend(vec![128u8; y_plane / 2]);
        VideoFrame {
            format: PixelFormat::Nv12,
            width,
            height,
            data,
        }
    }

    #[test]
    fn file_name_is_zero_padded() {
        let ts = Utc.with_ymd_and_hms(2026, 8, 26, 9, 5, 3).unwrap()
            + chrono::Duration::milliseconds(7);
        assert_eq!(snapshot_file_name(ts), "09h_05m_03s_007ms.jpg");
    }

    #[test]
    fn file_names_differ_per_millisecond() {
        let base = Utc.with_ymd_and_hms(2026, 8, 26, 23, 59, 59).unwrap();
        let a = snapshot_file_name(base + chrono::Duration::milliseconds(1));
        let b = snapshot_file_name(base + chrono::Duration::milliseconds(2));
        assert_ne!(a, b);
        // Same millisecond is deterministic
        assert_eq!(a, snapshot_file_name(base + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn encoded_jpeg_is_structurally_valid() {
        let jpeg = encode_jpeg(&gray_nv12(16, 16)).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8], "missing SOI marker");
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9], "missing EOI marker");
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }

    #[test]
    fn encode_rejects_truncated_buffer() {
        let mut frame = gray_nv12(16, 16);
        frame.data.truncate(8);
        assert!(encode_jpeg(&frame).is_err());
    }

    #[tokio::test]
    async fn panicked_handler_counts_as_failed() {
        let counters = Counters::default();

        let handler: JoinHandle<()> = tokio::spawn(async { panic!("handler blew up") });
        record_handler_exit(handler.await, &counters);
        assert_eq!(counters.snapshot().failed, 1);

        // Clean exits leave the tallies alone
        let handler: JoinHandle<()> = tokio::spawn(async {});
        record_handler_exit(handler.await, &counters);
        assert_eq!(counters.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn empty_slot_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let latest = LatestFrame::default();
        let result = write_snapshot(&latest, dir.path()).await.unwrap();
        assert!(result.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn non_video_frame_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (reader, sender) = FrameReader::detached();
        sender.deliver(CapturedFrame::NonVideo);
        let result = write_snapshot(&reader.latest(), dir.path()).await.unwrap();
        assert!(result.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failed_encode_leaves_no_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let (reader, sender) = FrameReader::detached();
        let mut frame = gray_nv12(16, 16);
        frame.data.truncate(8);
        sender.deliver(CapturedFrame::Video(frame));

        let result = write_snapshot(&reader.latest(), dir.path()).await;
        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn successful_invocation_writes_one_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let (reader, sender) = FrameReader::detached();
        sender.deliver(CapturedFrame::Video(gray_nv12(16, 16)));

        let path = write_snapshot(&reader.latest(), dir.path())
            .await
            .unwrap()
            .unwrap();
        assert!(path.to_string_lossy().ends_with("ms.jpg"));
        let bytes = std::fs::read(&path).unwrap();
        assert!(image::load_from_memory(&bytes).is_ok());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn missing_output_directory_is_a_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("never_created");
        let (reader, sender) = FrameReader::detached();
        sender.deliver(CapturedFrame::Video(gray_nv12(16, 16)));

        let result = write_snapshot(&reader.latest(), &missing).await;
        assert!(matches!(result, Err(SnapshotError::Write { .. })));
    }
}
