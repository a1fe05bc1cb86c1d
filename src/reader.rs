use crate::frame::CapturedFrame;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Shared single-slot buffer holding the most recently delivered frame.
///
/// Delivery overwrites, acquisition takes: frames arriving between two
/// acquisitions are silently dropped, and acquiring from a drained slot
/// returns `None`. This is the only coordination between the capture
/// backend and handler invocations.
#[derive(Clone, Default)]
pub struct LatestFrame(Arc<Mutex<Option<CapturedFrame>>>);

impl LatestFrame {
    /// Take the most recent frame, leaving the slot empty.
    pub fn take(&self) -> Option<CapturedFrame> {
        match self.0.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn replace(&self, frame: CapturedFrame) {
        match self.0.lock() {
            Ok(mut slot) => *slot = Some(frame),
            Err(poisoned) => *poisoned.into_inner() = Some(frame),
        }
    }
}

/// Producer half handed to the capture backend (or a test harness).
#[derive(Clone)]
pub struct FrameSender {
    latest: LatestFrame,
    notify: mpsc::UnboundedSender<()>,
}

impl FrameSender {
    /// Overwrite the latest-frame slot and emit one arrival notification.
    pub fn deliver(&self, frame: CapturedFrame) {
        self.latest.replace(frame);
        if self.notify.send(()).is_err() {
            debug!("frame delivered after reader was dropped");
        }
    }
}

/// Start/stop control over the underlying device stream.
pub trait StreamControl: Send {
    fn start(&mut self) -> Result<(), ReaderError>;
    fn stop(&mut self) -> Result<(), ReaderError>;
}

/// A negotiated frame stream: arrival notifications plus the
/// latest-frame accessor, with start/stop over the backing device.
pub struct FrameReader {
    latest: LatestFrame,
    arrivals: mpsc::UnboundedReceiver<()>,
    control: Option<Box<dyn StreamControl>>,
}

impl FrameReader {
    /// Reader with no backing device; start/stop are no-ops until a
    /// `StreamControl` is attached. Frames come from whoever holds the
    /// returned `FrameSender`.
    pub fn detached() -> (Self, FrameSender) {
        let latest = LatestFrame::default();
        let (notify, arrivals) = mpsc::unbounded_channel();
        let sender = FrameSender {
            latest: latest.clone(),
            notify,
        };
        let reader = Self {
            latest,
            arrivals,
            control: None,
        };
        (reader, sender)
    }

    /// Attach start/stop control over the backing device stream. The
    /// builder constructs the backend with the sender half, then hands
    /// control over here.
    pub fn set_control(&mut self, control: Box<dyn StreamControl>) {
        self.control = Some(control);
    }

    /// Cloneable handle to the latest-frame slot, for handler tasks.
    pub fn latest(&self) -> LatestFrame {
        self.latest.clone()
    }

    /// Wait for the next frame-arrived notification. Returns `None` once
    /// every `FrameSender` has been dropped.
    pub async fn frame_arrived(&mut self) -> Option<()> {
        self.arrivals.recv().await
    }

    pub fn start(&mut self) -> Result<(), ReaderError> {
        match self.control.as_mut() {
            Some(control) => control.start(),
            None => Ok(()),
        }
    }

    pub fn stop(&mut self) -> Result<(), ReaderError> {
        match self.control.as_mut() {
            Some(control) => control.stop(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("failed to start capture stream: {0}")]
    Start(String),
    #[error("failed to stop capture stream: {0}")]
    Stop(String),
}
