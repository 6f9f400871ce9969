pub mod mjpeg;

use detect_snap_common::frame::Frame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Single-slot mailbox holding the most recent camera frame.
///
/// The capture task writes with [`FrameSource::on_new_sample`]; readers pull
/// the latest value only when they need it. Older frames are overwritten and
/// never observed again.
pub struct FrameSource {
    slot: watch::Sender<Option<Frame>>,
    seq: AtomicU64,
}

/// Read-only handle onto a [`FrameSource`] slot.
#[derive(Clone)]
pub struct LatestFrame {
    slot: watch::Receiver<Option<Frame>>,
}

impl FrameSource {
    pub fn new() -> Arc<Self> {
        let (slot, _) = watch::channel(None);
        Arc::new(Self {
            slot,
            seq: AtomicU64::new(0),
        })
    }

    /// Publish a frame as the latest, replacing whatever was there.
    pub fn on_new_sample(&self, frame: Frame) {
        // send_replace stores the value even when no receiver is alive.
        self.slot.send_replace(Some(frame));
    }

    /// Next sequence number for frames produced by a capture driver.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    #[allow(dead_code)]
    pub fn latest(&self) -> Option<Frame> {
        self.slot.borrow().clone()
    }

    pub fn reader(&self) -> LatestFrame {
        LatestFrame {
            slot: self.slot.subscribe(),
        }
    }
}

impl LatestFrame {
    pub fn latest(&self) -> Option<Frame> {
        self.slot.borrow().clone()
    }
}
