//! Bounded outbound frame buffer and the drain-side drop policy.
//!
//! The producer never blocks: when the queue is full the oldest unsent frame
//! is evicted so the newest one is always kept. The drain task asks
//! [`DropPolicy`] before sending each frame and sheds load while the queue is
//! backed up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use kc_protocol::FrameFormat;

/// Frames above this size without a recognizable header are assumed to be JPEG.
const JPEG_SIZE_THRESHOLD: usize = 50_000;

const START_CODE_4: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
const START_CODE_3: [u8; 3] = [0x00, 0x00, 0x01];
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;

#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub bytes: Vec<u8>,
    pub enqueued_at: Instant,
    pub format: FrameFormat,
    /// Only known for H.264.
    pub is_keyframe: Option<bool>,
}

impl QueuedFrame {
    pub fn new(bytes: Vec<u8>) -> Self {
        let format = detect_format(&bytes);
        let is_keyframe = match format {
            FrameFormat::H264 => Some(is_keyframe(&bytes)),
            FrameFormat::Jpeg => None,
        };
        Self {
            bytes,
            enqueued_at: Instant::now(),
            format,
            is_keyframe,
        }
    }
}

/// Best-effort format detection: magic bytes first, size heuristic otherwise.
pub fn detect_format(bytes: &[u8]) -> FrameFormat {
    if bytes.starts_with(&JPEG_SOI) {
        FrameFormat::Jpeg
    } else if bytes.starts_with(&START_CODE_4) || bytes.starts_with(&START_CODE_3) {
        FrameFormat::H264
    } else if bytes.len() > JPEG_SIZE_THRESHOLD {
        FrameFormat::Jpeg
    } else {
        FrameFormat::H264
    }
}

/// An Annex-B access unit starting with an IDR slice or SPS.
pub fn is_keyframe(bytes: &[u8]) -> bool {
    match bytes {
        [0x00, 0x00, 0x00, 0x01, header, ..] => matches!(header & 0x1F, NAL_IDR | NAL_SPS),
        _ => false,
    }
}

pub struct FrameBackpressureQueue {
    capacity: usize,
    frames: Mutex<VecDeque<QueuedFrame>>,
    available: Notify,
    evicted: AtomicU64,
}

impl FrameBackpressureQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Notify::new(),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Total frames evicted by overflow since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Enqueue without blocking. Returns the evicted frame, if the queue was full.
    pub fn push(&self, frame: QueuedFrame) -> Option<QueuedFrame> {
        let evicted = {
            let mut frames = self.lock();
            let evicted = if frames.len() >= self.capacity {
                frames.pop_front()
            } else {
                None
            };
            frames.push_back(frame);
            evicted
        };

        if evicted.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Frame queue full, evicted oldest frame");
        }
        self.available.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<QueuedFrame> {
        self.lock().pop_front()
    }

    /// Wait for the next frame. Intended for a single drain task.
    pub async fn pop(&self) -> QueuedFrame {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            self.available.notified().await;
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedFrame>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Decides, per frame, whether the drain task sends or sheds it.
#[derive(Debug, Clone)]
pub struct DropPolicy {
    capacity: usize,
    max_consecutive_drops: u32,
    consecutive_drops: u32,
    max_age: Option<Duration>,
}

impl DropPolicy {
    pub fn new(capacity: usize, max_consecutive_drops: u32) -> Self {
        Self {
            capacity: capacity.max(1),
            max_consecutive_drops,
            consecutive_drops: 0,
            max_age: None,
        }
    }

    /// Shed frames that waited longer than `max_age`. Zero disables the check.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = (!max_age.is_zero()).then_some(max_age);
        self
    }

    /// True when the frame outlived `max_age`; counted as a drop.
    pub fn drop_if_stale(&mut self, frame: &QueuedFrame) -> bool {
        let stale = self
            .max_age
            .is_some_and(|max| frame.enqueued_at.elapsed() > max);
        if stale {
            self.consecutive_drops += 1;
        }
        stale
    }

    /// `depth` is the number of frames still queued behind this one.
    pub fn should_drop(&mut self, depth: usize, unhealthy: bool) -> bool {
        let backed_up = depth * 2 > self.capacity;
        let starving = self.consecutive_drops > self.max_consecutive_drops;
        let drop = unhealthy || (backed_up && !starving);

        if drop {
            self.consecutive_drops += 1;
        } else {
            self.consecutive_drops = 0;
        }
        drop
    }

    /// A failed send counts as a drop.
    pub fn record_send_failure(&mut self) {
        self.consecutive_drops += 1;
    }

    pub fn consecutive_drops(&self) -> u32 {
        self.consecutive_drops
    }
}
