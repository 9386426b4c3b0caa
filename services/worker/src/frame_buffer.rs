//! Captured frames and the bounded recent-frame window.

use crate::metadata::FrameMetadata;
use bytes::Bytes;
use image::DynamicImage;
use std::collections::VecDeque;
use thiserror::Error;

/// Errors raised by the frame buffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("Frame buffer capacity must be at least 1")]
    ZeroCapacity,

    #[error("Frame index {index} out of range, {len} frames available")]
    OutOfRange { index: usize, len: usize },
}

/// An encoded frame fetched from a camera.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Encoded image (JPEG for every supported camera)
    pub data: Bytes,

    /// Size reported by the transport, in bytes
    pub size: usize,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,
}

impl Frame {
    pub fn new(data: Bytes, width: u32, height: u32) -> Self {
        Self {
            size: data.len(),
            data,
            width,
            height,
        }
    }

    /// Decode the payload into pixels.
    pub fn decode(&self) -> Result<DynamicImage, image::ImageError> {
        image::load_from_memory(&self.data)
    }
}

/// A frame paired with its metadata. Immutable once pushed.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    frame: Frame,
    metadata: FrameMetadata,
}

impl FrameRecord {
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }
}

/// Most-recent-first window of captured frames.
///
/// Index 0 is always the newest record; pushing past capacity evicts the
/// oldest one.
#[derive(Debug)]
pub struct FrameBuffer {
    records: VecDeque<FrameRecord>,
    capacity: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }

        Ok(Self {
            records: VecDeque::with_capacity(capacity + 1),
            capacity,
        })
    }

    /// Insert a frame at the front, evicting the tail when over capacity.
    pub fn push(&mut self, frame: Frame, metadata: FrameMetadata) {
        self.records.push_front(FrameRecord { frame, metadata });
        if self.records.len() > self.capacity {
            self.records.pop_back();
        }
    }

    /// The `index`-th most recent record (0 = newest).
    pub fn get(&self, index: usize) -> Result<&FrameRecord, BufferError> {
        self.records.get(index).ok_or(BufferError::OutOfRange {
            index,
            len: self.records.len(),
        })
    }

    pub fn frame(&self, index: usize) -> Result<&Frame, BufferError> {
        self.get(index).map(FrameRecord::frame)
    }

    pub fn metadata(&self, index: usize) -> Result<&FrameMetadata, BufferError> {
        self.get(index).map(FrameRecord::metadata)
    }

    /// Records from newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &FrameRecord> {
        self.records.iter()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
