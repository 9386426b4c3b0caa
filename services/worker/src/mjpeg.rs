//! Extraction of JPEG images from a multipart MJPEG byte stream.
//!
//! Cameras frame each image with multipart boundaries and headers, but the
//! images themselves are delimited by the JPEG start (`FF D8`) and end
//! (`FF D9`) markers, so the parser scans for those and ignores everything
//! in between images. Start/end pairs nested inside an image, such as an
//! EXIF thumbnail, belong to the enclosing image.

use bytes::{Buf, Bytes, BytesMut};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Outcome of asking the parser for the next image.
#[derive(Debug, PartialEq)]
pub enum ParsedFrame {
    /// A complete JPEG image
    Complete(Bytes),
    /// A partial image outgrew the size limit and was dropped
    Oversized(usize),
}

/// Incremental JPEG splitter for MJPEG streams.
#[derive(Debug)]
pub struct MjpegParser {
    buffer: BytesMut,
    max_frame_bytes: usize,
}

impl MjpegParser {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_bytes,
        }
    }

    /// Append a chunk read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes currently held while waiting for more data.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete image out of the buffer, if there is one.
    pub fn next_frame(&mut self) -> Option<ParsedFrame> {
        let Some(start) = find(&self.buffer, &SOI, 0) else {
            // Keep a trailing 0xFF, it may be the first half of a start marker.
            let keep = usize::from(self.buffer.last() == Some(&0xFF));
            let drop = self.buffer.len() - keep;
            self.buffer.advance(drop);
            return None;
        };
        self.buffer.advance(start);

        match find_image_end(&self.buffer) {
            Some(end) => {
                let image = self.buffer.split_to(end + EOI.len()).freeze();
                Some(ParsedFrame::Complete(image))
            }
            None if self.buffer.len() > self.max_frame_bytes => {
                let dropped = self.buffer.len();
                self.buffer.clear();
                Some(ParsedFrame::Oversized(dropped))
            }
            None => None,
        }
    }
}

/// Offset of the end marker closing the image that starts at offset 0.
fn find_image_end(data: &[u8]) -> Option<usize> {
    let mut depth = 1usize;
    let mut i = SOI.len();

    while i + 1 < data.len() {
        match [data[i], data[i + 1]] {
            SOI => {
                depth += 1;
                i += 2;
            }
            EOI => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
                i += 2;
            }
            _ => i += 1,
        }
    }

    None
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|window| window == needle)
        .map(|pos| pos + from)
}
