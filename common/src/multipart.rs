//! MJPEG `multipart/x-mixed-replace` wire format.
//!
//! Each part on the wire looks like:
//!
//! ```text
//! \r\n--123456789000000000000987654321\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: <len>\r\n
//! \r\n
//! <len bytes of JPEG>
//! ```

pub const PART_BOUNDARY: &str = "123456789000000000000987654321";

pub const STREAM_CONTENT_TYPE: &str =
    "multipart/x-mixed-replace;boundary=123456789000000000000987654321";

const BOUNDARY_MARKER: &[u8] = b"--123456789000000000000987654321\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Separator sent before every part.
pub fn boundary_line() -> &'static [u8] {
    b"\r\n--123456789000000000000987654321\r\n"
}

/// Per-part header announcing one JPEG of `len` bytes.
pub fn part_header(len: usize) -> String {
    format!("Content-Type: image/jpeg\r\nContent-Length: {len}\r\n\r\n")
}

/// Parse state for the multipart stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the boundary marker.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental parser that turns arbitrary network chunks into JPEG frames.
#[derive(Debug)]
pub struct MultipartParser {
    buffer: Vec<u8>,
    state: ParseState,
    jpeg_start: usize,
}

impl Default for MultipartParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartParser {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(64 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
        }
    }

    /// Feed one chunk; returns every frame completed by it.
    ///
    /// A frame is complete once the following boundary has arrived, so the
    /// last frame of a stream is only emitted when the next part starts.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY_MARKER) {
                        self.buffer.drain(..pos + BOUNDARY_MARKER.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep last few bytes in case boundary spans chunks
                        if self.buffer.len() > BOUNDARY_MARKER.len() {
                            let cut = self.buffer.len() - BOUNDARY_MARKER.len();
                            self.buffer.drain(..cut);
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        self.buffer.drain(..pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) =
                        find_subsequence(&self.buffer[self.jpeg_start..], BOUNDARY_MARKER)
                    else {
                        // Avoid re-scanning old data on the next chunk
                        self.jpeg_start = self.buffer.len().saturating_sub(BOUNDARY_MARKER.len());
                        break;
                    };
                    let jpeg_end = self.jpeg_start + pos;
                    // Strip the \r\n that precedes every boundary
                    let end = if self.buffer[..jpeg_end].ends_with(b"\r\n") {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };
                    let jpeg: Vec<u8> = self.buffer[..end].to_vec();
                    self.buffer.drain(..jpeg_end + BOUNDARY_MARKER.len());
                    if !jpeg.is_empty() {
                        frames.push(jpeg);
                    }
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        frames
    }

    /// Bytes held back waiting for more input.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
