//! Streaming MIME detection for program stdout
//!
//! The detector buffers the head of the stdout stream until it has seen
//! [`DETECTION_WINDOW`] bytes or the stream ends, then classifies the
//! accumulated bytes exactly once. Stderr never participates in detection.

/// Number of leading stdout bytes inspected before a type is emitted.
pub const DETECTION_WINDOW: usize = 512;

/// Accumulates the head of an output stream and classifies it once.
///
/// `observe` returns the detected type on the call that completes the
/// detection window; `finish` classifies whatever was buffered when the
/// stream ends early. After either has produced a type, both return `None`.
#[derive(Debug, Default)]
pub struct OutputDetector {
    window: Vec<u8>,
    emitted: bool,
}

impl OutputDetector {
    /// Create a detector with an empty window
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of stdout; returns the MIME type when the detection
    /// window fills on this chunk.
    pub fn observe(&mut self, chunk: &[u8]) -> Option<String> {
        if self.emitted {
            return None;
        }

        let room = DETECTION_WINDOW - self.window.len();
        let take = room.min(chunk.len());
        self.window.extend_from_slice(&chunk[..take]);

        if self.window.len() >= DETECTION_WINDOW {
            self.emitted = true;
            return Some(detect(&self.window));
        }
        None
    }

    /// Classify the buffered bytes at end of stream, if not yet emitted.
    ///
    /// Returns `None` when a type was already emitted or no bytes were seen.
    pub fn finish(&mut self) -> Option<String> {
        if self.emitted || self.window.is_empty() {
            return None;
        }
        self.emitted = true;
        Some(detect(&self.window))
    }
}

/// Well-known magic numbers checked before text sniffing.
const MAGIC: &[(&[u8], &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"%PDF-", "application/pdf"),
    (b"\x1f\x8b", "application/gzip"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x7fELF", "application/x-executable"),
];

fn detect(data: &[u8]) -> String {
    for (magic, mime) in MAGIC {
        if data.starts_with(magic) {
            return (*mime).to_string();
        }
    }

    if data.starts_with(&[0xff, 0xfe]) {
        return "text/plain; charset=utf-16le".to_string();
    }
    if data.starts_with(&[0xfe, 0xff]) {
        return "text/plain; charset=utf-16be".to_string();
    }

    if is_text(data) {
        return "text/plain; charset=utf-8".to_string();
    }

    "application/octet-stream".to_string()
}

// The window may cut a UTF-8 sequence short; tolerate an incomplete tail.
fn is_text(data: &[u8]) -> bool {
    if data.contains(&0) {
        return false;
    }
    match std::str::from_utf8(data) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none() && e.valid_up_to() + 3 >= data.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_shell_output_as_plain_text() {
        let mut detector = OutputDetector::new();
        assert_eq!(detector.observe(b"test\n"), None);
        assert_eq!(
            detector.finish(),
            Some("text/plain; charset=utf-8".to_string())
        );
    }

    #[test]
    fn emits_once_when_window_fills() {
        let mut detector = OutputDetector::new();
        let chunk = vec![b'a'; DETECTION_WINDOW];
        assert_eq!(
            detector.observe(&chunk),
            Some("text/plain; charset=utf-8".to_string())
        );
        // No re-emission, not even at end of stream.
        assert_eq!(detector.observe(b"more"), None);
        assert_eq!(detector.finish(), None);
    }

    #[test]
    fn window_fills_across_chunks() {
        let mut detector = OutputDetector::new();
        assert_eq!(detector.observe(&vec![b'x'; DETECTION_WINDOW - 1]), None);
        assert!(detector.observe(b"yz").is_some());
    }

    #[test]
    fn detects_png_magic() {
        let mut detector = OutputDetector::new();
        detector.observe(b"\x89PNG\r\n\x1a\n....");
        assert_eq!(detector.finish(), Some("image/png".to_string()));
    }

    #[test]
    fn binary_data_falls_back_to_octet_stream() {
        let mut detector = OutputDetector::new();
        detector.observe(&[0x00, 0x01, 0x02, 0xfe]);
        assert_eq!(
            detector.finish(),
            Some("application/octet-stream".to_string())
        );
    }

    #[test]
    fn truncated_utf8_tail_is_still_text() {
        // "é" is two bytes; cut it in half at the window edge.
        let mut data = vec![b'a'; DETECTION_WINDOW - 1];
        data.push(0xc3);
        let mut detector = OutputDetector::new();
        assert_eq!(
            detector.observe(&data),
            Some("text/plain; charset=utf-8".to_string())
        );
    }

    #[test]
    fn empty_stream_yields_nothing() {
        let mut detector = OutputDetector::new();
        assert_eq!(detector.finish(), None);
    }
}
