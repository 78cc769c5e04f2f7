/// Incremental SSE frame decoder.
///
/// Network reads hand over arbitrary byte chunks; this buffers partial
/// frames across reads and yields the joined `data:` content of each
/// completed frame. Comment frames (heartbeats) and non-data fields are
/// dropped here, so callers only ever see payload text.
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed one chunk, returning the data of every frame it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((frame_len, delim_len)) = Self::frame_boundary(&self.buf) {
            let frame: Vec<u8> = self.buf.drain(..frame_len + delim_len).collect();
            let text = String::from_utf8_lossy(&frame[..frame_len]);
            if let Some(data) = Self::parse_frame(&text) {
                frames.push(data);
            }
        }
        frames
    }

    /// Position of the first frame delimiter: a blank line, in either LF
    /// or CRLF form. Returns (bytes before delimiter, delimiter length).
    fn frame_boundary(buf: &[u8]) -> Option<(usize, usize)> {
        for (i, window) in buf.windows(2).enumerate() {
            if window == b"\n\n" {
                return Some((i + 1, 1));
            }
            if window == b"\r\n"
                && buf.get(i + 2).copied() == Some(b'\r')
                && buf.get(i + 3).copied() == Some(b'\n')
            {
                return Some((i + 2, 2));
            }
        }
        None
    }

    fn parse_frame(frame: &str) -> Option<String> {
        let mut data_lines: Vec<&str> = Vec::new();
        for line in frame.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.starts_with(':') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
            }
            // event:/id:/retry: fields are irrelevant to this consumer.
        }
        if data_lines.is_empty() {
            None
        } else {
            Some(data_lines.join("\n"))
        }
    }
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}
