//! Incremental reassembly of the vendor's SSE byte stream into frame payloads.
//!
//! The transport may split the stream anywhere, including inside a UTF-8
//! sequence or a JSON object, so bytes are buffered until a whole record is
//! available. Accepted grammar:
//!
//! ```text
//! stream := record*
//! record := line+ EOL            ; a record ends at the first blank line
//! line   := field EOL
//! EOL    := "\r\n" | "\n" | "\r"
//! ```
//!
//! A record's payload is the value of its `data:` lines (one leading space
//! removed), joined with `\n`. Records with no `data:` line, such as comments
//! or keep-alives, produce no payload.

use bytes::{Buf, BytesMut};

const DATA_FIELD: &[u8] = b"data:";

#[derive(Debug, Default)]
pub struct FrameReassembler {
    buffer: BytesMut,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a network chunk and return every payload it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((consumed, payload)) = next_record(&self.buffer) {
            self.buffer.advance(consumed);
            match payload {
                Some(payload) => frames.push(payload),
                None if consumed > 2 => tracing::debug!("Skipping SSE record without data"),
                None => {}
            }
        }
        frames
    }

    /// End of input. Returns whatever could not be framed, if anything, so the
    /// caller can classify it. `data:` prefixes are still removed when present.
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buffer.split();
        if rest.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        let mut data_lines = Vec::new();
        let mut pos = 0;
        while pos < rest.len() {
            let (end, next) = line_end(&rest, pos).unwrap_or((rest.len(), rest.len()));
            if let Some(value) = data_value(&rest[pos..end]) {
                data_lines.push(value);
            }
            pos = next;
        }

        if data_lines.is_empty() {
            Some(String::from_utf8_lossy(&rest).trim().to_string())
        } else {
            Some(join_lines(&data_lines))
        }
    }

    /// Bytes currently held waiting for the rest of a record.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Find the first complete record at the start of `buf`.
/// Returns the number of bytes it spans and its payload, or `None` if more
/// input is needed.
fn next_record(buf: &[u8]) -> Option<(usize, Option<String>)> {
    let mut data_lines = Vec::new();
    let mut pos = 0;

    loop {
        let (end, next) = line_end(buf, pos)?;
        if end == pos {
            // Blank line: either a stray separator or the end of the record.
            if pos == 0 {
                return Some((next, None));
            }
            let payload = (!data_lines.is_empty()).then(|| join_lines(&data_lines));
            return Some((next, payload));
        }
        if let Some(value) = data_value(&buf[pos..end]) {
            data_lines.push(value);
        }
        pos = next;
    }
}

/// Locate the end of the line starting at `from`: `(end of content, start of next line)`.
/// A trailing lone `\r` is ambiguous until the next byte arrives.
fn line_end(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let rel = buf[from..].iter().position(|&b| b == b'\n' || b == b'\r')?;
    let end = from + rel;
    if buf[end] == b'\n' {
        return Some((end, end + 1));
    }
    match buf.get(end + 1) {
        Some(b'\n') => Some((end, end + 2)),
        Some(_) => Some((end, end + 1)),
        None => None,
    }
}

fn data_value(line: &[u8]) -> Option<&[u8]> {
    let value = line.strip_prefix(DATA_FIELD)?;
    Some(value.strip_prefix(b" ").unwrap_or(value))
}

fn join_lines(lines: &[&[u8]]) -> String {
    let joined = lines.join(&b'\n');
    match String::from_utf8(joined) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}
