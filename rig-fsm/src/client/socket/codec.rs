//! Reply framing and binary payloads for the text protocol
//!
//! Replies are newline-terminated text lines, except that a `MATRIX <rows> <cols>`
//! header announces a binary block of `rows * cols` little-endian doubles in
//! column-major order. The server only sends the block after the client
//! answers `READY`, but it may arrive in the same read as the header or split
//! across many reads, so framing is done here and not by the caller.

use byteorder::{ByteOrder, LittleEndian};

/// Largest binary block a `MATRIX` header may announce
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// One framed reply from the server
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Line(String),
    MatrixHeader { rows: usize, cols: usize },
    Payload(Vec<f64>),
}

/// Incremental reply framer fed by the reader thread
#[derive(Debug, Default)]
pub struct ReplyParser {
    buf: Vec<u8>,
    /// Bytes still expected for an announced matrix block
    payload_len: Option<usize>,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes and return every reply completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Reply> {
        self.buf.extend_from_slice(bytes);
        let mut replies = Vec::new();
        loop {
            if let Some(len) = self.payload_len {
                if self.buf.len() < len {
                    break;
                }
                let block: Vec<u8> = self.buf.drain(..len).collect();
                replies.push(Reply::Payload(unpack_f64(&block)));
                self.payload_len = None;
                continue;
            }

            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                break;
            };
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos]).trim_end_matches('\r').to_string();
            if line.is_empty() {
                continue;
            }
            match parse_matrix_header(&line) {
                Some((rows, cols)) => match payload_bytes(rows, cols) {
                    Some(len) => {
                        self.payload_len = Some(len);
                        replies.push(Reply::MatrixHeader { rows, cols });
                    }
                    None => {
                        log::warn!("Ignoring oversized matrix header '{}'", line);
                        replies.push(Reply::Line(format!("ERROR matrix header too large: {}", line)));
                    }
                },
                None => replies.push(Reply::Line(line)),
            }
        }
        replies
    }
}

/// Byte length of a `rows x cols` block, if it is representable and within bounds
fn payload_bytes(rows: usize, cols: usize) -> Option<usize> {
    rows.checked_mul(cols)?.checked_mul(8).filter(|&len| len <= MAX_PAYLOAD_BYTES)
}

fn parse_matrix_header(line: &str) -> Option<(usize, usize)> {
    let mut fields = line.split_whitespace();
    if fields.next() != Some("MATRIX") {
        return None;
    }
    let rows = fields.next()?.parse().ok()?;
    let cols = fields.next()?.parse().ok()?;
    Some((rows, cols))
}

/// Encode doubles as little-endian bytes
pub fn pack_f64(values: &[f64]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len() * 8];
    LittleEndian::write_f64_into(values, &mut bytes);
    bytes
}

/// Decode little-endian doubles (a trailing partial value is ignored)
pub fn unpack_f64(bytes: &[u8]) -> Vec<f64> {
    let mut values = vec![0.0; bytes.len() / 8];
    LittleEndian::read_f64_into(&bytes[..values.len() * 8], &mut values);
    values
}

/// Percent-encode everything except RFC 3986 unreserved characters
pub fn percent_encode(text: &str) -> String {
    let mut encoded = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}
