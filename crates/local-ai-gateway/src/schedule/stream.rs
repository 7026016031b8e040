//! Stream framing: detecting how an upstream streams, splitting its byte
//! stream into chunks, and unwrapping/wrapping one chunk's transport framing.

use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use bytes::{Buf, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    NonStream,
    EventStream,
    NdJson,
}

/// Framing detected from one set of response headers, plus those headers.
#[derive(Debug, Clone)]
pub struct StreamMode {
    pub framing: Framing,
    pub headers: HeaderMap,
}

impl StreamMode {
    pub fn detect(headers: &HeaderMap) -> Self {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default();
        let framing = if content_type.contains("text/event-stream") {
            Framing::EventStream
        } else if content_type.contains("application/x-ndjson") {
            Framing::NdJson
        } else {
            Framing::NonStream
        };
        Self {
            framing,
            headers: headers.clone(),
        }
    }

    pub fn is_stream(&self) -> bool {
        self.framing != Framing::NonStream
    }

    /// Strips surrounding whitespace and an optional `data:` prefix.
    pub fn unwrap_chunk(&self, chunk: &[u8]) -> Bytes {
        let trimmed = chunk.trim_ascii();
        let payload = trimmed.strip_prefix(b"data:").unwrap_or(trimmed);
        Bytes::copy_from_slice(payload.trim_ascii())
    }

    pub fn wrap_chunk(&self, payload: &[u8]) -> Bytes {
        match self.framing {
            Framing::EventStream => {
                let mut out = Vec::with_capacity(payload.len() + 8);
                out.extend_from_slice(b"data: ");
                out.extend_from_slice(payload);
                out.extend_from_slice(b"\n\n");
                Bytes::from(out)
            }
            Framing::NdJson => {
                let mut out = Vec::with_capacity(payload.len() + 1);
                out.extend_from_slice(payload);
                out.push(b'\n');
                Bytes::from(out)
            }
            Framing::NonStream => Bytes::copy_from_slice(payload),
        }
    }

    pub fn decoder(&self) -> ChunkDecoder {
        ChunkDecoder::new(self.framing)
    }
}

/// Incremental splitter over an upstream byte stream.
///
/// Each yielded chunk is one framed unit exactly as received (an SSE event
/// including its terminator, or one NDJSON line including `\n`), so a
/// same-dialect relay can pass it through untouched.
#[derive(Debug)]
pub struct ChunkDecoder {
    framing: Framing,
    buf: BytesMut,
}

impl ChunkDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buf: BytesMut::new(),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete chunk, skipping blank separators.
    pub fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            let end = match self.framing {
                Framing::EventStream => find_event_end(&self.buf)?,
                Framing::NdJson => self.buf.iter().position(|b| *b == b'\n')? + 1,
                Framing::NonStream => return None,
            };
            let chunk = self.buf.split_to(end).freeze();
            if !chunk.trim_ascii().is_empty() {
                return Some(chunk);
            }
        }
    }

    /// Whatever is left without a terminator once the upstream ends.
    pub fn finish(&mut self) -> Bytes {
        let rest = self.buf.split().freeze();
        if self.framing == Framing::NonStream {
            return rest;
        }
        let mut rest = rest;
        while rest.first().map(|b| b.is_ascii_whitespace()).unwrap_or(false) {
            rest.advance(1);
        }
        rest
    }
}

/// Offset just past the first blank line (`\n\n` or `\r\n\r\n`).
fn find_event_end(buf: &[u8]) -> Option<usize> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| i + 2);
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
