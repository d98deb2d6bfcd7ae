//! Bounded per-preview output buffer

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Fixed-capacity ring of recent output chunks. Oldest chunks are dropped silently.
#[derive(Debug)]
pub struct LogBuffer {
    chunks: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, chunk: impl Into<String>) {
        let mut chunks = self.chunks.lock();
        while chunks.len() >= self.capacity {
            chunks.pop_front();
        }
        chunks.push_back(chunk.into());
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    /// All retained chunks, newline separated
    pub fn contents(&self) -> String {
        let chunks = self.chunks.lock();
        let mut out = String::new();
        for chunk in chunks.iter() {
            out.push_str(chunk);
            out.push('\n');
        }
        out
    }

    /// The last `n` chunks, newline separated
    pub fn tail(&self, n: usize) -> String {
        let chunks = self.chunks.lock();
        let skip = chunks.len().saturating_sub(n);
        chunks
            .iter()
            .skip(skip)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Line reader over child output that never fails on encoding.
///
/// Invalid UTF-8 is replaced rather than reported, so a reader keeps draining
/// its pipe until EOF and the writer never sees a closed pipe. Partial lines
/// stay buffered across calls, which makes `next_line` safe to use as a
/// `select!` branch.
pub struct OutputLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    pub fn new(stream: R) -> Self {
        Self {
            reader: BufReader::new(stream),
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator, or `None` at EOF
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }

        let mut end = self.buf.len();
        while end > 0 && matches!(self.buf[end - 1], b'\n' | b'\r') {
            end -= 1;
        }
        let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}
