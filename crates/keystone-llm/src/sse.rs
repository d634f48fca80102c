use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;

use keystone_core::errors::ProviderError;
use keystone_core::stream::CompletionChunk;

/// Provider-specific state machine turning SSE events into completion chunks.
pub trait SseEventParser: Send + Unpin + 'static {
    /// Handle one `(event, data)` pair.
    fn parse_event(&mut self, event_type: &str, data: &str) -> Vec<CompletionChunk>;

    /// Called once when the byte stream ends. Returns any trailing chunks,
    /// e.g. an interruption error if no terminal event was seen.
    fn finish(&mut self) -> Vec<CompletionChunk>;
}

/// Parse raw SSE text into (event_type, data) pairs.
///
/// Events without an `event:` line are reported as `message`. Multiple
/// `data:` lines in one event are joined with newlines.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if let Some(event) = line.strip_prefix("event:") {
            current_event = event.trim_start().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data));
        } else if line.is_empty() {
            flush_event(&mut events, &mut current_event, &mut data_lines);
        }
        // Comments (":") and unknown fields are ignored.
    }

    // Handle trailing event without blank line
    flush_event(&mut events, &mut current_event, &mut data_lines);

    events
}

fn flush_event(events: &mut Vec<(String, String)>, current_event: &mut String, data_lines: &mut Vec<&str>) {
    if current_event.is_empty() && data_lines.is_empty() {
        return;
    }
    let event_type = if current_event.is_empty() {
        "message".to_string()
    } else {
        std::mem::take(current_event)
    };
    events.push((event_type, data_lines.join("\n")));
    data_lines.clear();
}

/// Wraps a byte stream from reqwest and yields completion chunks.
///
/// No idle timeout is applied. Dropping this stream drops the underlying
/// response and aborts the request.
pub struct SseStream<P: SseEventParser> {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: P,
    buffer: String,
    carry: Vec<u8>,
    pending: VecDeque<CompletionChunk>,
    finished: bool,
}

impl<P: SseEventParser> SseStream<P> {
    pub fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        parser: P,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser,
            buffer: String::new(),
            carry: Vec::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    fn drain_complete_events(&mut self) {
        while let Some(pos) = self.buffer.find("\n\n") {
            let chunk: String = self.buffer.drain(..pos + 2).collect();
            for (event_type, data) in parse_sse_lines(&chunk) {
                let chunks = self.parser.parse_event(&event_type, &data);
                self.pending.extend(chunks);
            }
        }
    }
}

impl<P: SseEventParser> Stream for SseStream<P> {
    type Item = CompletionChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                if chunk.is_terminal() {
                    self.finished = true;
                    self.pending.clear();
                }
                return Poll::Ready(Some(chunk));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.carry.extend_from_slice(&bytes);
                    // Hold back a multi-byte character split across chunks.
                    let valid = match std::str::from_utf8(&self.carry) {
                        Ok(_) => self.carry.len(),
                        Err(e) if e.error_len().is_none() => e.valid_up_to(),
                        Err(_) => self.carry.len(),
                    };
                    let head: Vec<u8> = self.carry.drain(..valid).collect();
                    let text = String::from_utf8_lossy(&head).replace("\r\n", "\n");
                    self.buffer.push_str(&text);
                    self.drain_complete_events();
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(CompletionChunk::Error {
                        error: ProviderError::StreamInterrupted(e.to_string()),
                    }));
                }
                Poll::Ready(None) => {
                    // Stream ended; flush whatever is buffered
                    let tail = std::mem::take(&mut self.carry);
                    let tail = String::from_utf8_lossy(&tail).replace("\r\n", "\n");
                    self.buffer.push_str(&tail);
                    let remaining = std::mem::take(&mut self.buffer);
                    for (event_type, data) in parse_sse_lines(&remaining) {
                        let chunks = self.parser.parse_event(&event_type, &data);
                        self.pending.extend(chunks);
                    }
                    let trailing = self.parser.finish();
                    self.pending.extend(trailing);
                    if self.pending.is_empty() {
                        self.finished = true;
                        return Poll::Ready(None);
                    }
                    // Mark finished after the pending queue drains.
                    let last_is_terminal = self.pending.back().is_some_and(CompletionChunk::is_terminal);
                    if !last_is_terminal {
                        self.finished = true;
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
