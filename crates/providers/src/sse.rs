//! Server-sent-event decoding for streaming model responses.
//!
//! The streaming endpoints answer with an SSE body: `data:` lines grouped
//! into events, events separated by a blank line. [`SseParser`] consumes
//! raw body chunks incrementally and hands back one payload string per
//! completed event; [`sse_event_stream`] wires a `reqwest::Response`
//! through the parser and a payload decoder into a [`BoxStream`].

use crate::util::from_reqwest;
use hub_domain::error::Result;
use hub_domain::stream::{BoxStream, StreamEvent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Incremental parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Line-oriented SSE parser.
///
/// Chunks may cut lines or events anywhere; unfinished input stays
/// buffered until the next `feed`. Multiple `data:` lines in one event
/// are joined with `\n`. Comment lines (`:`) and `event:`/`id:`/`retry:`
/// fields are skipped.
pub(crate) struct SseParser {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseParser {
    pub(crate) fn new() -> Self {
        Self {
            buffer: String::new(),
            data_lines: Vec::new(),
        }
    }

    /// Consume a raw body chunk; returns each payload the chunk completed.
    pub(crate) fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(payload) = self.accept_line(line.trim_end_matches(['\r', '\n'])) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush a trailing event the server never terminated with a blank
    /// line (some backends close the socket right after the last `data:`).
    pub(crate) fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            self.accept_line(tail.trim_end_matches('\r'));
        }
        self.close_event()
    }

    /// One line without its terminator. A blank line closes the event.
    fn accept_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.close_event();
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_owned());
        }
        None
    }

    fn close_event(&mut self) -> Option<String> {
        if self.data_lines.is_empty() {
            return None;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();
        (!payload.trim().is_empty()).then_some(payload)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response wrapper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Turn a streaming `reqwest::Response` into a [`BoxStream`] of model
/// events.
///
/// `decode` maps one event payload to zero or more stream events. The
/// stream always terminates: when the body closes without the decoder
/// ever producing a `Done`, one is appended so consumers can rely on a
/// terminal event.
pub(crate) fn sse_event_stream<F>(
    response: reqwest::Response,
    mut decode: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut response = response;
        let mut parser = SseParser::new();
        let mut saw_done = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    for payload in parser.feed(&String::from_utf8_lossy(&bytes)) {
                        for event in decode(&payload) {
                            saw_done |= matches!(&event, Ok(StreamEvent::Done { .. }));
                            yield event;
                        }
                    }
                }
                Ok(None) => {
                    if let Some(payload) = parser.finish() {
                        for event in decode(&payload) {
                            saw_done |= matches!(&event, Ok(StreamEvent::Done { .. }));
                            yield event;
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            }
        }

        if !saw_done {
            yield Ok(StreamEvent::Done {
                finish_reason: Some("stop".into()),
            });
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
