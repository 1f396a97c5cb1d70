// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Incremental framing for streamed upstream bodies: server-sent events and
//! newline-delimited JSON.

use super::{DeltaStream, ProviderError, StreamDelta};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

/// Splits a byte stream into lines; chunks may end mid-line or mid-codepoint
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Whatever followed the last newline
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).trim_end_matches('\r').to_string();
        self.pending.clear();
        Some(rest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    lines: LineBuffer,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for line in self.lines.push(chunk) {
            if let Some(event) = self.line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush an event left unterminated at end of body
    pub fn finish(&mut self) -> Option<SseEvent> {
        if let Some(line) = self.lines.finish() {
            if let Some(event) = self.line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(SseEvent {
            event: self.event.take(),
            data,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Sse,
    Ndjson,
}

/// Turns frames of one provider's stream into deltas
pub(crate) trait StreamParser: Send + 'static {
    fn frame(&mut self, event: Option<&str>, data: &str) -> Result<Vec<StreamDelta>, ProviderError>;

    /// End of body; must yield the closing [`StreamDelta::Finish`] if none was sent
    fn finish(&mut self) -> Vec<StreamDelta>;
}

/// False once the receiver is gone
async fn forward(tx: &mpsc::Sender<Result<StreamDelta, ProviderError>>, deltas: Vec<StreamDelta>) -> bool {
    for delta in deltas {
        if tx.send(Ok(delta)).await.is_err() {
            return false;
        }
    }
    true
}

/// Drive `response` through `parser` on a background task
pub(crate) fn pump<P: StreamParser>(response: reqwest::Response, framing: Framing, mut parser: P) -> DeltaStream {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut body = response.bytes_stream();
        let mut sse = SseDecoder::default();
        let mut ndjson = LineBuffer::default();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = tx.send(Err(ProviderError::Stream(e.to_string()))).await;
                    return;
                }
            };

            let frames: Vec<(Option<String>, String)> = match framing {
                Framing::Sse => sse.push(&chunk).into_iter().map(|e| (e.event, e.data)).collect(),
                Framing::Ndjson => ndjson
                    .push(&chunk)
                    .into_iter()
                    .filter(|l| !l.trim().is_empty())
                    .map(|l| (None, l))
                    .collect(),
            };

            for (event, data) in frames {
                match parser.frame(event.as_deref(), &data) {
                    Ok(deltas) => {
                        if !forward(&tx, deltas).await {
                            debug!("Stream receiver dropped, closing upstream");
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        }

        let tail = match framing {
            Framing::Sse => sse.finish().map(|e| (e.event, e.data)),
            Framing::Ndjson => ndjson.finish().filter(|l| !l.trim().is_empty()).map(|l| (None, l)),
        };
        if let Some((event, data)) = tail {
            match parser.frame(event.as_deref(), &data) {
                Ok(deltas) => {
                    if !forward(&tx, deltas).await {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
        forward(&tx, parser.finish()).await;
    });

    rx
}
