//! Server-sent event parsing over a byte stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;

use super::AdapterError;

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// The `event:` field, when present.
    pub event: Option<String>,
    /// Concatenated `data:` lines, joined with newlines.
    pub data: String,
}

/// Splits a byte stream into SSE frames.
///
/// Frames are separated by blank lines; CRLF line endings are normalized.
/// Comment lines and unknown fields are ignored. A trailing frame without a
/// terminating blank line is flushed when the byte stream ends.
pub struct SseEventStream<S> {
    inner: S,
    buffer: String,
    done: bool,
}

impl<S> SseEventStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: String::new(),
            done: false,
        }
    }

    fn take_frame(&mut self) -> Option<SseEvent> {
        let boundary = self.buffer.find("\n\n")?;
        let frame: String = self.buffer.drain(..boundary + 2).collect();
        parse_frame(&frame)
    }

    fn flush_trailing(&mut self) -> Option<SseEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let frame = std::mem::take(&mut self.buffer);
        parse_frame(&frame)
    }
}

fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data_lines = Vec::new();

    for line in frame.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => data_lines.push(value.to_string()),
            "event" => event.event = Some(value.to_string()),
            _ => {}
        }
    }

    if data_lines.is_empty() && event.event.is_none() {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}

impl<S> Stream for SseEventStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<SseEvent, AdapterError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            if let Some(event) = self.take_frame() {
                return Poll::Ready(Some(Ok(event)));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes).replace("\r\n", "\n");
                    self.buffer.push_str(&text);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(e.into())));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(self.flush_trailing().map(Ok));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use futures::stream;

    fn byte_stream(chunks: Vec<&str>) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Unpin {
        stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    async fn collect(chunks: Vec<&str>) -> Vec<SseEvent> {
        SseEventStream::new(byte_stream(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn parses_simple_frames() {
        let events = collect(vec!["data: one\n\ndata: two\n\n"]).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "one");
        assert_eq!(events[1].data, "two");
    }

    #[tokio::test]
    async fn frames_split_across_chunks_are_reassembled() {
        let events = collect(vec!["data: hel", "lo\n", "\ndata: [DONE]\n\n"]).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[1].data, "[DONE]");
    }

    #[tokio::test]
    async fn crlf_and_comments_are_tolerated() {
        let events = collect(vec![": keepalive\r\nevent: token\r\ndata: x\r\n\r\n"]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("token"));
        assert_eq!(events[0].data, "x");
    }

    #[tokio::test]
    async fn multi_line_data_joins_with_newline() {
        let events = collect(vec!["data: a\ndata: b\n\n"]).await;
        assert_eq!(events[0].data, "a\nb");
    }

    #[tokio::test]
    async fn trailing_frame_without_blank_line_is_flushed() {
        let events = collect(vec!["data: tail"]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }
}
