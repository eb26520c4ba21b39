//! Server-Sent Events (SSE) processing for streaming responses.
//!
//! This module turns the raw byte stream of a streaming completion into a sequence of text
//! deltas. Two framings exist: line-oriented SSE (`data: {json}` frames terminated by a blank
//! line, ended by `data: [DONE]`) and raw text, where every decoded chunk is itself a delta and
//! the end of the transport is the end of the stream. One parser instance handles exactly one
//! framing.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};

use crate::observability::{STREAM_BYTES, STREAM_EVENTS, STREAM_PARSE_ERRORS, STREAM_TIMEOUTS};
use crate::types::CompletionChunk;
use crate::utf8::Utf8Decoder;
use crate::{Error, Result};

/// Payload that marks the end of an SSE stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Number of consecutive malformed frames after which the stream is abandoned.
pub const MAX_CONSECUTIVE_PARSE_FAILURES: u32 = 3;

/// A boxed stream of parsed stream events.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Wire framing of a streamed reply.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `text/event-stream` with JSON delta frames and a `[DONE]` sentinel.
    #[default]
    Sse,

    /// Plain chunked text; every chunk is a delta.
    RawText,
}

impl Framing {
    /// The `Content-Type` a response in this framing carries.
    pub fn content_type(&self) -> &'static str {
        match self {
            Framing::Sse => "text/event-stream",
            Framing::RawText => "text/plain; charset=utf-8",
        }
    }
}

impl FromStr for Framing {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sse" | "event-stream" => Ok(Framing::Sse),
            "raw" | "text" => Ok(Framing::RawText),
            _ => Err(Error::validation(
                format!("Invalid framing: {s}. Valid options: sse, raw"),
                Some("framing".to_string()),
            )),
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Sse => f.write_str("sse"),
            Framing::RawText => f.write_str("raw"),
        }
    }
}

/// One parsed step of a streamed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Text to append to the in-flight message.
    Delta(String),

    /// The reply is complete.
    Done,
}

/// Incremental parser for one streamed reply.
///
/// Feed it byte chunks with arbitrary boundaries; it returns the deltas contained in every
/// frame completed so far. After `Done` has been returned, further input is ignored.
#[derive(Debug)]
pub struct StreamParser {
    framing: Framing,
    decoder: Utf8Decoder,
    buffer: String,
    consecutive_failures: u32,
    done: bool,
}

impl StreamParser {
    /// Creates a parser for the given framing.
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            decoder: Utf8Decoder::new(),
            buffer: String::new(),
            consecutive_failures: 0,
            done: false,
        }
    }

    /// The framing this parser expects.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Returns true once the end of the stream has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds one network chunk.
    ///
    /// # Errors
    ///
    /// Returns an error when the provider reports an error inside the stream, or when
    /// [`MAX_CONSECUTIVE_PARSE_FAILURES`] frames in a row are not valid JSON.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>> {
        if self.done {
            return Ok(Vec::new());
        }
        let text = self.decoder.decode(chunk);
        match self.framing {
            Framing::RawText => Ok(raw_delta(text).into_iter().collect()),
            Framing::Sse => {
                self.buffer.extend(text.chars().filter(|c| *c != '\r'));
                self.drain_frames()
            }
        }
    }

    /// Signals that the transport closed.
    ///
    /// For raw text this completes the stream. For SSE a trailing frame without its blank
    /// line is still processed, but no `Done` is synthesized: an SSE stream that never sent
    /// the sentinel was interrupted.
    pub fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        if self.done {
            return Ok(Vec::new());
        }
        let tail = self.decoder.finish();
        match self.framing {
            Framing::RawText => {
                self.done = true;
                let mut events: Vec<StreamEvent> = raw_delta(tail).into_iter().collect();
                events.push(StreamEvent::Done);
                Ok(events)
            }
            Framing::Sse => {
                self.buffer.push_str(&tail);
                let rest = std::mem::take(&mut self.buffer);
                if rest.trim().is_empty() {
                    return Ok(Vec::new());
                }
                let event = self.process_frame(&rest)?;
                if event == Some(StreamEvent::Done) {
                    self.done = true;
                }
                Ok(event.into_iter().collect())
            }
        }
    }

    fn drain_frames(&mut self) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let frame = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);
            match self.process_frame(&frame)? {
                Some(StreamEvent::Done) => {
                    self.done = true;
                    self.buffer.clear();
                    events.push(StreamEvent::Done);
                    break;
                }
                Some(event) => events.push(event),
                None => {}
            }
        }
        Ok(events)
    }

    /// Parses one complete SSE frame.
    fn process_frame(&mut self, frame: &str) -> Result<Option<StreamEvent>> {
        let mut data: Option<String> = None;
        for line in frame.lines() {
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                let value = value.strip_prefix(' ').unwrap_or(value);
                match &mut data {
                    Some(data) => {
                        data.push('\n');
                        data.push_str(value);
                    }
                    None => data = Some(value.to_string()),
                }
            }
        }

        let Some(data) = data else {
            return Ok(None);
        };
        let payload = data.trim();
        if payload.is_empty() {
            return Ok(None);
        }
        if payload == DONE_SENTINEL {
            return Ok(Some(StreamEvent::Done));
        }

        match serde_json::from_str::<CompletionChunk>(payload) {
            Ok(chunk) => {
                self.consecutive_failures = 0;
                if let Some(error) = chunk.error {
                    let message = error
                        .message
                        .unwrap_or_else(|| "unknown streaming error".to_string());
                    return Err(Error::streaming(message, None));
                }
                Ok(chunk
                    .delta_text()
                    .filter(|text| !text.is_empty())
                    .map(|text| StreamEvent::Delta(text.to_string())))
            }
            Err(err) => {
                self.consecutive_failures += 1;
                STREAM_PARSE_ERRORS.click();
                tracing::warn!(
                    failures = self.consecutive_failures,
                    error = %err,
                    "dropping malformed stream frame"
                );
                if self.consecutive_failures >= MAX_CONSECUTIVE_PARSE_FAILURES {
                    return Err(Error::serialization(
                        format!(
                            "{} consecutive malformed stream frames: {err}",
                            self.consecutive_failures
                        ),
                        Some(Box::new(err)),
                    ));
                }
                Ok(None)
            }
        }
    }
}

fn raw_delta(text: String) -> Option<StreamEvent> {
    if text.is_empty() {
        None
    } else {
        Some(StreamEvent::Delta(text))
    }
}

struct DecodeState {
    bytes: Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>,
    parser: StreamParser,
    queue: VecDeque<StreamEvent>,
    finished: bool,
}

/// Process a stream of bytes into a stream of deltas.
///
/// The returned stream ends right after `Done`. A transport error is yielded once and ends the
/// stream; an SSE transport that closes without `[DONE]` simply ends, which callers treat as an
/// interruption.
///
/// # Examples
///
/// ```
/// # tokio_test::block_on(async {
/// use bytes::Bytes;
/// use chatlite::{Framing, StreamEvent, process_stream};
/// use futures::{StreamExt, stream};
///
/// let chunks = vec![
///     Ok::<_, chatlite::Error>(Bytes::from_static(b"Hel")),
///     Ok(Bytes::from_static(b"lo")),
/// ];
/// let events: Vec<_> = process_stream(stream::iter(chunks), Framing::RawText)
///     .map(|event| event.unwrap())
///     .collect()
///     .await;
/// assert_eq!(
///     events,
///     vec![
///         StreamEvent::Delta("Hel".into()),
///         StreamEvent::Delta("lo".into()),
///         StreamEvent::Done,
///     ]
/// );
/// # });
/// ```
pub fn process_stream<S, E>(byte_stream: S, framing: Framing) -> DeltaStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<Error> + 'static,
{
    let bytes = byte_stream.map(|result| {
        result.map_err(|e| {
            let err: Error = e.into();
            if err.is_timeout() || err.is_streaming() {
                err
            } else {
                Error::streaming(format!("Error in HTTP stream: {err}"), Some(Box::new(err)))
            }
        })
    });

    let state = DecodeState {
        bytes: Box::pin(bytes),
        parser: StreamParser::new(framing),
        queue: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                STREAM_EVENTS.click();
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }

            let result = match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    STREAM_BYTES.count(bytes.len() as u64);
                    state.parser.feed(&bytes)
                }
                Some(Err(err)) => Err(err),
                None => {
                    state.finished = true;
                    state.parser.finish()
                }
            };
            match result {
                Ok(events) => {
                    state.queue.extend(events);
                    if state.parser.is_done() {
                        state.finished = true;
                    }
                }
                Err(err) => {
                    state.finished = true;
                    state.queue.clear();
                    return Some((Err(err), state));
                }
            }
        }
    }))
}

/// Bounds every read of `stream` by `idle`.
///
/// If no item arrives within `idle`, a timeout error is yielded and the stream ends. The inner
/// stream is dropped at that point, which aborts the underlying request.
pub fn with_idle_timeout<T>(
    stream: Pin<Box<dyn Stream<Item = Result<T>> + Send>>,
    idle: Duration,
) -> Pin<Box<dyn Stream<Item = Result<T>> + Send>>
where
    T: Send + 'static,
{
    Box::pin(stream::unfold(Some(stream), move |inner| async move {
        let mut inner = inner?;
        match tokio::time::timeout(idle, inner.next()).await {
            Ok(Some(item)) => Some((item, Some(inner))),
            Ok(None) => None,
            Err(_) => {
                STREAM_TIMEOUTS.click();
                tracing::warn!(idle_secs = idle.as_secs_f64(), "stream idle timeout");
                Some((
                    Err(Error::timeout(
                        "no data received from the stream",
                        Some(idle.as_secs_f64()),
                    )),
                    None,
                ))
            }
        }
    }))
}

/// Bounds the wait for a response to start by `idle`.
///
/// Body reads are bounded separately by [`with_idle_timeout`]; this covers a peer that accepts
/// the connection and never sends a response head.
pub async fn with_response_timeout<T, E, F>(response: F, idle: Duration) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<Error>,
{
    match tokio::time::timeout(idle, response).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            STREAM_TIMEOUTS.click();
            tracing::warn!(idle_secs = idle.as_secs_f64(), "response timeout");
            Err(Error::timeout(
                "no response received before the idle timeout",
                Some(idle.as_secs_f64()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn byte_stream(chunks: Vec<&'static [u8]>) -> impl Stream<Item = Result<Bytes>> + Send {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    async fn collect(stream: DeltaStream) -> Vec<Result<StreamEvent>> {
        stream.collect().await
    }

    fn deltas(events: &[Result<StreamEvent>]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                Ok(StreamEvent::Delta(text)) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn done_terminates_exactly_once() {
        let mut parser = StreamParser::new(Framing::Sse);
        let events = parser
            .feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n")
            .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Delta("Hi".to_string()), StreamEvent::Done]
        );
        assert!(parser.is_done());

        // Anything after the sentinel is ignored, including another sentinel.
        assert!(parser.feed(b"data: [DONE]\n\n").unwrap().is_empty());
        assert!(parser.finish().unwrap().is_empty());
    }

    #[test]
    fn malformed_frame_between_valid_frames_is_skipped() {
        let mut parser = StreamParser::new(Framing::Sse);
        let events = parser
            .feed(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
                  data: {not json\n\n\
                  data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            )
            .unwrap();
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("Hel".to_string()),
                StreamEvent::Delta("lo".to_string())
            ]
        );
    }

    #[test]
    fn three_consecutive_malformed_frames_abort() {
        let mut parser = StreamParser::new(Framing::Sse);
        assert!(parser.feed(b"data: nope\n\n").unwrap().is_empty());
        assert!(parser.feed(b"data: nope\n\n").unwrap().is_empty());
        let err = parser.feed(b"data: nope\n\n").unwrap_err();
        assert!(err.is_serialization());
    }

    #[test]
    fn valid_frame_resets_failure_count() {
        let mut parser = StreamParser::new(Framing::Sse);
        for _ in 0..5 {
            assert!(parser.feed(b"data: nope\n\ndata: nope\n\n").unwrap().is_empty());
            assert_eq!(parser.feed(b"data: {}\n\n").unwrap(), Vec::new());
        }
    }

    #[test]
    fn frames_without_delta_are_skipped() {
        let mut parser = StreamParser::new(Framing::Sse);
        let events = parser
            .feed(
                b": keep-alive\n\n\
                  event: ping\n\n\
                  data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
                  data: {\"choices\":[]}\n\n\
                  data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n\n\
                  data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
            )
            .unwrap();
        assert_eq!(events, vec![StreamEvent::Delta("x".to_string())]);
    }

    #[test]
    fn crlf_frames_and_missing_space() {
        let mut parser = StreamParser::new(Framing::Sse);
        let events = parser
            .feed(b"data:{\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\r\n\r\ndata: [DONE]\r\n\r\n")
            .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Delta("a".to_string()), StreamEvent::Done]
        );
    }

    #[test]
    fn provider_error_frame_is_reported() {
        let mut parser = StreamParser::new(Framing::Sse);
        let err = parser
            .feed(b"data: {\"error\":{\"message\":\"context length exceeded\"}}\n\n")
            .unwrap_err();
        assert!(err.is_streaming());
        assert_eq!(err.message(), "context length exceeded");
    }

    #[test]
    fn sse_without_done_is_not_complete() {
        let mut parser = StreamParser::new(Framing::Sse);
        parser
            .feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n")
            .unwrap();
        assert!(parser.finish().unwrap().is_empty());
        assert!(!parser.is_done());
    }

    #[test]
    fn trailing_frame_without_blank_line() {
        let mut parser = StreamParser::new(Framing::Sse);
        assert!(parser.feed(b"data: [DONE]").unwrap().is_empty());
        assert_eq!(parser.finish().unwrap(), vec![StreamEvent::Done]);
    }

    #[test]
    fn raw_text_every_chunk_is_a_delta() {
        let mut parser = StreamParser::new(Framing::RawText);
        assert_eq!(
            parser.feed(b"data: [DONE]").unwrap(),
            vec![StreamEvent::Delta("data: [DONE]".to_string())]
        );
        assert_eq!(parser.finish().unwrap(), vec![StreamEvent::Done]);
    }

    #[test]
    fn framing_from_str() {
        assert_eq!("sse".parse::<Framing>().unwrap(), Framing::Sse);
        assert_eq!("RAW".parse::<Framing>().unwrap(), Framing::RawText);
        assert!("xml".parse::<Framing>().unwrap_err().is_validation());
        assert_eq!(Framing::RawText.to_string(), "raw");
    }

    #[tokio::test]
    async fn split_frame_and_split_character() {
        // "é" is 0xC3 0xA9; split it across chunks along with the frame itself.
        let stream = byte_stream(vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"caf\xc3",
            b"\xa9\"}}]}\n",
            b"\ndata: [DO",
            b"NE]\n\n",
        ]);
        let events = collect(process_stream(stream, Framing::Sse)).await;
        assert_eq!(deltas(&events), "café");
        assert!(matches!(events.last(), Some(Ok(StreamEvent::Done))));
        assert!(!deltas(&events).contains(char::REPLACEMENT_CHARACTER));
    }

    #[tokio::test]
    async fn raw_stream_split_character() {
        // "€" is 0xE2 0x82 0xAC, split 1 + 2.
        let stream = byte_stream(vec![b"price: \xe2", b"\x82\xac5"]);
        let events = collect(process_stream(stream, Framing::RawText)).await;
        assert_eq!(deltas(&events), "price: €5");
        assert_eq!(events.iter().filter(|e| matches!(e, Ok(StreamEvent::Done))).count(), 1);
    }

    #[tokio::test]
    async fn stream_ends_after_done() {
        let stream = byte_stream(vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ]);
        let events = collect(process_stream(stream, Framing::Sse)).await;
        assert_eq!(events.len(), 2);
        assert_eq!(deltas(&events), "Hi");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_times_out() {
        let stalled: DeltaStream = Box::pin(
            stream::iter(vec![Ok(StreamEvent::Delta("first".to_string()))])
                .chain(stream::pending()),
        );
        let events: Vec<_> = with_idle_timeout(stalled, Duration::from_secs(90))
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Ok(StreamEvent::Delta(text)) if text == "first"));
        assert!(events[1].as_ref().unwrap_err().is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_response_times_out() {
        let silent = std::future::pending::<Result<()>>();
        let err = with_response_timeout(silent, Duration::from_secs(90))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let ready = async { Ok::<_, Error>(7) };
        assert_eq!(with_response_timeout(ready, Duration::from_secs(1)).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn transport_error_is_yielded_once() {
        let stream = stream::iter(vec![
            Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            )),
            Err(Error::connection("reset by peer", None)),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ]);
        let events = collect(process_stream(stream, Framing::Sse)).await;
        assert_eq!(events.len(), 2);
        assert_eq!(deltas(&events), "Hi");
        let err = events[1].as_ref().unwrap_err();
        assert!(err.is_streaming());
        assert!(err.is_retryable());
    }
}
