//! Turns a response body into a stream of decoded chat events.

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use shared::error::StreamError;
use shared::protocol::StreamEvent;

use crate::sse::StreamDecoder;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, StreamError>> + Send>>;

struct DecodeState<S> {
    body: Pin<Box<S>>,
    decoder: StreamDecoder,
    pending: VecDeque<StreamEvent>,
    closed: bool,
    idle_timeout: Option<Duration>,
}

/// Decode a chunked byte stream into events.
///
/// The returned stream ends after the first terminal event, after the first
/// error, or when the body ends. An end of body without `done` is a normal
/// end of turn. With `idle_timeout` set, a gap longer than that between two
/// chunks yields `StreamError::Idle` and closes the stream.
pub fn decode_stream<S, B, E>(body: S, idle_timeout: Option<Duration>) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: StreamDecoder::new(),
        pending: VecDeque::new(),
        closed: false,
        idle_timeout,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if st.closed {
                return None;
            }

            let next = match st.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, st.body.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        st.closed = true;
                        return Some((Err(StreamError::Idle(limit)), st));
                    }
                },
                None => st.body.next().await,
            };

            match next {
                Some(Ok(chunk)) => match st.decoder.feed(chunk.as_ref()) {
                    Ok(events) => {
                        st.pending.extend(events);
                        st.closed = st.decoder.is_finished();
                    }
                    Err(e) => {
                        st.closed = true;
                        return Some((Err(e), st));
                    }
                },
                Some(Err(e)) => {
                    st.closed = true;
                    return Some((Err(StreamError::Transport(e.to_string())), st));
                }
                None => {
                    st.closed = true;
                    match st.decoder.finish() {
                        Ok(Some(event)) => st.pending.push_back(event),
                        Ok(None) => {}
                        Err(e) => return Some((Err(e), st)),
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    type Chunk = Result<Vec<u8>, String>;

    fn body(chunks: Vec<Chunk>) -> impl Stream<Item = Chunk> + Send + 'static {
        stream::iter(chunks)
    }

    async fn collect(events: EventStream) -> Vec<Result<StreamEvent, StreamError>> {
        events.collect().await
    }

    #[tokio::test]
    async fn stops_reading_after_done() {
        let events = decode_stream(
            body(vec![
                Ok(b"data: {\"type\":\"token\",\"content\":\"a\"}\n".to_vec()),
                Ok(b"data: {\"type\":\"done\"}\n".to_vec()),
                Err("should never be polled".into()),
            ]),
            None,
        );
        assert_eq!(
            collect(events).await,
            vec![Ok(StreamEvent::Token("a".into())), Ok(StreamEvent::Done)]
        );
    }

    #[tokio::test]
    async fn transport_failure_ends_the_stream() {
        let events = decode_stream(
            body(vec![
                Ok(b"data: {\"type\":\"token\",\"content\":\"a\"}\n".to_vec()),
                Err("connection reset".into()),
            ]),
            None,
        );
        assert_eq!(
            collect(events).await,
            vec![
                Ok(StreamEvent::Token("a".into())),
                Err(StreamError::Transport("connection reset".into())),
            ]
        );
    }

    #[tokio::test]
    async fn body_end_without_done_just_ends() {
        let events = decode_stream(
            body(vec![Ok(b"data: {\"type\":\"sources\",\"sources\":[]}\n\n".to_vec())]),
            None,
        );
        assert_eq!(
            collect(events).await,
            vec![Ok(StreamEvent::Sources(Vec::new()))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_body_trips_the_idle_timeout() {
        let silent = stream::pending::<Chunk>();
        let events = decode_stream(silent, Some(Duration::from_secs(30)));
        assert_eq!(
            collect(events).await,
            vec![Err(StreamError::Idle(Duration::from_secs(30)))]
        );
    }
}
