//! Streaming normalization
//!
//! Each provider contributes a [`StreamDecoder`] that maps its native chunk
//! type to zero or more canonical [`StreamEvent`]s through a fixed table.
//! [`normalize`] drives the decoder one chunk at a time, pushes the output
//! through a [`Normalizer`], and yields events in the exact order they were
//! produced. Nothing is buffered across chunks.

mod normalizer;

use std::collections::VecDeque;
use std::pin::Pin;

use eventsource_stream::{Event, Eventsource};
use futures_util::{Stream, StreamExt};

pub use normalizer::Normalizer;

use crate::error::LlmError;
use crate::types::StreamEvent;

/// Normalized event stream handed to callers
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// Maps one provider's raw stream chunks to canonical events
pub trait StreamDecoder: Send + 'static {
    type Chunk: Send + 'static;

    /// Translate a single upstream chunk
    ///
    /// Unknown chunk kinds must be dropped with a warning and yield no events.
    /// An `Err` ends the stream and is forwarded to the caller.
    fn decode(&mut self, chunk: Self::Chunk) -> Result<Vec<StreamEvent>, LlmError>;

    /// Events implied by the end of upstream input
    fn finish(&mut self) -> Vec<StreamEvent> {
        Vec::new()
    }
}

struct Pump<S, D> {
    provider: String,
    upstream: Option<Pin<Box<S>>>,
    decoder: D,
    normalizer: Normalizer,
    pending: VecDeque<Result<StreamEvent, LlmError>>,
}

impl<S, D> Pump<S, D>
where
    D: StreamDecoder,
{
    fn emit(&mut self, events: Vec<StreamEvent>) {
        for event in events {
            self.pending.extend(self.normalizer.push(event).into_iter().map(Ok));
        }
    }

    fn close(&mut self) {
        self.upstream = None;
    }
}

/// Wrap an upstream chunk stream into a normalized event stream
///
/// The returned stream ends after `MessageStop`. When the upstream ends or
/// fails before that, a [`LlmError::StreamInterrupted`] is yielded after the
/// events already produced. Dropping the returned stream drops the upstream,
/// which closes the connection.
pub fn normalize<S, D>(provider: &str, model: &str, upstream: S, decoder: D) -> EventStream
where
    S: Stream<Item = Result<D::Chunk, LlmError>> + Send + 'static,
    D: StreamDecoder,
{
    let pump = Pump {
        provider: provider.to_owned(),
        upstream: Some(Box::pin(upstream)),
        decoder,
        normalizer: Normalizer::new(provider, model),
        pending: VecDeque::new(),
    };

    let stream = futures_util::stream::unfold(pump, |mut pump| async move {
        loop {
            if let Some(item) = pump.pending.pop_front() {
                return Some((item, pump));
            }

            let next = pump.upstream.as_mut()?.next().await;

            match next {
                Some(Ok(chunk)) => match pump.decoder.decode(chunk) {
                    Ok(events) => {
                        pump.emit(events);
                        if pump.normalizer.is_finished() {
                            pump.close();
                        }
                    }
                    Err(e) => {
                        tracing::error!(provider = %pump.provider, error = %e, "upstream stream reported an error");
                        pump.pending.push_back(Err(e));
                        pump.close();
                    }
                },
                Some(Err(e)) => {
                    tracing::error!(provider = %pump.provider, error = %e, "upstream stream failed");
                    pump.pending.push_back(Err(LlmError::StreamInterrupted {
                        provider: pump.provider.clone(),
                        reason: e.to_string(),
                    }));
                    pump.close();
                }
                None => {
                    let tail = pump.decoder.finish();
                    pump.emit(tail);

                    if !pump.normalizer.is_finished() {
                        tracing::warn!(provider = %pump.provider, "upstream stream ended without message stop");
                        pump.pending.push_back(Err(LlmError::StreamInterrupted {
                            provider: pump.provider.clone(),
                            reason: "upstream closed before message stop".to_owned(),
                        }));
                    }
                    pump.close();
                }
            }
        }
    });

    Box::pin(stream)
}

/// Server-sent events from an upstream HTTP response body
pub(crate) fn sse_events(
    provider: &str,
    response: reqwest::Response,
) -> impl Stream<Item = Result<Event, LlmError>> + Send + 'static {
    let provider = provider.to_owned();

    response.bytes_stream().eventsource().map(move |result| {
        result.map_err(|e| LlmError::upstream(&provider, None, format!("invalid event stream: {e}")))
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures_util::stream;

    use super::*;
    use crate::types::{BlockDelta, BlockKind, StopReason, Usage};

    struct Passthrough;

    impl StreamDecoder for Passthrough {
        type Chunk = Option<StreamEvent>;

        fn decode(&mut self, chunk: Self::Chunk) -> Result<Vec<StreamEvent>, LlmError> {
            match chunk {
                Some(event) => Ok(vec![event]),
                None => {
                    tracing::warn!("dropping unknown event");
                    Ok(vec![])
                }
            }
        }
    }

    fn delta(text: &str) -> StreamEvent {
        StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::Text(text.to_owned()),
        }
    }

    fn message_stop() -> StreamEvent {
        StreamEvent::MessageStop {
            stop_reason: Some(StopReason::EndTurn),
            usage: Usage::default(),
        }
    }

    #[tokio::test]
    async fn preserves_order_and_drops_unknown_chunks() {
        let upstream = stream::iter(vec![
            Ok(Some(delta("Hel"))),
            Ok(None),
            Ok(Some(delta("lo"))),
            Ok(Some(message_stop())),
        ]);

        let events: Vec<_> = normalize("test", "m", upstream, Passthrough)
            .map(|event| event.unwrap())
            .collect()
            .await;

        let text: String = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::ContentBlockDelta {
                    delta: BlockDelta::Text(text),
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect();

        assert_eq!(text, "Hello");
        assert!(matches!(events.first(), Some(StreamEvent::MessageStart { .. })));
        assert_eq!(
            events[1],
            StreamEvent::ContentBlockStart {
                index: 0,
                kind: BlockKind::Text
            }
        );
        assert_eq!(events[events.len() - 2], StreamEvent::ContentBlockStop { index: 0 });
        assert_eq!(events.last(), Some(&message_stop()));
    }

    #[tokio::test]
    async fn early_end_is_interrupted() {
        let upstream = stream::iter(vec![Ok(Some(delta("partial")))]);

        let events: Vec<_> = normalize("test", "m", upstream, Passthrough).collect().await;

        assert!(events[..events.len() - 1].iter().all(Result::is_ok));
        assert!(matches!(
            events.last(),
            Some(Err(LlmError::StreamInterrupted { provider, .. })) if provider == "test"
        ));
    }

    #[tokio::test]
    async fn transport_error_is_interrupted() {
        let upstream = stream::iter(vec![
            Ok(Some(delta("a"))),
            Err(LlmError::upstream("test", None, "connection reset")),
            Ok(Some(delta("never"))),
        ]);

        let events: Vec<_> = normalize("test", "m", upstream, Passthrough).collect().await;

        assert!(matches!(events.last(), Some(Err(LlmError::StreamInterrupted { reason, .. })) if reason.contains("connection reset")));
        assert!(!events.iter().any(|e| matches!(e, Ok(StreamEvent::ContentBlockDelta { delta: BlockDelta::Text(t), .. }) if t == "never")));
    }

    #[tokio::test]
    async fn stops_reading_after_message_stop() {
        let upstream = stream::iter(vec![Ok(Some(message_stop())), Ok(Some(delta("trailing")))]);

        let events: Vec<_> = normalize("test", "m", upstream, Passthrough).collect().await;

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn dropping_the_stream_closes_upstream() {
        struct Connection(Arc<AtomicBool>);

        impl Drop for Connection {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let closed = Arc::new(AtomicBool::new(false));
        let connection = Connection(Arc::clone(&closed));

        let upstream = stream::unfold(connection, |connection| async move {
            Some((Ok(Some(delta("tick"))), connection))
        });

        let mut events = normalize("test", "m", upstream, Passthrough);
        events.next().await.unwrap().unwrap();
        events.next().await.unwrap().unwrap();
        assert!(!closed.load(Ordering::SeqCst));

        drop(events);
        assert!(closed.load(Ordering::SeqCst));
    }
}
