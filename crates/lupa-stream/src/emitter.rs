use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::events::StreamEvent;

#[derive(Debug, Clone, Copy)]
/// Stream tunables. `send_timeout_ms` is the backpressure threshold: a full
/// buffer that does not drain within it terminates the connection.
pub struct StreamConfig {
    pub buffer_capacity: usize,
    pub send_timeout_ms: u64,
    pub text_chunk_words: usize,
    pub audio_chunk_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 64,
            send_timeout_ms: 5_000,
            text_chunk_words: crate::chunking::DEFAULT_TEXT_CHUNK_WORDS,
            audio_chunk_bytes: crate::chunking::DEFAULT_AUDIO_CHUNK_BYTES,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
/// Emission failures.
pub enum StreamError {
    #[error("event '{event}' violates the stream grammar in state '{state}'")]
    GrammarViolation { state: &'static str, event: &'static str },
    #[error("client drained too slowly; stream terminated")]
    SlowConsumer,
    #[error("stream already terminated")]
    Terminated,
    #[error("client disconnected")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrammarState {
    Created,
    Started,
    IntentSeen,
    Body,
    Terminal,
}

impl GrammarState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::IntentSeen => "intent_seen",
            Self::Body => "body",
            Self::Terminal => "terminal",
        }
    }

    /// Transition table for
    /// `start progress* (intent agent_selected)? (text|audio|progress|warning)* (done|error)`.
    fn accept(self, event: &StreamEvent) -> Result<Self, StreamError> {
        use StreamEvent::*;
        let next = match (self, event) {
            (Self::Created, Start { .. }) => Some(Self::Started),
            (Self::Started, Progress { .. }) => Some(Self::Started),
            (Self::Started, Intent { .. }) => Some(Self::IntentSeen),
            (Self::IntentSeen, AgentSelected { .. }) => Some(Self::Body),
            (Self::Started | Self::Body, Text { .. } | Audio { .. } | Warning { .. }) => {
                Some(Self::Body)
            }
            (Self::Body, Progress { .. }) => Some(Self::Body),
            (
                Self::Started | Self::IntentSeen | Self::Body,
                Done { .. } | Error { .. },
            ) => Some(Self::Terminal),
            _ => None,
        };
        next.ok_or(StreamError::GrammarViolation {
            state: self.as_str(),
            event: event.tag(),
        })
    }
}

/// Sending half of one stream connection. Emission blocks on the bounded
/// buffer rather than on the agent pipeline; a buffer that stays full beyond
/// the threshold ends the stream with `error{reason: slow_consumer}`.
pub struct StreamEmitter {
    sender: mpsc::Sender<StreamEvent>,
    config: StreamConfig,
    state: Mutex<GrammarState>,
    trailer: Arc<Mutex<Option<StreamEvent>>>,
}

/// Receiving half: the buffered events, then (if the emitter had to
/// terminate without buffer room) one trailing terminal event.
pub struct StreamReceiver {
    inner: ReceiverStream<StreamEvent>,
    trailer: Arc<Mutex<Option<StreamEvent>>>,
}

impl Stream for StreamReceiver {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(None) => Poll::Ready(lock_or_recover(&self.trailer).take()),
            other => other,
        }
    }
}

/// Creates one connection: the emitter and the event stream the HTTP layer
/// serializes to SSE frames.
pub fn stream_channel(config: StreamConfig) -> (StreamEmitter, StreamReceiver) {
    let (sender, receiver) = mpsc::channel(config.buffer_capacity.max(1));
    let trailer = Arc::new(Mutex::new(None));
    (
        StreamEmitter {
            sender,
            config,
            state: Mutex::new(GrammarState::Created),
            trailer: trailer.clone(),
        },
        StreamReceiver {
            inner: ReceiverStream::new(receiver),
            trailer,
        },
    )
}

impl StreamEmitter {
    pub fn config(&self) -> StreamConfig {
        self.config
    }

    pub fn is_terminated(&self) -> bool {
        *lock_or_recover(&self.state) == GrammarState::Terminal
    }

    /// Emits one event, enforcing the grammar and the backpressure bound.
    pub async fn emit(&self, event: StreamEvent) -> Result<(), StreamError> {
        {
            let mut state = lock_or_recover(&self.state);
            if *state == GrammarState::Terminal {
                return Err(StreamError::Terminated);
            }
            *state = state.accept(&event)?;
        }

        let send = self.sender.send_timeout(
            event,
            std::time::Duration::from_millis(self.config.send_timeout_ms.max(1)),
        );
        match send.await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                tracing::warn!(
                    timeout_ms = self.config.send_timeout_ms,
                    "stream buffer never drained, terminating"
                );
                self.terminate_slow_consumer();
                Err(StreamError::SlowConsumer)
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                *lock_or_recover(&self.state) = GrammarState::Terminal;
                Err(StreamError::Disconnected)
            }
        }
    }

    /// Marks the stream terminal and parks the slow-consumer error where the
    /// receiver will still find it after draining the buffer.
    fn terminate_slow_consumer(&self) {
        *lock_or_recover(&self.state) = GrammarState::Terminal;
        let error_event = StreamEvent::Error {
            reason: "slow_consumer".to_string(),
            message: "o cliente não consumiu o stream a tempo".to_string(),
        };
        match self.sender.try_send(error_event.clone()) {
            Ok(()) => {}
            Err(_) => {
                *lock_or_recover(&self.trailer) = Some(error_event);
            }
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::{stream_channel, StreamConfig, StreamError};
    use crate::events::StreamEvent;

    fn start() -> StreamEvent {
        StreamEvent::Start {
            investigation_id: "inv-1".to_string(),
            session_id: "sess-1".to_string(),
        }
    }

    fn done() -> StreamEvent {
        StreamEvent::Done {
            total_records_analyzed: 1,
            anomalies_found: 0,
            processing_time_ms: 10,
        }
    }

    fn text(index: usize) -> StreamEvent {
        StreamEvent::Text {
            content: "cinco palavras por bloco aqui".to_string(),
            index,
        }
    }

    #[tokio::test]
    async fn functional_valid_connection_follows_the_grammar() {
        let (emitter, mut stream) = stream_channel(StreamConfig::default());
        emitter.emit(start()).await.expect("start");
        emitter
            .emit(StreamEvent::Progress {
                phase: "planning".to_string(),
                progress: 0.1,
            })
            .await
            .expect("progress");
        emitter
            .emit(StreamEvent::Intent {
                intent: "investigate".to_string(),
                confidence: 0.9,
            })
            .await
            .expect("intent");
        emitter
            .emit(StreamEvent::AgentSelected {
                agent_id: "detective".to_string(),
            })
            .await
            .expect("agent_selected");
        emitter.emit(text(0)).await.expect("text");
        emitter.emit(done()).await.expect("done");
        drop(emitter);

        let mut tags = Vec::new();
        while let Some(event) = stream.next().await {
            tags.push(event.tag());
        }
        assert_eq!(
            tags,
            vec!["start", "progress", "intent", "agent_selected", "text", "done"]
        );
    }

    #[tokio::test]
    async fn regression_first_event_must_be_start() {
        let (emitter, _stream) = stream_channel(StreamConfig::default());
        let error = emitter.emit(text(0)).await.expect_err("text before start");
        assert!(matches!(error, StreamError::GrammarViolation { .. }));
    }

    #[tokio::test]
    async fn regression_exactly_one_terminal_event() {
        let (emitter, _stream) = stream_channel(StreamConfig::default());
        emitter.emit(start()).await.expect("start");
        emitter.emit(done()).await.expect("done");
        let error = emitter.emit(done()).await.expect_err("second terminal");
        assert_eq!(error, StreamError::Terminated);
    }

    #[tokio::test]
    async fn regression_agent_selected_requires_intent_first() {
        let (emitter, _stream) = stream_channel(StreamConfig::default());
        emitter.emit(start()).await.expect("start");
        let error = emitter
            .emit(StreamEvent::AgentSelected {
                agent_id: "detective".to_string(),
            })
            .await
            .expect_err("agent_selected without intent");
        assert!(matches!(error, StreamError::GrammarViolation { .. }));
    }

    #[tokio::test]
    async fn functional_slow_consumer_terminates_with_typed_error() {
        let (emitter, mut stream) = stream_channel(StreamConfig {
            buffer_capacity: 2,
            send_timeout_ms: 50,
            ..StreamConfig::default()
        });
        emitter.emit(start()).await.expect("start");
        emitter.emit(text(0)).await.expect("first text fits");
        // Nobody drains the receiver: the next emit overruns the buffer.
        let error = emitter.emit(text(1)).await.expect_err("buffer overflow");
        assert_eq!(error, StreamError::SlowConsumer);
        assert!(emitter.is_terminated());
        let error = emitter.emit(text(2)).await.expect_err("post-termination");
        assert_eq!(error, StreamError::Terminated);

        // The client that finally drains still sees the slow_consumer error
        // as the last event of the connection.
        drop(emitter);
        let mut last = None;
        while let Some(event) = stream.next().await {
            last = Some(event);
        }
        match last {
            Some(StreamEvent::Error { reason, .. }) => assert_eq!(reason, "slow_consumer"),
            other => panic!("expected slow_consumer error, got {other:?}"),
        }
    }
}
