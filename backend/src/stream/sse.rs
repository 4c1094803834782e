//! Server-Sent-Events sink.
//!
//! Each event is handed to the response body as its own chunk, so actix writes
//! it out immediately. The body holds the receiving half of a bounded channel;
//! when the client goes away actix drops the body, the channel closes, and the
//! producing side learns about it through [`SseWriter::emit`] or
//! [`SseWriter::closed`].

use actix_web::{HttpResponse, http::header};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::event::DomainEvent;
use crate::error::AppError;

pub struct SseWriter {
    tx: mpsc::Sender<Bytes>,
}

pub struct SseBody {
    rx: mpsc::Receiver<Bytes>,
}

pub fn channel(capacity: usize) -> (SseWriter, SseBody) {
    let (tx, rx) = mpsc::channel(capacity);
    (SseWriter { tx }, SseBody { rx })
}

impl SseWriter {
    pub async fn emit(&self, event: &DomainEvent) -> Result<(), AppError> {
        self.tx
            .send(Bytes::from(event.encode()))
            .await
            .map_err(|_| AppError::StreamWrite("client disconnected".into()))
    }

    /// Resolves once the client side is gone.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

impl SseBody {
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, AppError>> + 'static {
        ReceiverStream::new(self.rx).map(Ok::<Bytes, AppError>)
    }
}

/// Why a forwarded stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    SourceExhausted,
    ClientGone,
}

/// Pumps `source` into `writer` until one side ends. The source is dropped on
/// return, which releases whatever upstream connections it owns.
pub async fn forward<S>(mut source: S, writer: SseWriter) -> StreamEnd
where
    S: Stream<Item = DomainEvent> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = writer.closed() => return StreamEnd::ClientGone,
            next = source.next() => next,
        };
        let Some(event) = next else {
            return StreamEnd::SourceExhausted;
        };
        if let Err(err) = writer.emit(&event).await {
            debug!(error = %err, "stopping stream");
            return StreamEnd::ClientGone;
        }
    }
}

/// `Connection` is owned by actix's HTTP/1 encoder, which drops any value set
/// here. A streaming body is sent chunked on a persistent connection, so the
/// stream stays open without it.
pub fn sse_response(body: SseBody) -> HttpResponse {
    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"))
        .insert_header((header::PRAGMA, "no-cache"))
        .insert_header((header::EXPIRES, "0"))
        .streaming(body.into_stream())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::stream;
    use tokio::time::timeout;

    use super::*;

    fn event(id: &str, data: &str) -> DomainEvent {
        DomainEvent {
            id: id.into(),
            event_type: String::new(),
            data: data.into(),
            retry: None,
        }
    }

    #[tokio::test]
    async fn forward_writes_each_event_as_one_chunk() {
        let (writer, body) = channel(8);
        let source = stream::iter(vec![event("1", "a"), event("2", "b")]);

        let end = forward(source, writer).await;
        assert_eq!(end, StreamEnd::SourceExhausted);

        let chunks: Vec<Bytes> = body.into_stream().map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(
            chunks,
            vec![
                Bytes::from_static(b"id:1\ndata:a\n\n"),
                Bytes::from_static(b"id:2\ndata:b\n\n"),
            ]
        );
    }

    #[tokio::test]
    async fn idle_stream_notices_disconnect() {
        let (writer, body) = channel(8);
        let source = stream::pending::<DomainEvent>();
        let task = tokio::spawn(forward(source, writer));

        drop(body);
        let end = timeout(Duration::from_secs(1), task)
            .await
            .expect("forward did not observe the disconnect")
            .unwrap();
        assert_eq!(end, StreamEnd::ClientGone);
    }

    #[tokio::test]
    async fn emit_fails_once_the_client_is_gone() {
        let (writer, body) = channel(1);
        drop(body);
        let err = writer.emit(&event("1", "late")).await.unwrap_err();
        assert!(matches!(err, AppError::StreamWrite(_)));
    }

    #[test]
    fn response_carries_streaming_headers() {
        let (_writer, body) = channel(1);
        let response = sse_response(body);
        let headers = response.headers();
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "text/event-stream");
        assert!(headers.get(header::CONNECTION).is_none());
        assert_eq!(
            headers.get(header::CACHE_CONTROL).unwrap(),
            "no-cache, no-store, must-revalidate"
        );
    }
}
