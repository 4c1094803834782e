//! Merges the follow streams of several containers into one sequence of lines.
//!
//! Line order is kept within one container. Lines of different containers are
//! interleaved in whatever order their producers reach the merge queue, which
//! is not the order of their timestamps.

use std::{
    collections::HashSet,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::{Stream, StreamExt, future::join_all};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

use super::lines::LineBuffer;
use crate::{
    error::AppError,
    runtime::{ByteStream, LogOptions},
    snapshot::SnapshotProvider,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub source_id: String,
    pub timestamp: Option<String>,
    /// The line without the runtime's timestamp prefix.
    pub text: String,
}

impl LogLine {
    /// Splits off the RFC3339 prefix the runtime adds with `timestamps=1`.
    pub fn parse(source_id: &str, line: String) -> Self {
        let (timestamp, text) = match leading_timestamp(&line) {
            Some(stamp) => {
                let rest = line[stamp.len()..].strip_prefix(' ').unwrap_or_default();
                (Some(stamp.to_string()), rest.to_string())
            }
            None => (None, line),
        };
        Self {
            source_id: source_id.to_string(),
            timestamp,
            text,
        }
    }
}

/// The first token of `line` when it looks like an RFC3339 timestamp.
fn leading_timestamp(line: &str) -> Option<&str> {
    let token = line.split(' ').next()?;
    let bytes = token.as_bytes();
    let shaped = bytes.len() >= 20
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes[10] == b'T'
        && bytes[..4].iter().all(u8::is_ascii_digit);
    shaped.then_some(token)
}

pub struct LogMultiplexer {
    snapshots: Arc<SnapshotProvider>,
    buffer: usize,
}

impl LogMultiplexer {
    pub fn new(snapshots: Arc<SnapshotProvider>, buffer: usize) -> Self {
        Self { snapshots, buffer }
    }

    /// Opens one follow stream per id, or per running container when `ids` is
    /// empty. The running set is resolved once, here.
    pub async fn stream_logs(&self, ids: Vec<String>) -> Result<LogStream, AppError> {
        let ids = if ids.is_empty() {
            let running: Vec<String> = self
                .snapshots
                .running_containers()
                .await?
                .into_iter()
                .map(|container| container.id)
                .collect();
            if running.is_empty() {
                return Err(AppError::NotFound("no running container".into()));
            }
            running
        } else {
            dedupe(ids)
        };

        let sources = self.open_all(&ids).await?;
        let (tx, rx) = mpsc::channel(self.buffer);
        let producers = sources
            .into_iter()
            .map(|(id, source)| tokio::spawn(pump_source(id, source, tx.clone())))
            .collect();
        info!(sources = ids.len(), "log stream opened");

        Ok(LogStream {
            rx,
            producers,
            source_count: ids.len(),
        })
    }

    async fn open_all(&self, ids: &[String]) -> Result<Vec<(String, ByteStream)>, AppError> {
        let options = LogOptions::follow();
        let deadline = self.snapshots.deadline();
        let runtime = self.snapshots.runtime();

        let opened = join_all(ids.iter().map(|id| {
            let options = &options;
            async move {
                let result = match timeout(deadline, runtime.container_logs(id, options)).await {
                    Ok(result) => result,
                    Err(_) => Err(AppError::Runtime(format!(
                        "open timed out after {}ms",
                        deadline.as_millis()
                    ))),
                };
                (id.clone(), result)
            }
        }))
        .await;

        // Any failure drops every source opened so far along with the Vec.
        let mut sources = Vec::with_capacity(opened.len());
        for (id, result) in opened {
            match result {
                Ok(source) => sources.push((id, source)),
                Err(err @ AppError::BadRequest(_)) => return Err(err),
                Err(err) => {
                    warn!(source = %id, error = %err, "log source failed to open");
                    return Err(AppError::StreamSource {
                        source_id: id,
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(sources)
    }
}

fn dedupe(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

async fn pump_source(id: String, mut source: ByteStream, tx: mpsc::Sender<LogLine>) {
    let mut lines = LineBuffer::default();
    loop {
        let chunk = tokio::select! {
            _ = tx.closed() => {
                debug!(source = %id, "log consumer gone");
                return;
            }
            chunk = source.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for line in lines.push(&bytes) {
                    if tx.send(LogLine::parse(&id, line)).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(err)) => {
                warn!(source = %id, error = %err, "log source failed");
                break;
            }
            None => {
                debug!(source = %id, "log source ended");
                break;
            }
        }
    }

    if let Some(rest) = lines.finish() {
        let _ = tx.send(LogLine::parse(&id, rest)).await;
    }
}

/// The merged line sequence. Ends once every source has ended; dropping it
/// stops the producers and releases their sources.
pub struct LogStream {
    rx: mpsc::Receiver<LogLine>,
    producers: Vec<JoinHandle<()>>,
    source_count: usize,
}

impl LogStream {
    pub fn source_count(&self) -> usize {
        self.source_count
    }
}

impl Stream for LogStream {
    type Item = LogLine;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<LogLine>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        for producer in &self.producers {
            producer.abort();
        }
    }
}
