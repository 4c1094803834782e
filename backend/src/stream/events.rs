use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::Stream;
use serde_json::json;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

use super::event::DomainEvent;
use crate::{
    error::AppError,
    runtime::{EventFilter, EventMessage, EventSubscription, short_id},
    snapshot::SnapshotProvider,
};

/// Turns the runtime's lifecycle feed into typed events.
pub struct EventMultiplexer {
    snapshots: Arc<SnapshotProvider>,
    buffer: usize,
}

impl EventMultiplexer {
    pub fn new(snapshots: Arc<SnapshotProvider>, buffer: usize) -> Self {
        Self { snapshots, buffer }
    }

    /// `last_event_id` is recorded but nothing is replayed; the stream starts
    /// at the present.
    pub async fn stream_events(&self, last_event_id: Option<&str>) -> Result<EventStream, AppError> {
        if let Some(last_event_id) = last_event_id {
            info!(last_event_id, "event client resumed, replay is not supported");
        }

        let filter = EventFilter::lifecycle();
        let deadline = self.snapshots.deadline();
        let subscription = match timeout(deadline, self.snapshots.runtime().events(&filter)).await {
            Ok(Ok(subscription)) => subscription,
            Ok(Err(err)) => return Err(subscription_failed(err.to_string())),
            Err(_) => {
                return Err(subscription_failed(format!(
                    "subscribe timed out after {}ms",
                    deadline.as_millis()
                )));
            }
        };

        let (tx, rx) = mpsc::channel(self.buffer);
        let relay = tokio::spawn(relay_events(subscription, filter, tx));
        Ok(EventStream { rx, relay })
    }
}

fn subscription_failed(message: String) -> AppError {
    warn!(error = %message, "event subscription failed");
    AppError::StreamSource {
        source_id: "events".into(),
        message,
    }
}

async fn relay_events(
    mut subscription: EventSubscription,
    filter: EventFilter,
    tx: mpsc::Sender<DomainEvent>,
) {
    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!("event consumer gone");
                return;
            }
            message = subscription.messages.recv() => {
                let Some(message) = message else {
                    debug!("event feed closed");
                    return;
                };
                if !filter.matches(&message) {
                    continue;
                }
                if tx.send(normalize(&message)).await.is_err() {
                    return;
                }
            }
            err = subscription.errors.recv() => {
                match err {
                    Some(err) => warn!(error = %err, "event feed reported an error"),
                    None => {
                        debug!("event error channel closed");
                        return;
                    }
                }
            }
        }
    }
}

fn normalize(message: &EventMessage) -> DomainEvent {
    let name = message
        .actor
        .attributes
        .get("name")
        .cloned()
        .unwrap_or_else(|| short_id(&message.actor.id).to_string());
    let description = format!("{} {} {}", message.event_type, name, past_tense(&message.action));
    let data = json!({
        "id": message.actor.id,
        "kind": message.event_type,
        "action": message.action,
        "name": name,
        "description": description,
    });
    DomainEvent::new(message.event_type.clone(), data.to_string())
}

fn past_tense(action: &str) -> String {
    match action {
        "start" => "started".into(),
        "stop" => "stopped".into(),
        other => other.to_string(),
    }
}

/// Live lifecycle events. Dropping it ends the upstream subscription.
pub struct EventStream {
    rx: mpsc::Receiver<DomainEvent>,
    relay: JoinHandle<()>,
}

impl Stream for EventStream {
    type Item = DomainEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<DomainEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use futures_util::StreamExt;
    use serde_json::Value;
    use tokio::time::timeout;

    use super::*;
    use crate::runtime::{EventActor, fake::FakeRuntime};

    fn multiplexer(runtime: Arc<FakeRuntime>) -> EventMultiplexer {
        let snapshots = Arc::new(SnapshotProvider::new(runtime, Duration::from_secs(1)));
        EventMultiplexer::new(snapshots, 8)
    }

    fn message(event_type: &str, action: &str, id: &str, name: Option<&str>) -> EventMessage {
        let attributes = name
            .map(|name| BTreeMap::from([("name".to_string(), name.to_string())]))
            .unwrap_or_default();
        EventMessage {
            event_type: event_type.into(),
            action: action.into(),
            actor: EventActor {
                id: id.into(),
                attributes,
            },
            time: 0,
        }
    }

    #[tokio::test]
    async fn lifecycle_messages_become_typed_events() {
        let runtime = Arc::new(FakeRuntime::new());
        let (messages, _errors) = runtime.event_feed();
        let mut stream = multiplexer(runtime).stream_events(None).await.unwrap();

        messages.send(message("container", "die", "c1", Some("web"))).await.unwrap();
        messages.send(message("container", "start", "c1", Some("web"))).await.unwrap();

        let event = timeout(Duration::from_secs(1), stream.next()).await.unwrap().unwrap();
        assert_eq!(event.event_type, "container");
        let data: Value = serde_json::from_str(&event.data).unwrap();
        assert_eq!(data["id"], "c1");
        assert_eq!(data["action"], "start");
        assert_eq!(data["description"], "container web started");
    }

    #[tokio::test]
    async fn unnamed_images_fall_back_to_short_id() {
        let event = normalize(&message("image", "stop", "sha256:0123456789abcdef", None));
        assert_eq!(event.event_type, "image");
        let data: Value = serde_json::from_str(&event.data).unwrap();
        assert_eq!(data["name"], "0123456789ab");
        assert_eq!(data["description"], "image 0123456789ab stopped");
    }

    #[tokio::test]
    async fn errors_are_logged_and_the_feed_continues() {
        let runtime = Arc::new(FakeRuntime::new());
        let (messages, errors) = runtime.event_feed();
        let mut stream = multiplexer(runtime).stream_events(Some("evt-41")).await.unwrap();

        errors.send(AppError::Runtime("hiccup".into())).await.unwrap();
        messages.send(message("image", "start", "sha256:i1", Some("nginx"))).await.unwrap();

        let event = timeout(Duration::from_secs(1), stream.next()).await.unwrap().unwrap();
        assert_eq!(event.event_type, "image");
    }

    #[tokio::test]
    async fn closed_error_channel_ends_the_stream() {
        let runtime = Arc::new(FakeRuntime::new());
        let (_messages, errors) = runtime.event_feed();
        let mut stream = multiplexer(runtime).stream_events(None).await.unwrap();

        drop(errors);
        let next = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn failed_subscription_is_a_stream_source_error() {
        let runtime = Arc::new(FakeRuntime::new());
        let result = multiplexer(runtime).stream_events(None).await;
        assert!(matches!(
            result,
            Err(AppError::StreamSource { ref source_id, .. }) if source_id == "events"
        ));
    }

    #[tokio::test]
    async fn dropping_the_stream_releases_the_subscription() {
        let runtime = Arc::new(FakeRuntime::new());
        let (messages, _errors) = runtime.event_feed();
        let stream = multiplexer(runtime).stream_events(None).await.unwrap();

        drop(stream);
        timeout(Duration::from_secs(1), messages.closed())
            .await
            .expect("subscription was not released");
    }
}
