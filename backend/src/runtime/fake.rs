//! Scripted in-memory runtime used by the unit tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use tokio::sync::mpsc;

use super::{
    ByteStream, ContainerDetails, ContainerQuery, ContainerRuntime, ContainerSummary, EventFilter,
    EventMessage, EventSubscription, ImageDetails, ImageSummary, LogOptions, ProcessList,
    SystemInfo, VolumeSummary,
    types::{ContainerConfig, ContainerState},
};
use crate::error::AppError;

pub fn container(id: &str, name: &str, state: &str) -> ContainerSummary {
    ContainerSummary {
        id: id.into(),
        names: vec![format!("/{name}")],
        image: format!("{name}-image:latest"),
        state: state.into(),
        status: if state == "running" {
            "Up 5 minutes".into()
        } else {
            "Exited (0) 1 hour ago".into()
        },
        labels: Some(BTreeMap::from([(
            "com.docker.compose.service".to_string(),
            name.to_string(),
        )])),
        ..Default::default()
    }
}

pub fn image(id: &str, tags: &[&str]) -> ImageSummary {
    ImageSummary {
        id: id.into(),
        repo_tags: Some(tags.iter().map(|tag| tag.to_string()).collect()),
        size: 1024,
        ..Default::default()
    }
}

#[derive(Clone)]
struct FakeLog {
    chunks: Vec<Bytes>,
    keep_open: bool,
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<Vec<ContainerSummary>>,
    images: Mutex<Vec<ImageSummary>>,
    volumes: Vec<VolumeSummary>,
    logs: Mutex<HashMap<String, FakeLog>>,
    broken_logs: Mutex<HashSet<String>>,
    fail_containers: AtomicBool,
    fail_images: AtomicBool,
    metadata_delay: Mutex<Option<Duration>>,
    events: Mutex<Option<EventSubscription>>,
    open_sources: Arc<AtomicUsize>,
    opened_total: AtomicUsize,
    container_calls: AtomicUsize,
    image_calls: AtomicUsize,
    top_calls: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_container(self, container: ContainerSummary) -> Self {
        self.containers.lock().unwrap().push(container);
        self
    }

    pub fn with_image(self, image: ImageSummary) -> Self {
        self.images.lock().unwrap().push(image);
        self
    }

    pub fn with_volume(mut self, name: &str) -> Self {
        self.volumes.push(VolumeSummary {
            name: name.into(),
            driver: "local".into(),
            mountpoint: format!("/var/lib/docker/volumes/{name}/_data"),
            ..Default::default()
        });
        self
    }

    /// Scripts the log source of `id`. With `keep_open` the source stays
    /// pending after its chunks, like a follow stream of an idle container.
    pub fn with_log(self, id: &str, chunks: &[&str], keep_open: bool) -> Self {
        self.logs.lock().unwrap().insert(
            id.into(),
            FakeLog {
                chunks: chunks
                    .iter()
                    .map(|chunk| Bytes::copy_from_slice(chunk.as_bytes()))
                    .collect(),
                keep_open,
            },
        );
        self
    }

    pub fn with_broken_log(self, id: &str) -> Self {
        self.broken_logs.lock().unwrap().insert(id.into());
        self
    }

    pub fn remove_container(&self, id: &str) {
        self.containers.lock().unwrap().retain(|c| c.id != id);
    }

    pub fn add_container(&self, container: ContainerSummary) {
        self.containers.lock().unwrap().push(container);
    }

    pub fn fail_containers(&self, fail: bool) {
        self.fail_containers.store(fail, Ordering::SeqCst);
    }

    pub fn fail_images(&self, fail: bool) {
        self.fail_images.store(fail, Ordering::SeqCst);
    }

    pub fn delay_metadata(&self, delay: Duration) {
        *self.metadata_delay.lock().unwrap() = Some(delay);
    }

    /// Installs an event subscription and hands back its producing ends.
    pub fn event_feed(&self) -> (mpsc::Sender<EventMessage>, mpsc::Sender<AppError>) {
        let (message_tx, messages) = mpsc::channel(16);
        let (error_tx, errors) = mpsc::channel(16);
        *self.events.lock().unwrap() = Some(EventSubscription { messages, errors });
        (message_tx, error_tx)
    }

    /// Log sources currently held open by a consumer.
    pub fn open_sources(&self) -> usize {
        self.open_sources.load(Ordering::SeqCst)
    }

    pub fn opened_total(&self) -> usize {
        self.opened_total.load(Ordering::SeqCst)
    }

    pub fn container_calls(&self) -> usize {
        self.container_calls.load(Ordering::SeqCst)
    }

    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    pub fn top_calls(&self) -> usize {
        self.top_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.metadata_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(
        &self,
        query: &ContainerQuery,
    ) -> Result<Vec<ContainerSummary>, AppError> {
        self.container_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_containers.load(Ordering::SeqCst) {
            return Err(AppError::Runtime("containers unavailable".into()));
        }
        let containers = self.containers.lock().unwrap().clone();
        Ok(containers
            .into_iter()
            .filter(|c| query.all || c.is_running())
            .filter(|c| {
                query.ids.is_empty() || query.ids.iter().any(|id| c.id.starts_with(id.as_str()))
            })
            .collect())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, AppError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_images.load(Ordering::SeqCst) {
            return Err(AppError::Runtime("images unavailable".into()));
        }
        Ok(self.images.lock().unwrap().clone())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>, AppError> {
        self.pause().await;
        Ok(self.volumes.clone())
    }

    async fn info(&self) -> Result<SystemInfo, AppError> {
        let containers = self.containers.lock().unwrap();
        Ok(SystemInfo {
            name: "fake-host".into(),
            server_version: "27.0.0".into(),
            containers: containers.len() as i64,
            containers_running: containers.iter().filter(|c| c.is_running()).count() as i64,
            images: self.images.lock().unwrap().len() as i64,
            ..Default::default()
        })
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, AppError> {
        self.pause().await;
        let containers = self.containers.lock().unwrap();
        let container = containers
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| AppError::NotFound(format!("No such container: {id}")))?;
        Ok(ContainerDetails {
            id: container.id.clone(),
            name: container.names.first().cloned().unwrap_or_default(),
            image: container.image_id.clone(),
            state: ContainerState {
                status: container.state.clone(),
                running: container.is_running(),
                paused: container.state == "paused",
                ..Default::default()
            },
            config: ContainerConfig {
                image: container.image.clone(),
                labels: container.labels.clone(),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    async fn container_top(&self, id: &str) -> Result<ProcessList, AppError> {
        self.top_calls.fetch_add(1, Ordering::SeqCst);
        let containers = self.containers.lock().unwrap();
        let container = containers
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| AppError::NotFound(format!("No such container: {id}")))?;
        Ok(ProcessList {
            titles: vec!["PID".into(), "CMD".into()],
            processes: vec![vec!["1".into(), container.command.clone()]],
        })
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails, AppError> {
        self.pause().await;
        let images = self.images.lock().unwrap();
        let image = images
            .iter()
            .find(|image| {
                image.id == reference || image.repo_tags.iter().flatten().any(|tag| tag == reference)
            })
            .ok_or_else(|| AppError::NotFound(format!("No such image: {reference}")))?;
        Ok(ImageDetails {
            id: image.id.clone(),
            repo_tags: image.repo_tags.clone(),
            repo_digests: image.repo_digests.clone(),
            size: image.size,
            os: "linux".into(),
            architecture: "amd64".into(),
            ..Default::default()
        })
    }

    async fn container_logs(&self, id: &str, _options: &LogOptions) -> Result<ByteStream, AppError> {
        if self.broken_logs.lock().unwrap().contains(id) {
            return Err(AppError::Runtime(format!("no such container: {id}")));
        }
        let log = self.logs.lock().unwrap().get(id).cloned().unwrap_or(FakeLog {
            chunks: Vec::new(),
            keep_open: true,
        });

        self.opened_total.fetch_add(1, Ordering::SeqCst);
        let guard = OpenGuard::new(Arc::clone(&self.open_sources));
        let chunks = stream::iter(log.chunks.into_iter().map(Ok));
        let inner: ByteStream = if log.keep_open {
            Box::pin(chunks.chain(stream::pending()))
        } else {
            Box::pin(chunks)
        };
        Ok(Box::pin(TrackedStream {
            inner,
            _guard: guard,
        }))
    }

    async fn events(&self, _filter: &EventFilter) -> Result<EventSubscription, AppError> {
        self.events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AppError::Runtime("event feed unavailable".into()))
    }
}

struct OpenGuard(Arc<AtomicUsize>);

impl OpenGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct TrackedStream {
    inner: ByteStream,
    _guard: OpenGuard,
}

impl Stream for TrackedStream {
    type Item = Result<Bytes, AppError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
