use std::{sync::Arc, time::Instant};

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{
    document::{ResourceDocument, ResourceKind},
    index::{IndexStats, SearchIndex, SharedIndex, SubIndexWriter},
};
use crate::{
    error::AppError,
    runtime::{ContainerSummary, ImageSummary},
    snapshot::SnapshotProvider,
};

/// Rebuilds the search index from a fresh snapshot and publishes it.
///
/// Builds are coalesced: a caller arriving while another build runs waits for
/// that build and shares its result instead of starting a second one.
pub struct IndexBuilder {
    snapshots: Arc<SnapshotProvider>,
    index: SharedIndex,
    in_flight: Mutex<()>,
}

impl IndexBuilder {
    pub fn new(snapshots: Arc<SnapshotProvider>, index: SharedIndex) -> Self {
        Self {
            snapshots,
            index,
            in_flight: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn index(&self) -> &SharedIndex {
        &self.index
    }

    pub fn stats(&self) -> IndexStats {
        self.index.current().stats()
    }

    pub async fn rebuild(&self) -> Result<IndexStats, AppError> {
        let observed = self.index.current().generation();
        let _guard = self.in_flight.lock().await;

        let current = self.index.current();
        if current.generation() != observed {
            debug!(
                generation = current.generation(),
                "rebuild coalesced with a concurrent build"
            );
            return Ok(current.stats());
        }

        self.build_and_publish(current.generation() + 1).await
    }

    /// Starts a rebuild in the background; failures are logged and the last
    /// good index stays published.
    pub fn trigger_rebuild(self: &Arc<Self>) {
        let builder = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = builder.rebuild().await {
                error!(error = %err, "background index rebuild failed");
            }
        });
    }

    async fn build_and_publish(&self, generation: u64) -> Result<IndexStats, AppError> {
        let started = Instant::now();
        let (containers, images) = tokio::join!(self.snapshots.containers(), self.snapshots.images());
        let containers = containers.map_err(|err| {
            error!(error = %err, "container snapshot failed, keeping previous index");
            AppError::IndexBuild(format!("containers: {err}"))
        })?;
        let images = images.map_err(|err| {
            error!(error = %err, "image snapshot failed, keeping previous index");
            AppError::IndexBuild(format!("images: {err}"))
        })?;

        let index = tokio::task::spawn_blocking(move || write_index(generation, &containers, &images))
            .await
            .map_err(|err| AppError::IndexBuild(format!("index writer task failed: {err}")))??;
        let stats = index.stats();
        self.index.publish(index);

        info!(
            generation,
            documents = stats.documents,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search index published"
        );
        Ok(stats)
    }
}

/// Writes one RAM sub-index per kind. Runs on the blocking pool since
/// tantivy commits synchronously.
fn write_index(
    generation: u64,
    containers: &[ContainerSummary],
    images: &[ImageSummary],
) -> Result<SearchIndex, AppError> {
    let mut container_index = SubIndexWriter::for_kind(ResourceKind::Container)?;
    for container in containers {
        container_index.add(&ResourceDocument::from_container(container))?;
    }
    let mut image_index = SubIndexWriter::for_kind(ResourceKind::Image)?;
    for image in images {
        image_index.add(&ResourceDocument::from_image(image))?;
    }
    debug!(
        containers = container_index.len(),
        images = image_index.len(),
        "{} and {} sub-indices written",
        container_index.name(),
        image_index.name()
    );

    Ok(SearchIndex::new(
        generation,
        vec![container_index.finish()?, image_index.finish()?],
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::runtime::fake::{FakeRuntime, container, image};

    fn builder(runtime: Arc<FakeRuntime>) -> Arc<IndexBuilder> {
        let snapshots = Arc::new(SnapshotProvider::new(runtime, Duration::from_secs(1)));
        Arc::new(IndexBuilder::new(snapshots, SharedIndex::new()))
    }

    fn runtime() -> Arc<FakeRuntime> {
        Arc::new(
            FakeRuntime::new()
                .with_container(container("c1", "web", "running"))
                .with_container(container("c2", "db", "running"))
                .with_image(image("sha256:i1", &["nginx:latest"])),
        )
    }

    #[tokio::test]
    async fn rebuild_publishes_every_document() {
        let builder = builder(runtime());
        let stats = builder.rebuild().await.unwrap();

        assert_eq!(stats.generation, 1);
        assert_eq!(stats.documents, 3);
        assert_eq!(stats.sub_indices["containers"], 2);
        assert_eq!(stats.sub_indices["images"], 1);
        assert_eq!(builder.stats(), stats);
    }

    #[tokio::test]
    async fn rebuild_replaces_rather_than_appends() {
        let runtime = runtime();
        let builder = builder(Arc::clone(&runtime));
        builder.rebuild().await.unwrap();

        runtime.remove_container("c2");
        let stats = builder.rebuild().await.unwrap();
        assert_eq!(stats.generation, 2);
        assert_eq!(stats.sub_indices["containers"], 1);
        assert_eq!(builder.index().current().search("db", 10).unwrap().total, 0);
    }

    #[tokio::test]
    async fn failed_snapshot_keeps_the_last_good_index() {
        let runtime = runtime();
        let builder = builder(Arc::clone(&runtime));
        builder.rebuild().await.unwrap();

        runtime.fail_images(true);
        let err = builder.rebuild().await.unwrap_err();
        assert!(matches!(err, AppError::IndexBuild(ref msg) if msg.starts_with("images")));

        let current = builder.index().current();
        assert_eq!(current.generation(), 1);
        assert_eq!(current.document_count(), 3);
    }

    #[tokio::test]
    async fn concurrent_rebuilds_coalesce() {
        let runtime = runtime();
        runtime.delay_metadata(Duration::from_millis(50));
        let builder = builder(Arc::clone(&runtime));

        let (first, second) = tokio::join!(builder.rebuild(), builder.rebuild());
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 1);
        assert_eq!(runtime.container_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_observe_a_partial_index() {
        let runtime = runtime();
        let builder = builder(Arc::clone(&runtime));
        builder.rebuild().await.unwrap();

        for n in 3..40 {
            runtime.add_container(container(&format!("extra{n}"), &format!("svc{n}"), "running"));
        }

        let index = builder.index().clone();
        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..2_000 {
                let current = index.current();
                let stats = current.stats();
                // A published index is always internally complete.
                assert_eq!(
                    stats.documents,
                    stats.sub_indices.values().sum::<usize>()
                );
                seen.push((current.generation(), stats.documents));
                tokio::task::yield_now().await;
            }
            seen
        });

        builder.rebuild().await.unwrap();
        let seen = reader.await.unwrap();
        for (generation, documents) in seen {
            match generation {
                1 => assert_eq!(documents, 3),
                2 => assert_eq!(documents, 40),
                other => panic!("unexpected generation {other}"),
            }
        }
    }

    #[tokio::test]
    async fn background_trigger_publishes() {
        let builder = builder(runtime());
        builder.trigger_rebuild();

        tokio::time::timeout(Duration::from_secs(1), async {
            while builder.stats().generation == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("background rebuild did not publish");
        assert_eq!(builder.stats().documents, 3);
    }
}
