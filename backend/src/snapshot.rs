use std::{collections::HashSet, future::Future, sync::Arc, time::Duration};

use tokio::time::timeout;
use tracing::debug;

use crate::{
    error::AppError,
    runtime::{
        ContainerDetails, ContainerQuery, ContainerRuntime, ContainerSummary, ImageDetails,
        ImageSummary, ProcessList, SystemInfo, VolumeSummary,
    },
};

/// Point-in-time views of the runtime, each call bounded by the metadata deadline.
pub struct SnapshotProvider {
    runtime: Arc<dyn ContainerRuntime>,
    deadline: Duration,
}

impl SnapshotProvider {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, deadline: Duration) -> Self {
        Self { runtime, deadline }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub async fn containers(&self) -> Result<Vec<ContainerSummary>, AppError> {
        self.bounded("list containers", self.runtime.list_containers(&ContainerQuery::all()))
            .await
    }

    pub async fn running_containers(&self) -> Result<Vec<ContainerSummary>, AppError> {
        self.bounded(
            "list running containers",
            self.runtime.list_containers(&ContainerQuery::running()),
        )
        .await
    }

    /// Live containers whose id is exactly one of `ids`, in one runtime call.
    pub async fn containers_by_id(&self, ids: &[String]) -> Result<Vec<ContainerSummary>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let containers = self
            .bounded(
                "resolve containers",
                self.runtime.list_containers(&ContainerQuery::by_ids(ids)),
            )
            .await?;
        // The runtime matches id prefixes.
        Ok(containers
            .into_iter()
            .filter(|c| wanted.contains(c.id.as_str()))
            .collect())
    }

    pub async fn images(&self) -> Result<Vec<ImageSummary>, AppError> {
        self.bounded("list images", self.runtime.list_images()).await
    }

    /// Live images whose id is one of `ids`, in one runtime call.
    pub async fn images_by_id(&self, ids: &[String]) -> Result<Vec<ImageSummary>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let images = self.images().await?;
        Ok(images
            .into_iter()
            .filter(|image| wanted.contains(image.id.as_str()))
            .collect())
    }

    pub async fn volumes(&self) -> Result<Vec<VolumeSummary>, AppError> {
        self.bounded("list volumes", self.runtime.list_volumes()).await
    }

    pub async fn info(&self) -> Result<SystemInfo, AppError> {
        self.bounded("host info", self.runtime.info()).await
    }

    /// Inspect output of one container, plus its process table when it runs.
    pub async fn container_details(
        &self,
        id: &str,
    ) -> Result<(ContainerDetails, Option<ProcessList>), AppError> {
        let details = self
            .bounded("inspect container", self.runtime.inspect_container(id))
            .await?;
        if !details.state.running {
            debug!(container = %id, state = %details.state.status, "not running, skipping top");
            return Ok((details, None));
        }
        let processes = self
            .bounded("list processes", self.runtime.container_top(id))
            .await?;
        Ok((details, Some(processes)))
    }

    pub async fn image_details(&self, reference: &str) -> Result<ImageDetails, AppError> {
        self.bounded("inspect image", self.runtime.inspect_image(reference))
            .await
    }

    /// Runs `call` under the deadline. Missing resources and rejected ids keep
    /// their own variant; every other failure is a snapshot error.
    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        match timeout(self.deadline, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err @ (AppError::NotFound(_) | AppError::BadRequest(_)))) => Err(err),
            Ok(Err(err)) => Err(AppError::Snapshot(format!("{operation}: {err}"))),
            Err(_) => Err(AppError::Snapshot(format!(
                "{operation} timed out after {}ms",
                self.deadline.as_millis()
            ))),
        }
    }
}
