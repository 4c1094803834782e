//! Capability surface of the container runtime.
//!
//! Everything above this module talks to the host through [`ContainerRuntime`].
//! Metadata calls return point-in-time values; log and event calls return
//! long-lived subscriptions that stay open until the returned value is dropped.

mod docker;
#[cfg(test)]
pub mod fake;
mod types;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::AppError;

pub use docker::DockerClient;
pub use types::{
    ContainerDetails, ContainerSummary, EventActor, EventMessage, ImageDetails, ImageSummary,
    ProcessList, SystemInfo, VolumeSummary, short_id,
};

/// Raw log bytes from one container, already stripped of stream framing.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(&self, query: &ContainerQuery)
    -> Result<Vec<ContainerSummary>, AppError>;

    async fn list_images(&self) -> Result<Vec<ImageSummary>, AppError>;

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>, AppError>;

    async fn info(&self) -> Result<SystemInfo, AppError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, AppError>;

    /// Processes of a running container.
    async fn container_top(&self, id: &str) -> Result<ProcessList, AppError>;

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails, AppError>;

    /// Opens a log source. Resolves once the runtime accepted the request;
    /// the returned stream then runs until the container stops logging or
    /// the stream is dropped.
    async fn container_logs(&self, id: &str, options: &LogOptions) -> Result<ByteStream, AppError>;

    async fn events(&self, filter: &EventFilter) -> Result<EventSubscription, AppError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerQuery {
    /// Include stopped containers.
    pub all: bool,
    /// Restrict to these ids. The runtime treats them as prefixes.
    pub ids: Vec<String>,
}

impl ContainerQuery {
    pub fn all() -> Self {
        Self {
            all: true,
            ids: Vec::new(),
        }
    }

    pub fn running() -> Self {
        Self::default()
    }

    pub fn by_ids(ids: &[String]) -> Self {
        Self {
            all: true,
            ids: ids.to_vec(),
        }
    }

    pub(crate) fn filters_json(&self) -> Option<String> {
        if self.ids.is_empty() {
            return None;
        }
        Some(json!({ "id": self.ids }).to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub timestamps: bool,
}

impl LogOptions {
    pub fn follow() -> Self {
        Self {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub types: Vec<String>,
    pub actions: Vec<String>,
}

impl EventFilter {
    /// Container and image start/stop transitions.
    pub fn lifecycle() -> Self {
        Self {
            types: vec!["container".into(), "image".into()],
            actions: vec!["start".into(), "stop".into()],
        }
    }

    pub fn matches(&self, message: &EventMessage) -> bool {
        let type_ok = self.types.is_empty() || self.types.iter().any(|t| *t == message.event_type);
        let action_ok = self.actions.is_empty() || self.actions.iter().any(|a| *a == message.action);
        type_ok && action_ok
    }

    pub(crate) fn filters_json(&self) -> String {
        json!({ "type": self.types, "event": self.actions }).to_string()
    }
}

/// A live event subscription. Both channels close when the subscription ends;
/// dropping the receivers releases the upstream connection.
#[derive(Debug)]
pub struct EventSubscription {
    pub messages: mpsc::Receiver<EventMessage>,
    pub errors: mpsc::Receiver<AppError>,
}
