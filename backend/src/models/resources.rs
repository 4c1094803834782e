use serde::{Deserialize, Serialize};

use crate::runtime::{
    ContainerDetails, ContainerSummary, ImageDetails, ImageSummary, ProcessList, SystemInfo,
    VolumeSummary, short_id,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusColor {
    Green,
    Yellow,
    Red,
}

impl StatusColor {
    /// The engine reports paused containers as running too.
    fn new(running: bool, paused: bool) -> Self {
        if paused {
            StatusColor::Yellow
        } else if running {
            StatusColor::Green
        } else {
            StatusColor::Red
        }
    }

    pub fn for_container(container: &ContainerSummary) -> Self {
        Self::new(
            container.is_running(),
            container.state.eq_ignore_ascii_case("paused"),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerView {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub status_color: StatusColor,
    pub created: i64,
}

impl From<ContainerSummary> for ContainerView {
    fn from(container: ContainerSummary) -> Self {
        Self {
            name: container.display_name(),
            status_color: StatusColor::for_container(&container),
            id: container.id,
            image: container.image,
            state: container.state,
            status: container.status,
            created: container.created,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageView {
    pub id: String,
    pub short_id: String,
    /// First tag, or `None` for dangling images.
    pub name: String,
    pub tags: Vec<String>,
    pub created: i64,
    pub size: i64,
}

impl From<ImageSummary> for ImageView {
    fn from(image: ImageSummary) -> Self {
        let name = image.primary_tag().unwrap_or("None").to_string();
        let tags = image
            .repo_tags
            .unwrap_or_default()
            .into_iter()
            .filter(|tag| tag != "<none>:<none>")
            .collect();
        Self {
            short_id: short_id(&image.id).to_string(),
            id: image.id,
            name,
            tags,
            created: image.created,
            size: image.size,
        }
    }
}

/// `/containers/{id}`: inspect output, with `ps` rows for running containers.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerDetailsView {
    pub name: String,
    pub status_color: StatusColor,
    pub container: ContainerDetails,
    pub processes: Option<ProcessList>,
}

impl ContainerDetailsView {
    pub fn new(container: ContainerDetails, processes: Option<ProcessList>) -> Self {
        Self {
            name: container.display_name(),
            status_color: StatusColor::new(container.state.running, container.state.paused),
            container,
            processes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageDetailsView {
    pub short_id: String,
    pub name: String,
    pub image: ImageDetails,
}

impl From<ImageDetails> for ImageDetailsView {
    fn from(image: ImageDetails) -> Self {
        let name = image
            .repo_tags
            .iter()
            .flatten()
            .find(|tag| *tag != "<none>:<none>")
            .cloned()
            .unwrap_or_else(|| "None".to_string());
        Self {
            short_id: short_id(&image.id).to_string(),
            name,
            image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeView {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
    pub created_at: Option<String>,
}

impl From<VolumeSummary> for VolumeView {
    fn from(volume: VolumeSummary) -> Self {
        Self {
            name: volume.name,
            driver: volume.driver,
            mountpoint: volume.mountpoint,
            created_at: volume.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub name: String,
    pub server_version: String,
    pub operating_system: String,
    pub containers: i64,
    pub containers_running: i64,
    pub containers_paused: i64,
    pub containers_stopped: i64,
    pub images: i64,
    pub cpus: i64,
    pub memory_bytes: i64,
}

impl From<SystemInfo> for HostInfo {
    fn from(info: SystemInfo) -> Self {
        Self {
            name: info.name,
            server_version: info.server_version,
            operating_system: info.operating_system,
            containers: info.containers,
            containers_running: info.containers_running,
            containers_paused: info.containers_paused,
            containers_stopped: info.containers_stopped,
            images: info.images,
            cpus: info.ncpu,
            memory_bytes: info.mem_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::{container, image};

    #[test]
    fn status_colors_follow_state() {
        let color = |state: &str| StatusColor::for_container(&container("c1", "web", state));
        assert_eq!(color("running"), StatusColor::Green);
        assert_eq!(color("Running"), StatusColor::Green);
        assert_eq!(color("paused"), StatusColor::Yellow);
        assert_eq!(color("exited"), StatusColor::Red);
        assert_eq!(color("restarting"), StatusColor::Red);
    }

    #[test]
    fn paused_details_are_yellow_even_though_running() {
        let mut details = ContainerDetails {
            id: "c1".into(),
            name: "/web".into(),
            ..Default::default()
        };
        details.state.running = true;
        details.state.paused = true;
        let view = ContainerDetailsView::new(details, None);
        assert_eq!(view.name, "web");
        assert_eq!(view.status_color, StatusColor::Yellow);
    }

    #[test]
    fn container_view_uses_the_display_name() {
        let view = ContainerView::from(container("c1", "web", "running"));
        assert_eq!(view.name, "web");
        assert_eq!(view.status_color, StatusColor::Green);
        assert_eq!(
            serde_json::to_value(&view).unwrap()["status_color"],
            serde_json::json!("green")
        );
    }

    #[test]
    fn dangling_images_are_named_none() {
        let view = ImageView::from(image("sha256:0123456789abcdef", &["<none>:<none>"]));
        assert_eq!(view.name, "None");
        assert!(view.tags.is_empty());
        assert_eq!(view.short_id, "0123456789ab");
    }
}
