use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::runtime::{ContainerSummary, ImageSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Container,
    Image,
}

impl ResourceKind {
    /// Name of the sub-index holding documents of this kind.
    pub const fn index_name(self) -> &'static str {
        match self {
            ResourceKind::Container => "containers",
            ResourceKind::Image => "images",
        }
    }

    pub fn from_index_name(name: &str) -> Option<Self> {
        match name {
            "containers" => Some(ResourceKind::Container),
            "images" => Some(ResourceKind::Image),
            _ => None,
        }
    }
}

/// Searchable projection of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDocument {
    pub id: String,
    pub kind: ResourceKind,
    pub fields: BTreeMap<String, String>,
}

impl ResourceDocument {
    pub fn from_container(container: &ContainerSummary) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), container.id.clone());
        fields.insert("name".to_string(), container.display_name());
        fields.insert("image".to_string(), container.image.clone());
        fields.insert("state".to_string(), container.state.clone());
        fields.insert("status".to_string(), container.status.clone());
        fields.insert("command".to_string(), container.command.clone());
        insert_labels(&mut fields, container.labels.as_ref());

        Self {
            id: container.id.clone(),
            kind: ResourceKind::Container,
            fields,
        }
    }

    pub fn from_image(image: &ImageSummary) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), image.id.clone());
        fields.insert(
            "tags".to_string(),
            image.repo_tags.iter().flatten().cloned().collect::<Vec<_>>().join(" "),
        );
        fields.insert(
            "digests".to_string(),
            image
                .repo_digests
                .iter()
                .flatten()
                .cloned()
                .collect::<Vec<_>>()
                .join(" "),
        );
        insert_labels(&mut fields, image.labels.as_ref());

        Self {
            id: image.id.clone(),
            kind: ResourceKind::Image,
            fields,
        }
    }
}

fn insert_labels(fields: &mut BTreeMap<String, String>, labels: Option<&BTreeMap<String, String>>) {
    for (key, value) in labels.into_iter().flatten() {
        fields.insert(format!("label.{key}"), format!("{key} {value}"));
    }
}
