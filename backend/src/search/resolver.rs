use std::{collections::HashMap, sync::Arc};

use tracing::{debug, warn};

use super::{
    document::ResourceKind,
    index::{SearchHit, SharedIndex},
};
use crate::{
    error::AppError,
    models::search::{ResolvedResult, SearchResponse},
    runtime::short_id,
    snapshot::SnapshotProvider,
};

pub const MAX_QUERY_LEN: usize = 512;

/// Answers queries from the published index, then re-reads every hit from
/// the runtime so results describe live resources only.
pub struct QueryResolver {
    index: SharedIndex,
    snapshots: Arc<SnapshotProvider>,
    max_hits: usize,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct PartitionedHits {
    containers: Vec<String>,
    images: Vec<String>,
}

impl QueryResolver {
    pub fn new(index: SharedIndex, snapshots: Arc<SnapshotProvider>, max_hits: usize) -> Self {
        Self {
            index,
            snapshots,
            max_hits,
        }
    }

    pub async fn search(&self, query: &str) -> Result<SearchResponse, AppError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(SearchResponse::default());
        }
        if query.len() > MAX_QUERY_LEN {
            return Err(AppError::Query(format!(
                "query is {} bytes, the limit is {MAX_QUERY_LEN}",
                query.len()
            )));
        }

        let index = self.index.current();
        let results = index.search(query, self.max_hits)?;
        debug!(
            query,
            generation = index.generation(),
            total = results.total,
            "index searched"
        );

        let partitioned = partition_hits(&results.hits);
        let (containers, images) = tokio::try_join!(
            self.resolve_containers(&partitioned.containers),
            self.resolve_images(&partitioned.images),
        )?;

        Ok(SearchResponse {
            query: Some(query.to_string()),
            hits: results.total as u64,
            containers,
            images,
        })
    }

    async fn resolve_containers(&self, ids: &[String]) -> Result<Vec<ResolvedResult>, AppError> {
        let live: HashMap<String, String> = self
            .snapshots
            .containers_by_id(ids)
            .await?
            .into_iter()
            .map(|container| {
                let name = container.display_name();
                (container.id, name)
            })
            .collect();
        Ok(in_hit_order(ids, &live, ResourceKind::Container))
    }

    async fn resolve_images(&self, ids: &[String]) -> Result<Vec<ResolvedResult>, AppError> {
        let live: HashMap<String, String> = self
            .snapshots
            .images_by_id(ids)
            .await?
            .into_iter()
            .map(|image| {
                let name = image
                    .primary_tag()
                    .map(str::to_string)
                    .unwrap_or_else(|| short_id(&image.id).to_string());
                (image.id, name)
            })
            .collect();
        Ok(in_hit_order(ids, &live, ResourceKind::Image))
    }
}

fn partition_hits(hits: &[SearchHit]) -> PartitionedHits {
    let mut partitioned = PartitionedHits::default();
    for hit in hits {
        match hit.kind() {
            Some(ResourceKind::Container) => partitioned.containers.push(hit.id.clone()),
            Some(ResourceKind::Image) => partitioned.images.push(hit.id.clone()),
            None => warn!(index = %hit.index, id = %hit.id, "dropping hit from unknown index"),
        }
    }
    partitioned
}

fn in_hit_order(
    ids: &[String],
    live: &HashMap<String, String>,
    kind: ResourceKind,
) -> Vec<ResolvedResult> {
    ids.iter()
        .filter_map(|id| match live.get(id) {
            Some(name) => Some(ResolvedResult {
                id: id.clone(),
                display_name: name.clone(),
                kind,
            }),
            None => {
                debug!(id = %id, ?kind, "indexed resource is gone");
                None
            }
        })
        .collect()
}
