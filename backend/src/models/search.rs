use serde::{Deserialize, Serialize};

use crate::search::ResourceKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedResult {
    pub id: String,
    pub display_name: String,
    pub kind: ResourceKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: Option<String>,
    /// Raw index match count; may exceed the resolved results.
    pub hits: u64,
    pub containers: Vec<ResolvedResult>,
    pub images: Vec<ResolvedResult>,
}
