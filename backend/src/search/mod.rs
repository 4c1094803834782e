//! Ephemeral full-text search over container and image metadata.

mod builder;
mod document;
mod index;
mod resolver;

pub use builder::IndexBuilder;
pub use document::ResourceKind;
pub use index::SharedIndex;
pub use resolver::QueryResolver;
