pub mod resources;
pub mod search;
