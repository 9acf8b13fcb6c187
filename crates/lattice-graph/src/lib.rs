pub mod memory;
pub mod merge;
mod query;
pub mod store;

pub use memory::MemoryGraphStore;
pub use store::Neo4jGraphStore;
