pub mod qdrant;

pub use qdrant::QdrantChunkStore;
