pub mod embedding_worker;
pub mod llm_worker;
pub mod relation_worker;

pub use embedding_worker::EmbeddingWorker;
pub use llm_worker::LlmWorker;
pub use relation_worker::RelationWorker;
