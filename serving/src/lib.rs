pub mod batch;
pub mod block;
pub mod block_allocator;
pub mod block_manager;
pub mod config;
pub mod llm_engine;
pub mod llm_service;
pub mod model_executor;
pub mod policy;
pub mod scheduler;
pub mod sequence;
pub mod types;
pub mod validation;

#[cfg(test)]
pub mod tests;

pub use batch::{BatchDescriptor, SequenceMetadata};
pub use config::{CacheConfig, SchedulerConfig, ServiceConfig};
pub use llm_engine::StreamResponse;
pub use llm_service::{LlmService, LlmServiceError, RequestHandle, ShutdownPolicy};
pub use model_executor::{ModelExecutor, ModelExecutorError};
pub use scheduler::{PreemptionMode, SchedulerSnapshot};
pub use sequence::{FinishReason, SequenceOutput};
pub use types::GenerateParameters;
