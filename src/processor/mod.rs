//! 任务处理：任务模型、prompt 构建、派发状态机、单连接上下文

pub mod context;
pub mod processor;
pub mod prompt;
pub mod task;

pub use context::ConnectionContext;
pub use processor::{DispatchOutcome, ProcessorConfig, ProcessorEvent, ProcessorParts, TaskProcessor};
pub use prompt::{build_prompt, format_cache_hints, PromptParts};
pub use task::Task;
