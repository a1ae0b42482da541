//! 核心：错误类型与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{BudgetError, OrchestratorError, ProviderError};
pub use shutdown::{ShutdownManager, ShutdownReason};
