//! 编排层错误类型
//!
//! 所有失败路径都降级为「少做事」（排队、跳过缓存、不回放），不会让进程崩溃。

use thiserror::Error;

/// 编排核心对外暴露的错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// 主队列已满，任务被丢弃（需要向用户显式报告）
    #[error("Queue full: {max} tasks already waiting")]
    QueueFull { max: usize },

    #[error("Budget slot wait timed out for monitor {monitor_id} after {waited_ms}ms")]
    BudgetTimeout { monitor_id: String, waited_ms: u64 },

    #[error("Budget slot rejected: {0}")]
    BudgetRejected(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// 角色已被占用或池容量耗尽，且没有可降级的路径
    #[error("No agent available for {0}")]
    AgentUnavailable(String),

    #[error("Window not found: {0}")]
    WindowNotFound(String),

    #[error("Cache entry not found: {0}")]
    CacheEntryNotFound(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Shutting down")]
    ShuttingDown,
}

/// AI Provider 会话错误（初始化、传输、中断）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Session not initialized")]
    NotInitialized,

    #[error("Initialize failed: {0}")]
    Initialize(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("No provider available: {0}")]
    Unavailable(String),
}

/// 监视器预算错误：等待超时或被关闭流程拒绝
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BudgetError {
    #[error("Timed out waiting for a task slot (monitor {monitor_id}, {waited_ms}ms)")]
    Timeout { monitor_id: String, waited_ms: u64 },

    #[error("Rejected: {0}")]
    Rejected(String),
}

impl From<BudgetError> for OrchestratorError {
    fn from(err: BudgetError) -> Self {
        match err {
            BudgetError::Timeout { monitor_id, waited_ms } => {
                OrchestratorError::BudgetTimeout { monitor_id, waited_ms }
            }
            BudgetError::Rejected(reason) => OrchestratorError::BudgetRejected(reason),
        }
    }
}
