//! 进程级 Agent 数量限制，所有连接的池共享
//!
//! 每个池化 Agent 持有一个许可，销毁时归还。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct AgentLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl AgentLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// 非阻塞获取；耗尽时立即返回 None
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.max - self.available()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}
