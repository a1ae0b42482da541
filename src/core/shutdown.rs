//! 优雅关闭
//!
//! `ShutdownManager` 记录所有存活的连接上下文。收到关闭信号后并发排空它们：
//! 拒绝等待预算槽位的任务，先中断再销毁 Agent，写出回放缓存。
//! 单个连接超过 `drain_timeout` 仍未结束时只记日志，不阻塞其余连接。

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::processor::ConnectionContext;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C 或 /quit
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 输入流结束
    InputClosed,
    FatalError(String),
}

pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
    connections: Mutex<Vec<Arc<ConnectionContext>>>,
    drain_timeout: Duration,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::with_drain_timeout(Duration::from_secs(5))
    }

    pub fn with_drain_timeout(drain_timeout: Duration) -> Self {
        let (reason_tx, _) = broadcast::channel(4);
        Self {
            token: CancellationToken::new(),
            reason_tx,
            connections: Mutex::new(Vec::new()),
            drain_timeout,
        }
    }

    fn connections(&self) -> MutexGuard<'_, Vec<Arc<ConnectionContext>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 跟踪一个连接，关闭时会被排空
    pub fn register(&self, context: Arc<ConnectionContext>) {
        tracing::debug!(connection_id = %context.connection_id, "Connection registered for shutdown");
        self.connections().push(context);
    }

    /// 连接已自行关闭时移除跟踪
    pub fn deregister(&self, connection_id: &str) -> bool {
        let mut connections = self.connections();
        let before = connections.len();
        connections.retain(|c| c.connection_id != connection_id);
        connections.len() != before
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// 用于取消长任务的 token 副本
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发只广播原因
    pub fn trigger(&self, reason: ShutdownReason) {
        tracing::info!(?reason, "Shutdown triggered");
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Ctrl+C 与 SIGTERM 都转换为关闭触发
    pub fn listen_for_signals(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C");
                manager.trigger(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM");
                    manager.trigger(ShutdownReason::Signal);
                }
            });
        }
    }

    /// 并发关闭所有已登记的连接，返回按时完成的数量
    pub async fn drain(&self) -> usize {
        let connections = std::mem::take(&mut *self.connections());
        if connections.is_empty() {
            return 0;
        }
        tracing::info!(count = connections.len(), "Draining connections");

        let timeout = self.drain_timeout;
        let mut set = JoinSet::new();
        for context in connections {
            set.spawn(async move {
                let id = context.connection_id.clone();
                (id, tokio::time::timeout(timeout, context.shutdown()).await.is_ok())
            });
        }

        let mut completed = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, true)) => completed += 1,
                Ok((id, false)) => {
                    tracing::warn!(connection_id = %id, timeout_ms = timeout.as_millis() as u64, "Connection drain timed out")
                }
                Err(e) => tracing::warn!("Connection drain task failed: {}", e),
            }
        }
        tracing::info!(completed, "All connections drained");
        completed
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 运行应用直到其结束或收到关闭信号，随后排空所有连接
pub async fn run_until_shutdown<F>(manager: Arc<ShutdownManager>, app: F)
where
    F: Future<Output = ()>,
{
    manager.listen_for_signals();

    tokio::select! {
        _ = app => tracing::info!("Application finished"),
        _ = manager.cancelled() => tracing::info!("Shutdown signal received"),
    }

    manager.drain().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pool::AgentLimiter;
    use crate::processor::Task;
    use crate::provider::{ProviderKind, ScriptedSessionFactory};

    fn connection(limiter: &AgentLimiter, factory: &Arc<ScriptedSessionFactory>) -> Arc<ConnectionContext> {
        let (context, _rx) = ConnectionContext::new(&AppConfig::default(), limiter.clone(), factory.clone());
        Arc::new(context)
    }

    #[tokio::test]
    async fn test_trigger_cancels_token_and_broadcasts_reason() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        let mut rx = manager.subscribe();
        assert!(!manager.is_triggered());

        manager.trigger(ShutdownReason::FatalError("disk".into()));
        assert!(token.is_cancelled());
        assert!(manager.is_triggered());
        assert_eq!(rx.recv().await.unwrap(), ShutdownReason::FatalError("disk".into()));
    }

    #[tokio::test]
    async fn test_drain_shuts_down_every_registered_connection() {
        let limiter = AgentLimiter::new(4);
        let factory = Arc::new(ScriptedSessionFactory::new(ProviderKind::Claude));
        let manager = ShutdownManager::with_drain_timeout(Duration::from_secs(1));

        let first = connection(&limiter, &factory);
        let second = connection(&limiter, &factory);
        manager.register(Arc::clone(&first));
        manager.register(Arc::clone(&second));
        first.processor().queue_main_task(Task::new("hi", "main")).await.unwrap();
        second.processor().queue_main_task(Task::new("hi", "main")).await.unwrap();
        assert_eq!(limiter.available(), 2);

        assert_eq!(manager.drain().await, 2);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(limiter.available(), 4);
        assert!(first.processor().is_shutting_down());
        assert!(second.processor().is_shutting_down());
    }

    #[tokio::test]
    async fn test_deregistered_connection_is_not_drained() {
        let limiter = AgentLimiter::new(2);
        let factory = Arc::new(ScriptedSessionFactory::new(ProviderKind::Claude));
        let manager = ShutdownManager::new();
        let context = connection(&limiter, &factory);

        manager.register(Arc::clone(&context));
        assert!(manager.deregister(&context.connection_id));
        assert!(!manager.deregister(&context.connection_id));
        assert_eq!(manager.drain().await, 0);
        assert!(!context.processor().is_shutting_down());
    }
}
