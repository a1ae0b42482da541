//! 单连接上下文：持有一条连接所需的全部编排组件
//!
//! 组件都在这里显式构建并注入处理器，连接之间互不共享状态；
//! 只有 `AgentLimiter` 是进程级共享的。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cache::{CacheConfig, ReloadCache};
use crate::config::AppConfig;
use crate::memory::{ContextTape, InteractionTimeline};
use crate::policy::{BudgetConfig, MainQueuePolicy, MonitorBudgetPolicy, WindowConnectionPolicy};
use crate::pool::{AgentLimiter, AgentPool, PoolConfig};
use crate::provider::SessionFactory;
use crate::windows::WindowRegistry;

use super::processor::{ProcessorConfig, ProcessorEvent, ProcessorParts, TaskProcessor};

pub struct ConnectionContext {
    pub connection_id: String,
    processor: TaskProcessor,
    pool: AgentPool,
    budget: MonitorBudgetPolicy,
    registry: Arc<WindowRegistry>,
    cache: Arc<ReloadCache>,
}

impl ConnectionContext {
    /// 按配置构建；配置了缓存路径时从磁盘加载回放缓存（需在 tokio runtime 内调用）
    pub fn new(
        config: &AppConfig,
        limiter: AgentLimiter,
        factory: Arc<dyn SessionFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<ProcessorEvent>) {
        let pool = AgentPool::new(
            factory,
            limiter,
            PoolConfig {
                max_agents: config.pool.max_agents,
                idle_timeout: config.pool.idle_timeout(),
                system_prompt: config.provider.system_prompt.clone(),
            },
        );
        let budget = MonitorBudgetPolicy::new(BudgetConfig::from(&config.budget));
        let registry = Arc::new(WindowRegistry::new());
        let cache_config = CacheConfig::from(&config.cache);
        let cache = Arc::new(match &config.cache.path {
            Some(path) => ReloadCache::open(
                cache_config,
                path.clone(),
                Duration::from_millis(config.cache.debounce_ms),
            ),
            None => ReloadCache::new(cache_config),
        });

        let (processor, events) = TaskProcessor::new(ProcessorParts {
            pool: pool.clone(),
            budget: budget.clone(),
            registry: Arc::clone(&registry),
            cache: Arc::clone(&cache),
            queue: MainQueuePolicy::new(config.queue.max_size),
            tape: ContextTape::new(config.tape.max_main_messages),
            timeline: InteractionTimeline::new(),
            windows: WindowConnectionPolicy::new(),
            config: ProcessorConfig {
                cache_hint_limit: config.cache.hint_limit,
                ..ProcessorConfig::default()
            },
        });

        let connection_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(connection_id = %connection_id, max_agents = config.pool.max_agents, "Connection context created");
        (
            Self {
                connection_id,
                processor,
                pool,
                budget,
                registry,
                cache,
            },
            events,
        )
    }

    pub fn processor(&self) -> &TaskProcessor {
        &self.processor
    }

    pub fn pool(&self) -> &AgentPool {
        &self.pool
    }

    pub fn budget(&self) -> &MonitorBudgetPolicy {
        &self.budget
    }

    pub fn registry(&self) -> &Arc<WindowRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ReloadCache> {
        &self.cache
    }

    /// 连接断开：拒绝等待中的槽位、清理 Agent 池、写出缓存
    pub async fn shutdown(&self) {
        tracing::info!(connection_id = %self.connection_id, "Shutting down connection context");
        self.processor.shutdown().await;
    }
}
