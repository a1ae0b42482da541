//! 单连接的 Agent 池
//!
//! 按角色借出/归还 `PooledAgent`；空闲的 Agent 在超时后回收（0 号 Agent 与池中最后一个 Agent 除外）。
//! 创建受两层约束：池容量 `max_agents` 与进程级 `AgentLimiter`。

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::OwnedSemaphorePermit;
use tokio::task::AbortHandle;

use crate::provider::{AgentSession, SessionFactory};

use super::{AgentLimiter, Role};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct AgentState {
    current_role: Option<Role>,
    last_used: Instant,
    idle_timer: Option<AbortHandle>,
    permit: Option<OwnedSemaphorePermit>,
}

/// 池中的一个 Agent：会话 + 角色 + 空闲计时器 + 全局许可
pub struct PooledAgent {
    pub id: u64,
    pub instance_id: String,
    session: Arc<dyn AgentSession>,
    state: Mutex<AgentState>,
}

impl PooledAgent {
    fn new(id: u64, session: Arc<dyn AgentSession>, permit: OwnedSemaphorePermit, role: Option<Role>) -> Self {
        Self {
            id,
            instance_id: uuid::Uuid::new_v4().to_string(),
            session,
            state: Mutex::new(AgentState {
                current_role: role,
                last_used: Instant::now(),
                idle_timer: None,
                permit: Some(permit),
            }),
        }
    }

    pub fn session(&self) -> &Arc<dyn AgentSession> {
        &self.session
    }

    pub fn current_role(&self) -> Option<Role> {
        lock(&self.state).current_role.clone()
    }

    pub fn last_used(&self) -> Instant {
        lock(&self.state).last_used
    }

    /// 既没有角色，会话也不在运行
    pub fn is_idle(&self) -> bool {
        lock(&self.state).current_role.is_none() && !self.session.is_running()
    }

    pub fn has_idle_timer(&self) -> bool {
        lock(&self.state).idle_timer.is_some()
    }

    fn holds(&self, role: &Role) -> bool {
        lock(&self.state).current_role.as_ref() == Some(role)
    }

    fn claim(&self, role: Role) {
        let mut state = lock(&self.state);
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        state.current_role = Some(role);
        state.last_used = Instant::now();
    }

    /// 取出全局许可与计时器，准备销毁
    fn retire(&self, abort_timer: bool) -> Option<OwnedSemaphorePermit> {
        let mut state = lock(&self.state);
        if let Some(timer) = state.idle_timer.take() {
            if abort_timer {
                timer.abort();
            }
        }
        state.current_role = None;
        state.permit.take()
    }
}

impl std::fmt::Debug for PooledAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledAgent")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("state", &self.state)
            .finish()
    }
}

/// 池统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total_agents: usize,
    pub idle_agents: usize,
    pub busy_agents: usize,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_agents: usize,
    pub idle_timeout: Duration,
    pub system_prompt: String,
}

#[derive(Default)]
struct PoolState {
    agents: Vec<Arc<PooledAgent>>,
    next_id: u64,
    /// 正在初始化、尚未注册的 Agent 数
    creating: usize,
    /// 正在初始化的 Agent 预占的角色
    pending_roles: HashSet<Role>,
}

impl PoolState {
    /// 角色已被某个 Agent 持有，或正被初始化中的 Agent 预占
    fn role_taken(&self, role: &Role) -> bool {
        self.pending_roles.contains(role) || self.agents.iter().any(|a| a.holds(role))
    }
}

struct PoolInner {
    factory: Arc<dyn SessionFactory>,
    limiter: AgentLimiter,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

/// Agent 池（可廉价克隆，内部共享）
#[derive(Clone)]
pub struct AgentPool {
    inner: Arc<PoolInner>,
}

impl AgentPool {
    pub fn new(factory: Arc<dyn SessionFactory>, limiter: AgentLimiter, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                limiter,
                config,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// 创建并初始化一个空闲 Agent；容量或全局许可耗尽、初始化失败时返回 None
    pub async fn create_agent(&self) -> Option<Arc<PooledAgent>> {
        self.create_with_role(None).await
    }

    /// 新建一个直接持有角色的 Agent，不复用空闲的（一次性 Agent 用完即销毁）
    pub async fn create_for(&self, role: Role) -> Option<Arc<PooledAgent>> {
        self.create_with_role(Some(role)).await
    }

    /// 角色检查、容量检查与预占在同一把锁内完成；初始化期间角色保持预占
    async fn create_with_role(&self, role: Option<Role>) -> Option<Arc<PooledAgent>> {
        {
            let mut state = lock(&self.inner.state);
            if let Some(role) = &role {
                if state.role_taken(role) {
                    tracing::debug!(role = %role, "Role already held or being created");
                    return None;
                }
            }
            if state.agents.len() + state.creating >= self.inner.config.max_agents {
                tracing::debug!(max = self.inner.config.max_agents, "Agent pool at capacity");
                return None;
            }
            state.creating += 1;
            if let Some(role) = &role {
                state.pending_roles.insert(role.clone());
            }
        }

        let agent = self.spawn_session(role.clone()).await;
        let mut state = lock(&self.inner.state);
        state.creating -= 1;
        if let Some(role) = &role {
            state.pending_roles.remove(role);
        }
        let (session, permit, role) = agent?;
        let id = state.next_id;
        state.next_id += 1;
        let agent = Arc::new(PooledAgent::new(id, session, permit, role));
        state.agents.push(Arc::clone(&agent));
        tracing::info!(agent_id = id, total = state.agents.len(), "Agent created");
        Some(agent)
    }

    /// 先拿全局许可，再初始化会话；任何失败都归还许可
    async fn spawn_session(
        &self,
        role: Option<Role>,
    ) -> Option<(Arc<dyn AgentSession>, OwnedSemaphorePermit, Option<Role>)> {
        let Some(permit) = self.inner.limiter.try_acquire() else {
            tracing::warn!(
                max = self.inner.limiter.max(),
                "Global agent limit reached, cannot create agent"
            );
            return None;
        };

        let session = self.inner.factory.create_session(&self.inner.config.system_prompt);
        match session.initialize().await {
            Ok(true) => Some((session, permit, role)),
            Ok(false) => {
                tracing::warn!("Agent session declined to initialize");
                None
            }
            Err(e) => {
                tracing::warn!("Agent session initialize failed: {}", e);
                None
            }
        }
    }

    /// 第一个（id 最小）空闲 Agent
    pub fn find_idle(&self) -> Option<Arc<PooledAgent>> {
        lock(&self.inner.state)
            .agents
            .iter()
            .find(|a| a.is_idle())
            .cloned()
    }

    /// 按角色借出 Agent：优先复用空闲的，否则在容量内新建，否则 None（由调用方排队或降级）
    pub async fn acquire(&self, role: Role) -> Option<Arc<PooledAgent>> {
        {
            let state = lock(&self.inner.state);
            if state.role_taken(&role) {
                tracing::warn!(role = %role, "Role already held by another agent");
                return None;
            }
            if let Some(agent) = state.agents.iter().find(|a| a.is_idle()) {
                agent.claim(role.clone());
                tracing::debug!(agent_id = agent.id, role = %role, "Reusing idle agent");
                return Some(Arc::clone(agent));
            }
        }
        let agent = self.create_with_role(Some(role.clone())).await?;
        tracing::debug!(agent_id = agent.id, role = %role, "Acquired new agent");
        Some(agent)
    }

    /// 归还 Agent：清除角色，必要时启动空闲回收计时器
    pub fn release(&self, agent: &Arc<PooledAgent>) {
        let schedule = {
            let state = lock(&self.inner.state);
            let mut agent_state = lock(&agent.state);
            agent_state.current_role = None;
            agent_state.last_used = Instant::now();
            agent.id != 0
                && state.agents.len() > 1
                && state.agents.iter().any(|a| Arc::ptr_eq(a, agent))
        };
        if schedule {
            self.schedule_eviction(agent);
        }
    }

    fn schedule_eviction(&self, agent: &Arc<PooledAgent>) {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let agent_id = agent.id;
        let timeout = self.inner.config.idle_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                AgentPool { inner }.evict_if_idle(agent_id).await;
            }
        });

        let mut state = lock(&agent.state);
        if let Some(previous) = state.idle_timer.replace(handle.abort_handle()) {
            previous.abort();
        }
    }

    async fn evict_if_idle(&self, agent_id: u64) {
        let evicted = {
            let mut state = lock(&self.inner.state);
            let Some(pos) = state.agents.iter().position(|a| a.id == agent_id) else {
                return;
            };
            if !state.agents[pos].is_idle() || state.agents.len() <= 1 {
                return;
            }
            state.agents.remove(pos)
        };
        // 计时器任务自己在执行回收，不能 abort 自己
        let permit = evicted.retire(false);
        evicted.session.cleanup().await;
        drop(permit);
        tracing::info!(agent_id, "Evicted idle agent");
    }

    pub fn get_by_role(&self, role: &Role) -> Option<Arc<PooledAgent>> {
        lock(&self.inner.state)
            .agents
            .iter()
            .find(|a| a.holds(role))
            .cloned()
    }

    /// 是否有 Agent 的角色满足条件
    pub fn any_role(&self, pred: impl Fn(&Role) -> bool) -> bool {
        lock(&self.inner.state)
            .agents
            .iter()
            .any(|a| a.current_role().as_ref().is_some_and(&pred))
    }

    /// 中断持有该角色的 Agent；没有则返回 false
    pub async fn interrupt_by_role(&self, role: &Role) -> bool {
        let Some(agent) = self.get_by_role(role) else {
            return false;
        };
        if let Err(e) = agent.session.interrupt().await {
            tracing::warn!(agent_id = agent.id, role = %role, "Interrupt failed: {}", e);
        } else {
            tracing::info!(agent_id = agent.id, role = %role, "Agent interrupted");
        }
        true
    }

    /// 从池中移除并销毁指定 Agent
    pub async fn dispose(&self, agent_id: u64) -> bool {
        let removed = {
            let mut state = lock(&self.inner.state);
            state
                .agents
                .iter()
                .position(|a| a.id == agent_id)
                .map(|pos| state.agents.remove(pos))
        };
        let Some(agent) = removed else {
            return false;
        };
        let permit = agent.retire(true);
        if agent.session.is_running() {
            if let Err(e) = agent.session.interrupt().await {
                tracing::warn!(agent_id, "Interrupt before dispose failed: {}", e);
            }
        }
        agent.session.cleanup().await;
        drop(permit);
        tracing::info!(agent_id, "Agent disposed");
        true
    }

    pub async fn dispose_by_role(&self, role: &Role) -> bool {
        match self.get_by_role(role) {
            Some(agent) => self.dispose(agent.id).await,
            None => false,
        }
    }

    /// 两阶段清理：先中断所有会话，再逐个销毁并归还许可
    pub async fn cleanup(&self) {
        let agents = std::mem::take(&mut lock(&self.inner.state).agents);
        if agents.is_empty() {
            return;
        }
        let permits: Vec<_> = agents.iter().map(|a| a.retire(true)).collect();

        for agent in &agents {
            if let Err(e) = agent.session.interrupt().await {
                tracing::warn!(agent_id = agent.id, "Interrupt during cleanup failed: {}", e);
            }
        }
        for agent in &agents {
            agent.session.cleanup().await;
        }
        drop(permits);
        tracing::info!(count = agents.len(), "Agent pool cleaned up");
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.inner.state);
        let idle = state.agents.iter().filter(|a| a.is_idle()).count();
        PoolStats {
            total_agents: state.agents.len(),
            idle_agents: idle,
            busy_agents: state.agents.len() - idle,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.state).agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
