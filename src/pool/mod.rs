//! Agent 池：会话复用、角色分配、空闲回收与全局数量限制

mod agent_pool;
mod limiter;
mod role;

pub use agent_pool::{AgentPool, PoolConfig, PoolStats, PooledAgent};
pub use limiter::AgentLimiter;
pub use role::Role;
