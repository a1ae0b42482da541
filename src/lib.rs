//! AgentDesk - AI 桌面 Agent 编排核心
//!
//! 模块划分：
//! - **provider**: AI Provider 会话端口、事件流、Provider 选择、动作块解析
//! - **pool**: 单连接 Agent 池、角色、进程级 Agent 上限
//! - **policy**: 监视器预算、窗口分组、主队列
//! - **memory**: 交互时间线、上下文磁带
//! - **cache**: 回放缓存（指纹、精确/模糊匹配、防抖落盘）
//! - **windows**: 窗口状态登记表（按窗口加锁）
//! - **processor**: 任务派发状态机与单连接上下文
//! - **core**: 错误类型、优雅关闭
//! - **config**: 应用配置加载（TOML + 环境变量）

pub mod cache;
pub mod config;
pub mod core;
pub mod memory;
pub mod observability;
pub mod policy;
pub mod pool;
pub mod processor;
pub mod provider;
pub mod windows;

pub use processor::{ConnectionContext, DispatchOutcome, ProcessorEvent, Task, TaskProcessor};
