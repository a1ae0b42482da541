//! AI Provider 端口
//!
//! 传输层是黑盒：核心只通过 `AgentSession` 初始化、发消息、中断、清理。
//! `mock` 提供脚本化实现，供测试与本地演示使用。

mod factory;
pub mod mock;
mod parser;
mod traits;

pub use factory::{select_factory, ProviderKind};
pub use mock::{ScriptedSession, ScriptedSessionFactory};
pub use parser::extract_actions;
pub use traits::{
    ActionKind, AgentSession, MessageOptions, SessionEvent, SessionFactory, SteerOutcome, UiAction,
};
