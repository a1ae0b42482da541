//! 记忆层：交互时间线（注入主 Agent prompt）与上下文磁带（主线程/窗口线程对话）

pub mod tape;
pub mod timeline;

pub use tape::{ContextTape, TapeMessage, TapeRole, TapeSource};
pub use timeline::{
    format_entries, summarize_actions, EntryKind, InteractionTimeline, TimelineEntry,
    UserInteraction,
};
