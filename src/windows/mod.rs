//! 窗口状态

pub mod registry;

pub use registry::{AppCommand, ApplyOutcome, WindowInfo, WindowRegistry, WindowStore};
