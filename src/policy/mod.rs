//! 调度策略：监视器预算、窗口关联、主队列

mod budget;
mod main_queue;
mod window_connection;

pub use budget::{BudgetConfig, MonitorBudgetPolicy, MonitorUsage, TaskSlot};
pub use main_queue::MainQueuePolicy;
pub use window_connection::{CloseDecision, WindowConnectionPolicy, WindowGroup};
