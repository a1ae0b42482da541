//! 监视器预算：并发槽位 + 滑动窗口限速
//!
//! 所有非主监视器共享 `max_concurrent` 个槽位；等待者按到达顺序（FIFO）获得释放的槽位，
//! 超时的等待者只拒绝自己。主监视器完全豁免，也不留下任何记录。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::config::BudgetSection;
use crate::core::BudgetError;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub primary_monitor_id: String,
    pub max_concurrent: usize,
    pub slot_timeout: Duration,
    pub max_actions_per_minute: usize,
    pub max_output_bytes_per_minute: usize,
    pub window: Duration,
}

impl From<&BudgetSection> for BudgetConfig {
    fn from(section: &BudgetSection) -> Self {
        Self {
            primary_monitor_id: section.primary_monitor_id.clone(),
            max_concurrent: section.max_concurrent.max(1),
            slot_timeout: Duration::from_secs(section.slot_timeout_secs),
            max_actions_per_minute: section.max_actions_per_minute,
            max_output_bytes_per_minute: section.max_output_bytes_per_minute,
            window: Duration::from_secs(section.window_secs),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self::from(&BudgetSection::default())
    }
}

/// 单个监视器的用量快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorUsage {
    pub running: usize,
    pub actions: usize,
    pub output_bytes: usize,
}

#[derive(Debug, Default)]
struct MonitorRecord {
    running: usize,
    actions: VecDeque<Instant>,
    output: VecDeque<(Instant, usize)>,
}

impl MonitorRecord {
    fn prune(&mut self, window: Duration) {
        let now = Instant::now();
        while self
            .actions
            .front()
            .is_some_and(|t| now.duration_since(*t) > window)
        {
            self.actions.pop_front();
        }
        while self
            .output
            .front()
            .is_some_and(|(t, _)| now.duration_since(*t) > window)
        {
            self.output.pop_front();
        }
    }

    fn output_bytes(&self) -> usize {
        self.output.iter().map(|(_, b)| b).sum()
    }

    fn is_idle(&self) -> bool {
        self.running == 0 && self.actions.is_empty() && self.output.is_empty()
    }
}

struct Waiter {
    id: u64,
    monitor_id: String,
    tx: oneshot::Sender<Result<(), BudgetError>>,
}

#[derive(Default)]
struct BudgetState {
    running: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    monitors: HashMap<String, MonitorRecord>,
}

impl BudgetState {
    /// 清理过期用量；监视器已没有任何用量时删除其记录
    fn pruned(&mut self, monitor_id: &str, window: Duration) -> Option<&mut MonitorRecord> {
        let record = self.monitors.get_mut(monitor_id)?;
        record.prune(window);
        if record.is_idle() {
            self.monitors.remove(monitor_id);
            return None;
        }
        self.monitors.get_mut(monitor_id)
    }
}

/// 排队中的槽位请求；未正常结束就被丢弃时，撤销排队或归还已转交的槽位
struct SlotWait<'a> {
    policy: &'a MonitorBudgetPolicy,
    id: u64,
    monitor_id: &'a str,
    rx: oneshot::Receiver<Result<(), BudgetError>>,
    settled: bool,
}

impl Drop for SlotWait<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = lock(&self.policy.inner.state);
        if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(pos);
            return;
        }
        drop(state);
        // 转交发生在锁内，不在队列里说明结果已经送达
        if let Ok(Ok(())) = self.rx.try_recv() {
            tracing::debug!(monitor_id = self.monitor_id, "Slot granted to a dropped waiter, releasing");
            self.policy.release_slot(self.monitor_id);
        }
    }
}

struct BudgetInner {
    config: BudgetConfig,
    state: Mutex<BudgetState>,
}

#[derive(Clone)]
pub struct MonitorBudgetPolicy {
    inner: Arc<BudgetInner>,
}

/// 已占用的槽位，drop 时归还（主监视器的槽位是空操作）
#[must_use = "dropping the slot releases it immediately"]
pub struct TaskSlot {
    policy: Option<MonitorBudgetPolicy>,
    monitor_id: String,
}

impl TaskSlot {
    pub fn monitor_id(&self) -> &str {
        &self.monitor_id
    }
}

impl std::fmt::Debug for TaskSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSlot").field("monitor_id", &self.monitor_id).finish_non_exhaustive()
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if let Some(policy) = self.policy.take() {
            policy.release_slot(&self.monitor_id);
        }
    }
}

impl MonitorBudgetPolicy {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                config,
                state: Mutex::new(BudgetState::default()),
            }),
        }
    }

    pub fn is_primary(&self, monitor_id: &str) -> bool {
        monitor_id == self.inner.config.primary_monitor_id
    }

    pub fn primary_monitor_id(&self) -> &str {
        &self.inner.config.primary_monitor_id
    }

    fn slot(&self, monitor_id: &str, counted: bool) -> TaskSlot {
        TaskSlot {
            policy: counted.then(|| self.clone()),
            monitor_id: monitor_id.to_string(),
        }
    }

    /// 获取槽位；满时排队等待，超过 `slot_timeout` 失败
    pub async fn acquire_task_slot(&self, monitor_id: &str) -> Result<TaskSlot, BudgetError> {
        if self.is_primary(monitor_id) {
            return Ok(self.slot(monitor_id, false));
        }

        let (id, rx) = {
            let mut state = lock(&self.inner.state);
            if state.running < self.inner.config.max_concurrent {
                state.running += 1;
                state.monitors.entry(monitor_id.to_string()).or_default().running += 1;
                return Ok(self.slot(monitor_id, true));
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.waiters.push_back(Waiter {
                id,
                monitor_id: monitor_id.to_string(),
                tx,
            });
            tracing::debug!(monitor_id, waiting = state.waiters.len(), "Waiting for task slot");
            (id, rx)
        };

        let mut wait = SlotWait {
            policy: self,
            id,
            monitor_id,
            rx,
            settled: false,
        };
        let timeout = self.inner.config.slot_timeout;
        let granted = tokio::select! {
            granted = &mut wait.rx => Some(granted),
            _ = tokio::time::sleep(timeout) => None,
        };
        wait.settled = true;

        match granted {
            Some(Ok(Ok(()))) => Ok(self.slot(monitor_id, true)),
            Some(Ok(Err(e))) => Err(e),
            Some(Err(_)) => Err(BudgetError::Rejected("budget state cleared".to_string())),
            None => {
                let mut state = lock(&self.inner.state);
                if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                    state.waiters.remove(pos);
                    tracing::warn!(monitor_id, timeout_ms = timeout.as_millis() as u64, "Task slot wait timed out");
                    return Err(BudgetError::Timeout {
                        monitor_id: monitor_id.to_string(),
                        waited_ms: timeout.as_millis() as u64,
                    });
                }
                drop(state);
                // 超时与放行同时发生：槽位已经转交给我们
                match wait.rx.try_recv() {
                    Ok(Ok(())) => Ok(self.slot(monitor_id, true)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(BudgetError::Rejected("budget state cleared".to_string())),
                }
            }
        }
    }

    /// 非阻塞版本，仅用于诊断
    pub fn try_acquire_task_slot(&self, monitor_id: &str) -> Option<TaskSlot> {
        if self.is_primary(monitor_id) {
            return Some(self.slot(monitor_id, false));
        }
        let mut state = lock(&self.inner.state);
        if state.running >= self.inner.config.max_concurrent {
            return None;
        }
        state.running += 1;
        state.monitors.entry(monitor_id.to_string()).or_default().running += 1;
        Some(self.slot(monitor_id, true))
    }

    /// 归还槽位：有等待者时直接转交给最早到达的那个
    fn release_slot(&self, monitor_id: &str) {
        let mut state = lock(&self.inner.state);
        if let Some(record) = state.monitors.get_mut(monitor_id) {
            record.running = record.running.saturating_sub(1);
        }
        state.pruned(monitor_id, self.inner.config.window);
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.send(Ok(())).is_ok() {
                state.monitors.entry(waiter.monitor_id).or_default().running += 1;
                return;
            }
        }
        state.running = state.running.saturating_sub(1);
    }

    pub fn record_action(&self, monitor_id: &str) {
        if self.is_primary(monitor_id) {
            return;
        }
        let mut state = lock(&self.inner.state);
        let record = state.monitors.entry(monitor_id.to_string()).or_default();
        record.prune(self.inner.config.window);
        record.actions.push_back(Instant::now());
    }

    pub fn record_output(&self, monitor_id: &str, bytes: usize) {
        if self.is_primary(monitor_id) {
            return;
        }
        let mut state = lock(&self.inner.state);
        let record = state.monitors.entry(monitor_id.to_string()).or_default();
        record.prune(self.inner.config.window);
        record.output.push_back((Instant::now(), bytes));
    }

    /// 窗口内动作数达到上限后返回 false
    pub fn check_action_budget(&self, monitor_id: &str) -> bool {
        if self.is_primary(monitor_id) {
            return true;
        }
        let mut state = lock(&self.inner.state);
        match state.pruned(monitor_id, self.inner.config.window) {
            Some(record) => record.actions.len() < self.inner.config.max_actions_per_minute,
            None => true,
        }
    }

    /// 窗口内输出字节数达到上限后返回 false（调用方负责中断该监视器的 Agent）
    pub fn check_output_budget(&self, monitor_id: &str) -> bool {
        if self.is_primary(monitor_id) {
            return true;
        }
        let mut state = lock(&self.inner.state);
        match state.pruned(monitor_id, self.inner.config.window) {
            Some(record) => record.output_bytes() < self.inner.config.max_output_bytes_per_minute,
            None => true,
        }
    }

    pub fn usage(&self, monitor_id: &str) -> Option<MonitorUsage> {
        let mut state = lock(&self.inner.state);
        let record = state.pruned(monitor_id, self.inner.config.window)?;
        Some(MonitorUsage {
            running: record.running,
            actions: record.actions.len(),
            output_bytes: record.output_bytes(),
        })
    }

    pub fn running(&self) -> usize {
        lock(&self.inner.state).running
    }

    /// 仍有用量记录的监视器数
    pub fn tracked_monitors(&self) -> usize {
        lock(&self.inner.state).monitors.len()
    }

    pub fn waiting(&self) -> usize {
        lock(&self.inner.state).waiters.len()
    }

    /// 重置全部状态；仍在等待的调用会以 Rejected 结束
    pub fn clear(&self) {
        let mut state = lock(&self.inner.state);
        *state = BudgetState::default();
    }

    /// 用给定错误拒绝所有等待者（关闭流程使用）
    pub fn clear_waiting(&self, error: BudgetError) {
        let waiters = std::mem::take(&mut lock(&self.inner.state).waiters);
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.tx.send(Err(error.clone()));
        }
        if count > 0 {
            tracing::info!(count, "Rejected waiting budget slots: {}", error);
        }
    }
}
