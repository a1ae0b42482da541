//! 回放缓存：记住成功任务产出的 UI 动作，命中时直接重放而不必再跑 Agent
//!
//! - 精确命中（同一指纹键）O(1) 查找，相似度 1.0
//! - 模糊命中：词集相似度严格大于阈值，按相似度降序
//! - 淘汰：先清掉超过 TTL 的条目，再按最近使用时间裁剪到容量上限
//! - 失败率 > 50% 且至少 3 次尝试的条目被移除

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::fingerprint::Fingerprint;
use super::persistence::{load_snapshot, CachePersister};
use crate::config::CacheSection;
use crate::core::OrchestratorError;
use crate::provider::UiAction;

const MIN_ATTEMPTS_FOR_FAILURE_EVICTION: u32 = 3;
const MAX_FAILURE_RATE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub id: String,
    pub fingerprint: Fingerprint,
    pub actions: Vec<UiAction>,
    pub label: String,
    /// 毫秒时间戳
    pub created_at: i64,
    pub last_used_at: i64,
    pub use_count: u32,
    pub failure_count: u32,
    /// 重放前必须存在的窗口
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_window_ids: Vec<String>,
}

impl CacheEntry {
    fn should_evict_for_failures(&self) -> bool {
        let attempts = self.use_count + self.failure_count;
        attempts >= MIN_ATTEMPTS_FOR_FAILURE_EVICTION
            && self.failure_count as f64 / attempts as f64 > MAX_FAILURE_RATE
    }
}

/// 磁盘格式 `{ "entries": [...], "idCounter": n }`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    pub entries: Vec<CacheEntry>,
    pub id_counter: u64,
}

#[derive(Debug, Clone)]
pub struct CacheMatch {
    pub entry: CacheEntry,
    pub similarity: f64,
    pub exact: bool,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
    pub similarity_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&CacheSection::default())
    }
}

impl From<&CacheSection> for CacheConfig {
    fn from(section: &CacheSection) -> Self {
        Self {
            ttl: section.ttl(),
            max_entries: section.max_entries,
            similarity_threshold: section.similarity_threshold,
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// 指纹键 -> 条目 ID
    by_key: HashMap<String, String>,
    id_counter: u64,
}

impl CacheState {
    fn from_snapshot(snapshot: CacheSnapshot) -> Self {
        let mut state = Self {
            id_counter: snapshot.id_counter,
            ..Default::default()
        };
        for entry in snapshot.entries {
            state.insert(entry);
        }
        state
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.by_key.insert(entry.fingerprint.key(), entry.id.clone());
        self.entries.insert(entry.id.clone(), entry);
    }

    fn remove(&mut self, id: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(id)?;
        let key = entry.fingerprint.key();
        if self.by_key.get(&key).map(String::as_str) == Some(id) {
            self.by_key.remove(&key);
        }
        Some(entry)
    }

    fn sorted_entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        entries
    }

    fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            entries: self.sorted_entries(),
            id_counter: self.id_counter,
        }
    }
}

pub struct ReloadCache {
    state: Mutex<CacheState>,
    config: CacheConfig,
    persister: Option<CachePersister>,
}

impl ReloadCache {
    /// 纯内存缓存
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            config,
            persister: None,
        }
    }

    /// 从文件加载并启用防抖落盘；文件缺失或损坏时从空缓存开始。需在 tokio runtime 内调用
    pub fn open(config: CacheConfig, path: PathBuf, debounce: Duration) -> Self {
        let state = match load_snapshot(&path) {
            Ok(Some(snapshot)) => {
                tracing::info!(path = %path.display(), entries = snapshot.entries.len(), "Reload cache loaded");
                CacheState::from_snapshot(snapshot)
            }
            Ok(None) => CacheState::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to load reload cache, starting empty: {}", e);
                CacheState::default()
            }
        };
        let (persister, _handle) = CachePersister::spawn(path, debounce);
        let cache = Self {
            state: Mutex::new(state),
            config,
            persister: Some(persister),
        };
        {
            let mut state = cache.lock();
            if cache.evict(&mut state, None) > 0 {
                cache.schedule_save(&state);
            }
        }
        cache
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_save(&self, state: &CacheState) {
        if let Some(persister) = &self.persister {
            persister.schedule(state.snapshot());
        }
    }

    /// 记录一次成功任务；同指纹已存在时原地刷新动作、标签与使用时间。返回条目 ID
    pub fn record(
        &self,
        fingerprint: Fingerprint,
        actions: Vec<UiAction>,
        label: impl Into<String>,
        required_window_ids: Vec<String>,
    ) -> String {
        let now = Utc::now().timestamp_millis();
        let label = label.into();
        let mut state = self.lock();

        let key = fingerprint.key();
        let existing = state.by_key.get(&key).cloned();
        let id = match existing.and_then(|id| state.entries.get_mut(&id)) {
            Some(entry) => {
                entry.actions = actions;
                entry.label = label;
                entry.last_used_at = now;
                entry.required_window_ids = required_window_ids;
                entry.id.clone()
            }
            None => {
                state.id_counter += 1;
                let id = format!("cache-{}", state.id_counter);
                state.insert(CacheEntry {
                    id: id.clone(),
                    fingerprint,
                    actions,
                    label,
                    created_at: now,
                    last_used_at: now,
                    use_count: 0,
                    failure_count: 0,
                    required_window_ids,
                });
                self.evict(&mut state, Some(&id));
                id
            }
        };
        self.schedule_save(&state);
        tracing::debug!(id = %id, entries = state.entries.len(), "Reload cache entry recorded");
        id
    }

    /// 先精确后模糊，最多 `limit` 条
    pub fn find_matches(&self, fingerprint: &Fingerprint, limit: usize) -> Vec<CacheMatch> {
        if limit == 0 {
            return Vec::new();
        }
        let state = self.lock();
        let mut matches = Vec::new();

        let exact_id = state.by_key.get(&fingerprint.key()).cloned();
        if let Some(entry) = exact_id.as_ref().and_then(|id| state.entries.get(id)) {
            matches.push(CacheMatch {
                entry: entry.clone(),
                similarity: 1.0,
                exact: true,
            });
        }

        let mut fuzzy: Vec<CacheMatch> = state
            .entries
            .values()
            .filter(|entry| Some(&entry.id) != exact_id.as_ref())
            .filter_map(|entry| {
                let similarity = fingerprint.similarity(&entry.fingerprint);
                (similarity > self.config.similarity_threshold).then(|| CacheMatch {
                    entry: entry.clone(),
                    similarity,
                    exact: false,
                })
            })
            .collect();
        fuzzy.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| b.entry.last_used_at.cmp(&a.entry.last_used_at))
        });

        matches.extend(fuzzy);
        matches.truncate(limit);
        matches
    }

    /// 成功重放
    pub fn mark_used(&self, id: &str) -> Result<(), OrchestratorError> {
        let mut state = self.lock();
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::CacheEntryNotFound(id.to_string()))?;
        entry.use_count += 1;
        entry.last_used_at = Utc::now().timestamp_millis();
        self.schedule_save(&state);
        Ok(())
    }

    /// 重放失败；返回条目是否因失败率过高被移除
    pub fn mark_failed(&self, id: &str) -> Result<bool, OrchestratorError> {
        let mut state = self.lock();
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::CacheEntryNotFound(id.to_string()))?;
        entry.failure_count += 1;
        let evict = entry.should_evict_for_failures();
        if evict {
            state.remove(id);
            tracing::info!(id, "Reload cache entry removed after repeated failures");
        }
        self.schedule_save(&state);
        Ok(evict)
    }

    /// 移除依赖该窗口的条目，返回移除数
    pub fn invalidate_for_window(&self, window_id: &str) -> usize {
        let mut state = self.lock();
        let doomed: Vec<String> = state
            .entries
            .values()
            .filter(|entry| entry.required_window_ids.iter().any(|w| w == window_id))
            .map(|entry| entry.id.clone())
            .collect();
        for id in &doomed {
            state.remove(id);
        }
        if !doomed.is_empty() {
            self.schedule_save(&state);
            tracing::debug!(window_id, removed = doomed.len(), "Reload cache invalidated for window");
        }
        doomed.len()
    }

    pub fn get(&self, id: &str) -> Option<CacheEntry> {
        self.lock().entries.get(id).cloned()
    }

    /// 按创建时间排序
    pub fn list_entries(&self) -> Vec<CacheEntry> {
        self.lock().sorted_entries()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 立即写出待写快照（纯内存缓存为空操作）
    pub async fn flush(&self) {
        if let Some(persister) = &self.persister {
            persister.flush().await;
        }
    }

    /// 返回淘汰条数；`keep` 为刚插入的条目，容量裁剪时不会淘汰它
    fn evict(&self, state: &mut CacheState, keep: Option<&str>) -> usize {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(self.config.ttl.as_millis()).unwrap_or(i64::MAX);
        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|entry| now.saturating_sub(entry.created_at) > ttl_ms)
            .map(|entry| entry.id.clone())
            .collect();
        let mut removed = expired.len();
        for id in &expired {
            state.remove(id);
        }

        if state.entries.len() > self.config.max_entries {
            // 同一毫秒内的条目按分配序号排，"cache-10" 不能排在 "cache-9" 前面
            let mut by_use: Vec<(i64, u64, String)> = state
                .entries
                .values()
                .filter(|entry| Some(entry.id.as_str()) != keep)
                .map(|entry| (entry.last_used_at, id_sequence(&entry.id), entry.id.clone()))
                .collect();
            by_use.sort();
            let excess = state.entries.len() - self.config.max_entries;
            for (_, _, id) in by_use.into_iter().take(excess) {
                state.remove(&id);
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "Reload cache evicted entries");
        }
        removed
    }
}

/// `cache-N` 中的 N；无法解析时排在最前
fn id_sequence(id: &str) -> u64 {
    id.strip_prefix("cache-")
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}
