//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AGENTDESK__*` 覆盖（双下划线表示嵌套，如 `AGENTDESK__POOL__MAX_AGENTS=8`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub pool: PoolSection,
    pub budget: BudgetSection,
    pub queue: QueueSection,
    pub tape: TapeSection,
    pub cache: CacheSection,
    pub provider: ProviderSection,
}

/// [pool] 段：单连接 Agent 池容量、全局上限、空闲回收
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// 单个连接最多持有的 Agent 数
    pub max_agents: usize,
    /// 进程级 Agent 上限（所有连接共享）
    pub global_max_agents: usize,
    /// 空闲多久后回收（秒）
    pub idle_timeout_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_agents: 4,
            global_max_agents: 16,
            idle_timeout_secs: 300,
        }
    }
}

impl PoolSection {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// [budget] 段：监视器并发与速率限制
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    /// 主监视器（前台循环），不受任何限制
    pub primary_monitor_id: String,
    /// 非主监视器共享的并发槽数
    pub max_concurrent: usize,
    /// 等待槽位的超时（秒）
    pub slot_timeout_secs: u64,
    pub max_actions_per_minute: usize,
    pub max_output_bytes_per_minute: usize,
    /// 滑动窗口长度（秒）
    pub window_secs: u64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            primary_monitor_id: "main".to_string(),
            max_concurrent: 2,
            slot_timeout_secs: 30,
            max_actions_per_minute: 30,
            max_output_bytes_per_minute: 200_000,
            window_secs: 60,
        }
    }
}

/// [queue] 段：主队列长度上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_size: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self { max_size: 10 }
    }
}

/// [tape] 段：主线程消息上限，超过后剪掉较旧的一半
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TapeSection {
    pub max_main_messages: usize,
}

impl Default for TapeSection {
    fn default() -> Self {
        Self {
            max_main_messages: 200,
        }
    }
}

/// [cache] 段：回放缓存的持久化路径、过期、容量、相似度阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// 未设置时仅在内存中保存
    pub path: Option<PathBuf>,
    pub ttl_hours: u64,
    pub max_entries: usize,
    pub similarity_threshold: f64,
    /// 写盘防抖间隔（毫秒）
    pub debounce_ms: u64,
    /// 注入 prompt 的提示条数
    pub hint_limit: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            path: None,
            ttl_hours: 168,
            max_entries: 200,
            similarity_threshold: 0.7,
            debounce_ms: 1000,
            hint_limit: 3,
        }
    }
}

impl CacheSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 3600)
    }
}

/// [provider] 段：后端优先级与系统提示词
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    /// 按顺序选择第一个可用的后端：claude / codex
    pub priority: Vec<String>,
    pub system_prompt: String,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            priority: vec!["claude".into(), "codex".into()],
            system_prompt: "You are a desktop agent. Control the UI by emitting window actions \
                            as fenced JSON blocks."
                .to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 AGENTDESK__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AGENTDESK__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AGENTDESK")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
