//! Provider 选择：按配置的优先级挑第一个可用的会话工厂

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::core::ProviderError;

use super::SessionFactory;

/// 支持的 Provider 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Claude,
    Codex,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Codex => "codex",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Ok(ProviderKind::Claude),
            "codex" => Ok(ProviderKind::Codex),
            other => Err(ProviderError::Unavailable(format!(
                "unknown provider type: {} (valid: claude, codex)",
                other
            ))),
        }
    }
}

/// 按 `priority` 顺序返回第一个可用的工厂；未知名称会被跳过并记录
pub async fn select_factory(
    priority: &[String],
    factories: &[Arc<dyn SessionFactory>],
) -> Result<Arc<dyn SessionFactory>, ProviderError> {
    for name in priority {
        let kind = match name.parse::<ProviderKind>() {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!("Skipping provider in priority list: {}", e);
                continue;
            }
        };
        let Some(factory) = factories.iter().find(|f| f.kind() == kind) else {
            continue;
        };
        if factory.check_availability().await {
            tracing::info!(provider = %kind, "Selected AI provider");
            return Ok(Arc::clone(factory));
        }
        tracing::debug!(provider = %kind, "Provider not available");
    }
    Err(ProviderError::Unavailable(
        "no AI provider available".to_string(),
    ))
}
