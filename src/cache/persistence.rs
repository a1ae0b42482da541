//! 回放缓存的防抖落盘
//!
//! 后台任务持有最新快照，每次变更重置计时器；计时器到期才整体重写一次 JSON 文件。
//! 写盘失败只记日志，内存中的缓存始终是唯一的真实来源。

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::CacheSnapshot;

enum PersistCommand {
    Save(CacheSnapshot),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct CachePersister {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl CachePersister {
    /// 启动后台写盘任务；所有 `CachePersister` 克隆被 drop 后，任务写完剩余快照并退出
    pub fn spawn(path: PathBuf, debounce: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(path, debounce, rx));
        (Self { tx }, handle)
    }

    /// 提交新快照（覆盖尚未写出的旧快照）
    pub fn schedule(&self, snapshot: CacheSnapshot) {
        if self.tx.send(PersistCommand::Save(snapshot)).is_err() {
            tracing::warn!("Cache writer stopped, snapshot not persisted");
        }
    }

    /// 立即写出待写快照
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn run_writer(
    path: PathBuf,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
) {
    let mut pending: Option<CacheSnapshot> = None;
    loop {
        let command = if pending.is_some() {
            tokio::select! {
                cmd = rx.recv() => cmd,
                _ = tokio::time::sleep(debounce) => {
                    if let Some(snapshot) = pending.take() {
                        write_snapshot(&path, &snapshot).await;
                    }
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        match command {
            Some(PersistCommand::Save(snapshot)) => pending = Some(snapshot),
            Some(PersistCommand::Flush(ack)) => {
                if let Some(snapshot) = pending.take() {
                    write_snapshot(&path, &snapshot).await;
                }
                let _ = ack.send(());
            }
            None => {
                if let Some(snapshot) = pending.take() {
                    write_snapshot(&path, &snapshot).await;
                }
                break;
            }
        }
    }
}

async fn write_snapshot(path: &Path, snapshot: &CacheSnapshot) {
    if let Err(e) = try_write(path, snapshot).await {
        tracing::warn!(path = %path.display(), "Failed to save reload cache: {}", e);
    } else {
        tracing::debug!(path = %path.display(), entries = snapshot.entries.len(), "Reload cache saved");
    }
}

async fn try_write(path: &Path, snapshot: &CacheSnapshot) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

/// 同步读取快照；文件不存在返回 None
pub fn load_snapshot(path: &Path) -> Result<Option<CacheSnapshot>, crate::core::OrchestratorError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}
