use crate::core::backup::{BackupManager, BackupRecord};
use crate::core::comparator::{ConflictReason, SyncAction, SyncDecision};
use crate::core::inspector::{FileRecord, SourceTag};
use crate::core::transfer::{replace_file, SpaceProbe};
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// 冲突解决策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    KeepLocal,
    KeepCloud,
    KeepBoth,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictStrategy::KeepLocal => write!(f, "keep_local"),
            ConflictStrategy::KeepCloud => write!(f, "keep_cloud"),
            ConflictStrategy::KeepBoth => write!(f, "keep_both"),
        }
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "keep_local" | "local" => Ok(ConflictStrategy::KeepLocal),
            "keep_cloud" | "cloud" => Ok(ConflictStrategy::KeepCloud),
            "keep_both" | "both" => Ok(ConflictStrategy::KeepBoth),
            _ => Err(format!("无效的冲突策略: {}", s)),
        }
    }
}

/// 冲突的解决状态；`Resolved` 是终态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    Unresolved,
    Resolved(ConflictStrategy),
}

impl std::fmt::Display for ResolutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionState::Unresolved => write!(f, "unresolved"),
            ResolutionState::Resolved(strategy) => write!(f, "resolved-by-{}", strategy),
        }
    }
}

impl Serialize for ResolutionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// 冲突记录
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub path: String,
    pub local: FileRecord,
    pub cloud: FileRecord,
    pub reason: ConflictReason,
    pub state: ResolutionState,
    /// 解决过程中创建的备份
    pub backups: Vec<BackupRecord>,
    /// keep_both 时在对侧创建的副本
    pub duplicates: Vec<PathBuf>,
}

impl Conflict {
    pub fn from_decision(decision: &SyncDecision) -> Option<Self> {
        match decision.action {
            SyncAction::Conflict(reason) => Some(Self {
                path: decision.path.clone(),
                local: decision.local.clone(),
                cloud: decision.cloud.clone(),
                reason,
                state: ResolutionState::Unresolved,
                backups: Vec::new(),
                duplicates: Vec::new(),
            }),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, ResolutionState::Resolved(_))
    }

    /// 进入终态；已解决的冲突不再转换
    fn mark_resolved(&mut self, strategy: ConflictStrategy) -> bool {
        if self.is_resolved() {
            return false;
        }
        self.state = ResolutionState::Resolved(strategy);
        true
    }
}

/// 调用方对一次冲突请求的回复
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResponse {
    Resolve(ConflictStrategy),
    /// 暂不解决，保持 unresolved
    Skip,
}

impl ConflictResponse {
    fn strategy(self) -> Option<ConflictStrategy> {
        match self {
            ConflictResponse::Resolve(strategy) => Some(strategy),
            ConflictResponse::Skip => None,
        }
    }
}

/// 交给调用方的冲突决策请求
///
/// 核心在此挂起，直到 `respond` 收到回复；丢弃 `respond` 等同于 [`ConflictResponse::Skip`]。
#[derive(Debug)]
pub struct ConflictRequest {
    pub conflict: Conflict,
    /// 回复是否会应用到本次运行中同一原因的所有后续冲突
    pub applies_to_reason: bool,
    pub respond: oneshot::Sender<ConflictResponse>,
}

/// 冲突解决方式
#[derive(Debug, Clone)]
pub enum ResolutionMode {
    /// 逐个（或按原因批量）向调用方请求决定
    Interactive {
        requests: mpsc::Sender<ConflictRequest>,
        batch_by_reason: bool,
    },
    /// 非交互：统一应用调用方声明的策略
    Default(ConflictStrategy),
    /// 只报告，冲突保持 unresolved
    ReportOnly,
}

/// 冲突解决器
#[derive(Debug)]
pub struct ConflictResolver {
    mode: ResolutionMode,
    batch_decisions: HashMap<ConflictReason, ConflictResponse>,
}

impl ConflictResolver {
    pub fn new(mode: ResolutionMode) -> Self {
        Self {
            mode,
            batch_decisions: HashMap::new(),
        }
    }

    /// 获取某个冲突的解决策略；`None` 表示保持 unresolved
    pub async fn decide(&mut self, conflict: &Conflict) -> Option<ConflictStrategy> {
        let (requests, batch_by_reason) = match &self.mode {
            ResolutionMode::ReportOnly => return None,
            ResolutionMode::Default(strategy) => return Some(*strategy),
            ResolutionMode::Interactive {
                requests,
                batch_by_reason,
            } => (requests.clone(), *batch_by_reason),
        };

        if batch_by_reason {
            if let Some(response) = self.batch_decisions.get(&conflict.reason) {
                return response.strategy();
            }
        }

        let (tx, rx) = oneshot::channel();
        let request = ConflictRequest {
            conflict: conflict.clone(),
            applies_to_reason: batch_by_reason,
            respond: tx,
        };
        if requests.send(request).await.is_err() {
            warn!("冲突请求无人接收，保持未解决: {}", conflict.path);
            return None;
        }

        let response = rx.await.unwrap_or(ConflictResponse::Skip);
        if batch_by_reason {
            self.batch_decisions.insert(conflict.reason, response);
        }
        response.strategy()
    }

    /// 决定并应用策略
    ///
    /// 返回处理后的冲突；应用失败时冲突保持 unresolved 并附带错误。
    pub async fn resolve(
        &mut self,
        conflict: Conflict,
        backups: Arc<BackupManager>,
        probe: Arc<dyn SpaceProbe>,
        stamp: String,
    ) -> (Conflict, Option<SyncError>) {
        let Some(strategy) = self.decide(&conflict).await else {
            info!("冲突保持未解决: {} ({})", conflict.path, conflict.reason);
            return (conflict, None);
        };

        let mut working = conflict.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = apply_strategy(&mut working, strategy, &backups, probe.as_ref(), &stamp);
            (working, result)
        })
        .await;

        match joined {
            Ok((conflict, Ok(()))) => {
                info!("冲突已解决: {} -> {}", conflict.path, conflict.state);
                (conflict, None)
            }
            Ok((conflict, Err(e))) => {
                warn!("冲突解决失败: {} - {}", conflict.path, e);
                (conflict, Some(e))
            }
            Err(e) => {
                warn!("冲突解决任务异常: {} - {}", conflict.path, e);
                let err = SyncError::Copy {
                    from: conflict.local.absolute_path.clone(),
                    to: conflict.cloud.absolute_path.clone(),
                    source: std::io::Error::other(e.to_string()),
                };
                (conflict, Some(err))
            }
        }
    }
}

/// 对冲突应用策略（阻塞 I/O）
///
/// - `keep_local`: 备份云端副本，再用本地覆盖云端
/// - `keep_cloud`: 备份本地副本，再用云端覆盖本地
/// - `keep_both`: 不覆盖任何文件，把两侧文件以带来源标记的新名字复制到对侧
pub fn apply_strategy(
    conflict: &mut Conflict,
    strategy: ConflictStrategy,
    backups: &BackupManager,
    probe: &dyn SpaceProbe,
    stamp: &str,
) -> Result<()> {
    if conflict.is_resolved() {
        return Ok(());
    }

    match strategy {
        ConflictStrategy::KeepLocal => {
            let record = backups.backup(&conflict.cloud.absolute_path, SourceTag::Cloud)?;
            conflict.backups.push(record);
            replace_file(
                &conflict.local.absolute_path,
                &conflict.cloud.absolute_path,
                probe,
            )?;
        }
        ConflictStrategy::KeepCloud => {
            let record = backups.backup(&conflict.local.absolute_path, SourceTag::Local)?;
            conflict.backups.push(record);
            replace_file(
                &conflict.cloud.absolute_path,
                &conflict.local.absolute_path,
                probe,
            )?;
        }
        ConflictStrategy::KeepBoth => {
            for (from, to_side_of, tag) in [
                (&conflict.local, &conflict.cloud, SourceTag::Local),
                (&conflict.cloud, &conflict.local, SourceTag::Cloud),
            ] {
                let target = free_duplicate_path(&to_side_of.absolute_path, stamp, tag);
                replace_file(&from.absolute_path, &target, probe)?;
                conflict.duplicates.push(target);
            }
        }
    }

    conflict.mark_resolved(strategy);
    Ok(())
}

/// keep_both 副本名: `<stem>.<YYYYMMDD-HHMMSS>.<tag><.ext>`
pub fn duplicate_name(file_name: &str, stamp: &str, tag: SourceTag) -> String {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string());
    match path.extension() {
        Some(ext) => format!("{}.{}.{}.{}", stem, stamp, tag, ext.to_string_lossy()),
        None => format!("{}.{}.{}", stem, stamp, tag),
    }
}

/// 在 `sibling` 所在目录中找一个尚未占用的副本路径
fn free_duplicate_path(sibling: &Path, stamp: &str, tag: SourceTag) -> PathBuf {
    let file_name = sibling
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut candidate = sibling.with_file_name(duplicate_name(&file_name, stamp, tag));
    let mut attempt = 1;
    while candidate.exists() {
        let stamp = format!("{}-{}", stamp, attempt);
        candidate = sibling.with_file_name(duplicate_name(&file_name, &stamp, tag));
        attempt += 1;
    }
    candidate
}
