use crate::core::backup::{BackupManager, BackupRecord};
use crate::core::comparator::{ConflictReason, FileComparator, SyncAction, SyncDecision};
use crate::core::conflict::{
    Conflict, ConflictResolver, ConflictStrategy, ResolutionMode, ResolutionState,
};
use crate::core::directional::Direction;
use crate::core::inspector::{FileRecord, SourceTag};
use crate::core::scanner::{FileScanner, Listing, ScanConfig};
use crate::core::transfer::{replace_file, DiskSpaceProbe, SpaceProbe};
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// 双向同步中相同文件的跳过原因
pub const REASON_FILES_EQUAL: &str = "files are equal";

/// 同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 最大并发传输数
    pub max_concurrent_transfers: usize,
    /// 扫描配置
    pub scan_config: ScanConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 4,
            scan_config: ScanConfig::default(),
        }
    }
}

/// 一对同步目录及其备份目录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPaths {
    pub local_dir: PathBuf,
    pub cloud_dir: PathBuf,
    /// 本游戏的备份目录
    pub backup_dir: PathBuf,
}

impl SyncPaths {
    pub fn new(
        local_dir: impl Into<PathBuf>,
        cloud_dir: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            local_dir: local_dir.into(),
            cloud_dir: cloud_dir.into(),
            backup_dir: backup_dir.into(),
        }
    }

    /// 在任何同步逻辑运行前检查路径
    pub fn validate(&self) -> Result<()> {
        for (label, dir) in [("本地", &self.local_dir), ("云端", &self.cloud_dir)] {
            if dir.as_os_str().is_empty() {
                return Err(SyncError::config(format!("{}目录为空", label)));
            }
            if dir.exists() && !dir.is_dir() {
                return Err(SyncError::config(format!("{}路径不是目录: {:?}", label, dir)));
            }
        }
        if self.backup_dir.exists() && !self.backup_dir.is_dir() {
            return Err(SyncError::config(format!(
                "备份路径不是目录: {:?}",
                self.backup_dir
            )));
        }
        if same_location(&self.local_dir, &self.cloud_dir) {
            return Err(SyncError::config(format!(
                "本地与云端指向同一目录: {:?}",
                self.local_dir
            )));
        }
        Ok(())
    }
}

fn same_location(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// 单个文件的处理结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Copied,
    /// dry run 中将要执行的复制
    Planned,
    Skipped { reason: String },
    Resolved { strategy: ConflictStrategy },
    Unresolved { reason: ConflictReason },
    Failed { kind: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOutcome {
    pub path: String,
    pub action: SyncAction,
    #[serde(flatten)]
    pub status: OutcomeStatus,
    pub bytes: u64,
}

impl FileOutcome {
    fn failed(path: String, action: SyncAction, err: &SyncError) -> Self {
        Self {
            path,
            action,
            status: OutcomeStatus::Failed {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
            bytes: 0,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, OutcomeStatus::Failed { .. })
    }
}

/// 一次运行的汇总结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    /// 单向同步的方向；双向同步为 `None`
    pub direction: Option<Direction>,
    pub copied_to_cloud: usize,
    pub copied_to_local: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub unresolved: usize,
    pub errors: usize,
    pub bytes_transferred: u64,
    pub outcomes: Vec<FileOutcome>,
    pub conflict_details: Vec<Conflict>,
    pub backups: Vec<BackupRecord>,
    /// 运行结束后的检查点
    pub checkpoint: Option<DateTime<Utc>>,
    pub checkpoint_advanced: bool,
    /// 单向同步因安全规则拒绝了至少一次覆盖
    pub safety_check_prevented: bool,
}

impl SyncSummary {
    pub fn new(started_at: DateTime<Utc>, dry_run: bool, direction: Option<Direction>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at,
            finished_at: None,
            dry_run,
            direction,
            copied_to_cloud: 0,
            copied_to_local: 0,
            skipped: 0,
            conflicts: 0,
            unresolved: 0,
            errors: 0,
            bytes_transferred: 0,
            outcomes: Vec::new(),
            conflict_details: Vec::new(),
            backups: Vec::new(),
            checkpoint: None,
            checkpoint_advanced: false,
            safety_check_prevented: false,
        }
    }

    /// 记录一个复制或跳过的结果
    pub fn record(&mut self, outcome: FileOutcome) {
        match (&outcome.status, outcome.action) {
            (OutcomeStatus::Copied | OutcomeStatus::Planned, SyncAction::CopyToCloud) => {
                self.copied_to_cloud += 1
            }
            (OutcomeStatus::Copied | OutcomeStatus::Planned, SyncAction::CopyToLocal) => {
                self.copied_to_local += 1
            }
            (OutcomeStatus::Skipped { .. }, _) => self.skipped += 1,
            (OutcomeStatus::Failed { .. }, _) => self.errors += 1,
            _ => {}
        }
        self.bytes_transferred += outcome.bytes;
        self.outcomes.push(outcome);
    }

    /// 记录一个冲突的最终状态
    pub fn record_conflict(&mut self, conflict: Conflict, error: Option<&SyncError>) {
        self.conflicts += 1;
        let action = SyncAction::Conflict(conflict.reason);

        let outcome = match (error, conflict.state) {
            (Some(err), _) => FileOutcome::failed(conflict.path.clone(), action, err),
            (None, ResolutionState::Resolved(strategy)) => FileOutcome {
                path: conflict.path.clone(),
                action,
                status: OutcomeStatus::Resolved { strategy },
                bytes: 0,
            },
            (None, ResolutionState::Unresolved) => FileOutcome {
                path: conflict.path.clone(),
                action,
                status: OutcomeStatus::Unresolved {
                    reason: conflict.reason,
                },
                bytes: 0,
            },
        };

        if error.is_some() {
            self.errors += 1;
        }
        if !conflict.is_resolved() {
            self.unresolved += 1;
        }
        self.backups.extend(conflict.backups.iter().cloned());
        self.outcomes.push(outcome);
        self.conflict_details.push(conflict);
    }

    /// 进程退出码：0 成功，1 错误，2 安全检查阻止，3 有未解决的冲突
    pub fn exit_code(&self) -> i32 {
        if self.errors > 0 {
            1
        } else if self.safety_check_prevented {
            2
        } else if self.unresolved > 0 {
            3
        } else {
            0
        }
    }

    pub(crate) fn finish(&mut self) {
        self.outcomes.sort_by(|a, b| a.path.cmp(&b.path));
        self.backups.sort_by(|a, b| a.backup_name.cmp(&b.backup_name));
        self.finished_at = Some(Utc::now());
    }
}

/// 一次覆盖写：源文件 -> 目标文件
#[derive(Debug, Clone)]
pub(crate) struct Transfer {
    pub path: String,
    pub action: SyncAction,
    pub source: FileRecord,
    pub destination: FileRecord,
    pub destination_side: SourceTag,
}

impl Transfer {
    fn from_decision(decision: &SyncDecision) -> Option<Self> {
        let (source, destination, destination_side) = match decision.action {
            SyncAction::CopyToCloud => (&decision.local, &decision.cloud, SourceTag::Cloud),
            SyncAction::CopyToLocal => (&decision.cloud, &decision.local, SourceTag::Local),
            SyncAction::Skip | SyncAction::Conflict(_) | SyncAction::Unsupported(_) => {
                return None
            }
        };
        Some(Self {
            path: decision.path.clone(),
            action: decision.action,
            source: source.clone(),
            destination: destination.clone(),
            destination_side,
        })
    }

    /// 备份已存在的目标文件，再原子替换（阻塞 I/O）
    ///
    /// 备份失败时不会覆盖目标文件。
    fn execute(
        &self,
        backups: &BackupManager,
        probe: &dyn SpaceProbe,
    ) -> (Option<BackupRecord>, Result<u64>) {
        let backup = if self.destination.exists {
            match backups.backup(&self.destination.absolute_path, self.destination_side) {
                Ok(record) => Some(record),
                Err(e) => return (None, Err(e)),
            }
        } else {
            None
        };

        let copied = replace_file(
            &self.source.absolute_path,
            &self.destination.absolute_path,
            probe,
        );
        (backup, copied)
    }
}

/// 同步引擎
pub struct SyncEngine {
    config: SyncConfig,
    probe: Arc<dyn SpaceProbe>,
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self {
            config,
            probe: Arc::new(DiskSpaceProbe),
        }
    }

    /// 替换可用空间查询（测试中使用固定值）
    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub(crate) fn scanner(&self) -> Result<FileScanner> {
        FileScanner::new(&self.config.scan_config)
    }

    /// 比较两侧目录，返回按路径排序的同步决定
    pub async fn compare(
        &self,
        local_dir: &Path,
        cloud_dir: &Path,
        checkpoint: Option<DateTime<Utc>>,
    ) -> Result<Vec<SyncDecision>> {
        let scanner = self.scanner()?;

        let (local_listing, cloud_listing) = tokio::join!(
            list_files(scanner.clone(), local_dir.to_path_buf()),
            list_files(scanner, cloud_dir.to_path_buf()),
        );
        let (local_listing, cloud_listing) = (local_listing?, cloud_listing?);

        let local_dir = local_dir.to_path_buf();
        let cloud_dir = cloud_dir.to_path_buf();
        let root = local_dir.clone();
        tokio::task::spawn_blocking(move || {
            FileComparator::compare_listings(
                &local_dir,
                &cloud_dir,
                &local_listing,
                &cloud_listing,
                checkpoint,
            )
        })
        .await
        .map_err(|e| join_error(&root, e))?
    }

    /// 运行一次双向同步
    ///
    /// 比较失败（结构性错误）时在任何写操作之前返回错误；单个文件的失败只记录在汇总中。
    /// 仅当运行不是 dry run、没有错误且没有未解决的冲突时，检查点前移到本次运行的开始时间。
    pub async fn run_sync(
        &self,
        paths: &SyncPaths,
        checkpoint: Option<DateTime<Utc>>,
        dry_run: bool,
        mode: ResolutionMode,
    ) -> Result<SyncSummary> {
        let started_at = Utc::now();
        let summary = SyncSummary::new(started_at, dry_run, None);
        let span = info_span!("sync", run_id = %summary.run_id);

        async move {
            paths.validate()?;
            info!(
                "开始同步: {:?} <-> {:?} (检查点: {:?}, dry_run: {})",
                paths.local_dir, paths.cloud_dir, checkpoint, dry_run
            );

            let decisions = self
                .compare(&paths.local_dir, &paths.cloud_dir, checkpoint)
                .await?;

            let plan = FileComparator::summarize_actions(&decisions);
            info!(
                "比较完成: 上传 {} ({} 字节), 下载 {} ({} 字节), 跳过 {}, 冲突 {}, 无法同步 {}",
                plan.copy_to_cloud.len(),
                plan.copy_to_cloud_bytes,
                plan.copy_to_local.len(),
                plan.copy_to_local_bytes,
                plan.skip.len(),
                plan.conflicts.len(),
                plan.unsupported.len()
            );

            let mut summary = summary;
            let mut transfers = Vec::new();
            let mut conflicts = Vec::new();

            for decision in &decisions {
                match decision.action {
                    SyncAction::Skip => summary.record(FileOutcome {
                        path: decision.path.clone(),
                        action: decision.action,
                        status: OutcomeStatus::Skipped {
                            reason: REASON_FILES_EQUAL.to_string(),
                        },
                        bytes: 0,
                    }),
                    SyncAction::Unsupported(reason) => summary.record(FileOutcome {
                        path: decision.path.clone(),
                        action: decision.action,
                        status: OutcomeStatus::Skipped {
                            reason: reason.to_string(),
                        },
                        bytes: 0,
                    }),
                    SyncAction::Conflict(_) => conflicts.extend(Conflict::from_decision(decision)),
                    SyncAction::CopyToCloud | SyncAction::CopyToLocal => {
                        transfers.extend(Transfer::from_decision(decision))
                    }
                }
            }

            if dry_run {
                for transfer in transfers {
                    summary.record(FileOutcome {
                        path: transfer.path,
                        action: transfer.action,
                        status: OutcomeStatus::Planned,
                        bytes: 0,
                    });
                }
                for conflict in conflicts {
                    summary.record_conflict(conflict, None);
                }
                summary.checkpoint = checkpoint;
                summary.finish();
                info!("dry run 完成，未修改任何文件");
                return Ok(summary);
            }

            let backups = Arc::new(BackupManager::new(&paths.backup_dir, started_at));
            let summary = Arc::new(Mutex::new(summary));

            self.execute_transfers(transfers, backups.clone(), summary.clone())
                .await;

            let mut resolver = ConflictResolver::new(mode);
            for conflict in conflicts {
                let (conflict, err) = resolver
                    .resolve(
                        conflict,
                        backups.clone(),
                        self.probe.clone(),
                        backups.stamp().to_string(),
                    )
                    .await;
                if let Some(e) = &err {
                    error!("冲突处理失败: {} - {}", conflict.path, e);
                }
                summary.lock().await.record_conflict(conflict, err.as_ref());
            }

            let mut summary = summary.lock().await.clone();
            if summary.errors == 0 && summary.unresolved == 0 {
                let advanced = checkpoint.map_or(started_at, |c| c.max(started_at));
                summary.checkpoint = Some(advanced);
                summary.checkpoint_advanced = true;
            } else {
                summary.checkpoint = checkpoint;
                warn!(
                    "检查点未前移: {} 个错误, {} 个未解决的冲突",
                    summary.errors, summary.unresolved
                );
            }
            summary.finish();

            info!(
                "同步完成: 上传 {}, 下载 {}, 跳过 {}, 冲突 {} (未解决 {}), 错误 {}",
                summary.copied_to_cloud,
                summary.copied_to_local,
                summary.skipped,
                summary.conflicts,
                summary.unresolved,
                summary.errors
            );
            Ok::<_, SyncError>(summary)
        }
        .instrument(span)
        .await
    }

    /// 并行执行复制，并发数由信号量限制
    pub(crate) async fn execute_transfers(
        &self,
        transfers: Vec<Transfer>,
        backups: Arc<BackupManager>,
        summary: Arc<Mutex<SyncSummary>>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_transfers.max(1)));
        let mut handles = Vec::with_capacity(transfers.len());

        for transfer in transfers {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let backups = backups.clone();
            let probe = self.probe.clone();
            let summary = summary.clone();

            let handle = tokio::spawn(
                async move {
                    let path = transfer.path.clone();
                    let action = transfer.action;
                    let joined = tokio::task::spawn_blocking(move || {
                        transfer.execute(&backups, probe.as_ref())
                    })
                    .await;
                    drop(permit);

                    let (backup, result) = match joined {
                        Ok(pair) => pair,
                        Err(e) => (None, Err(join_error(Path::new(&path), e))),
                    };

                    let outcome = match result {
                        Ok(bytes) => {
                            debug!("复制完成: {} ({:?}, {} 字节)", path, action, bytes);
                            FileOutcome {
                                path,
                                action,
                                status: OutcomeStatus::Copied,
                                bytes,
                            }
                        }
                        Err(e) => {
                            error!("复制失败: {} - {}", path, e);
                            FileOutcome::failed(path, action, &e)
                        }
                    };

                    let mut summary = summary.lock().await;
                    summary.backups.extend(backup);
                    summary.record(outcome);
                }
                .in_current_span(),
            );
            handles.push(handle);
        }

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("传输任务异常退出: {}", e);
            }
        }
    }
}

/// 在阻塞线程中列出目录
pub(crate) async fn list_files(scanner: FileScanner, dir: PathBuf) -> Result<Listing> {
    let path = dir.clone();
    tokio::task::spawn_blocking(move || scanner.list_files(&dir))
        .await
        .map_err(|e| join_error(&path, e))?
}

pub(crate) fn join_error(path: &Path, e: tokio::task::JoinError) -> SyncError {
    SyncError::inspection(path, std::io::Error::other(e.to_string()))
}
