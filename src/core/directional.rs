//! 单向同步（push / pull）
//!
//! 不检测冲突：目标文件更新时一律跳过，除非显式 `force`。

use crate::core::backup::BackupManager;
use crate::core::comparator::{SyncAction, UnsupportedReason};
use crate::core::engine::{
    join_error, list_files, FileOutcome, OutcomeStatus, SyncEngine, SyncPaths, SyncSummary,
    Transfer, REASON_FILES_EQUAL,
};
use crate::core::inspector::{inspect, FileRecord, SourceTag};
use crate::error::{Result, SyncError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

pub const REASON_DESTINATION_NEWER: &str = "destination is newer";
pub const REASON_SAME_TIMESTAMP_DIFFERENT_SIZE: &str = "same timestamp, different size";

/// 同步方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// 本地 -> 云端
    ToCloud,
    /// 云端 -> 本地
    FromCloud,
}

impl Direction {
    pub fn action(self) -> SyncAction {
        match self {
            Direction::ToCloud => SyncAction::CopyToCloud,
            Direction::FromCloud => SyncAction::CopyToLocal,
        }
    }

    pub fn destination_side(self) -> SourceTag {
        match self {
            Direction::ToCloud => SourceTag::Cloud,
            Direction::FromCloud => SourceTag::Local,
        }
    }

    /// 源或目标不是普通文件时的原因
    fn unsupported(
        self,
        source: &FileRecord,
        destination: &FileRecord,
    ) -> Option<UnsupportedReason> {
        let destination_side = self.destination_side();
        if source.is_non_file() {
            Some(UnsupportedReason::NotAFile(destination_side.other()))
        } else if destination.is_non_file() {
            Some(UnsupportedReason::NotAFile(destination_side))
        } else {
            None
        }
    }

    /// (源目录, 目标目录)
    fn endpoints(self, paths: &SyncPaths) -> (&Path, &Path) {
        match self {
            Direction::ToCloud => (paths.local_dir.as_path(), paths.cloud_dir.as_path()),
            Direction::FromCloud => (paths.cloud_dir.as_path(), paths.local_dir.as_path()),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ToCloud => write!(f, "to_cloud"),
            Direction::FromCloud => write!(f, "from_cloud"),
        }
    }
}

/// 单个文件的单向同步决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionalStep {
    Copy,
    Skip {
        reason: &'static str,
        /// 跳过是否拒绝了一次会丢失数据的覆盖
        withheld: bool,
    },
}

/// 单向同步的判定规则
pub fn plan_file(source: &FileRecord, destination: &FileRecord, force: bool) -> DirectionalStep {
    let (Some(src_time), Some(dst_time)) = (source.modified, destination.modified) else {
        return DirectionalStep::Copy;
    };

    if force || src_time > dst_time {
        return DirectionalStep::Copy;
    }

    if dst_time > src_time {
        DirectionalStep::Skip {
            reason: REASON_DESTINATION_NEWER,
            withheld: true,
        }
    } else if source.size != destination.size {
        DirectionalStep::Skip {
            reason: REASON_SAME_TIMESTAMP_DIFFERENT_SIZE,
            withheld: true,
        }
    } else {
        DirectionalStep::Skip {
            reason: REASON_FILES_EQUAL,
            withheld: false,
        }
    }
}

impl SyncEngine {
    /// 运行一次单向同步
    ///
    /// 只处理源目录中存在的文件；仅存在于目标目录的文件保持不变。
    /// 不读取也不前移检查点。
    pub async fn run_directional_sync(
        &self,
        direction: Direction,
        paths: &SyncPaths,
        force: bool,
        dry_run: bool,
    ) -> Result<SyncSummary> {
        let started_at = Utc::now();
        let summary = SyncSummary::new(started_at, dry_run, Some(direction));
        let span = info_span!("sync", run_id = %summary.run_id, %direction);

        async move {
            paths.validate()?;
            let (source_dir, destination_dir) = direction.endpoints(paths);
            info!(
                "开始单向同步: {:?} -> {:?} (force: {}, dry_run: {})",
                source_dir, destination_dir, force, dry_run
            );

            let listing = list_files(self.scanner()?, source_dir.to_path_buf()).await?;
            let non_utf8: Vec<String> = listing.non_utf8.keys().cloned().collect();
            let (src_root, dst_root) = (source_dir.to_path_buf(), destination_dir.to_path_buf());
            let pairs = tokio::task::spawn_blocking(move || {
                listing
                    .files
                    .iter()
                    .map(|name| Ok((inspect(&src_root, name)?, inspect(&dst_root, name)?)))
                    .collect::<Result<Vec<_>>>()
            })
            .await
            .map_err(|e| join_error(source_dir, e))??;

            let mut summary = summary;
            let mut transfers = Vec::new();
            let action = direction.action();

            for name in non_utf8 {
                warn!("无法同步: {} ({})", name, UnsupportedReason::NonUtf8Name);
                summary.record(FileOutcome {
                    path: name,
                    action: SyncAction::Unsupported(UnsupportedReason::NonUtf8Name),
                    status: OutcomeStatus::Skipped {
                        reason: UnsupportedReason::NonUtf8Name.to_string(),
                    },
                    bytes: 0,
                });
            }

            for (source, destination) in pairs {
                if let Some(reason) = direction.unsupported(&source, &destination) {
                    warn!("无法同步: {} ({})", source.relative_path, reason);
                    summary.record(FileOutcome {
                        path: source.relative_path,
                        action: SyncAction::Unsupported(reason),
                        status: OutcomeStatus::Skipped {
                            reason: reason.to_string(),
                        },
                        bytes: 0,
                    });
                    continue;
                }

                match plan_file(&source, &destination, force) {
                    DirectionalStep::Copy => transfers.push(Transfer {
                        path: source.relative_path.clone(),
                        action,
                        source,
                        destination,
                        destination_side: direction.destination_side(),
                    }),
                    DirectionalStep::Skip { reason, withheld } => {
                        if withheld {
                            warn!("安全检查阻止覆盖: {} ({})", source.relative_path, reason);
                            summary.safety_check_prevented = true;
                        } else {
                            debug!("跳过: {} ({})", source.relative_path, reason);
                        }
                        summary.record(FileOutcome {
                            path: source.relative_path,
                            action: SyncAction::Skip,
                            status: OutcomeStatus::Skipped {
                                reason: reason.to_string(),
                            },
                            bytes: 0,
                        });
                    }
                }
            }

            let mut summary = if dry_run {
                for transfer in transfers {
                    summary.record(FileOutcome {
                        path: transfer.path,
                        action,
                        status: OutcomeStatus::Planned,
                        bytes: 0,
                    });
                }
                summary
            } else {
                let backups = Arc::new(BackupManager::new(&paths.backup_dir, started_at));
                let shared = Arc::new(Mutex::new(summary));
                self.execute_transfers(transfers, backups, shared.clone())
                    .await;
                let snapshot = shared.lock().await.clone();
                snapshot
            };
            summary.finish();

            info!(
                "单向同步完成: 复制 {}, 跳过 {}, 错误 {}, 安全检查阻止: {}",
                summary.copied_to_cloud + summary.copied_to_local,
                summary.skipped,
                summary.errors,
                summary.safety_check_prevented
            );
            Ok::<_, SyncError>(summary)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{at, mtime, write_file};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn dirs() -> (TempDir, SyncPaths) {
        let root = tempfile::tempdir().unwrap();
        let paths = SyncPaths::new(
            root.path().join("local"),
            root.path().join("cloud"),
            root.path().join("backups"),
        );
        std::fs::create_dir_all(&paths.local_dir).unwrap();
        std::fs::create_dir_all(&paths.cloud_dir).unwrap();
        (root, paths)
    }

    fn skip_reasons(summary: &SyncSummary) -> Vec<(&str, &str)> {
        summary
            .outcomes
            .iter()
            .filter_map(|o| match &o.status {
                OutcomeStatus::Skipped { reason } => Some((o.path.as_str(), reason.as_str())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_scenario_c_newer_destination_is_not_overwritten() {
        let (_root, paths) = dirs();
        write_file(&paths.local_dir, "save.dat", b"older local", at(0));
        write_file(&paths.cloud_dir, "save.dat", b"newer cloud", at(5));

        let summary = SyncEngine::new()
            .run_directional_sync(Direction::ToCloud, &paths, false, false)
            .await
            .unwrap();

        assert_eq!(skip_reasons(&summary), vec![("save.dat", REASON_DESTINATION_NEWER)]);
        assert!(summary.safety_check_prevented);
        assert_eq!(summary.exit_code(), 2);
        assert_eq!(std::fs::read(paths.cloud_dir.join("save.dat")).unwrap(), b"newer cloud");
        assert_eq!(mtime(&paths.cloud_dir.join("save.dat")), at(5));
        assert!(!paths.backup_dir.exists());
        assert!(!summary.checkpoint_advanced);
        assert_eq!(summary.checkpoint, None);
    }

    #[tokio::test]
    async fn test_directory_at_destination_is_skipped_without_aborting() {
        let (_root, paths) = dirs();
        write_file(&paths.local_dir, "slot", b"file", at(10));
        write_file(&paths.local_dir, "other.sav", b"other", at(10));
        std::fs::create_dir(paths.cloud_dir.join("slot")).unwrap();

        let summary = SyncEngine::new()
            .run_directional_sync(Direction::ToCloud, &paths, true, false)
            .await
            .unwrap();

        assert_eq!(
            skip_reasons(&summary),
            vec![("slot", "type mismatch (not a file on cloud)")]
        );
        assert_eq!(summary.copied_to_cloud, 1);
        assert_eq!(std::fs::read(paths.cloud_dir.join("other.sav")).unwrap(), b"other");
        assert!(paths.cloud_dir.join("slot").is_dir());
        assert!(!summary.safety_check_prevented);
    }

    #[tokio::test]
    async fn test_force_overwrites_newer_destination_after_backup() {
        let (_root, paths) = dirs();
        write_file(&paths.local_dir, "save.dat", b"older local", at(0));
        write_file(&paths.cloud_dir, "save.dat", b"newer cloud", at(5));

        let summary = SyncEngine::new()
            .run_directional_sync(Direction::ToCloud, &paths, true, false)
            .await
            .unwrap();

        assert_eq!(summary.copied_to_cloud, 1);
        assert!(!summary.safety_check_prevented);
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(std::fs::read(paths.cloud_dir.join("save.dat")).unwrap(), b"older local");
        assert_eq!(summary.backups.len(), 1);
        assert_eq!(summary.backups[0].source, SourceTag::Cloud);
        assert_eq!(std::fs::read(&summary.backups[0].backup_path).unwrap(), b"newer cloud");
    }

    #[tokio::test]
    async fn test_pull_copies_newer_and_missing_files() {
        let (_root, paths) = dirs();
        write_file(&paths.cloud_dir, "save.dat", b"cloud v2", at(20));
        write_file(&paths.local_dir, "save.dat", b"local v1", at(10));
        write_file(&paths.cloud_dir, "new.dat", b"fresh", at(20));
        write_file(&paths.local_dir, "local_only.dat", b"mine", at(30));
        write_file(&paths.cloud_dir, "same.dat", b"same", at(7));
        write_file(&paths.local_dir, "same.dat", b"same", at(7));

        let summary = SyncEngine::new()
            .run_directional_sync(Direction::FromCloud, &paths, false, false)
            .await
            .unwrap();

        assert_eq!(summary.copied_to_local, 2);
        assert_eq!(skip_reasons(&summary), vec![("same.dat", REASON_FILES_EQUAL)]);
        assert_eq!(std::fs::read(paths.local_dir.join("save.dat")).unwrap(), b"cloud v2");
        assert_eq!(std::fs::read(paths.local_dir.join("new.dat")).unwrap(), b"fresh");
        assert_eq!(std::fs::read(paths.local_dir.join("local_only.dat")).unwrap(), b"mine");
        assert!(!paths.cloud_dir.join("local_only.dat").exists());
        assert_eq!(summary.backups.len(), 1);
        assert_eq!(summary.backups[0].source, SourceTag::Local);
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_same_timestamp_different_size_is_withheld() {
        let (_root, paths) = dirs();
        write_file(&paths.local_dir, "save.dat", b"short", at(3));
        write_file(&paths.cloud_dir, "save.dat", b"much longer", at(3));

        let summary = SyncEngine::new()
            .run_directional_sync(Direction::ToCloud, &paths, false, false)
            .await
            .unwrap();

        assert_eq!(
            skip_reasons(&summary),
            vec![("save.dat", REASON_SAME_TIMESTAMP_DIFFERENT_SIZE)]
        );
        assert!(summary.safety_check_prevented);
        assert_eq!(std::fs::read(paths.cloud_dir.join("save.dat")).unwrap(), b"much longer");
    }

    #[tokio::test]
    async fn test_dry_run_plans_without_writing() {
        let (_root, paths) = dirs();
        write_file(&paths.local_dir, "save.dat", b"new", at(9));
        write_file(&paths.cloud_dir, "save.dat", b"old", at(1));

        let summary = SyncEngine::new()
            .run_directional_sync(Direction::ToCloud, &paths, false, true)
            .await
            .unwrap();

        assert_eq!(summary.copied_to_cloud, 1);
        assert_eq!(summary.outcomes[0].status, OutcomeStatus::Planned);
        assert_eq!(std::fs::read(paths.cloud_dir.join("save.dat")).unwrap(), b"old");
        assert!(!paths.backup_dir.exists());
    }

    #[test]
    fn test_plan_file_rules() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a", b"1", at(1));
        write_file(dir.path(), "b", b"1", at(2));
        let older = inspect(dir.path(), "a").unwrap();
        let newer = inspect(dir.path(), "b").unwrap();
        let missing = inspect(dir.path(), "c").unwrap();

        assert_eq!(plan_file(&newer, &older, false), DirectionalStep::Copy);
        assert_eq!(plan_file(&older, &missing, false), DirectionalStep::Copy);
        assert_eq!(plan_file(&older, &newer, true), DirectionalStep::Copy);
        assert_eq!(
            plan_file(&older, &newer, false),
            DirectionalStep::Skip {
                reason: REASON_DESTINATION_NEWER,
                withheld: true
            }
        );
        assert_eq!(
            plan_file(&older, &older, false),
            DirectionalStep::Skip {
                reason: REASON_FILES_EQUAL,
                withheld: false
            }
        );
    }
}
