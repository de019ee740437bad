//! 覆盖前备份
//!
//! 备份文件名是对外约定，人工查看备份时依赖它：
//! `<原文件名>.<YYYYMMDD-HHMMSS>.<local|cloud>.backup`

use crate::core::inspector::SourceTag;
use crate::core::transfer::copy_new;
use crate::error::{Result, SyncError};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// 同一秒内同名备份的最大重试次数
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// 备份记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// 被备份文件的相对路径
    pub original_path: String,
    pub created_at: DateTime<Utc>,
    pub source: SourceTag,
    pub backup_name: String,
    pub backup_path: PathBuf,
}

/// 备份管理器
///
/// 一次同步运行共用一个实例；写入同一备份目录的操作在内部串行化。
#[derive(Debug)]
pub struct BackupManager {
    backup_dir: PathBuf,
    /// 同步开始时间，用于备份文件名
    stamp: String,
    lock: Mutex<()>,
}

impl BackupManager {
    pub fn new(backup_dir: impl Into<PathBuf>, sync_started_at: DateTime<Utc>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            stamp: format_stamp(sync_started_at),
            lock: Mutex::new(()),
        }
    }

    /// 本次运行的时间戳（`YYYYMMDD-HHMMSS`，本地时区）
    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    /// 在覆盖 `file_path` 之前备份它
    pub fn backup(&self, file_path: &Path, source: SourceTag) -> Result<BackupRecord> {
        let backup_err = |source: io::Error| SyncError::Backup {
            path: file_path.to_path_buf(),
            source,
        };

        let original_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| backup_err(io::Error::new(io::ErrorKind::InvalidInput, "路径没有文件名")))?;

        // 锁被毒化只说明另一个备份线程 panic 过，目录本身仍然可用
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        std::fs::create_dir_all(&self.backup_dir).map_err(backup_err)?;

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let backup_name = backup_file_name(&original_name, &self.stamp, attempt, source);
            let backup_path = self.backup_dir.join(&backup_name);

            match copy_new(file_path, &backup_path) {
                Ok(bytes) => {
                    info!("已创建备份: {:?} ({} 字节)", backup_path, bytes);
                    return Ok(BackupRecord {
                        original_path: original_name,
                        created_at: Utc::now(),
                        source,
                        backup_name,
                        backup_path,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(backup_err(e)),
            }
        }

        Err(backup_err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "无法生成唯一的备份文件名",
        )))
    }
}

/// 本地时区的 `YYYYMMDD-HHMMSS`
pub fn format_stamp(instant: DateTime<Utc>) -> String {
    instant
        .with_timezone(&Local)
        .format("%Y%m%d-%H%M%S")
        .to_string()
}

/// 生成备份文件名；`attempt > 0` 时在时间戳后追加 `-N`
pub fn backup_file_name(
    original_name: &str,
    stamp: &str,
    attempt: u32,
    source: SourceTag,
) -> String {
    if attempt == 0 {
        format!("{}.{}.{}.backup", original_name, stamp, source)
    } else {
        format!("{}.{}-{}.{}.backup", original_name, stamp, attempt, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{at, mtime, write_file};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_backup_file_name_format() {
        assert_eq!(
            backup_file_name("save.dat", "20260101-120000", 0, SourceTag::Cloud),
            "save.dat.20260101-120000.cloud.backup"
        );
        assert_eq!(
            backup_file_name("save.dat", "20260101-120000", 2, SourceTag::Local),
            "save.dat.20260101-120000-2.local.backup"
        );
    }

    #[test]
    fn test_backup_copies_file_into_backup_dir() {
        let dir = tempfile::tempdir().unwrap();
        let original = write_file(dir.path(), "save.dat", b"precious", at(42));
        let started = at(1000);
        let manager = BackupManager::new(dir.path().join("backups").join("hades"), started);

        let record = manager.backup(&original, SourceTag::Local).unwrap();

        let expected_name = format!("save.dat.{}.local.backup", format_stamp(started));
        assert_eq!(record.backup_name, expected_name);
        assert_eq!(record.original_path, "save.dat");
        assert_eq!(record.source, SourceTag::Local);
        assert_eq!(std::fs::read(&record.backup_path).unwrap(), b"precious");
        assert_eq!(mtime(&record.backup_path), at(42));
        // 原文件不受影响
        assert_eq!(std::fs::read(&original).unwrap(), b"precious");
    }

    #[test]
    fn test_backup_names_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let original = write_file(dir.path(), "save.dat", b"v1", at(1));
        let manager = BackupManager::new(dir.path().join("backups"), at(1000));

        let first = manager.backup(&original, SourceTag::Cloud).unwrap();
        std::fs::write(&original, b"v2").unwrap();
        let second = manager.backup(&original, SourceTag::Cloud).unwrap();

        assert_ne!(first.backup_path, second.backup_path);
        assert_eq!(std::fs::read(&first.backup_path).unwrap(), b"v1");
        assert_eq!(std::fs::read(&second.backup_path).unwrap(), b"v2");
    }

    #[cfg(unix)]
    #[test]
    fn test_unwritable_backup_dir_is_backup_error() {
        let dir = tempfile::tempdir().unwrap();
        let original = write_file(dir.path(), "save.dat", b"data", at(1));
        // 备份目录的父路径是一个普通文件，无法创建目录
        let blocker = write_file(dir.path(), "blocker", b"", at(1));
        let manager = BackupManager::new(blocker.join("backups"), at(1000));

        let err = manager.backup(&original, SourceTag::Local).unwrap_err();
        assert_eq!(err.kind(), "BackupError");
    }
}
