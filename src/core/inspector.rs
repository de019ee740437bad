//! 单文件检查：大小、修改时间，以及按需计算的内容校验和

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// 文件所在的一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Local,
    Cloud,
}

impl SourceTag {
    pub fn other(self) -> Self {
        match self {
            SourceTag::Local => SourceTag::Cloud,
            SourceTag::Cloud => SourceTag::Local,
        }
    }
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceTag::Local => write!(f, "local"),
            SourceTag::Cloud => write!(f, "cloud"),
        }
    }
}

/// 某一侧的一个文件
///
/// 每次比较时重新生成，从不持久化。文件不存在时 `exists == false`，
/// `size` 为 0，`modified` 为 `None`。路径上是目录等非普通文件时
/// `exists == true` 但 `is_file == false`，同样没有大小和修改时间。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub exists: bool,
    pub is_file: bool,
}

impl FileRecord {
    fn missing(relative_path: &str, absolute_path: PathBuf) -> Self {
        Self {
            relative_path: relative_path.to_string(),
            absolute_path,
            size: 0,
            modified: None,
            exists: false,
            is_file: false,
        }
    }

    /// 路径存在但不是普通文件（目录、设备等）
    pub fn is_non_file(&self) -> bool {
        self.exists && !self.is_file
    }

    /// 修改时间是否严格晚于给定时间点
    pub fn modified_after(&self, instant: DateTime<Utc>) -> bool {
        self.modified.is_some_and(|m| m > instant)
    }
}

/// 检查 `root` 下的 `relative_path`
///
/// 文件不存在不是错误；只有权限等其他 I/O 问题才返回 [`SyncError::Inspection`]。
pub fn inspect(root: &Path, relative_path: &str) -> Result<FileRecord> {
    inspect_entry(relative_path, root.join(relative_path))
}

/// 按绝对路径检查，`relative_path` 只用于显示
pub fn inspect_entry(relative_path: &str, absolute_path: PathBuf) -> Result<FileRecord> {
    let metadata = match std::fs::metadata(&absolute_path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(FileRecord::missing(relative_path, absolute_path));
        }
        Err(e) => return Err(SyncError::inspection(absolute_path, e)),
    };

    if !metadata.is_file() {
        return Ok(FileRecord {
            exists: true,
            ..FileRecord::missing(relative_path, absolute_path)
        });
    }

    let modified = metadata
        .modified()
        .map_err(|e| SyncError::inspection(&absolute_path, e))?;

    Ok(FileRecord {
        relative_path: relative_path.to_string(),
        absolute_path,
        size: metadata.len(),
        modified: Some(DateTime::<Utc>::from(modified)),
        exists: true,
        is_file: true,
    })
}

/// 计算文件内容的 BLAKE3 校验和（流式读取）
pub fn content_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| SyncError::inspection(path, e))?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher).map_err(|e| SyncError::inspection(path, e))?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// 两个文件是否字节级相同
pub fn is_identical(a: &FileRecord, b: &FileRecord) -> Result<bool> {
    if !a.exists || !b.exists || a.size != b.size {
        return Ok(false);
    }
    Ok(content_checksum(&a.absolute_path)? == content_checksum(&b.absolute_path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let record = inspect(dir.path(), "nope.sav").unwrap();

        assert!(!record.exists);
        assert_eq!(record.size, 0);
        assert_eq!(record.modified, None);
        assert_eq!(record.absolute_path, dir.path().join("nope.sav"));
    }

    #[test]
    fn test_inspect_reads_size_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("save.dat");
        std::fs::write(&path, b"0123456789").unwrap();
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(when)
            .unwrap();

        let record = inspect(dir.path(), "save.dat").unwrap();

        assert!(record.exists);
        assert_eq!(record.size, 10);
        assert_eq!(record.modified, Some(DateTime::<Utc>::from(when)));
    }

    #[test]
    fn test_directory_is_reported_not_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let record = inspect(dir.path(), "sub").unwrap();

        assert!(record.exists);
        assert!(!record.is_file);
        assert!(record.is_non_file());
        assert_eq!(record.modified, None);
        assert!(!inspect(dir.path(), "absent").unwrap().is_non_file());
    }

    #[test]
    fn test_identical_compares_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"same").unwrap();
        std::fs::write(dir.path().join("b"), b"same").unwrap();
        std::fs::write(dir.path().join("c"), b"diff").unwrap();

        let a = inspect(dir.path(), "a").unwrap();
        let b = inspect(dir.path(), "b").unwrap();
        let c = inspect(dir.path(), "c").unwrap();

        assert!(is_identical(&a, &b).unwrap());
        assert!(!is_identical(&a, &c).unwrap());
    }
}
