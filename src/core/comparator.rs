use crate::core::inspector::{inspect, inspect_entry, is_identical, FileRecord, SourceTag};
use crate::core::scanner::{FileScanner, Listing};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

/// 同步动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "reason")]
pub enum SyncAction {
    /// 本地 -> 云端
    CopyToCloud,
    /// 云端 -> 本地
    CopyToLocal,
    /// 跳过（文件相同）
    Skip,
    /// 冲突（需要决定）
    Conflict(ConflictReason),
    /// 无法同步，只报告
    Unsupported(UnsupportedReason),
}

/// 冲突原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConflictReason {
    /// 两边都在上次同步后修改过
    #[serde(rename = "both-modified-since-checkpoint")]
    BothModifiedSinceCheckpoint,
    /// 修改时间相同但大小不同
    #[serde(rename = "size-mismatch-same-timestamp")]
    SizeMismatchSameTimestamp,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::BothModifiedSinceCheckpoint => {
                write!(f, "both-modified-since-checkpoint")
            }
            ConflictReason::SizeMismatchSameTimestamp => write!(f, "size-mismatch-same-timestamp"),
        }
    }
}

/// 无法同步的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnsupportedReason {
    /// 该侧的同名路径不是普通文件
    NotAFile(SourceTag),
    /// 文件名不是有效的 UTF-8
    NonUtf8Name,
}

impl UnsupportedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnsupportedReason::NotAFile(SourceTag::Local) => "type mismatch (not a file on local)",
            UnsupportedReason::NotAFile(SourceTag::Cloud) => "type mismatch (not a file on cloud)",
            UnsupportedReason::NonUtf8Name => "non-UTF-8 file name",
        }
    }

    /// 两侧记录中第一个不是普通文件的一侧
    pub fn for_records(local: &FileRecord, cloud: &FileRecord) -> Option<Self> {
        if local.is_non_file() {
            Some(UnsupportedReason::NotAFile(SourceTag::Local))
        } else if cloud.is_non_file() {
            Some(UnsupportedReason::NotAFile(SourceTag::Cloud))
        } else {
            None
        }
    }
}

impl std::fmt::Display for UnsupportedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for UnsupportedReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// 一个相对路径在两侧的比较结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDecision {
    pub path: String,
    pub action: SyncAction,
    pub local: FileRecord,
    pub cloud: FileRecord,
}

impl SyncDecision {
    /// 该动作需要传输的字节数
    pub fn transfer_bytes(&self) -> u64 {
        match self.action {
            SyncAction::CopyToCloud => self.local.size,
            SyncAction::CopyToLocal => self.cloud.size,
            SyncAction::Skip | SyncAction::Conflict(_) | SyncAction::Unsupported(_) => 0,
        }
    }
}

/// 文件比较器
pub struct FileComparator {
    scanner: FileScanner,
}

impl FileComparator {
    pub fn new(scanner: FileScanner) -> Self {
        Self { scanner }
    }

    /// 比较本地与云端目录（仅顶层），按路径排序返回每个文件的同步决定
    pub fn compare_dirs(
        &self,
        local_dir: &Path,
        cloud_dir: &Path,
        checkpoint: Option<DateTime<Utc>>,
    ) -> Result<Vec<SyncDecision>> {
        let local_listing = self.scanner.list_files(local_dir)?;
        let cloud_listing = self.scanner.list_files(cloud_dir)?;
        Self::compare_listings(local_dir, cloud_dir, &local_listing, &cloud_listing, checkpoint)
    }

    /// 基于已扫描的文件列表生成决定
    ///
    /// 非 UTF-8 文件名的文件不做比较，直接以 [`SyncAction::Unsupported`] 报告。
    pub fn compare_listings(
        local_dir: &Path,
        cloud_dir: &Path,
        local_listing: &Listing,
        cloud_listing: &Listing,
        checkpoint: Option<DateTime<Utc>>,
    ) -> Result<Vec<SyncDecision>> {
        let all_paths: BTreeSet<&String> = local_listing
            .files
            .iter()
            .chain(cloud_listing.files.iter())
            .collect();

        let mut decisions = Vec::with_capacity(all_paths.len());
        for path in all_paths {
            let local = inspect(local_dir, path)?;
            let cloud = inspect(cloud_dir, path)?;
            let action = Self::decide(&local, &cloud, checkpoint)?;

            match action {
                SyncAction::Conflict(reason) => warn!("检测到冲突: {} ({})", path, reason),
                SyncAction::Unsupported(reason) => warn!("无法同步: {} ({})", path, reason),
                _ => debug!("同步决定: {} -> {:?}", path, action),
            }

            decisions.push(SyncDecision {
                path: path.clone(),
                action,
                local,
                cloud,
            });
        }

        let non_utf8: BTreeSet<&String> = local_listing
            .non_utf8
            .keys()
            .chain(cloud_listing.non_utf8.keys())
            .collect();
        for name in non_utf8 {
            let side = |root: &Path, listing: &Listing| match listing.non_utf8.get(name) {
                Some(actual) => inspect_entry(name, actual.clone()),
                None => inspect(root, name),
            };
            decisions.push(SyncDecision {
                path: name.clone(),
                action: SyncAction::Unsupported(UnsupportedReason::NonUtf8Name),
                local: side(local_dir, local_listing)?,
                cloud: side(cloud_dir, cloud_listing)?,
            });
        }
        decisions.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(decisions)
    }

    /// 单个文件的判定规则
    ///
    /// 时间比较一律使用严格的 `>`，时间与大小都相同时不复制。
    /// 没有检查点（首次同步）时不判定“两边都修改”的冲突。
    /// 任一侧不是普通文件时不做任何比较。
    pub fn decide(
        local: &FileRecord,
        cloud: &FileRecord,
        checkpoint: Option<DateTime<Utc>>,
    ) -> Result<SyncAction> {
        if let Some(reason) = UnsupportedReason::for_records(local, cloud) {
            return Ok(SyncAction::Unsupported(reason));
        }

        let (local_time, cloud_time) = match (local.modified, cloud.modified) {
            (Some(_), None) => return Ok(SyncAction::CopyToCloud),
            (None, Some(_)) => return Ok(SyncAction::CopyToLocal),
            (None, None) => return Ok(SyncAction::Skip),
            (Some(l), Some(c)) => (l, c),
        };

        if let Some(checkpoint) = checkpoint {
            if local.modified_after(checkpoint)
                && cloud.modified_after(checkpoint)
                && !is_identical(local, cloud)?
            {
                return Ok(SyncAction::Conflict(
                    ConflictReason::BothModifiedSinceCheckpoint,
                ));
            }
        }

        if local_time == cloud_time && local.size != cloud.size {
            return Ok(SyncAction::Conflict(
                ConflictReason::SizeMismatchSameTimestamp,
            ));
        }

        Ok(if local_time > cloud_time {
            SyncAction::CopyToCloud
        } else if cloud_time > local_time {
            SyncAction::CopyToLocal
        } else {
            SyncAction::Skip
        })
    }

    /// 统计同步动作
    pub fn summarize_actions(decisions: &[SyncDecision]) -> ActionSummary {
        let mut summary = ActionSummary::default();

        for decision in decisions {
            let path = decision.path.clone();
            match decision.action {
                SyncAction::CopyToCloud => {
                    summary.copy_to_cloud_bytes += decision.transfer_bytes();
                    summary.copy_to_cloud.push(path);
                }
                SyncAction::CopyToLocal => {
                    summary.copy_to_local_bytes += decision.transfer_bytes();
                    summary.copy_to_local.push(path);
                }
                SyncAction::Skip => summary.skip.push(path),
                SyncAction::Conflict(_) => summary.conflicts.push(path),
                SyncAction::Unsupported(_) => summary.unsupported.push(path),
            }
        }

        summary
    }
}

/// 动作统计
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSummary {
    pub copy_to_cloud: Vec<String>,
    pub copy_to_cloud_bytes: u64,
    pub copy_to_local: Vec<String>,
    pub copy_to_local_bytes: u64,
    pub skip: Vec<String>,
    pub conflicts: Vec<String>,
    pub unsupported: Vec<String>,
}

impl ActionSummary {
    pub fn total_files(&self) -> usize {
        self.copy_to_cloud.len()
            + self.copy_to_local.len()
            + self.skip.len()
            + self.conflicts.len()
            + self.unsupported.len()
    }

    pub fn total_transfer_bytes(&self) -> u64 {
        self.copy_to_cloud_bytes + self.copy_to_local_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scanner::ScanConfig;
    use crate::core::test_support::{at, write_file};
    use pretty_assertions::assert_eq;

    fn comparator() -> FileComparator {
        FileComparator::new(FileScanner::new(&ScanConfig::default()).unwrap())
    }

    fn actions(decisions: &[SyncDecision]) -> Vec<(&str, SyncAction)> {
        decisions
            .iter()
            .map(|d| (d.path.as_str(), d.action))
            .collect()
    }

    #[test]
    fn test_one_sided_files_copy_towards_missing_side() {
        let local = tempfile::tempdir().unwrap();
        let cloud = tempfile::tempdir().unwrap();
        write_file(local.path(), "only_local.sav", b"l", at(100));
        write_file(cloud.path(), "only_cloud.sav", b"c", at(100));

        for checkpoint in [None, Some(at(0)), Some(at(500))] {
            let decisions = comparator()
                .compare_dirs(local.path(), cloud.path(), checkpoint)
                .unwrap();
            assert_eq!(
                actions(&decisions),
                vec![
                    ("only_cloud.sav", SyncAction::CopyToLocal),
                    ("only_local.sav", SyncAction::CopyToCloud),
                ]
            );
        }
    }

    #[test]
    fn test_local_newer_copies_to_cloud() {
        let local = tempfile::tempdir().unwrap();
        let cloud = tempfile::tempdir().unwrap();
        write_file(local.path(), "save.dat", &[1u8; 100], at(1010));
        write_file(cloud.path(), "save.dat", &[1u8; 100], at(1005));

        let decisions = comparator()
            .compare_dirs(local.path(), cloud.path(), Some(at(1000)))
            .unwrap();

        assert_eq!(actions(&decisions), vec![("save.dat", SyncAction::CopyToCloud)]);
    }

    #[test]
    fn test_both_modified_since_checkpoint_is_conflict() {
        let local = tempfile::tempdir().unwrap();
        let cloud = tempfile::tempdir().unwrap();
        write_file(local.path(), "save.dat", b"local progress", at(1010));
        write_file(cloud.path(), "save.dat", b"cloud progress", at(1012));

        let decisions = comparator()
            .compare_dirs(local.path(), cloud.path(), Some(at(999)))
            .unwrap();

        assert_eq!(
            actions(&decisions),
            vec![(
                "save.dat",
                SyncAction::Conflict(ConflictReason::BothModifiedSinceCheckpoint)
            )]
        );
    }

    #[test]
    fn test_both_modified_but_identical_is_not_conflict() {
        let local = tempfile::tempdir().unwrap();
        let cloud = tempfile::tempdir().unwrap();
        write_file(local.path(), "save.dat", b"same bytes", at(1010));
        write_file(cloud.path(), "save.dat", b"same bytes", at(1012));

        let decisions = comparator()
            .compare_dirs(local.path(), cloud.path(), Some(at(999)))
            .unwrap();

        assert_eq!(actions(&decisions), vec![("save.dat", SyncAction::CopyToLocal)]);
    }

    #[test]
    fn test_same_timestamp_different_size_is_conflict() {
        let local = tempfile::tempdir().unwrap();
        let cloud = tempfile::tempdir().unwrap();
        write_file(local.path(), "save.dat", b"short", at(1000));
        write_file(cloud.path(), "save.dat", b"much longer", at(1000));

        for checkpoint in [None, Some(at(2000))] {
            let decisions = comparator()
                .compare_dirs(local.path(), cloud.path(), checkpoint)
                .unwrap();
            assert_eq!(
                actions(&decisions),
                vec![(
                    "save.dat",
                    SyncAction::Conflict(ConflictReason::SizeMismatchSameTimestamp)
                )]
            );
        }
    }

    #[test]
    fn test_equal_files_skip() {
        let local = tempfile::tempdir().unwrap();
        let cloud = tempfile::tempdir().unwrap();
        write_file(local.path(), "save.dat", b"abc", at(1000));
        write_file(cloud.path(), "save.dat", b"abc", at(1000));
        write_file(local.path(), "slot2.dat", b"abc", at(1000));
        write_file(cloud.path(), "slot2.dat", b"xyz", at(1000));

        for checkpoint in [None, Some(at(500)), Some(at(1000))] {
            let decisions = comparator()
                .compare_dirs(local.path(), cloud.path(), checkpoint)
                .unwrap();
            let expected_slot2 = match checkpoint {
                // 检查点之后两边都修改过且内容不同
                Some(c) if c < at(1000) => {
                    SyncAction::Conflict(ConflictReason::BothModifiedSinceCheckpoint)
                }
                _ => SyncAction::Skip,
            };
            assert_eq!(
                actions(&decisions),
                vec![("save.dat", SyncAction::Skip), ("slot2.dat", expected_slot2)]
            );
        }
    }

    #[test]
    fn test_first_sync_falls_back_to_mtime() {
        let local = tempfile::tempdir().unwrap();
        let cloud = tempfile::tempdir().unwrap();
        write_file(local.path(), "save.dat", b"local", at(1010));
        write_file(cloud.path(), "save.dat", b"cloud!", at(1012));

        let decisions = comparator()
            .compare_dirs(local.path(), cloud.path(), None)
            .unwrap();

        assert_eq!(actions(&decisions), vec![("save.dat", SyncAction::CopyToLocal)]);
    }

    #[test]
    fn test_directory_on_one_side_is_unsupported() {
        let local = tempfile::tempdir().unwrap();
        let cloud = tempfile::tempdir().unwrap();
        write_file(local.path(), "slot", b"file", at(100));
        std::fs::create_dir(cloud.path().join("slot")).unwrap();
        write_file(local.path(), "other.sav", b"o", at(100));

        let decisions = comparator()
            .compare_dirs(local.path(), cloud.path(), Some(at(50)))
            .unwrap();

        assert_eq!(
            actions(&decisions),
            vec![
                ("other.sav", SyncAction::CopyToCloud),
                (
                    "slot",
                    SyncAction::Unsupported(UnsupportedReason::NotAFile(SourceTag::Cloud))
                ),
            ]
        );
        assert_eq!(
            UnsupportedReason::NotAFile(SourceTag::Cloud).to_string(),
            "type mismatch (not a file on cloud)"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_name_is_reported() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let local = tempfile::tempdir().unwrap();
        let cloud = tempfile::tempdir().unwrap();
        std::fs::write(local.path().join(OsStr::from_bytes(b"save\xff.dat")), b"x").unwrap();

        let decisions = comparator()
            .compare_dirs(local.path(), cloud.path(), None)
            .unwrap();

        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].path, "save\u{FFFD}.dat");
        assert_eq!(
            decisions[0].action,
            SyncAction::Unsupported(UnsupportedReason::NonUtf8Name)
        );
        assert!(decisions[0].local.exists);
        assert_eq!(decisions[0].local.size, 1);
        assert!(!decisions[0].cloud.exists);
    }

    #[test]
    fn test_summarize_actions() {
        let local = tempfile::tempdir().unwrap();
        let cloud = tempfile::tempdir().unwrap();
        write_file(local.path(), "a.sav", &[0u8; 10], at(200));
        write_file(cloud.path(), "b.sav", &[0u8; 7], at(200));
        write_file(local.path(), "c.sav", b"c", at(300));
        write_file(cloud.path(), "c.sav", b"c", at(300));

        let decisions = comparator()
            .compare_dirs(local.path(), cloud.path(), None)
            .unwrap();
        let summary = FileComparator::summarize_actions(&decisions);

        assert_eq!(summary.copy_to_cloud, vec!["a.sav".to_string()]);
        assert_eq!(summary.copy_to_local, vec!["b.sav".to_string()]);
        assert_eq!(summary.skip, vec!["c.sav".to_string()]);
        assert_eq!(summary.total_files(), 3);
        assert_eq!(summary.total_transfer_bytes(), 17);
    }
}
