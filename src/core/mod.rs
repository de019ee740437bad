pub mod backup;
pub mod comparator;
pub mod conflict;
pub mod directional;
pub mod engine;
pub mod inspector;
pub mod scanner;
pub mod transfer;

pub use backup::{BackupManager, BackupRecord};
pub use comparator::{
    ActionSummary, ConflictReason, FileComparator, SyncAction, SyncDecision, UnsupportedReason,
};
pub use conflict::{
    Conflict, ConflictRequest, ConflictResolver, ConflictResponse, ConflictStrategy,
    ResolutionMode, ResolutionState,
};
pub use directional::Direction;
pub use engine::{FileOutcome, OutcomeStatus, SyncConfig, SyncEngine, SyncPaths, SyncSummary};
pub use inspector::{FileRecord, SourceTag};
pub use scanner::{FileScanner, Listing, ScanConfig};
pub use transfer::{DiskSpaceProbe, SpaceProbe};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::core::transfer::SpaceProbe;
    use chrono::{DateTime, Utc};
    use std::fs::File;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, SystemTime};

    const BASE_SECS: i64 = 1_700_000_000;

    /// 测试基准时间之后 `secs` 秒
    pub fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(BASE_SECS + secs, 0).unwrap()
    }

    /// 写入文件并设置修改时间
    pub fn write_file(dir: &Path, name: &str, bytes: &[u8], when: DateTime<Utc>) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        let system_time = SystemTime::UNIX_EPOCH + Duration::from_secs(when.timestamp() as u64);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(system_time)
            .unwrap();
        path
    }

    pub fn mtime(path: &Path) -> DateTime<Utc> {
        DateTime::<Utc>::from(std::fs::metadata(path).unwrap().modified().unwrap())
    }

    /// 固定可用空间
    pub struct FixedSpace(pub u64);

    impl SpaceProbe for FixedSpace {
        fn available_bytes(&self, _dir: &Path) -> std::io::Result<u64> {
            Ok(self.0)
        }
    }
}
