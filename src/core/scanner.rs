use crate::core::transfer::TEMP_SUFFIX;
use crate::error::{Result, SyncError};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 文件扫描器配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// 排除规则（glob，匹配文件名，不区分大小写）
    pub exclude_patterns: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: vec![
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                "desktop.ini".to_string(),
            ],
        }
    }
}

impl ScanConfig {
    /// 在默认规则之外追加排除规则
    pub fn with_excludes<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = Self::default();
        config
            .exclude_patterns
            .extend(patterns.into_iter().map(Into::into));
        config
    }
}

/// 一个目录顶层的扫描结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    /// 可同步的文件名
    pub files: BTreeSet<String>,
    /// 文件名不是有效 UTF-8 的文件：显示名 -> 实际路径
    pub non_utf8: BTreeMap<String, PathBuf>,
}

/// 目录扫描器（只扫描顶层文件，不进入子目录）
#[derive(Debug, Clone)]
pub struct FileScanner {
    excludes: Vec<(String, Regex)>,
}

impl FileScanner {
    pub fn new(config: &ScanConfig) -> Result<Self> {
        let excludes = config
            .exclude_patterns
            .iter()
            .map(|p| Ok((p.clone(), compile_pattern(p)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { excludes })
    }

    /// 检查文件名是否应该被排除
    pub fn should_exclude(&self, name: &str) -> bool {
        if name.ends_with(TEMP_SUFFIX) {
            return true;
        }
        self.excludes.iter().any(|(_, re)| re.is_match(name))
    }

    /// 列出目录顶层的所有普通文件
    ///
    /// 目录不存在时返回空结果；目录不可读时返回 [`SyncError::Inspection`]。
    /// 非 UTF-8 文件名不参与同步，单独放在 [`Listing::non_utf8`] 中。
    pub fn list_files(&self, dir: &Path) -> Result<Listing> {
        if !dir.exists() {
            debug!("目录不存在，视为空: {:?}", dir);
            return Ok(Listing::default());
        }

        let mut listing = Listing::default();
        let mut excluded_count = 0;

        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
        {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("目录遍历失败"));
                SyncError::inspection(path, source)
            })?;

            if !entry.file_type().is_file() {
                continue;
            }

            let Some(name) = entry.file_name().to_str() else {
                let display = entry.file_name().to_string_lossy().to_string();
                if !self.should_exclude(&display) {
                    warn!("文件名不是有效的 UTF-8，无法同步: {:?}", entry.path());
                    listing.non_utf8.insert(display, entry.path().to_path_buf());
                }
                continue;
            };

            if self.should_exclude(name) {
                debug!("排除文件: {}", name);
                excluded_count += 1;
                continue;
            }

            listing.files.insert(name.to_string());
        }

        info!(
            "扫描完成: {:?} - {} 个文件, {} 个被排除",
            dir,
            listing.files.len(),
            excluded_count
        );

        Ok(listing)
    }
}

/// 把 glob 规则编译为正则（支持 `*` 和 `?`）
fn compile_pattern(pattern: &str) -> Result<Regex> {
    let mut regex_pattern = String::from("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex_pattern.push_str(".*"),
            '?' => regex_pattern.push('.'),
            c => regex_pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex_pattern.push('$');

    Regex::new(&regex_pattern)
        .map_err(|e| SyncError::config(format!("无效的排除规则 {:?}: {}", pattern, e)))
}
