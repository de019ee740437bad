//! 同步核心的错误类型

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// 同步核心错误
///
/// `Inspection` 与 `Configuration` 是结构性错误，会在任何写操作之前中止整个同步；
/// 其余错误只影响单个文件，会被记录到 [`SyncSummary`](crate::core::SyncSummary) 中。
#[derive(Debug, Error)]
pub enum SyncError {
    /// 读取文件元数据失败（不包括文件不存在）
    #[error("无法读取 {path}: {source}")]
    Inspection {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 无法创建或写入备份
    #[error("备份 {path} 失败: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 写入目标文件失败
    #[error("复制 {from} -> {to} 失败: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 目标卷空间不足
    #[error("{path} 空间不足: 需要 {required} 字节, 可用 {available} 字节")]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// 配置无效，在同步逻辑运行前报告
    #[error("配置错误: {0}")]
    Configuration(String),
}

impl SyncError {
    pub fn inspection(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Inspection {
            path: path.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// 错误分类名称，用于报告
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Inspection { .. } => "InspectionError",
            SyncError::Backup { .. } => "BackupError",
            SyncError::Copy { .. } => "CopyError",
            SyncError::InsufficientSpace { .. } => "InsufficientSpaceError",
            SyncError::Configuration(_) => "ConfigurationError",
        }
    }

    /// 是否为需要中止整个运行的结构性错误
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            SyncError::Inspection { .. } | SyncError::Configuration(_)
        )
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
