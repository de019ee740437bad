//! 文件传输：原子替换、可用空间检查

use crate::error::{Result, SyncError};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 传输中临时文件的后缀，扫描时始终忽略
pub const TEMP_SUFFIX: &str = ".gamesync-tmp";

/// 查询目录所在卷的可用空间
pub trait SpaceProbe: Send + Sync {
    fn available_bytes(&self, dir: &Path) -> io::Result<u64>;
}

/// 基于文件系统统计信息的可用空间查询
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskSpaceProbe;

impl SpaceProbe for DiskSpaceProbe {
    fn available_bytes(&self, dir: &Path) -> io::Result<u64> {
        fs4::available_space(dir)
    }
}

/// 检查目标目录是否有足够空间；查询失败时视为足够
pub fn ensure_space(probe: &dyn SpaceProbe, dir: &Path, required: u64) -> Result<()> {
    match probe.available_bytes(dir) {
        Ok(available) if available < required => Err(SyncError::InsufficientSpace {
            path: dir.to_path_buf(),
            required,
            available,
        }),
        Ok(_) => Ok(()),
        Err(e) => {
            debug!("无法查询可用空间，继续传输: {:?} - {}", dir, e);
            Ok(())
        }
    }
}

/// 用 `src` 原子替换 `dst`，保留修改时间与权限位
///
/// 先写入目标目录中的临时文件，再重命名到位；失败时临时文件会被删除，
/// 目标文件保持原样。返回复制的字节数。
pub fn replace_file(src: &Path, dst: &Path, probe: &dyn SpaceProbe) -> Result<u64> {
    let copy_err = |source: io::Error| SyncError::Copy {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source,
    };

    let parent = dst
        .parent()
        .ok_or_else(|| copy_err(io::Error::new(io::ErrorKind::InvalidInput, "目标路径没有父目录")))?;
    fs::create_dir_all(parent).map_err(copy_err)?;

    let size = fs::metadata(src).map_err(copy_err)?.len();
    ensure_space(probe, parent, size)?;

    let temp_path = temp_path_for(dst);
    let bytes = write_copy(src, &temp_path).map_err(copy_err)?;

    let guard = scopeguard::guard(&temp_path, |p| {
        let _ = fs::remove_file(p);
    });
    fs::rename(&temp_path, dst).map_err(copy_err)?;
    scopeguard::ScopeGuard::into_inner(guard);

    debug!("写入完成: {:?} -> {:?} ({} 字节)", src, dst, bytes);
    Ok(bytes)
}

/// 把 `src` 复制为新文件 `dst`（`dst` 已存在时返回 `AlreadyExists`），保留修改时间与权限位
pub fn copy_new(src: &Path, dst: &Path) -> io::Result<u64> {
    write_copy(src, dst)
}

/// 复制到一个新建文件；创建之后的任何失败都会删除该文件
fn write_copy(src: &Path, dst: &Path) -> io::Result<u64> {
    let metadata = fs::metadata(src)?;
    let mut reader = File::open(src)?;
    let mut writer = File::options().write(true).create_new(true).open(dst)?;
    let guard = scopeguard::guard(dst, |p| {
        let _ = fs::remove_file(p);
    });

    let bytes = io::copy(&mut reader, &mut writer)?;
    writer.set_modified(metadata.modified()?)?;
    writer.sync_all()?;
    drop(writer);
    fs::set_permissions(dst, metadata.permissions())?;

    scopeguard::ScopeGuard::into_inner(guard);
    Ok(bytes)
}

fn temp_path_for(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    dst.with_file_name(format!(".{}.{}{}", name, &nonce[..8], TEMP_SUFFIX))
}
