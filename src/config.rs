//! 应用配置模块
//!
//! 所有配置保存在配置目录下的 `config.json` 中。保存时只覆盖本模块管理的键，
//! 其他键原样保留。

use crate::core::{FileScanner, ScanConfig, SyncPaths};
use crate::error::{Result, SyncError};
use crate::logging::LogConfig;
use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CONFIG_FILE: &str = "config.json";

/// 默认配置目录
pub fn default_config_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("gamesync"))
        .unwrap_or_else(|| PathBuf::from(".gamesync"))
}

/// 通用配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralConfig {
    /// 云端挂载目录；游戏的相对 `cloud` 路径以此为根
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_directory: Option<PathBuf>,
    /// 备份根目录，相对路径以配置目录为根
    #[serde(default = "default_backup_directory")]
    pub backup_directory: PathBuf,
}

fn default_backup_directory() -> PathBuf {
    PathBuf::from("backups")
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cloud_directory: None,
            backup_directory: default_backup_directory(),
        }
    }
}

/// 单个游戏的同步配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameConfig {
    pub id: String,
    pub name: String,
    pub local: PathBuf,
    pub cloud: PathBuf,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 上次成功同步的时间（ISO-8601）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl GameConfig {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        local: PathBuf,
        cloud: PathBuf,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            local,
            cloud,
            enabled: true,
            last_sync: None,
            exclude: Vec::new(),
        }
    }

    /// 解析检查点
    pub fn checkpoint(&self) -> Result<Option<DateTime<Utc>>> {
        self.last_sync
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_checkpoint)
            .transpose()
            .map_err(|e| match e {
                SyncError::Configuration(msg) => {
                    SyncError::config(format!("游戏 {} 的 lastSync 无效: {}", self.id, msg))
                }
                other => other,
            })
    }

    pub fn set_checkpoint(&mut self, checkpoint: DateTime<Utc>) {
        self.last_sync = Some(checkpoint.to_rfc3339_opts(SecondsFormat::AutoSi, true));
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig::with_excludes(self.exclude.iter().cloned())
    }
}

/// 解析 ISO-8601 时间：带时区的 RFC 3339，或按本地时间解释的无时区时间
pub fn parse_checkpoint(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }

    let naive = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .ok_or_else(|| SyncError::config(format!("无法解析时间: {:?}", value)))?;

    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| SyncError::config(format!("本地时间不存在: {:?}", value)))
}

/// `config.json` 的完整内容
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub games: Vec<GameConfig>,
}

impl AppConfig {
    /// 从配置目录加载；文件不存在时返回默认配置
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_file = config_dir.join(CONFIG_FILE);
        if !config_file.exists() {
            debug!("配置文件不存在，使用默认配置: {:?}", config_file);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_file)
            .map_err(|e| SyncError::config(format!("无法读取 {:?}: {}", config_file, e)))?;
        serde_json::from_str(&content)
            .map_err(|e| SyncError::config(format!("{:?} 格式错误: {}", config_file, e)))
    }

    /// 保存配置，保留文件中其他的键
    pub fn save(&self, config_dir: &Path) -> Result<()> {
        let config_file = config_dir.join(CONFIG_FILE);
        let write_err = |e: String| SyncError::config(format!("无法写入 {:?}: {}", config_file, e));

        fs::create_dir_all(config_dir).map_err(|e| write_err(e.to_string()))?;

        // 读取现有配置
        let mut config: serde_json::Value = fs::read_to_string(&config_file)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .filter(serde_json::Value::is_object)
            .unwrap_or_else(|| serde_json::json!({}));

        let ours = serde_json::to_value(self).map_err(|e| write_err(e.to_string()))?;
        if let (Some(target), serde_json::Value::Object(values)) = (config.as_object_mut(), ours) {
            target.extend(values);
        }

        let content = serde_json::to_string_pretty(&config).map_err(|e| write_err(e.to_string()))?;
        fs::write(&config_file, content).map_err(|e| write_err(e.to_string()))
    }

    pub fn game(&self, id: &str) -> Result<&GameConfig> {
        self.games
            .iter()
            .find(|g| g.id == id)
            .ok_or_else(|| SyncError::config(format!("未知的游戏: {}", id)))
    }

    pub fn game_mut(&mut self, id: &str) -> Result<&mut GameConfig> {
        self.games
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or_else(|| SyncError::config(format!("未知的游戏: {}", id)))
    }

    pub fn add_game(&mut self, game: GameConfig) -> Result<()> {
        if game.id.trim().is_empty() {
            return Err(SyncError::config("游戏 id 不能为空"));
        }
        if self.games.iter().any(|g| g.id == game.id) {
            return Err(SyncError::config(format!("游戏已存在: {}", game.id)));
        }
        FileScanner::new(&game.scan_config())?;
        info!("添加游戏: {} ({})", game.id, game.name);
        self.games.push(game);
        Ok(())
    }

    pub fn remove_game(&mut self, id: &str) -> Result<GameConfig> {
        let index = self
            .games
            .iter()
            .position(|g| g.id == id)
            .ok_or_else(|| SyncError::config(format!("未知的游戏: {}", id)))?;
        info!("移除游戏: {}", id);
        Ok(self.games.remove(index))
    }

    /// 备份根目录
    pub fn backup_root(&self, config_dir: &Path) -> PathBuf {
        if self.general.backup_directory.is_absolute() {
            self.general.backup_directory.clone()
        } else {
            config_dir.join(&self.general.backup_directory)
        }
    }

    /// 解析并校验游戏的同步路径
    pub fn resolve_paths(&self, config_dir: &Path, game: &GameConfig) -> Result<SyncPaths> {
        if game.local.as_os_str().is_empty() {
            return Err(SyncError::config(format!("游戏 {} 的本地路径为空", game.id)));
        }
        if game.cloud.as_os_str().is_empty() {
            return Err(SyncError::config(format!("游戏 {} 的云端路径为空", game.id)));
        }

        let cloud_dir = if game.cloud.is_absolute() {
            game.cloud.clone()
        } else {
            let root = self.general.cloud_directory.as_ref().ok_or_else(|| {
                SyncError::config(format!(
                    "游戏 {} 的云端路径是相对路径，但没有配置 cloudDirectory",
                    game.id
                ))
            })?;
            root.join(&game.cloud)
        };

        if let Some(root) = &self.general.cloud_directory {
            if !root.is_dir() {
                return Err(SyncError::config(format!("云端目录不存在（未挂载？）: {:?}", root)));
            }
        }

        FileScanner::new(&game.scan_config())?;

        let paths = SyncPaths::new(
            &game.local,
            cloud_dir,
            self.backup_root(config_dir).join(&game.id),
        );
        paths.validate()?;
        Ok(paths)
    }
}

/// 创建配置目录结构；返回是否新建了配置文件
pub fn init(config_dir: &Path) -> Result<bool> {
    let io_err = |path: &Path, e: std::io::Error| {
        SyncError::config(format!("无法创建 {:?}: {}", path, e))
    };

    for dir in [config_dir.to_path_buf(), config_dir.join("backups"), config_dir.join("logs")] {
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    }

    if config_dir.join(CONFIG_FILE).exists() {
        return Ok(false);
    }
    AppConfig::default().save(config_dir)?;
    info!("已创建配置文件: {:?}", config_dir.join(CONFIG_FILE));
    Ok(true)
}
