use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use gamesync_lib::config::{self, AppConfig, GameConfig};
use gamesync_lib::core::{
    ConflictRequest, ConflictResponse, ConflictStrategy, Direction, FileComparator,
    OutcomeStatus, ResolutionMode, SyncAction, SyncConfig, SyncEngine, SyncSummary,
};
use gamesync_lib::logging::{log_dir, LogConfig, SizeRotatingWriter};
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "gamesync", version, about = "在本地目录与云端挂载目录之间同步游戏存档")]
struct Cli {
    /// 配置目录（默认为系统配置目录下的 gamesync）
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// 同时在终端输出日志
    #[arg(short, long, global = true)]
    verbose: bool,

    /// 以 JSON 输出结果
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 创建配置目录与默认配置
    Init,
    /// 管理游戏
    Games {
        #[command(subcommand)]
        action: GamesCommand,
    },
    /// 查看两侧差异，不做任何修改
    Status { game: String },
    /// 双向同步
    Sync(SyncArgs),
    /// 本地 -> 云端
    Push(DirectionalArgs),
    /// 云端 -> 本地
    Pull(DirectionalArgs),
}

#[derive(Subcommand)]
enum GamesCommand {
    List,
    Add {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        local: PathBuf,
        /// 绝对路径，或相对于 cloudDirectory 的路径
        #[arg(long)]
        cloud: PathBuf,
        #[arg(long)]
        exclude: Vec<String>,
    },
    Remove {
        id: String,
    },
}

#[derive(Args)]
struct SyncArgs {
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    game: Option<String>,
    /// 同步所有启用的游戏
    #[arg(long)]
    all: bool,
    #[arg(long)]
    dry_run: bool,
    /// 非交互地用同一策略解决所有冲突: keep-local | keep-cloud | keep-both
    #[arg(long, conflicts_with = "report_only")]
    strategy: Option<ConflictStrategy>,
    /// 交互模式下每种冲突原因只询问一次
    #[arg(long)]
    batch: bool,
    /// 只报告冲突，不解决
    #[arg(long)]
    report_only: bool,
}

#[derive(Args)]
struct DirectionalArgs {
    game: String,
    /// 即使目标文件更新也覆盖（会先备份）
    #[arg(long)]
    force: bool,
    #[arg(long)]
    dry_run: bool,
}

/// 初始化日志系统
fn init_logging(config_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    let config = LogConfig::load(config_dir);

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(config.tracing_level().into())
        .from_env_lossy();

    let console_layer = verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    let writer = if config.enabled {
        SizeRotatingWriter::new(&log_dir(config_dir), config.max_size_mb).ok()
    } else {
        None
    };

    let (file_layer, guard) = match writer {
        Some(writer) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();
    guard
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_dir = cli
        .config_dir
        .clone()
        .unwrap_or_else(config::default_config_dir);

    let _guard = init_logging(&config_dir, cli.verbose);

    match run(cli, &config_dir).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("错误: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli, config_dir: &Path) -> anyhow::Result<u8> {
    match cli.command {
        Command::Init => {
            let created = config::init(config_dir)?;
            if created {
                println!("已创建配置: {}", config_dir.join(config::CONFIG_FILE).display());
            } else {
                println!("配置已存在: {}", config_dir.join(config::CONFIG_FILE).display());
            }
            Ok(0)
        }
        Command::Games { action } => games(action, config_dir, cli.json),
        Command::Status { game } => status(&game, config_dir, cli.json).await,
        Command::Sync(args) => sync(args, config_dir, cli.json).await,
        Command::Push(args) => directional(Direction::ToCloud, args, config_dir, cli.json).await,
        Command::Pull(args) => directional(Direction::FromCloud, args, config_dir, cli.json).await,
    }
}

fn games(action: GamesCommand, config_dir: &Path, json: bool) -> anyhow::Result<u8> {
    let mut app = AppConfig::load(config_dir)?;

    match action {
        GamesCommand::List => {
            if json {
                println!("{}", serde_json::to_string_pretty(&app.games)?);
            } else if app.games.is_empty() {
                println!("还没有配置任何游戏");
            } else {
                for game in &app.games {
                    println!(
                        "{:<16} {:<24} {} 上次同步: {}",
                        game.id,
                        game.name,
                        if game.enabled { "启用" } else { "停用" },
                        game.last_sync.as_deref().unwrap_or("从未")
                    );
                    println!("    本地: {}", game.local.display());
                    println!("    云端: {}", game.cloud.display());
                }
            }
        }
        GamesCommand::Add {
            id,
            name,
            local,
            cloud,
            exclude,
        } => {
            let mut game = GameConfig::new(&id, name.unwrap_or_else(|| id.clone()), local, cloud);
            game.exclude = exclude;
            app.add_game(game)?;
            app.save(config_dir)?;
            println!("已添加: {}", id);
        }
        GamesCommand::Remove { id } => {
            app.remove_game(&id)?;
            app.save(config_dir)?;
            println!("已移除: {}", id);
        }
    }
    Ok(0)
}

fn engine_for(game: &GameConfig) -> SyncEngine {
    SyncEngine::with_config(SyncConfig {
        scan_config: game.scan_config(),
        ..SyncConfig::default()
    })
}

async fn status(id: &str, config_dir: &Path, json: bool) -> anyhow::Result<u8> {
    let app = AppConfig::load(config_dir)?;
    let game = app.game(id)?;
    let paths = app.resolve_paths(config_dir, game)?;
    let checkpoint = game.checkpoint()?;

    let decisions = engine_for(game)
        .compare(&paths.local_dir, &paths.cloud_dir, checkpoint)
        .await?;
    let summary = FileComparator::summarize_actions(&decisions);

    if json {
        let value = serde_json::json!({ "game": id, "decisions": decisions, "summary": summary });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(0);
    }

    println!("[{}] {}", game.id, game.name);
    for decision in &decisions {
        let label = match decision.action {
            SyncAction::CopyToCloud => "上传".to_string(),
            SyncAction::CopyToLocal => "下载".to_string(),
            SyncAction::Skip => "相同".to_string(),
            SyncAction::Conflict(reason) => format!("冲突 ({})", reason),
            SyncAction::Unsupported(reason) => format!("无法同步 ({})", reason),
        };
        println!("  {:<32} {}", decision.path, label);
    }
    println!(
        "  上传 {} ({}), 下载 {} ({}), 相同 {}, 冲突 {}, 无法同步 {}",
        summary.copy_to_cloud.len(),
        format_bytes(summary.copy_to_cloud_bytes),
        summary.copy_to_local.len(),
        format_bytes(summary.copy_to_local_bytes),
        summary.skip.len(),
        summary.conflicts.len(),
        summary.unsupported.len()
    );
    Ok(0)
}

async fn sync(args: SyncArgs, config_dir: &Path, json: bool) -> anyhow::Result<u8> {
    let mut app = AppConfig::load(config_dir)?;

    let ids: Vec<String> = if args.all {
        app.games
            .iter()
            .filter(|g| g.enabled)
            .map(|g| g.id.clone())
            .collect()
    } else {
        args.game.iter().cloned().collect()
    };

    // 单个游戏失败不影响其余游戏
    let mut codes = Vec::with_capacity(ids.len());
    let mut reports = Vec::with_capacity(ids.len());
    for id in &ids {
        let mut report = serde_json::json!({ "game": id });

        match sync_game(&app, config_dir, id, &args).await {
            Ok(summary) => {
                if !json {
                    print_summary(id, &summary);
                }
                codes.push(summary.exit_code());
                if let Err(e) = save_checkpoint(&mut app, config_dir, id, &summary) {
                    error!("无法保存检查点: {} - {}", id, e);
                    if !json {
                        eprintln!("[{}] 无法保存检查点: {}", id, e);
                    }
                    report["checkpointError"] = e.to_string().into();
                    codes.push(1);
                }
                report["summary"] = serde_json::to_value(&summary)?;
            }
            Err(e) => {
                error!("同步 {} 失败: {}", id, e);
                if !json {
                    eprintln!("[{}] 同步失败 [{}]: {}", id, e.kind(), e);
                    if e.is_structural() {
                        eprintln!("  同步在修改任何文件之前中止");
                    }
                }
                report["error"] = serde_json::json!({
                    "kind": e.kind(),
                    "message": e.to_string(),
                    "structural": e.is_structural(),
                });
                codes.push(1);
            }
        }
        reports.push(report);
    }

    if json {
        if args.all {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        } else if let Some(report) = reports.first() {
            // 单个游戏顺利完成时直接输出汇总
            let output = match report.get("summary") {
                Some(summary) if report.get("checkpointError").is_none() => summary,
                _ => report,
            };
            println!("{}", serde_json::to_string_pretty(output)?);
        }
    }

    Ok(combined_exit_code(&codes))
}

/// 同步一个游戏；配置或比较阶段的错误在修改任何文件之前返回
async fn sync_game(
    app: &AppConfig,
    config_dir: &Path,
    id: &str,
    args: &SyncArgs,
) -> gamesync_lib::Result<SyncSummary> {
    let game = app.game(id)?;
    let paths = app.resolve_paths(config_dir, game)?;
    let checkpoint = game.checkpoint()?;

    let (mode, prompter) = resolution_mode(args);
    let summary = engine_for(game)
        .run_sync(&paths, checkpoint, args.dry_run, mode)
        .await;
    if let Some(prompter) = prompter {
        let _ = prompter.await;
    }
    summary
}

/// 干净的运行结束后把新的检查点写回配置
fn save_checkpoint(
    app: &mut AppConfig,
    config_dir: &Path,
    id: &str,
    summary: &SyncSummary,
) -> gamesync_lib::Result<()> {
    let Some(checkpoint) = summary.checkpoint.filter(|_| summary.checkpoint_advanced) else {
        return Ok(());
    };
    app.game_mut(id)?.set_checkpoint(checkpoint);
    app.save(config_dir)?;
    info!("已更新检查点: {} -> {}", id, checkpoint);
    Ok(())
}

async fn directional(
    direction: Direction,
    args: DirectionalArgs,
    config_dir: &Path,
    json: bool,
) -> anyhow::Result<u8> {
    let app = AppConfig::load(config_dir)?;
    let game = app.game(&args.game)?;
    let paths = app.resolve_paths(config_dir, game)?;

    let summary = engine_for(game)
        .run_directional_sync(direction, &paths, args.force, args.dry_run)
        .await
        .with_context(|| format!("{} {} 失败", direction, game.id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&game.id, &summary);
        if summary.safety_check_prevented {
            println!("  安全检查阻止了覆盖更新的文件；确认无误后可使用 --force");
        }
    }
    Ok(summary.exit_code() as u8)
}

/// 多个游戏时：有错误返回 1，否则取最严重的退出码
fn combined_exit_code(codes: &[i32]) -> u8 {
    if codes.contains(&1) {
        1
    } else {
        codes.iter().copied().max().unwrap_or(0) as u8
    }
}

type Prompter = tokio::task::JoinHandle<()>;

/// 按命令行参数选择冲突解决方式；交互模式同时启动提示任务
fn resolution_mode(args: &SyncArgs) -> (ResolutionMode, Option<Prompter>) {
    if let Some(strategy) = args.strategy {
        return (ResolutionMode::Default(strategy), None);
    }
    if args.report_only || args.dry_run || !std::io::stdin().is_terminal() {
        return (ResolutionMode::ReportOnly, None);
    }

    let (tx, mut rx) = mpsc::channel::<ConflictRequest>(1);
    let prompter = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let ConflictRequest {
                conflict,
                applies_to_reason,
                respond,
            } = request;
            let response = tokio::task::spawn_blocking(move || {
                prompt_conflict(&conflict, applies_to_reason)
            })
            .await
            .unwrap_or(ConflictResponse::Skip);
            let _ = respond.send(response);
        }
    });

    (
        ResolutionMode::Interactive {
            requests: tx,
            batch_by_reason: args.batch,
        },
        Some(prompter),
    )
}

fn prompt_conflict(
    conflict: &gamesync_lib::core::Conflict,
    applies_to_reason: bool,
) -> ConflictResponse {
    let describe = |record: &gamesync_lib::core::FileRecord| {
        format!(
            "{}, {}",
            format_bytes(record.size),
            record
                .modified
                .map(|m| m.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string())
        )
    };

    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "\n冲突: {} ({})", conflict.path, conflict.reason);
    let _ = writeln!(stderr, "  本地: {}", describe(&conflict.local));
    let _ = writeln!(stderr, "  云端: {}", describe(&conflict.cloud));
    if applies_to_reason {
        let _ = writeln!(stderr, "  (本次选择将用于同一原因的所有冲突)");
    }

    let stdin = std::io::stdin();
    loop {
        let _ = write!(stderr, "保留 [l]本地 / [c]云端 / [b]两者 / [s]跳过: ");
        let _ = stderr.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => return ConflictResponse::Skip,
            Ok(_) => {}
        }
        match line.trim().to_lowercase().as_str() {
            "l" | "local" => return ConflictResponse::Resolve(ConflictStrategy::KeepLocal),
            "c" | "cloud" => return ConflictResponse::Resolve(ConflictStrategy::KeepCloud),
            "b" | "both" => return ConflictResponse::Resolve(ConflictStrategy::KeepBoth),
            "s" | "skip" => return ConflictResponse::Skip,
            _ => {}
        }
    }
}

fn print_summary(game_id: &str, summary: &SyncSummary) {
    let title = match summary.direction {
        Some(Direction::ToCloud) => "上传",
        Some(Direction::FromCloud) => "下载",
        None => "同步",
    };
    println!(
        "[{}] {}{}",
        game_id,
        title,
        if summary.dry_run { " (dry run，未修改任何文件)" } else { "" }
    );

    for outcome in &summary.outcomes {
        let direction = match outcome.action {
            SyncAction::CopyToCloud => "-> 云端",
            SyncAction::CopyToLocal => "-> 本地",
            SyncAction::Skip | SyncAction::Conflict(_) | SyncAction::Unsupported(_) => "",
        };
        let line = match &outcome.status {
            OutcomeStatus::Copied => {
                format!("✓ 已复制 {} ({})", direction, format_bytes(outcome.bytes))
            }
            OutcomeStatus::Planned => format!("· 将复制 {}", direction),
            OutcomeStatus::Skipped { reason } => format!("- 跳过: {}", reason),
            OutcomeStatus::Resolved { strategy } => format!("✓ 冲突已解决: {}", strategy),
            OutcomeStatus::Unresolved { reason } => format!("! 冲突未解决: {}", reason),
            OutcomeStatus::Failed { kind, message } => format!("✗ 失败 [{}]: {}", kind, message),
        };
        println!("  {:<32} {}", outcome.path, line);
    }

    for backup in &summary.backups {
        println!("  备份: {}", backup.backup_path.display());
    }

    println!(
        "  上传 {}, 下载 {}, 跳过 {}, 冲突 {} (未解决 {}), 错误 {}, 传输 {}",
        summary.copied_to_cloud,
        summary.copied_to_local,
        summary.skipped,
        summary.conflicts,
        summary.unresolved,
        summary.errors,
        format_bytes(summary.bytes_transferred)
    );
    if summary.direction.is_none() && !summary.dry_run && !summary.checkpoint_advanced {
        println!("  检查点未更新：仍有错误或未解决的冲突");
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sync_all() -> SyncArgs {
        SyncArgs {
            game: None,
            all: true,
            dry_run: false,
            strategy: Some(ConflictStrategy::KeepLocal),
            batch: false,
            report_only: false,
        }
    }

    #[tokio::test]
    async fn test_sync_all_continues_after_a_failing_game() {
        let root = tempfile::tempdir().unwrap();
        let config_dir = root.path().join("config");
        let (local, cloud) = (root.path().join("local"), root.path().join("cloud"));
        std::fs::create_dir_all(&local).unwrap();
        std::fs::create_dir_all(&cloud).unwrap();
        std::fs::write(local.join("save.dat"), b"progress").unwrap();

        let mut app = AppConfig::default();
        let mut broken = GameConfig::new("broken", "Broken", local.clone(), cloud.clone());
        broken.last_sync = Some("not-a-date".to_string());
        app.add_game(broken).unwrap();
        app.add_game(GameConfig::new("hades", "Hades", local, cloud.clone())).unwrap();
        app.save(&config_dir).unwrap();

        let code = sync(sync_all(), &config_dir, true).await.unwrap();

        assert_eq!(code, 1);
        assert_eq!(std::fs::read(cloud.join("save.dat")).unwrap(), b"progress");
        let saved = AppConfig::load(&config_dir).unwrap();
        assert!(saved.game("hades").unwrap().last_sync.is_some());
        assert_eq!(
            saved.game("broken").unwrap().last_sync.as_deref(),
            Some("not-a-date")
        );
    }

    #[test]
    fn test_combined_exit_code() {
        assert_eq!(combined_exit_code(&[]), 0);
        assert_eq!(combined_exit_code(&[0, 3, 2]), 3);
        assert_eq!(combined_exit_code(&[3, 1, 0]), 1);
    }
}
