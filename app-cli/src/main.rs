//! QuarkDrive CLI
//!
//! - `mount`：挂载一个由回调提供内容的虚拟盘（内存存储或 Rhai 脚本），常驻直到 Ctrl-C
//! - `check`：输出当前进程是否提权、本构建携带的驱动后端

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use quarkdrive_core::handlers::{MemoryHandlers, ScriptHandlers};
use quarkdrive_core::virtual_driver::ExclusiveGate;
use quarkdrive_core::{BridgeSettings, HandlerSet, VirtualDriveService};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "quarkdrive")]
#[command(version)]
#[command(about = "QuarkDrive 虚拟盘命令行工具", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 挂载虚拟盘（该命令会常驻直到 Ctrl-C）
    Mount(MountArgs),
    /// 检查权限与驱动后端
    Check,
}

#[derive(Args, Debug)]
struct MountArgs {
    /// 挂载标识（Windows 盘符如 K / K:；Unix 为挂载目录，相对路径位于 home 下）
    id: String,

    /// 后端描述（仅记录，不解释）
    #[arg(long = "backend", default_value = "memory")]
    backend: String,

    /// Rhai 回调脚本；不指定则使用进程内存存储
    #[arg(long = "script")]
    script: Option<PathBuf>,

    /// 配置文件（JSON）；不存在时使用默认值
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// 额外写入日志文件的目录
    #[arg(long = "log-dir")]
    log_dir: Option<PathBuf>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckReport {
    elevated: bool,
    driver: &'static str,
}

fn main() {
    let cli = Cli::parse();

    let res = match cli.command {
        Commands::Mount(args) => run_mount(args),
        Commands::Check => check(),
    };

    if let Err(e) = res {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

/// 日志：stderr + 可选的文件（不滚动）。返回的 guard 需要活到进程退出
fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "quarkdrive=info,warn".into());
    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::never(dir, "quarkdrive.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(fmt::layer().with_writer(std::io::stderr)).init();
            None
        }
    }
}

fn run_mount(args: MountArgs) -> Result<(), String> {
    let _guard = init_logging(args.log_dir.as_deref());

    let settings = match &args.config {
        Some(path) => BridgeSettings::load(path).map_err(|e| e.to_string())?,
        None => {
            let mut settings = BridgeSettings::default();
            settings
                .apply_env(|k| std::env::var(k).ok())
                .map_err(|e| e.to_string())?;
            settings
        }
    };

    // 脚本运行时不是线程安全的：所有回调串行执行
    let script = match &args.script {
        Some(path) => Some(Arc::new(ScriptHandlers::from_file(path).map_err(|e| e.to_string())?)),
        None => None,
    };
    let mut builder = VirtualDriveService::builder().settings(settings);
    if script.is_some() {
        builder = builder.execution_gate(Arc::new(ExclusiveGate::new()));
    }
    let service = builder.build().map_err(|e| e.to_string())?;

    let handlers = match script {
        Some(script) => script.handler_set(),
        None => HandlerSet::from_callbacks(Arc::new(MemoryHandlers::new())),
    };

    service
        .try_mount(&args.id, &args.backend)
        .map_err(|e| format!("挂载失败: {e}"))?;
    service
        .set_handlers(&args.id, handlers)
        .map_err(|e| e.to_string())?;
    println!("mounted: {} (driver: {})", args.id, service.driver_name());

    let rt = tokio::runtime::Runtime::new().map_err(|e| format!("创建 Tokio Runtime 失败: {e}"))?;
    rt.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("监听 Ctrl-C 失败，直接卸载: {}", e);
        }
    });

    let report = service.try_unmount(&args.id).map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
    println!("{json}");
    service.shutdown();
    Ok(())
}

fn check() -> Result<(), String> {
    let service = VirtualDriveService::builder()
        .build()
        .map_err(|e| e.to_string())?;
    let report = CheckReport {
        elevated: service.has_elevated_privileges(),
        driver: service.driver_name(),
    };
    let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}
