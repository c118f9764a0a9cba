use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use syncin_lib::config::Settings;
use syncin_lib::core::{due_paths, SnapshotStore, SyncEngine, SyncEvents, SyncManager};
use syncin_lib::storage::HttpRemote;
use syncin_lib::{dirs, logging};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "syncin")]
#[command(version)]
#[command(about = "Bidirectional file sync client")]
struct Cli {
    /// 配置目录（默认 $SYNCIN_CONFIG_DIR 或 ~/.sync-in）
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 运行同步
    Run {
        /// 服务器名称或 id（默认全部）
        #[arg(short, long)]
        server: Option<String>,

        /// 只同步指定的路径 id
        #[arg(short, long)]
        path: Vec<u64>,

        /// 只报告将执行的操作，不修改任何文件
        #[arg(long)]
        report: bool,

        /// 只同步按调度周期到期的路径
        #[arg(long)]
        due: bool,
    },

    /// 列出服务器和同步路径
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = cli.config_dir.unwrap_or_else(dirs::config_dir);
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("无法创建配置目录 {}", config_dir.display()))?;
    let mut settings = Settings::load(&config_dir)?;

    match cli.command {
        Commands::List => {
            list(&settings);
            Ok(())
        }
        Commands::Run {
            server,
            path,
            report,
            due,
        } => {
            let _guard = logging::init(&config_dir, &settings.log)?;
            run(&config_dir, &mut settings, server.as_deref(), &path, report, due).await
        }
    }
}

fn list(settings: &Settings) {
    if settings.servers.is_empty() {
        println!("没有配置服务器");
        return;
    }
    for server in &settings.servers {
        println!("[{}] {} ({})", server.id, server.name, server.url);
        for sp in &server.sync_paths {
            let state = if sp.enabled { "" } else { " (disabled)" };
            println!(
                "    [{}] {} {} {}{}",
                sp.id,
                sp.local_path.display(),
                sp.symbol(),
                sp.remote_path,
                state
            );
            if let Some(e) = &sp.main_error {
                println!("        error: {}", e);
            }
        }
    }
}

async fn run(
    config_dir: &std::path::Path,
    settings: &mut Settings,
    server: Option<&str>,
    paths: &[u64],
    report: bool,
    due: bool,
) -> Result<()> {
    let ids: Vec<u64> = match server {
        Some(key) => vec![
            settings
                .find_server(key)
                .with_context(|| format!("找不到服务器 {}", key))?
                .id,
        ],
        None => settings.servers.iter().map(|s| s.id).collect(),
    };

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("收到中断信号，停止同步");
                stop.cancel();
            }
        });
    }

    let events = SyncEvents::new();
    let engine = Arc::new(SyncEngine::new(
        settings.engine.engine_config(),
        SnapshotStore::new(dirs::snapshots_dir(config_dir)),
        events.clone(),
    ));
    let retry = settings.engine.retry_policy();

    for id in ids {
        if stop.is_cancelled() {
            break;
        }
        let Some(server) = settings.find_server_mut(id) else {
            continue;
        };
        let selected: Vec<u64> = if due {
            due_paths(server)
                .into_iter()
                .filter(|p| paths.is_empty() || paths.contains(p))
                .collect()
        } else {
            paths.to_vec()
        };
        if due && selected.is_empty() {
            info!("{}: 没有到期的同步路径", server.name);
            continue;
        }

        let server_stop = stop.child_token();
        let remote = HttpRemote::new(&server.url, server.access_token.clone().unwrap_or_default())?
            .with_retry(retry)
            .with_stop(server_stop.clone());
        if !remote.check_connection().await {
            warn!("{}: 服务器不可访问", server.name);
        }
        let manager = SyncManager::new(engine.clone(), Arc::new(remote), events.clone(), server_stop);
        if let Err(e) = manager.run(server, &selected, report).await {
            error!("{}: {:#}", server.name, e);
        }
    }

    if !report {
        settings.save(config_dir)?;
    }
    Ok(())
}
