//! persona-cache 后台进程
//!
//! 建表 → 从数据库加载缓存 → 周期性同步；Ctrl-C 时做最后一次同步再退出。

use clap::Parser;
use persona_cache::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "persona-cache")]
#[command(about = "Write-back state cache with periodic SQLite sync")]
#[command(version)]
struct Args {
    /// YAML 配置文件；不指定时从环境变量读取
    #[arg(short, long, env = "PERSONA_CACHE_CONFIG")]
    config: Option<String>,

    /// 数据库文件路径（覆盖配置）
    #[arg(long)]
    db: Option<String>,

    /// 同步周期秒数（覆盖配置）
    #[arg(short, long)]
    interval: Option<u64>,

    /// 只加载并打印统计，然后退出
    #[arg(long)]
    check: bool,
}

// ── 入口 ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> persona_cache::error::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "persona_cache=info".into()),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => CacheConfig::load(path)?,
        None => CacheConfig::from_env()?,
    };
    if let Some(db) = args.db {
        config.database_path = db;
    }
    if let Some(secs) = args.interval.filter(|s| *s > 0) {
        config.sync_interval_secs = secs;
    }

    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    store.init_schema()?;

    let cache = Arc::new(CacheManager::new(config.defaults.clone()));
    let engine = Arc::new(SyncEngine::new(cache, store));
    let report = engine.load();

    if args.check {
        println!("users:         {}", report.users);
        println!("personas:      {}", report.personas);
        println!("sessions:      {}", report.sessions);
        println!("messages:      {}", report.messages);
        println!("token buckets: {}", report.token_buckets);
        println!("memories:      {}", report.memories);
        println!("max session:   {}", report.max_session_id);
        if let Some(e) = report.error {
            println!("error:         {e}");
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let handle = engine
        .clone()
        .spawn(config.sync_interval(), shutdown.clone());
    info!(
        db = %config.database_path,
        interval_secs = config.sync_interval_secs,
        "✅ persona-cache 已启动，按 Ctrl-C 退出"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "无法监听 Ctrl-C");
    }
    shutdown.cancel();

    match tokio::time::timeout(Duration::from_secs(30), handle).await {
        Ok(Ok(())) => info!("👋 已退出"),
        Ok(Err(e)) => error!(error = %e, "同步任务异常退出"),
        Err(_) => error!("最后一次同步超时"),
    }
    Ok(())
}
