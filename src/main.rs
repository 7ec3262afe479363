use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use ops_assist::config::PipelineConfig;
use ops_assist::decision::{KeywordEngine, PolicyTable};
use ops_assist::executor::{ArchiveFileCapability, CapabilityRegistry, Executor, spawn_executor};
use ops_assist::gate::ApprovalGate;
use ops_assist::gate::routes::gate_routes;
use ops_assist::planner::{Planner, spawn_planner};
use ops_assist::recovery;
use ops_assist::store::{LibSqlStore, PipelineStore};
use ops_assist::watcher::{LocalDropSource, PollSchedule, spawn_watcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env();

    // Initialize tracing — console, plus a daily-rolling file when a log
    // directory is configured.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _file_guard = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ops-assist.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
            None
        }
    };

    eprintln!("🛠  ops-assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Gate API: http://0.0.0.0:{}/api/items", config.gate_port);
    eprintln!("   Gate WS:  ws://0.0.0.0:{}/ws", config.gate_port);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn PipelineStore> = Arc::new(
        LibSqlStore::open_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );

    // ── Startup recovery ────────────────────────────────────────────────
    let report = recovery::check_consistency(store.as_ref()).await?;
    if !report.is_clean() {
        eprintln!(
            "   Recovery: {} item(s) flagged for manual review",
            report.flagged.len()
        );
    }
    let counts = store.counts_by_stage().await?;
    if !counts.is_empty() {
        let summary: Vec<String> = counts
            .iter()
            .map(|(stage, count)| format!("{stage}={count}"))
            .collect();
        eprintln!("   Items: {}", summary.join(", "));
    }

    // ── Gate ────────────────────────────────────────────────────────────
    let gate = ApprovalGate::new(Arc::clone(&store));
    let app = gate_routes(Arc::clone(&gate), Arc::clone(&store));
    let gate_port = config.gate_port;
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{gate_port}"))
            .await
            .expect("Failed to bind gate server port");
        tracing::info!(port = gate_port, "Gate server started");
        axum::serve(listener, app).await.ok();
    });

    // ── Planner ─────────────────────────────────────────────────────────
    let planner = Arc::new(Planner::new(
        Arc::clone(&store),
        Arc::new(KeywordEngine::new()),
        PolicyTable::default_rules(),
        Arc::clone(&gate),
    ));
    let (planner_handle, planner_shutdown) = spawn_planner(planner, config.planner_interval);

    // ── Executor ────────────────────────────────────────────────────────
    let registry = Arc::new(CapabilityRegistry::new());
    if let Some(ref drop_config) = config.local_drop {
        registry.register(Arc::new(ArchiveFileCapability::new(
            drop_config.archive_dir.clone(),
        )));
    }
    eprintln!("   Capabilities: {} registered", registry.count());

    let executor = Arc::new(Executor::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        &config.executor,
    ));
    let (executor_handle, executor_shutdown) =
        spawn_executor(executor, config.executor.poll_interval);

    // ── Watchers ────────────────────────────────────────────────────────
    let watcher_shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut watcher_handles = Vec::new();
    let mut active_channels: Vec<String> = Vec::new();

    if let Some(ref drop_config) = config.local_drop {
        let source = Arc::new(LocalDropSource::new(drop_config.drop_dir.clone()));
        watcher_handles.push(spawn_watcher(
            source,
            Arc::clone(&store),
            PollSchedule::Interval(Duration::from_secs(drop_config.poll_interval_secs)),
            Arc::clone(&watcher_shutdown),
        ));
        active_channels.push(format!(
            "local_drop ({})",
            drop_config.drop_dir.display()
        ));
    }

    if active_channels.is_empty() {
        eprintln!("   Channels: none (set OPS_ASSIST_DROP_DIR to enable local drop)");
    } else {
        eprintln!("   Channels: {}", active_channels.join(", "));
    }
    eprintln!();

    // ── Shutdown ────────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    planner_shutdown.store(true, Ordering::Relaxed);
    executor_shutdown.store(true, Ordering::Relaxed);
    watcher_shutdown.store(true, Ordering::Relaxed);

    planner_handle.abort();
    executor_handle.abort();
    for handle in &watcher_handles {
        handle.abort();
    }
    let _ = futures::future::join_all(watcher_handles).await;
    let _ = planner_handle.await;
    let _ = executor_handle.await;

    Ok(())
}
