mod backup;
mod config;
mod http;
mod monitor;
mod mount;
mod report;
mod state;

use backup::BackupScheduler;
use chrono::Utc;
use clap::Parser;
use config::Config;
use http::StatusServer;
use monitor::ActivityMonitor;
use mount::MountManager;
use report::{HttpReporter, Reporter};
use state::ActivityState;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "workspaced")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long, conflicts_with = "backup_off")]
    backup_on: bool,
    #[arg(long, conflicts_with = "backup_on")]
    backup_off: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };
    if cli.backup_on {
        cfg.backup.enabled = true;
    } else if cli.backup_off {
        cfg.backup.enabled = false;
    }

    resolve_secrets(&mut cfg);

    info!(
        workspace = %cfg.workspace_dir,
        monitor_interval_secs = cfg.monitor_interval_secs,
        backup_enabled = cfg.backup.enabled,
        backup_interval_secs = cfg.backup.interval_secs,
        mount = %cfg.mount_credentials_summary(),
        "запуск workspaced"
    );

    let started_at = Utc::now();
    let activity = Arc::new(ActivityState::default());

    let reporter: Option<Arc<dyn Reporter>> = if cfg.report.enabled {
        match HttpReporter::new(&cfg.report) {
            Ok(reporter) => Some(Arc::new(reporter)),
            Err(err) => {
                error!(error = %err, "не удалось инициализировать отправку отчётов");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<(&str, JoinHandle<bool>)> = Vec::new();

    let activity_monitor = ActivityMonitor::new(
        activity.clone(),
        Duration::from_secs(cfg.monitor_interval_secs),
        cfg.ide_port,
        cfg.ssh_port,
        reporter,
    );
    tasks.push((
        "monitor",
        spawn_task(
            "monitor",
            shutdown_tx.clone(),
            activity_monitor.run(shutdown_rx.clone()),
        ),
    ));

    if cfg.backup.enabled {
        let mount_manager = MountManager::new(cfg.mount.clone());
        let scheduler = BackupScheduler::new(&cfg, mount_manager, activity.clone());
        tasks.push((
            "backup",
            spawn_task("backup", shutdown_tx.clone(), scheduler.run(shutdown_rx.clone())),
        ));
    }

    if cfg.http.enabled {
        let server = StatusServer::new(cfg.http.listen.clone(), activity.clone(), started_at);
        tasks.push((
            "http",
            spawn_task("http", shutdown_tx.clone(), server.run(shutdown_rx.clone())),
        ));
    }

    let mut shutdown_watch = shutdown_rx.clone();
    tokio::select! {
        _ = shutdown_signal() => {
            info!("получен сигнал остановки, завершаем работу");
        }
        _ = shutdown_watch.changed() => {}
    }
    let _ = shutdown_tx.send(true);

    let mut failed = false;
    for (name, task) in tasks {
        match task.await {
            Ok(clean) => failed |= !clean,
            Err(err) => {
                error!(task = name, error = %err, "задача аварийно завершилась");
                failed = true;
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    info!("workspaced завершил работу корректно");
}

fn spawn_task<E, F>(
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    task: F,
) -> JoinHandle<bool>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    tokio::spawn(async move {
        match task.await {
            Ok(()) => true,
            Err(err) => {
                error!(task = name, error = %err, "задача завершилась с ошибкой");
                let _ = shutdown_tx.send(true);
                false
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "не удалось дождаться Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                error!(error = %err, "не удалось подписаться на SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_secrets(cfg: &mut Config) {
    cfg.mount.account_key = resolve_secret(&cfg.mount.account_key_env, cfg.mount.account_key.take());
    cfg.mount.sas_token = resolve_secret(&cfg.mount.sas_token_env, cfg.mount.sas_token.take());
    cfg.report.api_key = resolve_secret(&cfg.report.api_key_env, cfg.report.api_key.take());
}

fn resolve_secret(env_name: &str, configured: Option<String>) -> Option<String> {
    if let Ok(value) = std::env::var(env_name) {
        if !value.trim().is_empty() {
            return Some(value);
        }
    }
    configured
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
