use anyhow::Context;
use backend_supervisor::logger::{flush_logs, logs_tracing};
use backend_supervisor::parse::parser;
use backend_supervisor::shell::run_shell;
use backend_supervisor::Supervisor;
use std::sync::{Arc, Mutex};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "config/supervisor.yml";
const LOG_DIR: &str = "logs";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    // Shared so the signal path can flush before exiting.
    let log_guard = Arc::new(Mutex::new(Some(logs_tracing(LOG_DIR).context("installing log subscriber")?)));
    let cfg = parser(&path).with_context(|| format!("loading {path}"))?;

    let storage_path = cfg.backend.storagepath.clone();
    let supervisor = Arc::new(Supervisor::new(cfg.backend)?);

    supervisor
        .on_crash(|code| {
            error!(?code, "backend crashed");
            eprintln!("Backend crashed (exit code {code:?}); type `exit` to quit.");
        })
        .await;

    let port = match supervisor.start(&storage_path).await {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Backend failed to start: {e}");
            return Err(e.into());
        }
    };
    println!("Backend listening on 127.0.0.1:{port} ({:?})", supervisor.mode());

    // Host termination still takes the backend down with it.
    let on_signal = supervisor.clone();
    let signal_guard = log_guard.clone();
    tokio::spawn(async move {
        let (Ok(mut term), Ok(mut hup)) = (signal(SignalKind::terminate()), signal(SignalKind::hangup())) else {
            error!("cannot install host signal handlers");
            return;
        };
        tokio::select! {
            _ = term.recv() => info!("SIGTERM received"),
            _ = hup.recv() => info!("SIGHUP received"),
        }
        on_signal.stop().await;
        info!("host exiting");
        flush_logs(&signal_guard);
        std::process::exit(0);
    });

    let history = format!("{LOG_DIR}/history.txt");
    let (for_status, for_port, for_stop) = (supervisor.clone(), supervisor.clone(), supervisor.clone());
    let shell_result = run_shell(
        &history,
        move || {
            let supervisor = for_status.clone();
            async move {
                let status = supervisor.status().await;
                println!(
                    "{:?} [{:?}] pid={:?} port={:?} ready_since={} last_exit={:?}",
                    status.phase,
                    status.mode,
                    status.pid,
                    status.port,
                    status.ready_since.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
                    status.last_exit,
                );
            }
        },
        move || {
            let supervisor = for_port.clone();
            async move {
                match supervisor.port().await {
                    Some(port) => println!("{port}"),
                    None => println!("backend not running"),
                }
            }
        },
        move || {
            let supervisor = for_stop.clone();
            async move {
                supervisor.stop().await;
                println!("Backend stopped");
            }
        },
    )
    .await;

    supervisor.stop().await;
    info!("host exiting");
    flush_logs(&log_guard);
    shell_result.context("console")?;
    Ok(())
}
