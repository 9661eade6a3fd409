use std::sync::Mutex;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::SubscriberBuilder;

pub const LOG_FILE: &str = "backend-supervisor.log";



/*
    @@@
    @logs_tracing();
    . Creates a daily-rotating log file (<dir>/backend-supervisor.log) and wraps it in a non-blocking writer.
    . Installs a fmt subscriber at INFO with targets, so backend output (target "backend") stays distinguishable from the supervisor's own events.
    . The returned guard flushes the writer on drop; the host must keep it alive.
*/
pub fn logs_tracing(dir: &str) -> Result<WorkerGuard, SetGlobalDefaultError> {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = SubscriberBuilder::default()
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_writer(non_blocking)
        .with_max_level(tracing::Level::INFO)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}

/*
    @@@
    @flush_logs();
    . Takes the guard out of its shared slot and drops it, which blocks until buffered lines reach the file.
    . For exit paths that never unwind back to main (std::process::exit skips destructors).
    . Returns false if the slot was already empty or its lock was poisoned.
*/
pub fn flush_logs(slot: &Mutex<Option<WorkerGuard>>) -> bool {
    match slot.lock() {
        Ok(mut guard) => guard.take().is_some(),
        Err(_) => false,
    }
}
