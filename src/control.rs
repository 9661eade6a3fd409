use crate::runtime::{ChildProcess, ExitEvent, SpawnBackend};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};



/*
    @@@
    @shutdown_child();
    . Sends the graceful stop request (SIGTERM) through the backend.
    . Waits up to `stop_timeout` for the reaper to observe the exit.
    . Past that, force-kills through the backend and waits again, so the process is gone when this returns.
    . Kill errors are logged only; a child that is already dead is not a failure here.
*/
pub async fn shutdown_child(backend: &dyn SpawnBackend, child: &ChildProcess, stop_timeout: Duration) -> ExitEvent {
    if let Some(event) = child.try_exit() {
        info!(pid = child.pid(), "backend already exited");
        return event;
    }

    info!(pid = child.pid(), "sending stop signal");
    if let Err(e) = backend.terminate(child) {
        error!(pid = child.pid(), error = %e, "failed to send stop signal");
    }

    match timeout(stop_timeout, child.exited()).await {
        Ok(event) => {
            info!(pid = child.pid(), exit_code = ?event.code, "exited cleanly");
            event
        }
        Err(_) => {
            warn!(pid = child.pid(), ?stop_timeout, "backend ignored stop signal; force-killing");
            if let Err(e) = backend.force_kill(child) {
                error!(pid = child.pid(), error = %e, "force kill failed");
            }
            let event = child.exited().await;
            info!(pid = child.pid(), exit_code = ?event.code, signal = ?event.signal, "killed");
            event
        }
    }
}
