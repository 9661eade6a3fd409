use crate::control::shutdown_child;
use crate::error::SupervisorError;
use crate::parse::{BackendConfig, Mode};
use crate::port::find_free_port;
use crate::readiness::{wait_ready, HealthProbe, HttpProbe};
use crate::runtime::{backend_for, wait_for_exit, ChildProcess, ExitEvent, Launch, SpawnBackend};
use chrono::{DateTime, Local};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receives the exit code of a backend that died after becoming ready.
pub type CrashHandler = Box<dyn Fn(Option<i32>) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Ready,
    Stopping,
}

/// Point-in-time view for the host.
#[derive(Debug, Clone)]
pub struct Status {
    pub phase: Phase,
    pub mode: Mode,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub ready_since: Option<DateTime<Local>>,
    pub last_exit: Option<ExitEvent>,
}

#[derive(Debug)]
struct RuntimeState {
    phase: Phase,
    started: bool,
    child: Option<ChildProcess>,
    port: Option<u16>,
    ready_since: Option<DateTime<Local>>,
    last_exit: Option<ExitEvent>,
    monitor: Option<JoinHandle<()>>,
}

type SharedState = Arc<RwLock<RuntimeState>>;

pub struct Supervisor {
    config: BackendConfig,
    backend: Arc<dyn SpawnBackend>,
    probe: Arc<dyn HealthProbe>,
    state: SharedState,
    stopping: Arc<AtomicBool>,
    crash_handler: Arc<Mutex<Option<CrashHandler>>>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("cmd", &self.config.cmd)
            .field("backend", &self.backend)
            .field("stopping", &self.stopping.load(Ordering::SeqCst))
            .finish()
    }
}

impl Supervisor {
    /// Backend picked from `config.mode`, readiness probed over HTTP on `config.healthpath`.
    pub fn new(config: BackendConfig) -> Result<Self, SupervisorError> {
        let backend = backend_for(config.mode);
        let probe = HttpProbe::new(config.healthpath.clone(), config.readiness().probe_timeout)
            .map_err(SupervisorError::ProbeSetup)?;
        Ok(Self::with_parts(config, backend, Arc::new(probe)))
    }

    pub fn with_parts(config: BackendConfig, backend: Arc<dyn SpawnBackend>, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            config,
            backend,
            probe,
            state: Arc::new(RwLock::new(RuntimeState {
                phase: Phase::Idle,
                started: false,
                child: None,
                port: None,
                ready_since: None,
                last_exit: None,
                monitor: None,
            })),
            stopping: Arc::new(AtomicBool::new(false)),
            crash_handler: Arc::new(Mutex::new(None)),
        }
    }

    pub fn mode(&self) -> Mode {
        self.backend.mode()
    }

    /// Port the backend is serving on, while started.
    pub async fn port(&self) -> Option<u16> {
        self.state.read().await.port
    }

    pub async fn status(&self) -> Status {
        let state = self.state.read().await;
        Status {
            phase: state.phase,
            mode: self.mode(),
            pid: state.child.as_ref().and_then(ChildProcess::pid),
            port: state.port,
            ready_since: state.ready_since,
            last_exit: state.last_exit,
        }
    }

    /// Replaces any previously registered handler.
    pub async fn on_crash<F>(&self, handler: F)
    where
        F: Fn(Option<i32>) + Send + Sync + 'static,
    {
        let mut slot = self.crash_handler.lock().await;
        if slot.is_some() {
            debug!("replacing crash handler");
        }
        *slot = Some(Box::new(handler));
    }



    /*
        @@@
        @start();
        . Only valid once per supervisor; later calls get AlreadyStarted.
        . Picks a port near the configured one, spawns the backend with PORT/STORAGE_PATH/BACKEND_MODE, and waits for readiness.
        . On success arms the crash monitor and returns the ready port (the child may report one other than the allocated port).
        . A backend that timed out is torn down before the error is returned.
    */
    pub async fn start(&self, storage_path: &str) -> Result<u16, SupervisorError> {
        {
            let mut state = self.state.write().await;
            if state.started {
                return Err(SupervisorError::AlreadyStarted);
            }
            state.started = true;
            state.phase = Phase::Starting;
        }

        match self.launch(storage_path).await {
            Ok((port, mut child)) => {
                // Nothing reads messages past readiness.
                child.close_messages();
                // Armed under the lock so an instant crash cannot be recorded before the child is.
                let mut state = self.state.write().await;
                let monitor = self.arm_crash_monitor(child.exit_watch());
                state.port = Some(port);
                state.ready_since = Some(Local::now());
                state.child = Some(child);
                state.monitor = Some(monitor);
                state.phase = Phase::Ready;
                Ok(port)
            }
            Err(e) => {
                error!(error = %e, label = e.as_label(), "backend failed to start");
                self.state.write().await.phase = Phase::Idle;
                Err(e)
            }
        }
    }

    async fn launch(&self, storage_path: &str) -> Result<(u16, ChildProcess), SupervisorError> {
        let port = find_free_port(self.config.port).await?;
        info!(port, mode = self.mode().as_env(), cmd = %self.config.cmd, "starting backend");

        let launch = Launch { port, storage_path };
        let mut child = self.backend.spawn(&self.config, &launch)?;

        match wait_ready(&mut child, port, self.probe.as_ref(), &self.config.readiness()).await {
            Ok(ready) => Ok((ready, child)),
            Err(e @ SupervisorError::StartupTimeout { .. }) => {
                let event = shutdown_child(self.backend.as_ref(), &child, self.config.stop_timeout()).await;
                self.state.write().await.last_exit = Some(event);
                Err(e)
            }
            Err(e) => {
                self.state.write().await.last_exit = child.try_exit();
                Err(e)
            }
        }
    }

    fn arm_crash_monitor(&self, mut exit: watch::Receiver<Option<ExitEvent>>) -> JoinHandle<()> {
        let stopping = self.stopping.clone();
        let handler = self.crash_handler.clone();
        let state = self.state.clone();

        tokio::spawn(async move {
            let event = wait_for_exit(&mut exit).await;
            if stopping.load(Ordering::SeqCst) {
                debug!(code = ?event.code, "exit during stop; not a crash");
                return;
            }
            error!(code = ?event.code, signal = ?event.signal, "backend exited unexpectedly");
            {
                let mut state = state.write().await;
                state.child = None;
                state.monitor = None;
                state.last_exit = Some(event);
                state.phase = Phase::Idle;
            }
            if let Some(handler) = handler.lock().await.as_ref() {
                handler(event.code);
            }
        })
    }



    /*
        @@@
        @stop();
        . Resolves immediately when there is no child (never started, already crashed, already stopped).
        . Otherwise marks the exit as intentional, disarms the crash monitor, then runs the graceful-then-forced shutdown.
        . Leaves port, child and the stopping flag cleared.
    */
    pub async fn stop(&self) {
        let (child, monitor) = {
            let mut state = self.state.write().await;
            self.stopping.store(true, Ordering::SeqCst);
            if state.child.is_some() {
                state.phase = Phase::Stopping;
            }
            (state.child.take(), state.monitor.take())
        };
        if let Some(monitor) = monitor {
            monitor.abort();
        }

        let event = match &child {
            Some(child) => Some(shutdown_child(self.backend.as_ref(), child, self.config.stop_timeout()).await),
            None => {
                debug!("stop: no backend running");
                None
            }
        };

        let mut state = self.state.write().await;
        state.port = None;
        state.ready_since = None;
        if event.is_some() {
            state.last_exit = event;
        }
        state.phase = Phase::Idle;
        self.stopping.store(false, Ordering::SeqCst);
        if child.is_some() {
            info!("backend stopped");
        } else if state.started {
            warn!("stop called with no live backend");
        }
    }
}
