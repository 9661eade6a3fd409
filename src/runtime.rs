use crate::error::SupervisorError;
use crate::parse::{BackendConfig, Mode};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{dup2, Pid};
use serde::Deserialize;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::unix::pipe as unix_pipe;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Environment the child is always started with.
pub const PORT_ENV: &str = "PORT";
pub const STORAGE_PATH_ENV: &str = "STORAGE_PATH";
pub const MODE_ENV: &str = "BACKEND_MODE";

/// Descriptor the development child writes its messages to.
pub const MESSAGE_FD: RawFd = 3;

/// A message sent by the child, one JSON object per line.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChildMessage {
    Ready {
        #[serde(default)]
        port: Option<u16>,
    },
    #[serde(other)]
    Unknown,
}

impl ChildMessage {
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }
}

/// How the child went away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitEvent {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitEvent {
    fn from(status: ExitStatus) -> Self {
        Self { code: status.code(), signal: status.signal() }
    }
}

/// Per-launch values injected into the child's environment.
#[derive(Debug, Clone, Copy)]
pub struct Launch<'a> {
    pub port: u16,
    pub storage_path: &'a str,
}

/// Handle to a spawned child.
///
/// The tokio [`Child`] itself lives in a reaper task; this handle talks to it
/// through channels so that waiting for exit and killing never contend.
pub struct ChildProcess {
    pid: Option<u32>,
    messages: mpsc::UnboundedReceiver<ChildMessage>,
    exit: watch::Receiver<Option<ExitEvent>>,
    kill_tx: mpsc::UnboundedSender<()>,
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.pid)
            .field("exit", &*self.exit.borrow())
            .finish()
    }
}

impl ChildProcess {
    pub(crate) fn from_parts(
        pid: Option<u32>,
        messages: mpsc::UnboundedReceiver<ChildMessage>,
        exit: watch::Receiver<Option<ExitEvent>>,
        kill_tx: mpsc::UnboundedSender<()>,
    ) -> Self {
        Self { pid, messages, exit, kill_tx }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next message from the child; `None` once its message path is closed.
    pub async fn next_message(&mut self) -> Option<ChildMessage> {
        self.messages.recv().await
    }

    /// Stops buffering messages; later ones are only logged.
    pub fn close_messages(&mut self) {
        self.messages.close();
        while self.messages.try_recv().is_ok() {}
    }

    pub fn queued_messages(&self) -> usize {
        self.messages.len()
    }

    /// A receiver that flips to `Some` when the child has been reaped.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitEvent>> {
        self.exit.clone()
    }

    pub fn try_exit(&self) -> Option<ExitEvent> {
        *self.exit.borrow()
    }

    pub async fn exited(&self) -> ExitEvent {
        wait_for_exit(&mut self.exit_watch()).await
    }

    /// Asks the reaper to kill through tokio's own primitive.
    fn request_kill(&self) -> bool {
        self.kill_tx.send(()).is_ok()
    }

    fn signal(&self, sig: Signal) -> Result<(), SupervisorError> {
        if self.try_exit().is_some() {
            return Ok(());
        }
        let Some(pid) = self.pid else { return Ok(()) };
        let raw = i32::try_from(pid).map_err(|_| io::Error::from(Errno::EINVAL))?;
        match kill(Pid::from_raw(raw), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e).into()),
        }
    }
}

pub async fn wait_for_exit(exit: &mut watch::Receiver<Option<ExitEvent>>) -> ExitEvent {
    match exit.wait_for(Option::is_some).await {
        Ok(event) => (*event).unwrap_or_default(),
        Err(_) => ExitEvent::default(),
    }
}

/// One way of launching and killing the backend. Picked once from [`Mode`].
pub trait SpawnBackend: Send + Sync + fmt::Debug {
    fn mode(&self) -> Mode;

    fn spawn(&self, cfg: &BackendConfig, launch: &Launch<'_>) -> Result<ChildProcess, SupervisorError>;

    /// Cooperative shutdown request.
    fn terminate(&self, child: &ChildProcess) -> Result<(), SupervisorError> {
        child.signal(Signal::SIGTERM)
    }

    fn force_kill(&self, child: &ChildProcess) -> Result<(), SupervisorError>;
}

/// Project-root launch with a dedicated message descriptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct DevelopmentBackend;

/// Packaged launch; messages travel on stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProductionBackend;

pub fn backend_for(mode: Mode) -> Arc<dyn SpawnBackend> {
    match mode {
        Mode::Development => Arc::new(DevelopmentBackend),
        Mode::Production => Arc::new(ProductionBackend),
    }
}

impl SpawnBackend for DevelopmentBackend {
    fn mode(&self) -> Mode {
        Mode::Development
    }

    fn spawn(&self, cfg: &BackendConfig, launch: &Launch<'_>) -> Result<ChildProcess, SupervisorError> {
        let (read_end, write_end) = message_pipe()?;
        let channel = unix_pipe::Receiver::from_owned_fd(read_end)?;

        let mut cmd = base_command(cfg, launch, self.mode());
        if let Some(dir) = &cfg.workingdir {
            cmd.current_dir(dir);
        }
        let write_raw = write_end.as_raw_fd();
        // SAFETY: the hook only calls dup2/fcntl, both async-signal-safe.
        unsafe {
            cmd.pre_exec(move || install_message_fd(write_raw));
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::ProcessSpawnError {
            cmd: cfg.cmd.clone(),
            source,
        })?;
        // The child holds its own copy; ours must go so the channel sees EOF.
        drop(write_end);

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        forward_messages(channel, msg_tx);
        if let Some(out) = child.stdout.take() {
            forward_output(out, "stdout", None);
        }
        if let Some(err) = child.stderr.take() {
            forward_output(err, "stderr", None);
        }
        Ok(start_reaper(child, msg_rx, self.mode()))
    }

    fn force_kill(&self, child: &ChildProcess) -> Result<(), SupervisorError> {
        child.signal(Signal::SIGKILL)
    }
}

impl SpawnBackend for ProductionBackend {
    fn mode(&self) -> Mode {
        Mode::Production
    }

    fn spawn(&self, cfg: &BackendConfig, launch: &Launch<'_>) -> Result<ChildProcess, SupervisorError> {
        // Working directory stays the host's.
        let mut cmd = base_command(cfg, launch, self.mode());
        let mut child = cmd.spawn().map_err(|source| SupervisorError::ProcessSpawnError {
            cmd: cfg.cmd.clone(),
            source,
        })?;

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        if let Some(out) = child.stdout.take() {
            forward_output(out, "stdout", Some(msg_tx));
        }
        if let Some(err) = child.stderr.take() {
            forward_output(err, "stderr", None);
        }
        Ok(start_reaper(child, msg_rx, self.mode()))
    }

    fn force_kill(&self, child: &ChildProcess) -> Result<(), SupervisorError> {
        if !child.request_kill() {
            debug!("reaper already gone; nothing to kill");
        }
        Ok(())
    }
}

fn base_command(cfg: &BackendConfig, launch: &Launch<'_>, mode: Mode) -> Command {
    let mut cmd = Command::new(&cfg.cmd);
    cmd.args(&cfg.args);
    if let Some(envs) = &cfg.env {
        cmd.envs(envs);
    }
    cmd.env(PORT_ENV, launch.port.to_string())
        .env(STORAGE_PATH_ENV, launch.storage_path)
        .env(MODE_ENV, mode.as_env())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "illumos",
))]
fn message_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe2(OFlag::O_CLOEXEC)?)
}

// No pipe2 here; the flags are set right after creation.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "illumos",
)))]
fn message_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = nix::unistd::pipe()?;
    for fd in [&read_end, &write_end] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read_end, write_end))
}

// Runs between fork and exec.
fn install_message_fd(fd: RawFd) -> io::Result<()> {
    if fd == MESSAGE_FD {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        dup2(fd, MESSAGE_FD)?;
    }
    Ok(())
}

fn forward_messages(channel: unix_pipe::Receiver, tx: mpsc::UnboundedSender<ChildMessage>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(channel).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match ChildMessage::parse(&line) {
                Some(msg) => {
                    if tx.send(msg).is_err() {
                        debug!(?msg, "message from backend after readiness; not queued");
                    } else {
                        debug!(?msg, "message from backend");
                    }
                }
                None => warn!(line = %line, "unparseable message from backend"),
            }
        }
    });
}

/// Logs each line of a child stream. With `messages`, ready lines are routed there instead.
fn forward_output<R>(reader: R, stream: &'static str, messages: Option<mpsc::UnboundedSender<ChildMessage>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(tx) = &messages {
                if let Some(msg @ ChildMessage::Ready { .. }) = ChildMessage::parse(&line) {
                    if tx.send(msg).is_ok() {
                        debug!(?msg, stream, "message from backend");
                        continue;
                    }
                }
            }
            match stream {
                "stderr" => warn!(target: "backend", stream, "{line}"),
                _ => info!(target: "backend", stream, "{line}"),
            }
        }
    });
}



/*
    @@@
    @start_reaper();
    . Moves the tokio Child into its own task, which is the only place that waits on it.
    . Kill requests arrive over a channel and go through Child::start_kill; the task keeps waiting afterwards.
    . Publishes the exit on a watch channel, so any number of observers see it exactly once.
*/
fn start_reaper(mut child: Child, messages: mpsc::UnboundedReceiver<ChildMessage>, mode: Mode) -> ChildProcess {
    let pid = child.id();
    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
    info!(pid, mode = mode.as_env(), "spawned backend");

    tokio::spawn(async move {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(()) = kill_rx.recv() => {
                    if let Err(e) = child.start_kill() {
                        warn!(pid, error = %e, "start_kill failed");
                    }
                }
            }
        };
        let event = match status {
            Ok(status) => ExitEvent::from(status),
            Err(e) => {
                warn!(pid, error = %e, "wait on backend failed");
                ExitEvent::default()
            }
        };
        info!(pid, code = ?event.code, signal = ?event.signal, "backend exited");
        exit_tx.send_replace(Some(event));
    });

    ChildProcess::from_parts(pid, messages, exit_rx, kill_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ready_with_and_without_port() {
        assert_eq!(
            ChildMessage::parse(r#"{"type":"ready","port":4124}"#),
            Some(ChildMessage::Ready { port: Some(4124) })
        );
        assert_eq!(ChildMessage::parse(r#"{"type":"ready"}"#), Some(ChildMessage::Ready { port: None }));
        assert_eq!(ChildMessage::parse(r#"{"type":"progress","pct":40}"#), Some(ChildMessage::Unknown));
        assert_eq!(ChildMessage::parse("listening on 4123"), None);
    }

    #[tokio::test]
    async fn exit_watch_resolves_for_late_observers() {
        let (_msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, _kill_rx) = mpsc::unbounded_channel();
        let child = ChildProcess::from_parts(None, msg_rx, exit_rx, kill_tx);

        exit_tx.send_replace(Some(ExitEvent { code: Some(3), signal: None }));
        drop(exit_tx);
        assert_eq!(child.exited().await.code, Some(3));
        assert_eq!(child.try_exit().and_then(|e| e.code), Some(3));
    }

    #[tokio::test]
    async fn reaper_reports_exit_code() {
        let cfg = BackendConfig::new(Mode::Production, "sh", vec!["-c".into(), "exit 7".into()]);
        let child = ProductionBackend.spawn(&cfg, &Launch { port: 1, storage_path: "/tmp" }).unwrap();
        assert_eq!(child.exited().await, ExitEvent { code: Some(7), signal: None });
    }

    #[tokio::test]
    async fn messages_after_readiness_are_not_queued() {
        let cfg = BackendConfig::new(
            Mode::Development,
            "sh",
            vec![
                "-c".into(),
                r#"echo '{"type":"ready"}' >&3; sleep 0.3
i=0; while [ $i -lt 5000 ]; do echo '{"type":"progress"}' >&3; i=$((i+1)); done"#
                    .into(),
            ],
        );
        let mut child = DevelopmentBackend.spawn(&cfg, &Launch { port: 1, storage_path: "/tmp" }).unwrap();
        assert_eq!(child.next_message().await, Some(ChildMessage::Ready { port: None }));
        child.close_messages();

        // the forwarder keeps draining the pipe, so the child is not stuck on a full one
        let event = tokio::time::timeout(std::time::Duration::from_secs(10), child.exited()).await.unwrap();
        assert_eq!(event.code, Some(0));
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(child.queued_messages(), 0);
    }

    #[tokio::test]
    async fn development_child_writes_to_message_fd() {
        let cfg = BackendConfig::new(
            Mode::Development,
            "sh",
            vec!["-c".into(), r#"echo "{\"type\":\"ready\",\"port\":$PORT}" >&3"#.into()],
        );
        let mut child = DevelopmentBackend.spawn(&cfg, &Launch { port: 4555, storage_path: "/tmp" }).unwrap();
        assert_eq!(child.next_message().await, Some(ChildMessage::Ready { port: Some(4555) }));
        child.exited().await;
    }
}
