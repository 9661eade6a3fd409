use crate::error::SupervisorError;
use crate::parse::ReadinessTimings;
use crate::runtime::{wait_for_exit, ChildMessage, ChildProcess};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Answers "is something listening and speaking HTTP on this port".
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, port: u16) -> bool;
}

/// GETs a fixed path on loopback. Any status code counts.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpProbe {
    pub fn new(path: impl Into<String>, per_attempt: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(per_attempt)
            .no_proxy()
            .build()?;
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Ok(Self { client, path })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}{}", self.path);
        match self.client.get(&url).send().await {
            Ok(resp) => {
                debug!(%url, status = %resp.status(), "health probe answered");
                true
            }
            Err(e) => {
                debug!(%url, error = %e, "health probe failed");
                false
            }
        }
    }
}

async fn poll_until_listening<P>(probe: &P, port: u16, timings: &ReadinessTimings)
where
    P: HealthProbe + ?Sized,
{
    let mut ticker = interval_at(Instant::now() + timings.poll_interval, timings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Ok(true) = timeout(timings.probe_timeout, probe.probe(port)).await {
            return;
        }
    }
}



/*
    @@@
    @wait_ready();
    . Races a `ready` message, an HTTP poll that gets any answer, a child exit and the startup deadline in one select!.
    . Exactly one branch wins; the interval, any in-flight probe and the deadline are dropped with the others.
    . Resolves with the port the child is serving on: the one from its ready message if it sent one, else `port`.
    . Fails with PrematureExit if the child is reaped first, and with StartupTimeout when the deadline passes.
    . Messages other than `ready` are skipped; a closed message path just leaves polling and the deadline running.
*/
pub async fn wait_ready<P>(
    child: &mut ChildProcess,
    port: u16,
    probe: &P,
    timings: &ReadinessTimings,
) -> Result<u16, SupervisorError>
where
    P: HealthProbe + ?Sized,
{
    let mut exit = child.exit_watch();
    let poll = poll_until_listening(probe, port, timings);
    let deadline = sleep(timings.startup_timeout);
    tokio::pin!(poll, deadline);

    loop {
        tokio::select! {
            biased;
            Some(msg) = child.next_message() => {
                if let ChildMessage::Ready { port: reported } = msg {
                    let ready = reported.unwrap_or(port);
                    info!(port = ready, trigger = "message", "backend ready");
                    return Ok(ready);
                }
            }
            () = &mut poll => {
                info!(port, trigger = "poll", "backend ready");
                return Ok(port);
            }
            event = wait_for_exit(&mut exit) => {
                return Err(SupervisorError::PrematureExit { code: event.code, signal: event.signal });
            }
            () = &mut deadline => {
                return Err(SupervisorError::StartupTimeout { timeout: timings.startup_timeout });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ExitEvent;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch};

    #[derive(Default)]
    struct FakeProbe {
        up: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn probe(&self, _port: u16) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.up.load(Ordering::SeqCst)
        }
    }

    struct FakeChild {
        messages: mpsc::UnboundedSender<ChildMessage>,
        exit: watch::Sender<Option<ExitEvent>>,
        _kill: mpsc::UnboundedReceiver<()>,
    }

    fn fake_child() -> (ChildProcess, FakeChild) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let child = ChildProcess::from_parts(Some(4242), msg_rx, exit_rx, kill_tx);
        (child, FakeChild { messages: msg_tx, exit: exit_tx, _kill: kill_rx })
    }

    #[tokio::test(start_paused = true)]
    async fn message_port_overrides_allocated_port() {
        let (mut child, fake) = fake_child();
        let probe = FakeProbe::default();
        fake.messages.send(ChildMessage::Unknown).unwrap();
        fake.messages.send(ChildMessage::Ready { port: Some(4999) }).unwrap();

        let port = wait_ready(&mut child, 4123, &probe, &ReadinessTimings::default()).await.unwrap();
        assert_eq!(port, 4999);
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_happens_one_interval_in() {
        let (mut child, _fake) = fake_child();
        let probe = FakeProbe::default();
        probe.up.store(true, Ordering::SeqCst);

        let started = Instant::now();
        let port = wait_ready(&mut child, 4123, &probe, &ReadinessTimings::default()).await.unwrap();
        assert_eq!(port, 4123);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn both_triggers_in_one_tick_resolve_once_and_stop_polling() {
        let (mut child, fake) = fake_child();
        let probe = Arc::new(FakeProbe::default());
        probe.up.store(true, Ordering::SeqCst);
        // lands on the same instant as the first poll tick
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            fake.messages.send(ChildMessage::Ready { port: None }).unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(fake);
        });

        let port = wait_ready(&mut child, 4123, probe.as_ref(), &ReadinessTimings::default()).await.unwrap();
        assert_eq!(port, 4123);

        let calls = probe.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_at_thirty_seconds_not_before() {
        let (mut child, _fake) = fake_child();
        let probe = FakeProbe::default();

        let started = Instant::now();
        let err = wait_ready(&mut child, 4123, &probe, &ReadinessTimings::default()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::StartupTimeout { timeout: t } if t == Duration::from_secs(30)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(30_500), "fired late: {elapsed:?}");
        assert!(probe.calls.load(Ordering::SeqCst) >= 59);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_at_29s_is_premature_exit() {
        let (mut child, fake) = fake_child();
        let probe = FakeProbe::default();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(29)).await;
            fake.exit.send_replace(Some(ExitEvent { code: Some(1), signal: None }));
            // keep the message sender alive past the exit
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(fake);
        });

        let err = wait_ready(&mut child, 4123, &probe, &ReadinessTimings::default()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::PrematureExit { code: Some(1), signal: None }), "{err:?}");
    }

    #[tokio::test]
    async fn http_client_builds_with_rooted_path() {
        let http = HttpProbe::new("api", Duration::from_millis(400)).unwrap();
        assert_eq!(http.path, "/api");

        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        assert!(!http.probe(port).await);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_message_path_keeps_polling() {
        let (mut child, fake) = fake_child();
        drop(fake.messages);
        let probe = Arc::new(FakeProbe::default());

        let flip = probe.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            flip.up.store(true, Ordering::SeqCst);
        });

        let port = wait_ready(&mut child, 4123, probe.as_ref(), &ReadinessTimings::default()).await.unwrap();
        assert_eq!(port, 4123);
        drop(fake.exit);
    }
}
