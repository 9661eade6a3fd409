use backend_supervisor::runtime::{MESSAGE_FD, MODE_ENV, PORT_ENV, STORAGE_PATH_ENV};
use std::fs::File;
use std::io::Write;
use std::os::fd::FromRawFd;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/*
    @@@
    @main();
    . Minimal backend honoring the supervisor's child contract; listens on 127.0.0.1:$PORT and answers every request with 404.
    . With --announce it sends {"type":"ready","port":...} on descriptor 3 in development mode, on stdout in production mode.
    . Exits on SIGTERM.
*/
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let port: u16 = std::env::var(PORT_ENV)?.parse()?;
    let storage = std::env::var(STORAGE_PATH_ENV).unwrap_or_default();
    let mode = std::env::var(MODE_ENV).unwrap_or_default();
    let announce = std::env::args().any(|a| a == "--announce");

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let bound = listener.local_addr()?.port();
    println!("stub backend on {bound} (mode={mode}, storage={storage})");

    if announce {
        let msg = format!("{{\"type\":\"ready\",\"port\":{bound}}}\n");
        if mode == "development" {
            // SAFETY: the supervisor hands us descriptor 3 as the message channel.
            let mut channel = unsafe { File::from_raw_fd(MESSAGE_FD) };
            channel.write_all(msg.as_bytes())?;
            channel.flush()?;
        } else {
            print!("{msg}");
            std::io::stdout().flush()?;
        }
    }

    let mut term = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut stream, _) = accepted?;
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(NOT_FOUND).await;
                    let _ = stream.shutdown().await;
                });
            }
            _ = term.recv() => {
                println!("stub backend stopping");
                return Ok(());
            }
        }
    }
}
