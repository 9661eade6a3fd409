use crate::error::SupervisorError;
use std::net::Ipv4Addr;
use tokio::net::TcpListener;
use tracing::debug;



/*
    @@@
    @find_free_port();
    . Binds a throwaway listener on 127.0.0.1 at `preferred`, then preferred+1, ... up to 65535.
    . Reads back the bound port (so 0 yields the ephemeral port the OS picked) and drops the listener before returning.
    . The port is free when probed, not when the child binds it; another process can take it in between.
*/
pub async fn find_free_port(preferred: u16) -> Result<u16, SupervisorError> {
    for candidate in preferred..=u16::MAX {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, candidate)).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                drop(listener);
                debug!(preferred, port, "found free port");
                return Ok(port);
            }
            Err(e) => {
                debug!(port = candidate, error = %e, "port unavailable, trying next");
            }
        }
    }
    Err(SupervisorError::PortExhausted { preferred })
}
