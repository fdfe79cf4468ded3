use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};

use crate::api::{self, ApiState};
use crate::config::RelayConfig;
use crate::registry::SessionRegistry;
use crate::rendezvous::Rendezvous;
use crate::socket;

/// Run the relay server: HTTP control plane plus TCP data plane.
///
/// # Overview
/// The relay is the rendezvous point for file transfers between peers that
/// cannot reach each other directly. It:
/// 1. Matches a sender and a receiver on a session via the blocking
///    `/api/relay/serve` and `/api/relay/listen` endpoints
/// 2. Accepts both parties' raw TCP connections on the socket port
/// 3. Gates the transfer behind a READY/ACK handshake so neither side writes
///    into the void
/// 4. Forwards opaque bytes in both directions until either side disconnects
///
/// # Process Flow
/// 1. Sender POSTs serve; receiver POSTs listen; both block until matched
/// 2. Each connects to the socket port and sends `session_id:role`
/// 3. The relay pairs the connections, handshakes, and streams bytes
/// 4. Either side closing ends the transfer; the session is cleaned up
///
/// Both subsystems share one in-memory session registry; nothing survives a
/// restart.
pub async fn run(config: RelayConfig) -> Result<(), Box<dyn Error>> {
    let registry = Arc::new(SessionRegistry::new());
    let rendezvous = Arc::new(Rendezvous::new(
        registry.clone(),
        config.blocking_timeout(),
        config.session_expiry(),
    ));

    let socket_addr: SocketAddr = ([0, 0, 0, 0], config.socket_port).into();
    let http_addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();

    let mut socket_task = tokio::spawn(socket::run(
        registry.clone(),
        socket_addr,
        config.backlog,
    ));

    let app = api::router(ApiState {
        rendezvous,
        registry,
        socket_port: config.socket_port,
    });
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    println!("HTTP API listening on {}", http_addr);
    info!("HTTP API listening on {}", http_addr);
    let mut http_task = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("Shutting down...");
            info!("Shutdown signal received, stopping relay");
        }
        result = &mut socket_task => {
            error!("Socket server exited: {:?}", result);
        }
        result = &mut http_task => {
            error!("HTTP server exited: {:?}", result);
        }
    }

    socket_task.abort();
    http_task.abort();
    Ok(())
}
