use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, info, warn};
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::registry::{ConnEvent, ConnHandle, ConnId, RegisterOutcome, SessionRegistry};
use crate::session::{short_fp, TransferRole};
use crate::{MAX_HANDSHAKE_LEN, READY_SIGNAL, RELAY_QUEUE_DEPTH, SOCKET_BUFFER_SIZE};

/// Run the data-plane socket server that pairs client connections and relays
/// bytes between them.
///
/// # Protocol
/// 1. Client connects and sends `session_id:role\n` (raw text)
/// 2. Server validates the session and waits for the partner
/// 3. When both are connected, the server sends `READY\n` to each side
/// 4. Each client answers `ACK\n`; once both ACKs are in, all further bytes
///    are forwarded to the partner unmodified, in both directions
///
/// # Architecture
/// - Main task: accepts new TCP connections in a loop
/// - Per connection: a handler task that owns the read half and drives the
///   handshake/ACK state machine, plus a writer task draining a bounded
///   queue into the write half
/// - Pairing decisions live in the shared registry; handler tasks look their
///   transfer up by session id on every operation
pub async fn run(
    registry: Arc<SessionRegistry>,
    addr: SocketAddr,
    backlog: u32,
) -> io::Result<()> {
    let listener = bind(addr, backlog)?;
    println!("Socket server listening on {}", addr);
    info!("Socket server listening on {}", addr);
    serve(registry, listener).await
}

/// Bind the relay listener with an explicit backlog.
pub fn bind(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Accept loop. Each connection gets a fresh id and its own handler task.
pub async fn serve(registry: Arc<SessionRegistry>, listener: TcpListener) -> io::Result<()> {
    let mut next_conn_id: ConnId = 0;
    loop {
        let (stream, peer) = listener.accept().await?;
        next_conn_id += 1;
        info!("Client connected: {}", peer);
        configure_stream(&stream, peer);
        tokio::spawn(handle_connection(
            registry.clone(),
            stream,
            peer,
            next_conn_id,
        ));
    }
}

/// Per-socket options: low latency for the interactive handshake, large
/// kernel buffers for the bulk relay phase. Failures are non-fatal.
fn configure_stream(stream: &TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }
    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_keepalive(true) {
        warn!("Failed to set SO_KEEPALIVE for {}: {}", peer, e);
    }
    if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!("Failed to set send buffer for {}: {}", peer, e);
    }
    if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!("Failed to set recv buffer for {}: {}", peer, e);
    }
}

/// Where a connection is in its lifecycle after the handshake line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// First socket of the pair; everything read here is retained.
    AwaitPartner,
    /// READY is out; the next line from the client must be ACK.
    AwaitAck,
    /// Our ACK is in, the partner's is not; keep retaining payload.
    AckSent,
    /// Both ACKs observed; bytes flow to the partner.
    Paired,
}

async fn handle_connection(
    registry: Arc<SessionRegistry>,
    stream: TcpStream,
    peer: SocketAddr,
    conn_id: ConnId,
) {
    let (read_half, write_half) = stream.into_split();
    let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(RELAY_QUEUE_DEPTH);
    let (event_tx, event_rx) = mpsc::unbounded_channel::<ConnEvent>();
    let writer = tokio::spawn(write_loop(data_rx, write_half));

    let handle = ConnHandle {
        id: conn_id,
        data: data_tx,
        events: event_tx,
    };

    match drive(&registry, read_half, event_rx, handle.clone(), peer).await {
        Ok(()) => info!("Client disconnected: {}", peer),
        Err(RelayError::PeerLost) => debug!("Relay ended for {}: peer lost", peer),
        Err(err) => warn!("Closing {}: {}", peer, err),
    }

    // Tear down whatever we registered and hang up the partner, if any.
    if let Some(partner) = registry.remove_by_conn(conn_id) {
        let _ = partner.events.send(ConnEvent::Close);
    }

    // With every handle clone gone the writer drains its queue and closes
    // the socket.
    drop(handle);
    let _ = writer.await;
}

/// Writer side of one connection: drain queued chunks into the socket, then
/// shut it down. READY and relayed payload share this queue, so everything a
/// peer is owed leaves in order.
async fn write_loop(mut data_rx: mpsc::Receiver<Vec<u8>>, mut write_half: OwnedWriteHalf) {
    while let Some(chunk) = data_rx.recv().await {
        if let Err(e) = write_half.write_all(&chunk).await {
            debug!("Write failed, dropping connection: {}", e);
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Reader side of one connection: handshake, then the pairing state machine,
/// then byte forwarding. Returns when the peer hangs up, the partner goes
/// away, or the client violates the protocol.
async fn drive(
    registry: &SessionRegistry,
    mut read_half: OwnedReadHalf,
    mut events: mpsc::UnboundedReceiver<ConnEvent>,
    handle: ConnHandle,
    peer: SocketAddr,
) -> Result<(), RelayError> {
    let mut buf = vec![0u8; 64 * 1024];
    // Bytes read but not yet forwarded: handshake remainder, then anything
    // the client pushes before both ACKs are in.
    let mut retained: Vec<u8> = Vec::new();

    // ---- handshake: read up to the first newline ----
    let (session_id, role) = loop {
        if let Some(pos) = find_newline(&retained) {
            let parsed = parse_handshake(&retained[..pos])?;
            retained.drain(..=pos);
            break parsed;
        }
        if retained.len() > MAX_HANDSHAKE_LEN {
            return Err(RelayError::ProtocolViolation(
                "handshake line too long".into(),
            ));
        }
        let n = read_half
            .read(&mut buf)
            .await
            .map_err(|_| RelayError::PeerLost)?;
        if n == 0 {
            debug!("{} closed before handshake", peer);
            return Ok(());
        }
        retained.extend_from_slice(&buf[..n]);
    };

    let session = registry
        .get_session(&session_id)
        .ok_or_else(|| RelayError::SessionAbsent(short_fp(&session_id).to_string()))?;
    info!(
        "Handshake: session={}, role={} | {} -> {}",
        short_fp(&session_id),
        role.as_str(),
        short_fp(&session.sender_fp),
        short_fp(&session.receiver_fp)
    );

    let mut phase = match registry.register_socket(&session_id, handle.clone(), role, session) {
        RegisterOutcome::Pending => Phase::AwaitPartner,
        RegisterOutcome::Promoted { partner } => {
            info!(
                "Both parties connected, sending READY signals | Session: {}",
                short_fp(&session_id)
            );
            handle
                .data
                .send(READY_SIGNAL.to_vec())
                .await
                .map_err(|_| RelayError::PeerLost)?;
            partner
                .data
                .send(READY_SIGNAL.to_vec())
                .await
                .map_err(|_| RelayError::PeerLost)?;
            let _ = partner.events.send(ConnEvent::PartnerAttached);
            Phase::AwaitAck
        }
        RegisterOutcome::DuplicateRole => {
            return Err(RelayError::ProtocolViolation(format!(
                "duplicate {} for session {}",
                role.as_str(),
                short_fp(&session_id)
            )));
        }
    };

    // ---- pairing state machine + relay loop ----
    loop {
        // Work through retained bytes first; each pass may change phase.
        match phase {
            Phase::AwaitAck => {
                if let Some(pos) = find_newline(&retained) {
                    let line = trim_line(&retained[..pos]).to_vec();
                    retained.drain(..=pos);
                    if line != b"ACK" {
                        return Err(RelayError::ProtocolViolation(format!(
                            "expected ACK, got: {}",
                            String::from_utf8_lossy(&line)
                        )));
                    }
                    info!(
                        "ACK received from {} | Session: {}",
                        role.as_str(),
                        short_fp(&session_id)
                    );
                    if registry.mark_ack(&session_id, role) {
                        // We completed the pair; open the partner's side and
                        // flush our own retained payload before live bytes.
                        let (partner, _) = registry
                            .relay_target(&session_id, role)
                            .ok_or(RelayError::PeerLost)?;
                        let _ = partner.events.send(ConnEvent::RelayOpen);
                        phase = Phase::Paired;
                    } else {
                        phase = Phase::AckSent;
                    }
                    continue;
                }
            }
            Phase::Paired => {
                if !retained.is_empty() {
                    let backlog = std::mem::take(&mut retained);
                    debug!(
                        "Flushing {} retained bytes | Session: {}",
                        backlog.len(),
                        short_fp(&session_id)
                    );
                    forward(registry, &session_id, role, backlog).await?;
                }
            }
            Phase::AwaitPartner | Phase::AckSent => {}
        }

        tokio::select! {
            event = events.recv() => match event {
                Some(ConnEvent::PartnerAttached) => {
                    if phase == Phase::AwaitPartner {
                        phase = Phase::AwaitAck;
                    }
                }
                Some(ConnEvent::RelayOpen) => {
                    phase = Phase::Paired;
                }
                Some(ConnEvent::Close) | None => return Ok(()),
            },
            result = read_half.read(&mut buf) => {
                let n = result.map_err(|_| RelayError::PeerLost)?;
                if n == 0 {
                    return Ok(());
                }
                if phase == Phase::Paired {
                    forward(registry, &session_id, role, buf[..n].to_vec()).await?;
                } else {
                    debug!(
                        "Buffering {} bytes until paired | Session: {}",
                        n,
                        short_fp(&session_id)
                    );
                    retained.extend_from_slice(&buf[..n]);
                }
            }
        }
    }
}

/// Push one chunk to the partner and account for it. The transfer is looked
/// up fresh every time; a missing transfer or closed partner queue means the
/// other side is gone.
async fn forward(
    registry: &SessionRegistry,
    session_id: &str,
    from: TransferRole,
    chunk: Vec<u8>,
) -> Result<(), RelayError> {
    if chunk.is_empty() {
        return Ok(());
    }
    let (partner, bytes_transferred) = registry
        .relay_target(session_id, from)
        .ok_or(RelayError::PeerLost)?;
    let len = chunk.len() as u64;
    partner
        .data
        .send(chunk)
        .await
        .map_err(|_| RelayError::PeerLost)?;
    bytes_transferred.fetch_add(len, Ordering::Relaxed);
    Ok(())
}

fn find_newline(data: &[u8]) -> Option<usize> {
    data.iter().position(|&b| b == b'\n')
}

/// Strip trailing carriage return and surrounding spaces from a control line.
fn trim_line(line: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = line.len();
    while start < end && (line[start] == b' ' || line[start] == b'\r') {
        start += 1;
    }
    while end > start && (line[end - 1] == b' ' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[start..end]
}

/// Parse the `session_id:role` handshake line.
fn parse_handshake(line: &[u8]) -> Result<(String, TransferRole), RelayError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| RelayError::ProtocolViolation("handshake is not UTF-8".into()))?;
    let Some((session_id, role)) = text.trim().split_once(':') else {
        return Err(RelayError::ProtocolViolation(format!(
            "invalid handshake format: {}",
            text.trim()
        )));
    };
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return Err(RelayError::ProtocolViolation("empty session id".into()));
    }
    let role = TransferRole::parse(role.trim())
        .ok_or_else(|| RelayError::ProtocolViolation(format!("unknown role: {}", role.trim())))?;
    Ok((session_id.to_string(), role))
}
