pub mod api;
pub mod config;
pub mod error;
pub mod registry;
pub mod rendezvous;
pub mod server;
pub mod session;
pub mod socket;

// Data-plane control lines. Everything else on the socket is opaque payload.
pub const READY_SIGNAL: &[u8] = b"READY\n";
pub const ACK_SIGNAL: &[u8] = b"ACK\n";

pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_SOCKET_PORT: u16 = 10000;
pub const DEFAULT_WORKER_THREADS: usize = 4;
pub const DEFAULT_BACKLOG: u32 = 128;

/// How long a rendezvous call blocks waiting for its counterpart.
pub const DEFAULT_BLOCKING_TIMEOUT_MS: u64 = 30_000;
/// Session lifetime from creation to expiry.
pub const DEFAULT_SESSION_EXPIRY_MS: u64 = 120_000;

/// Kernel send/receive buffer size for relay sockets (2 MiB).
pub const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;
/// Upper bound on the `session_id:role` handshake line.
pub const MAX_HANDSHAKE_LEN: usize = 256;
/// Chunks queued per connection before the reader side is backpressured.
pub const RELAY_QUEUE_DEPTH: usize = 64;
