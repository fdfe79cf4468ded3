use std::time::Duration;

use clap::Parser;

use crate::{
    DEFAULT_BACKLOG, DEFAULT_BLOCKING_TIMEOUT_MS, DEFAULT_HTTP_PORT, DEFAULT_SESSION_EXPIRY_MS,
    DEFAULT_SOCKET_PORT, DEFAULT_WORKER_THREADS,
};

/// Runtime configuration, from command-line flags or their environment
/// variable equivalents.
#[derive(Parser, Debug, Clone)]
#[command(name = "ferry")]
#[command(about = "Rendezvous and relay server for peer-to-peer file transfers", long_about = None)]
#[command(version)]
pub struct RelayConfig {
    /// Port for the HTTP control API
    #[arg(long, env = "FERRY_HTTP_PORT", default_value_t = DEFAULT_HTTP_PORT)]
    pub http_port: u16,

    /// Port for the raw TCP data plane
    #[arg(long, env = "FERRY_SOCKET_PORT", default_value_t = DEFAULT_SOCKET_PORT)]
    pub socket_port: u16,

    /// Worker threads for the async runtime
    #[arg(long, env = "FERRY_WORKER_THREADS", default_value_t = DEFAULT_WORKER_THREADS)]
    pub worker_threads: usize,

    /// TCP accept backlog for the data plane listener
    #[arg(long, env = "FERRY_BACKLOG", default_value_t = DEFAULT_BACKLOG)]
    pub backlog: u32,

    /// How long a rendezvous call blocks waiting for its counterpart, in ms
    #[arg(long, env = "FERRY_BLOCKING_TIMEOUT_MS", default_value_t = DEFAULT_BLOCKING_TIMEOUT_MS)]
    pub blocking_timeout_ms: u64,

    /// Session lifetime from creation to expiry, in ms
    #[arg(long, env = "FERRY_SESSION_EXPIRY_MS", default_value_t = DEFAULT_SESSION_EXPIRY_MS)]
    pub session_expiry_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl RelayConfig {
    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }

    pub fn session_expiry(&self) -> Duration {
        Duration::from_millis(self.session_expiry_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            http_port: DEFAULT_HTTP_PORT,
            socket_port: DEFAULT_SOCKET_PORT,
            worker_threads: DEFAULT_WORKER_THREADS,
            backlog: DEFAULT_BACKLOG,
            blocking_timeout_ms: DEFAULT_BLOCKING_TIMEOUT_MS,
            session_expiry_ms: DEFAULT_SESSION_EXPIRY_MS,
            verbose: false,
        }
    }
}
