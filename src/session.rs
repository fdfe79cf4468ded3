use std::time::{Duration, SystemTime};

use uuid::Uuid;

/// Which side of a transfer a socket speaks for. The lowercase strings are
/// wire literals: clients send them verbatim in the socket handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRole {
    Sender,
    Receiver,
}

impl TransferRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferRole::Sender => "sender",
            TransferRole::Receiver => "receiver",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sender" => Some(TransferRole::Sender),
            "receiver" => Some(TransferRole::Receiver),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            TransferRole::Sender => TransferRole::Receiver,
            TransferRole::Receiver => TransferRole::Sender,
        }
    }
}

/// Lifecycle of a session. Transitions only move forward:
/// `WaitingReceiver -> Matched -> Completed`, or `WaitingReceiver -> Timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    WaitingReceiver,
    Matched,
    Completed,
    Timeout,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::WaitingReceiver => "waiting_receiver",
            SessionStatus::Matched => "matched",
            SessionStatus::Completed => "completed",
            SessionStatus::Timeout => "timeout",
        }
    }
}

/// One rendezvous record matching a sender to a receiver for one transfer.
/// The metadata fields are client-supplied and forwarded verbatim; the relay
/// never interprets them.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub sender_fp: String,
    pub receiver_fp: String,
    pub filename: String,
    pub file_size: u64,
    pub signature: String,
    pub file_hash: String,
    pub status: SessionStatus,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
}

impl Session {
    pub fn new(
        sender_fp: &str,
        receiver_fp: &str,
        filename: &str,
        file_size: u64,
        signature: &str,
        file_hash: &str,
        ttl: Duration,
    ) -> Self {
        let created_at = SystemTime::now();
        Session {
            session_id: Uuid::new_v4().to_string(),
            sender_fp: sender_fp.to_string(),
            receiver_fp: receiver_fp.to_string(),
            filename: filename.to_string(),
            file_size,
            signature: signature.to_string(),
            file_hash: file_hash.to_string(),
            status: SessionStatus::WaitingReceiver,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        SystemTime::now() > self.expires_at
    }

    /// Milliseconds until expiry, saturating at zero.
    pub fn expires_in_ms(&self) -> u64 {
        self.expires_at
            .duration_since(SystemTime::now())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Move the status forward along the allowed graph. Returns false (and
    /// leaves the status untouched) for back-transitions and repeats, so
    /// callers can apply it unconditionally.
    pub fn advance(&mut self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        let allowed = matches!(
            (self.status, next),
            (WaitingReceiver, Matched)
                | (WaitingReceiver, Completed)
                | (WaitingReceiver, Timeout)
                | (Matched, Completed)
        );
        if allowed {
            self.status = next;
        }
        allowed
    }
}

/// Fingerprint prefix for log lines and user-facing messages. Falls back to
/// the whole string when it is short or the cut would split a code point.
pub fn short_fp(fp: &str) -> &str {
    fp.get(..8).unwrap_or(fp)
}
