use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::error::RelayError;
use crate::session::{short_fp, Session, SessionStatus, TransferRole};

/// Identifies one accepted socket for the lifetime of its connection.
pub type ConnId = u64;

/// Single-shot completion handle for a parked rendezvous call. Completed with
/// the matched session while the registry lock is held, so a waiter can never
/// be observed both parked and resolved.
pub type Waiter = oneshot::Sender<Session>;

/// Control messages delivered to a connection's handler task.
#[derive(Debug)]
pub enum ConnEvent {
    /// The second socket of the session has attached; READY is on the wire.
    PartnerAttached,
    /// Both sides have ACKed; start forwarding.
    RelayOpen,
    /// The transfer was torn down; hang up.
    Close,
}

/// Cheap cloneable handle to one socket: outbound byte queue plus control
/// channel. The registry stores these; it never touches the socket itself.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub id: ConnId,
    pub data: mpsc::Sender<Vec<u8>>,
    pub events: mpsc::UnboundedSender<ConnEvent>,
}

/// Half-open transfer: one socket handshaken, partner not yet connected.
#[derive(Debug)]
struct PendingConnection {
    role: TransferRole,
    conn: ConnHandle,
    session: Session,
}

/// Both sockets attached. `bytes_transferred` is shared with the handler
/// tasks so it can be read without taking the registry lock.
#[derive(Debug)]
struct ActiveTransfer {
    sender_conn: ConnHandle,
    receiver_conn: ConnHandle,
    session: Session,
    bytes_transferred: Arc<AtomicU64>,
    sender_acked: bool,
    receiver_acked: bool,
    paired: bool,
}

/// Read-only view of an active transfer handed out to handlers and tests.
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    pub session: Session,
    pub sender_conn: ConnHandle,
    pub receiver_conn: ConnHandle,
    pub bytes_transferred: Arc<AtomicU64>,
    pub sender_acked: bool,
    pub receiver_acked: bool,
    pub paired: bool,
}

/// Result of attaching a socket to a session.
#[derive(Debug)]
pub enum RegisterOutcome {
    /// First socket for this session; parked until the partner arrives.
    Pending,
    /// Second socket; the transfer is now active. Carries the partner's
    /// handle so READY can be pushed to both sides.
    Promoted { partner: ConnHandle },
    /// A socket already holds this role for the session.
    DuplicateRole,
}

/// Result of the atomic initiate step.
#[derive(Debug)]
pub enum InitiateOutcome {
    /// A receiver was already parked; it has been woken with this session.
    Matched(Session),
    /// No receiver yet; the sender waiter is parked under the session id.
    Parked,
}

/// Result of the atomic listen step.
#[derive(Debug)]
pub enum ListenOutcome {
    /// A sender was already waiting; it has been woken with this session.
    Matched(Session),
    /// No waiting sender; the receiver waiter is parked under the fingerprint.
    Parked,
    /// Another receiver is already parked for this fingerprint.
    Busy,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    waiting_senders: HashMap<String, Waiter>,
    waiting_receivers: HashMap<String, Waiter>,
    pending: HashMap<String, PendingConnection>,
    active: HashMap<String, ActiveTransfer>,
    /// Bytes of transfers already removed; live transfers are summed on read.
    historical_bytes: u64,
}

/// Shared state for both halves of the relay: sessions and parked rendezvous
/// waiters on the control side, pending connections and active transfers on
/// the socket side. A session id lives in at most one of `pending` / `active`
/// at any instant.
///
/// Every multi-step transition runs under the single internal lock, and no
/// I/O happens while it is held; completing a oneshot waiter or posting a
/// control event only queues a wakeup.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("registry lock poisoned")
    }

    // ---- sessions -----------------------------------------------------

    pub fn put_session(&self, session: Session) -> Result<(), RelayError> {
        let mut inner = self.lock();
        if inner.sessions.contains_key(&session.session_id) {
            return Err(RelayError::DuplicateSession(session.session_id));
        }
        inner.sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    /// Look up a session; expired sessions are removed on sight and reported
    /// as absent.
    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        let mut inner = self.lock();
        match inner.sessions.get(session_id) {
            Some(s) if s.is_expired() => {
                debug!("Session expired on lookup: {}", short_fp(session_id));
                inner.sessions.remove(session_id);
                None
            }
            Some(s) => Some(s.clone()),
            None => None,
        }
    }

    pub fn complete_session(&self, session_id: &str) {
        let mut inner = self.lock();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.advance(SessionStatus::Completed);
            info!("Completed session: {}", short_fp(session_id));
        }
    }

    pub fn find_waiting_session_for(&self, receiver_fp: &str) -> Option<Session> {
        let inner = self.lock();
        inner
            .sessions
            .values()
            .filter(|s| s.receiver_fp == receiver_fp && s.status == SessionStatus::WaitingReceiver)
            .min_by_key(|s| s.created_at)
            .cloned()
    }

    // ---- waiter indexes ----------------------------------------------

    /// Park a sender waiter. False if one is already parked for the id.
    pub fn park_sender(&self, session_id: &str, waiter: Waiter) -> bool {
        let mut inner = self.lock();
        if inner.waiting_senders.contains_key(session_id) {
            return false;
        }
        inner.waiting_senders.insert(session_id.to_string(), waiter);
        true
    }

    pub fn unpark_sender(&self, session_id: &str) -> Option<Waiter> {
        self.lock().waiting_senders.remove(session_id)
    }

    /// Park a receiver waiter. False if one is already parked for the
    /// fingerprint.
    pub fn park_receiver(&self, receiver_fp: &str, waiter: Waiter) -> bool {
        let mut inner = self.lock();
        if inner.waiting_receivers.contains_key(receiver_fp) {
            return false;
        }
        inner
            .waiting_receivers
            .insert(receiver_fp.to_string(), waiter);
        true
    }

    pub fn unpark_receiver(&self, receiver_fp: &str) -> Option<Waiter> {
        self.lock().waiting_receivers.remove(receiver_fp)
    }

    // ---- atomic rendezvous steps -------------------------------------

    /// Insert a fresh session and either wake an already-parked receiver or
    /// park the sender waiter, all in one step.
    pub fn initiate_session(
        &self,
        session: Session,
        waiter: Waiter,
    ) -> Result<InitiateOutcome, RelayError> {
        let mut inner = self.lock();
        if inner.sessions.contains_key(&session.session_id) {
            return Err(RelayError::DuplicateSession(session.session_id));
        }

        // A waiter whose Listen call has been dropped client-side is dead
        // weight; discard it and fall through to parking.
        let parked = match inner.waiting_receivers.remove(&session.receiver_fp) {
            Some(w) if !w.is_closed() => Some(w),
            Some(_) => {
                debug!(
                    "Dropping abandoned receiver waiter: {}",
                    short_fp(&session.receiver_fp)
                );
                None
            }
            None => None,
        };

        match parked {
            Some(receiver_waiter) => {
                let mut session = session;
                session.advance(SessionStatus::Matched);
                info!(
                    "Receiver {} already waiting, matching {} immediately",
                    short_fp(&session.receiver_fp),
                    short_fp(&session.sender_fp)
                );
                inner
                    .sessions
                    .insert(session.session_id.clone(), session.clone());
                if receiver_waiter.send(session.clone()).is_err() {
                    warn!(
                        "Receiver waiter vanished mid-match: {}",
                        short_fp(&session.receiver_fp)
                    );
                }
                Ok(InitiateOutcome::Matched(session))
            }
            None => {
                let session_id = session.session_id.clone();
                inner.sessions.insert(session_id.clone(), session);
                inner.waiting_senders.insert(session_id, waiter);
                Ok(InitiateOutcome::Parked)
            }
        }
    }

    /// Match against a waiting session (waking its parked sender) or park the
    /// receiver waiter, all in one step.
    pub fn listen_session(&self, receiver_fp: &str, waiter: Waiter) -> ListenOutcome {
        let mut inner = self.lock();

        let found = inner
            .sessions
            .values()
            .filter(|s| s.receiver_fp == receiver_fp && s.status == SessionStatus::WaitingReceiver)
            .min_by_key(|s| s.created_at)
            .map(|s| s.session_id.clone());

        if let Some(session_id) = found {
            if let Some(session) = inner.sessions.get_mut(&session_id) {
                session.advance(SessionStatus::Matched);
                let session = session.clone();
                info!(
                    "Sender {} already waiting, matching receiver {} immediately",
                    short_fp(&session.sender_fp),
                    short_fp(receiver_fp)
                );
                if let Some(sender_waiter) = inner.waiting_senders.remove(&session_id) {
                    if sender_waiter.send(session.clone()).is_err() {
                        warn!("Sender waiter vanished mid-match: {}", short_fp(&session_id));
                    }
                }
                return ListenOutcome::Matched(session);
            }
        }

        match inner.waiting_receivers.get(receiver_fp) {
            Some(existing) if !existing.is_closed() => ListenOutcome::Busy,
            _ => {
                inner
                    .waiting_receivers
                    .insert(receiver_fp.to_string(), waiter);
                ListenOutcome::Parked
            }
        }
    }

    /// Timeout cleanup for a parked Initiate. True iff the waiter was still
    /// parked; the session is then removed with status `timeout`.
    pub fn abort_sender_wait(&self, session_id: &str) -> bool {
        let mut inner = self.lock();
        if inner.waiting_senders.remove(session_id).is_none() {
            return false;
        }
        if let Some(mut session) = inner.sessions.remove(session_id) {
            session.advance(SessionStatus::Timeout);
            warn!(
                "Session timeout: {} | {} -> {}",
                short_fp(session_id),
                short_fp(&session.sender_fp),
                short_fp(&session.receiver_fp)
            );
        }
        true
    }

    /// Timeout cleanup for a parked Listen. True iff the waiter was still
    /// parked.
    pub fn abort_receiver_wait(&self, receiver_fp: &str) -> bool {
        let removed = self.lock().waiting_receivers.remove(receiver_fp).is_some();
        if removed {
            warn!("Listen timeout: {}", short_fp(receiver_fp));
        }
        removed
    }

    // ---- socket pairing ----------------------------------------------

    /// Attach a handshaken socket to its session. The first socket parks as
    /// pending; the second with the opposite role promotes the pair to an
    /// active transfer (connections assigned by role, not arrival order).
    pub fn register_socket(
        &self,
        session_id: &str,
        conn: ConnHandle,
        role: TransferRole,
        session: Session,
    ) -> RegisterOutcome {
        let mut inner = self.lock();

        if inner.active.contains_key(session_id) {
            // both slots already taken
            return RegisterOutcome::DuplicateRole;
        }

        match inner.pending.remove(session_id) {
            Some(pending) if pending.role == role => {
                inner.pending.insert(session_id.to_string(), pending);
                RegisterOutcome::DuplicateRole
            }
            Some(pending) => {
                let partner = pending.conn.clone();
                let (sender_conn, receiver_conn) = match role {
                    TransferRole::Sender => (conn, pending.conn),
                    TransferRole::Receiver => (pending.conn, conn),
                };
                info!("Pair matched! Session: {}", short_fp(session_id));
                inner.active.insert(
                    session_id.to_string(),
                    ActiveTransfer {
                        sender_conn,
                        receiver_conn,
                        session: pending.session,
                        bytes_transferred: Arc::new(AtomicU64::new(0)),
                        sender_acked: false,
                        receiver_acked: false,
                        paired: false,
                    },
                );
                RegisterOutcome::Promoted { partner }
            }
            None => {
                debug!("Waiting for partner... Session: {}", short_fp(session_id));
                inner.pending.insert(
                    session_id.to_string(),
                    PendingConnection {
                        role,
                        conn,
                        session,
                    },
                );
                RegisterOutcome::Pending
            }
        }
    }

    pub fn get_active(&self, session_id: &str) -> Option<TransferSnapshot> {
        let inner = self.lock();
        inner.active.get(session_id).map(|t| TransferSnapshot {
            session: t.session.clone(),
            sender_conn: t.sender_conn.clone(),
            receiver_conn: t.receiver_conn.clone(),
            bytes_transferred: t.bytes_transferred.clone(),
            sender_acked: t.sender_acked,
            receiver_acked: t.receiver_acked,
            paired: t.paired,
        })
    }

    /// Partner handle and byte counter for forwarding out of `from`'s side.
    pub fn relay_target(
        &self,
        session_id: &str,
        from: TransferRole,
    ) -> Option<(ConnHandle, Arc<AtomicU64>)> {
        let inner = self.lock();
        inner.active.get(session_id).map(|t| {
            let partner = match from {
                TransferRole::Sender => t.receiver_conn.clone(),
                TransferRole::Receiver => t.sender_conn.clone(),
            };
            (partner, t.bytes_transferred.clone())
        })
    }

    /// Record one role's ACK. Returns true exactly once: when the second
    /// role's ACK lands and the pair latches. Repeat calls for an already
    /// acked role change nothing.
    pub fn mark_ack(&self, session_id: &str, role: TransferRole) -> bool {
        let mut inner = self.lock();
        let Some(transfer) = inner.active.get_mut(session_id) else {
            warn!("ACK for unknown transfer: {}", short_fp(session_id));
            return false;
        };
        match role {
            TransferRole::Sender => transfer.sender_acked = true,
            TransferRole::Receiver => transfer.receiver_acked = true,
        }
        if transfer.sender_acked && transfer.receiver_acked && !transfer.paired {
            transfer.paired = true;
            info!(
                "Both clients ACK'd, relay open | Session: {}",
                short_fp(session_id)
            );
            true
        } else {
            false
        }
    }

    /// Drop the transfer state for a session, folding its byte count into the
    /// running total. Does not touch the sockets.
    pub fn remove_transfer(&self, session_id: &str) {
        let mut inner = self.lock();
        if let Some(transfer) = inner.active.remove(session_id) {
            inner.historical_bytes += transfer.bytes_transferred.load(Ordering::Relaxed);
        }
        inner.pending.remove(session_id);
        debug!("Removed transfer state: {}", short_fp(session_id));
    }

    /// Tear down whatever transfer state references this connection. Returns
    /// the partner's handle (if the connection was half of an active
    /// transfer) so the caller can hang it up outside the lock.
    pub fn remove_by_conn(&self, conn_id: ConnId) -> Option<ConnHandle> {
        let mut inner = self.lock();

        inner.pending.retain(|session_id, p| {
            if p.conn.id == conn_id {
                info!("Removed pending connection: {}", short_fp(session_id));
                false
            } else {
                true
            }
        });

        let session_id = inner
            .active
            .iter()
            .find(|(_, t)| t.sender_conn.id == conn_id || t.receiver_conn.id == conn_id)
            .map(|(id, _)| id.clone())?;
        let transfer = inner.active.remove(&session_id)?;
        inner.historical_bytes += transfer.bytes_transferred.load(Ordering::Relaxed);
        info!("Removed active transfer: {}", short_fp(&session_id));

        let partner = if transfer.sender_conn.id == conn_id {
            transfer.receiver_conn
        } else {
            transfer.sender_conn
        };
        Some(partner)
    }

    /// Bytes relayed over the lifetime of the process: finished transfers
    /// plus whatever the live ones have moved so far.
    pub fn total_bytes_transferred(&self) -> u64 {
        let inner = self.lock();
        let live: u64 = inner
            .active
            .values()
            .map(|t| t.bytes_transferred.load(Ordering::Relaxed))
            .sum();
        inner.historical_bytes + live
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
