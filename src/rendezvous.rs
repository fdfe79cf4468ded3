use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::oneshot;
use tokio::time;

use crate::error::RelayError;
use crate::registry::{InitiateOutcome, ListenOutcome, SessionRegistry};
use crate::session::{short_fp, Session};

const SENDER_TIMEOUT_MSG: &str = "Receiver didn't respond";
const RECEIVER_TIMEOUT_MSG: &str = "No sender found";

/// Matches senders and receivers on sessions. Each call either completes
/// immediately against an already-parked counterpart or parks on a oneshot
/// until the counterpart arrives or the blocking timeout fires.
pub struct Rendezvous {
    registry: Arc<SessionRegistry>,
    blocking_timeout: Duration,
    session_expiry: Duration,
}

impl Rendezvous {
    pub fn new(
        registry: Arc<SessionRegistry>,
        blocking_timeout: Duration,
        session_expiry: Duration,
    ) -> Self {
        Rendezvous {
            registry,
            blocking_timeout,
            session_expiry,
        }
    }

    /// Sender side: create a session for `receiver_fp` and block until a
    /// matching Listen arrives or the timeout fires.
    pub async fn initiate(
        &self,
        sender_fp: &str,
        receiver_fp: &str,
        filename: &str,
        file_size: u64,
        signature: &str,
        file_hash: &str,
    ) -> Result<Session, RelayError> {
        if sender_fp.is_empty() {
            return Err(RelayError::InvalidArgument(
                "Missing sender fingerprint".into(),
            ));
        }
        if receiver_fp.is_empty() {
            return Err(RelayError::InvalidArgument(
                "Missing receiver fingerprint".into(),
            ));
        }
        if filename.is_empty() {
            return Err(RelayError::InvalidArgument("Missing filename".into()));
        }
        if signature.is_empty() {
            return Err(RelayError::InvalidArgument("Missing signature".into()));
        }
        if file_hash.is_empty() {
            return Err(RelayError::InvalidArgument("Missing file hash".into()));
        }

        let session = Session::new(
            sender_fp,
            receiver_fp,
            filename,
            file_size,
            signature,
            file_hash,
            self.session_expiry,
        );
        let session_id = session.session_id.clone();
        info!(
            "Created session: {} | {} -> {}",
            short_fp(&session_id),
            short_fp(sender_fp),
            short_fp(receiver_fp)
        );

        let (waiter, mut parked) = oneshot::channel();
        match self.registry.initiate_session(session, waiter)? {
            InitiateOutcome::Matched(session) => Ok(session),
            InitiateOutcome::Parked => {
                info!(
                    "Receiver {} not ready yet, sender {} blocking...",
                    short_fp(receiver_fp),
                    short_fp(sender_fp)
                );
                match time::timeout(self.blocking_timeout, &mut parked).await {
                    Ok(Ok(session)) => Ok(session),
                    Ok(Err(_)) => Err(RelayError::Timeout(SENDER_TIMEOUT_MSG)),
                    Err(_elapsed) => {
                        if self.registry.abort_sender_wait(&session_id) {
                            Err(RelayError::Timeout(SENDER_TIMEOUT_MSG))
                        } else {
                            // lost the race: the match landed as the timer
                            // fired, and the session was sent under the lock
                            debug!("Timeout raced a match: {}", short_fp(&session_id));
                            parked
                                .try_recv()
                                .map_err(|_| RelayError::Timeout(SENDER_TIMEOUT_MSG))
                        }
                    }
                }
            }
        }
    }

    /// Receiver side: block until a sender initiates a transfer addressed to
    /// `receiver_fp` or the timeout fires.
    pub async fn listen(&self, receiver_fp: &str) -> Result<Session, RelayError> {
        if receiver_fp.is_empty() {
            return Err(RelayError::InvalidArgument(
                "Missing receiver fingerprint".into(),
            ));
        }

        info!("Receiver {} waiting", short_fp(receiver_fp));
        let (waiter, mut parked) = oneshot::channel();
        match self.registry.listen_session(receiver_fp, waiter) {
            ListenOutcome::Matched(session) => Ok(session),
            ListenOutcome::Busy => Err(RelayError::ReceiverBusy),
            ListenOutcome::Parked => {
                info!(
                    "Sender not ready yet, receiver {} blocking...",
                    short_fp(receiver_fp)
                );
                match time::timeout(self.blocking_timeout, &mut parked).await {
                    Ok(Ok(session)) => Ok(session),
                    Ok(Err(_)) => Err(RelayError::Timeout(RECEIVER_TIMEOUT_MSG)),
                    Err(_elapsed) => {
                        if self.registry.abort_receiver_wait(receiver_fp) {
                            Err(RelayError::Timeout(RECEIVER_TIMEOUT_MSG))
                        } else {
                            debug!("Timeout raced a match: {}", short_fp(receiver_fp));
                            parked
                                .try_recv()
                                .map_err(|_| RelayError::Timeout(RECEIVER_TIMEOUT_MSG))
                        }
                    }
                }
            }
        }
    }
}
