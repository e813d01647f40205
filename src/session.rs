//! Reader Session
//!
//! A time-boxed, reader-signed credential that backs key requests so the
//! reader is not asked to sign once per article.
//!
//! # The Key Abstraction
//!
//! A [`SessionKey`] only comes out of [`SessionManager::initialize`], after
//! the reader has signed it. If you hold one, the signature is already
//! there. Expiry is still checked on every use ([`SessionManager::current`],
//! [`SessionKey::verify`]); holding a key says nothing about whether it is
//! still live.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──initialize()──► Initializing ──signed──► Ready ──ttl──► Expired
//!       ▲                              │                                   │
//!       └─── signer refused ───────────┤                                   │
//!  (prior state) ◄── call dropped ─────┘                                   │
//!       └───────────────────────────── clear() ────────────────────────────┘
//! ```
//!
//! Session lifetime is independent of any subscription period.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::clock::{Clock, UnixSecs};
use crate::error::{PressError, Result};
use crate::identity::{encode_signature, Address, Signer};

/// A signed session credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKey {
    pub session_id: String,
    pub reader: Address,
    pub created_at: UnixSecs,
    pub ttl_secs: u64,
    /// Reader's hex signature over [`SessionKey::signing_bytes`]
    pub signature: String,
}

impl SessionKey {
    /// Bytes the reader signs when opening a session
    pub fn signing_bytes(session_id: &str, reader: &Address, created_at: UnixSecs, ttl_secs: u64) -> Vec<u8> {
        format!(
            "gated-press/session/v1\n{session_id}\n{reader}\n{}\n{ttl_secs}",
            created_at.as_u64()
        )
        .into_bytes()
    }

    pub fn expires_at(&self) -> UnixSecs {
        self.created_at.plus(self.ttl_secs)
    }

    pub fn is_expired(&self, now: UnixSecs) -> bool {
        now > self.expires_at()
    }

    /// Check the signature and that the session is still live
    pub fn verify(&self, now: UnixSecs) -> Result<()> {
        let message = Self::signing_bytes(&self.session_id, &self.reader, self.created_at, self.ttl_secs);
        self.reader.verify(&message, &self.signature)?;
        if self.is_expired(now) {
            return Err(PressError::SessionExpired {
                expired_at: self.expires_at(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum SessionState {
    Uninitialized,
    Initializing,
    Ready(SessionKey),
}

/// Observable session state. `Expired` is derived from the clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Uninitialized,
    Initializing,
    Ready { expires_at: UnixSecs },
    Expired { expired_at: UnixSecs },
}

pub struct SessionManager {
    signer: Arc<dyn Signer>,
    clock: Arc<dyn Clock>,
    ttl_secs: u64,
    state: RwLock<SessionState>,
}

/// Puts the previous state back if an initialization never finishes,
/// e.g. when the caller times out waiting on a wallet prompt.
struct InitializingGuard<'a> {
    state: &'a RwLock<SessionState>,
    previous: Option<SessionState>,
}

impl InitializingGuard<'_> {
    fn disarm(&mut self) {
        self.previous = None;
    }
}

impl Drop for InitializingGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            if matches!(*state, SessionState::Initializing) {
                debug!("Session initialization abandoned, restoring previous state");
                *state = previous;
            }
        }
    }
}

impl SessionManager {
    pub fn new(signer: Arc<dyn Signer>, clock: Arc<dyn Clock>, ttl_secs: u64) -> Self {
        Self {
            signer,
            clock,
            ttl_secs,
            state: RwLock::new(SessionState::Uninitialized),
        }
    }

    pub fn reader(&self) -> Address {
        self.signer.address()
    }

    // Never held across an await
    fn read_state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask the reader to sign a fresh session.
    ///
    /// Replaces any current session. If the signer refuses, the manager goes
    /// back to `Uninitialized` and the call can simply be retried. If this
    /// future is dropped before the signer answers, the state it replaced is
    /// restored.
    pub async fn initialize(&self) -> Result<SessionKey> {
        let mut guard = {
            let mut state = self.write_state();
            if matches!(*state, SessionState::Initializing) {
                return Err(PressError::SessionNotReady("initialization already in progress".into()));
            }
            let previous = std::mem::replace(&mut *state, SessionState::Initializing);
            InitializingGuard {
                state: &self.state,
                previous: Some(previous),
            }
        };

        let reader = self.signer.address();
        let session_id = uuid::Uuid::new_v4().to_string();
        let created_at = self.clock.now();
        let message = SessionKey::signing_bytes(&session_id, &reader, created_at, self.ttl_secs);

        debug!(reader = %reader, session_id = %session_id, "Requesting session signature");

        let signed = self.signer.sign(&message).await;
        guard.disarm();

        match signed {
            Ok(signature) => {
                let key = SessionKey {
                    session_id,
                    reader,
                    created_at,
                    ttl_secs: self.ttl_secs,
                    signature: encode_signature(&signature),
                };
                *self.write_state() = SessionState::Ready(key.clone());
                info!(
                    reader = %key.reader,
                    session_id = %key.session_id,
                    expires_at = %key.expires_at().to_rfc3339(),
                    "Session ready"
                );
                Ok(key)
            }
            Err(e) => {
                *self.write_state() = SessionState::Uninitialized;
                warn!(reader = %reader, error = %e, "Session signature refused");
                Err(e)
            }
        }
    }

    /// True only for a present, unexpired session. Never fails.
    pub async fn is_ready(&self) -> bool {
        matches!(self.status().await, SessionStatus::Ready { .. })
    }

    /// The live session key
    pub async fn current(&self) -> Result<SessionKey> {
        let state = self.read_state();
        match &*state {
            SessionState::Ready(key) if key.is_expired(self.clock.now()) => Err(PressError::SessionExpired {
                expired_at: key.expires_at(),
            }),
            SessionState::Ready(key) => Ok(key.clone()),
            SessionState::Initializing => Err(PressError::SessionNotReady("waiting for signature".into())),
            SessionState::Uninitialized => Err(PressError::SessionNotReady("no session".into())),
        }
    }

    /// The live session, asking for a signature first if there is none
    pub async fn ensure(&self) -> Result<SessionKey> {
        match self.current().await {
            Ok(key) => Ok(key),
            Err(PressError::SessionExpired { .. }) | Err(PressError::SessionNotReady(_)) => self.initialize().await,
            Err(e) => Err(e),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let state = self.read_state();
        match &*state {
            SessionState::Uninitialized => SessionStatus::Uninitialized,
            SessionState::Initializing => SessionStatus::Initializing,
            SessionState::Ready(key) if key.is_expired(self.clock.now()) => SessionStatus::Expired {
                expired_at: key.expires_at(),
            },
            SessionState::Ready(key) => SessionStatus::Ready {
                expires_at: key.expires_at(),
            },
        }
    }

    /// Drop the session. Safe to call any number of times.
    pub async fn clear(&self) {
        let mut state = self.write_state();
        if !matches!(*state, SessionState::Uninitialized) {
            debug!("Session cleared");
        }
        *state = SessionState::Uninitialized;
    }
}
