//! Sessions and per-operation authorization
//!
//! The identity provider authenticates an account; a session is opened
//! for it here. Before any state-changing operation the holder proves a
//! second factor (a four digit PIN) once per session and receives an
//! [`AuthToken`], which the coordinator checks on every sensitive call.
//!
//! Repeated wrong PINs lock the account out for a window that doubles
//! with every further failure, up to a cap.

use crate::config::AuthConfig;
use crate::error::{MediatorError, MediatorResult};
use crate::types::AccountId;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PIN_LENGTH: usize = 4;
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof that a session passed the PIN check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    value: Uuid,
    session: SessionId,
    account: AccountId,
}

impl AuthToken {
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn session(&self) -> SessionId {
        self.session
    }
}

struct Credential {
    salt: [u8; 16],
    digest: [u8; 32],
}

impl Credential {
    fn new(pin: &str) -> Self {
        let salt = *Uuid::new_v4().as_bytes();
        Self {
            salt,
            digest: digest(&salt, pin),
        }
    }

    fn matches(&self, pin: &str) -> bool {
        digest(&self.salt, pin) == self.digest
    }
}

fn digest(salt: &[u8; 16], pin: &str) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(salt);
    hasher.update(pin.as_bytes());
    hasher.finalize().into()
}

#[derive(Default)]
struct AttemptState {
    failures: u32,
    locked_until: Option<Instant>,
}

struct Session {
    account: AccountId,
    expires_at: Instant,
    token: Option<Uuid>,
}

/// Session registry and PIN gate
pub struct Authorizer {
    timeout: Duration,
    max_failed_attempts: u32,
    lockout_base: Duration,
    lockout_cap: Duration,
    credentials: DashMap<AccountId, Credential>,
    attempts: DashMap<AccountId, AttemptState>,
    sessions: DashMap<SessionId, Session>,
}

impl Authorizer {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.session_timeout_secs),
            max_failed_attempts: config.max_failed_attempts.max(1),
            lockout_base: Duration::from_secs(config.lockout_base_secs),
            lockout_cap: Duration::from_secs(config.lockout_max_secs),
            credentials: DashMap::new(),
            attempts: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Register the first PIN for an account
    pub fn set_pin(&self, account: &AccountId, pin: &str) -> MediatorResult<()> {
        validate_pin(pin)?;
        match self.credentials.entry(account.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(MediatorError::Unauthorized(
                "PIN already set; change it with the current PIN".to_string(),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Credential::new(pin));
                info!("PIN set for {}", account);
                Ok(())
            }
        }
    }

    pub fn change_pin(&self, account: &AccountId, current: &str, new_pin: &str) -> MediatorResult<()> {
        validate_pin(new_pin)?;
        self.check_pin(account, current)?;
        self.credentials
            .insert(account.clone(), Credential::new(new_pin));
        info!("PIN changed for {}", account);
        Ok(())
    }

    pub fn has_pin(&self, account: &AccountId) -> bool {
        self.credentials.contains_key(account)
    }

    /// Open a session for an account the identity provider authenticated
    pub fn open_session(&self, account: &AccountId) -> SessionId {
        let id = SessionId(Uuid::new_v4());
        self.sessions.insert(
            id,
            Session {
                account: account.clone(),
                expires_at: Instant::now() + self.timeout,
                token: None,
            },
        );
        debug!("Opened session {} for {}", id, account);
        id
    }

    pub fn close_session(&self, session: SessionId) {
        if self.sessions.remove(&session).is_some() {
            debug!("Closed session {}", session);
        }
    }

    /// Check the PIN once and issue the session's authorization token
    pub fn authorize(&self, session: SessionId, pin: &str) -> MediatorResult<AuthToken> {
        let account = self.live_session_account(session)?;
        self.check_pin(&account, pin)?;

        let mut entry = self
            .sessions
            .get_mut(&session)
            .ok_or_else(|| MediatorError::Unauthorized("session closed".to_string()))?;
        let value = Uuid::new_v4();
        entry.token = Some(value);
        entry.expires_at = Instant::now() + self.timeout;

        Ok(AuthToken {
            value,
            session,
            account,
        })
    }

    /// Verify a token allows acting on `account`, refreshing the session
    pub fn verify(&self, token: &AuthToken, account: &AccountId) -> MediatorResult<()> {
        let mut session = self
            .sessions
            .get_mut(&token.session)
            .ok_or_else(|| MediatorError::Unauthorized("unknown session".to_string()))?;

        if Instant::now() >= session.expires_at {
            drop(session);
            self.sessions.remove(&token.session);
            return Err(MediatorError::Unauthorized("session expired".to_string()));
        }
        if session.token != Some(token.value) {
            return Err(MediatorError::Unauthorized("token revoked".to_string()));
        }
        if &session.account != account || &token.account != account {
            warn!(
                "Session {} for {} used against {}",
                token.session, session.account, account
            );
            return Err(MediatorError::Unauthorized(
                "token does not cover this account".to_string(),
            ));
        }

        session.expires_at = Instant::now() + self.timeout;
        Ok(())
    }

    fn live_session_account(&self, session: SessionId) -> MediatorResult<AccountId> {
        let entry = self
            .sessions
            .get(&session)
            .ok_or_else(|| MediatorError::Unauthorized("unknown session".to_string()))?;
        if Instant::now() >= entry.expires_at {
            drop(entry);
            self.sessions.remove(&session);
            return Err(MediatorError::Unauthorized("session expired".to_string()));
        }
        Ok(entry.account.clone())
    }

    fn check_pin(&self, account: &AccountId, pin: &str) -> MediatorResult<()> {
        let now = Instant::now();
        let mut attempts = self.attempts.entry(account.clone()).or_default();

        if let Some(until) = attempts.locked_until {
            if now < until {
                let remaining = until.saturating_duration_since(now);
                return Err(MediatorError::Unauthorized(format!(
                    "too many failed attempts; retry in {}.{:03} seconds",
                    remaining.as_secs(),
                    remaining.subsec_millis()
                )));
            }
        }

        let ok = self
            .credentials
            .get(account)
            .map(|c| c.matches(pin))
            .unwrap_or(false);

        if ok {
            attempts.failures = 0;
            attempts.locked_until = None;
            return Ok(());
        }

        attempts.failures += 1;
        if attempts.failures >= self.max_failed_attempts {
            let exponent = (attempts.failures - self.max_failed_attempts).min(MAX_BACKOFF_EXPONENT);
            let delay = self
                .lockout_base
                .checked_mul(1 << exponent)
                .unwrap_or(self.lockout_cap)
                .min(self.lockout_cap);
            attempts.locked_until = Some(now + delay);
            warn!(
                "{} locked out for {:?} after {} failed PIN attempts",
                account, delay, attempts.failures
            );
        }

        Err(MediatorError::Unauthorized("wrong PIN".to_string()))
    }
}

fn validate_pin(pin: &str) -> MediatorResult<()> {
    if pin.len() != PIN_LENGTH || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MediatorError::Unauthorized(format!(
            "PIN must be exactly {} digits",
            PIN_LENGTH
        )));
    }
    Ok(())
}
