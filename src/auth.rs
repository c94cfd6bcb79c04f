//! Shared-secret gate in front of the admin and kitchen surfaces.
//!
//! The configured secret is either plain text or a bcrypt hash. A successful
//! unlock opens one session that expires after inactivity or a hard maximum.
//! Repeated failures lock the gate for a while. Typed secrets are wiped from
//! memory as soon as they have been checked.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Mutex, MutexGuard};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::Config;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const SESSION_INACTIVITY_MINUTES: i64 = 30;
const SESSION_MAX_DURATION_HOURS: i64 = 12;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminSession {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AdminSession {
    fn start(now: DateTime<Utc>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            started_at: now,
            last_activity: now,
            expires_at: now + Duration::hours(SESSION_MAX_DURATION_HOURS),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
            || now - self.last_activity > Duration::minutes(SESSION_INACTIVITY_MINUTES)
    }
}

#[derive(Default)]
struct GateState {
    failed_attempts: u32,
    locked_until: Option<DateTime<Utc>>,
    session: Option<AdminSession>,
}

pub struct AdminGate {
    secret: Zeroizing<String>,
    state: Mutex<GateState>,
}

impl std::fmt::Debug for AdminGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminGate")
            .field("hashed", &is_bcrypt_hash(&self.secret))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_bcrypt_hash(secret: &str) -> bool {
    ["$2a$", "$2b$", "$2x$", "$2y$"]
        .iter()
        .any(|prefix| secret.starts_with(prefix))
}

fn verify_secret(typed: &str, configured: &str) -> bool {
    if is_bcrypt_hash(configured) {
        match bcrypt::verify(typed, configured) {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "configured admin hash is unusable");
                false
            }
        }
    } else {
        typed.as_bytes().ct_eq(configured.as_bytes()).into()
    }
}

impl GateState {
    fn check_lockout(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.locked_until {
            Some(until) if now < until => {
                let remaining = (until - now).num_minutes() + 1;
                Err(Error::Gate(format!(
                    "Too many failed attempts. Try again in {remaining} minute(s)."
                )))
            }
            Some(_) => {
                self.locked_until = None;
                self.failed_attempts = 0;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failed_attempts += 1;
        warn!(attempts = self.failed_attempts, "failed admin unlock");
        if self.failed_attempts >= MAX_FAILED_ATTEMPTS {
            self.locked_until = Some(now + Duration::minutes(LOCKOUT_MINUTES));
            warn!(minutes = LOCKOUT_MINUTES, "admin gate locked");
        }
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

impl AdminGate {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
            state: Mutex::new(GateState::default()),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        match config.admin_secret.as_deref().map(str::trim) {
            Some(secret) if !secret.is_empty() => Ok(Self::new(secret)),
            _ => Err(Error::Gate("Admin secret is not configured".into())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn unlock(&self, typed: Zeroizing<String>) -> Result<AdminSession> {
        self.unlock_at(typed, Utc::now())
    }

    pub fn unlock_at(&self, typed: Zeroizing<String>, now: DateTime<Utc>) -> Result<AdminSession> {
        let mut state = self.lock();
        state.check_lockout(now)?;

        if typed.is_empty() {
            return Err(Error::Gate("Secret is required".into()));
        }
        if !verify_secret(&typed, &self.secret) {
            state.record_failure(now);
            return Err(Error::Gate("Incorrect secret".into()));
        }

        state.failed_attempts = 0;
        state.locked_until = None;
        let session = AdminSession::start(now);
        info!(session_id = %session.session_id, "admin gate unlocked");
        state.session = Some(session.clone());
        Ok(session)
    }

    /// Current session, if still valid. An expired session is dropped.
    pub fn session_at(&self, now: DateTime<Utc>) -> Option<AdminSession> {
        let mut state = self.lock();
        if state.session.as_ref().is_some_and(|s| s.is_expired(now)) {
            if let Some(expired) = state.session.take() {
                info!(session_id = %expired.session_id, "admin session expired");
            }
        }
        state.session.clone()
    }

    pub fn is_unlocked(&self) -> bool {
        self.session_at(Utc::now()).is_some()
    }

    /// Record activity on the open session.
    pub fn touch_at(&self, now: DateTime<Utc>) -> bool {
        if self.session_at(now).is_none() {
            return false;
        }
        if let Some(session) = self.lock().session.as_mut() {
            session.last_activity = now;
        }
        true
    }

    pub fn touch(&self) -> bool {
        self.touch_at(Utc::now())
    }

    pub fn logout(&self) {
        if let Some(session) = self.lock().session.take() {
            info!(session_id = %session.session_id, "admin session logged out");
        }
    }

    pub fn failed_attempts(&self) -> u32 {
        self.lock().failed_attempts
    }
}
