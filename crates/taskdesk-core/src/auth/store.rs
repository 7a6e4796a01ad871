use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use super::session::{Credential, Expiry, Session};
use crate::models::User;
use crate::storage::KeyValueStore;

/// Storage key for the bearer credential
pub const TOKEN_KEY: &str = "auth_token";

/// Storage key for the serialized user
pub const USER_KEY: &str = "auth_user";

/// Owner of the current `Session`.
///
/// Every mutation is written through to the durable medium while the
/// in-memory lock is still held, so storage never lags behind or overtakes
/// the state it mirrors. The lock is a `std` mutex held across that blocking
/// write, which stays brief because `KeyValueStore` calls must be short.
///
/// Each store also counts session generations. Loading, saving, and clearing
/// a session start a new generation; swapping in a refreshed credential does
/// not. A refresh installs its result only into the generation it started
/// from, so a sign-out while the refresh is in flight stays signed out.
pub struct CredentialStore {
    medium: Arc<dyn KeyValueStore>,
    session: Mutex<Session>,
    /// Only written with `session` locked.
    generation: AtomicU64,
}

impl CredentialStore {
    pub fn new(medium: Arc<dyn KeyValueStore>) -> Self {
        Self {
            medium,
            session: Mutex::new(Session::default()),
            generation: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Restore the session from durable storage.
    ///
    /// Missing or unreadable entries produce an empty session; nothing here fails.
    pub fn load(&self) -> Session {
        let token = match self.medium.get(TOKEN_KEY) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to read stored credential");
                None
            }
        };

        let user = match self.medium.get(USER_KEY) {
            Ok(Some(json)) => match serde_json::from_str::<User>(&json) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(error = %e, "Discarding unparseable stored user");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read stored user");
                None
            }
        };

        let session = match token.filter(|t| !t.is_empty()) {
            Some(token) => {
                let credential = Credential::new(token);
                if credential.decode_expiry() == Expiry::Unknown {
                    warn!("Stored credential has no decodable expiry, assuming valid");
                }
                Session::new(credential, user)
            }
            None => Session::default(),
        };

        debug!(
            has_credential = session.credential.is_some(),
            authenticated = session.authenticated,
            "Session restored"
        );
        let mut current = self.lock();
        *current = session.clone();
        self.bump_generation();
        session
    }

    /// Replace the whole session and persist it.
    pub fn save(&self, session: Session) {
        let mut current = self.lock();
        *current = session;
        self.bump_generation();
        self.persist(&current);
    }

    /// Swap in a refreshed credential, keeping the current user.
    pub fn set_credential(&self, credential: Credential) {
        let mut current = self.lock();
        let user = current.user.take();
        *current = Session::new(credential, user);
        self.persist(&current);
    }

    /// Swap in a refreshed credential only if the session is still in
    /// `generation`. Returns whether it was installed.
    pub fn set_credential_if_current(&self, generation: u64, credential: Credential) -> bool {
        let mut current = self.lock();
        if self.generation() != generation || current.is_empty() {
            return false;
        }
        let user = current.user.take();
        *current = Session::new(credential, user);
        self.persist(&current);
        true
    }

    pub fn set_user(&self, user: User) {
        let mut current = self.lock();
        current.user = Some(user);
        self.persist(&current);
    }

    /// Reset to an empty session and erase it from storage.
    ///
    /// Returns `false` when there was nothing to clear, which lets callers
    /// react to a sign-out exactly once.
    pub fn clear(&self) -> bool {
        let mut current = self.lock();
        if current.is_empty() {
            return false;
        }
        *current = Session::default();
        self.bump_generation();
        self.persist(&current);
        true
    }

    /// Like `clear`, but only while the session is still in `generation`.
    pub fn clear_if_current(&self, generation: u64) -> bool {
        let mut current = self.lock();
        if self.generation() != generation || current.is_empty() {
            return false;
        }
        *current = Session::default();
        self.bump_generation();
        self.persist(&current);
        true
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Session {
        self.lock().clone()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.lock().credential.clone()
    }

    pub fn user(&self) -> Option<User> {
        self.lock().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.lock().authenticated
    }

    fn persist(&self, session: &Session) {
        let token_result = match session.credential {
            Some(ref credential) => self.medium.set(TOKEN_KEY, credential.as_str()),
            None => self.medium.remove(TOKEN_KEY),
        };
        if let Err(e) = token_result {
            warn!(error = %e, "Failed to persist credential");
        }

        let user_result = match session.user {
            Some(ref user) => serde_json::to_string(user)
                .map_err(anyhow::Error::from)
                .and_then(|json| self.medium.set(USER_KEY, &json)),
            None => self.medium.remove(USER_KEY),
        };
        if let Err(e) = user_result {
            warn!(error = %e, "Failed to persist user");
        }
    }
}
