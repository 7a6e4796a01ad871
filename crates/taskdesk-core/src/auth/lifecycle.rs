//! Session lifecycle: startup restore, proactive expiry checks, sign-in,
//! sign-out, account management, and inactivity auto-logout.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::events::{SessionEvent, SignInReason};
use super::gateway::AuthGateway;
use super::refresh::{RefreshCoordinator, RefreshOutcome};
use super::session::{Expiry, Session};
use super::store::CredentialStore;
use crate::api::{ApiClient, ApiError, RequestOptions};
use crate::models::{ProfileUpdate, User};

// ============================================================================
// Constants
// ============================================================================

/// Refresh proactively when the credential expires within this window.
pub const DEFAULT_REFRESH_HORIZON: Duration = Duration::from_secs(5 * 60);

/// How often the background watch re-evaluates expiry.
pub const DEFAULT_EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Sign out after this long without recorded activity.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Warn this long before the inactivity sign-out.
pub const DEFAULT_INACTIVITY_WARNING: Duration = Duration::from_secs(60);

/// Floor for background polling so a zero setting can't spin.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

const DEFAULT_RESET_MESSAGE: &str = "Password reset email sent";
const DEFAULT_PASSWORD_CHANGED_MESSAGE: &str = "Password changed successfully";
const ACCESS_DENIED_MESSAGE: &str = "Access denied. Insufficient permissions.";

/// Reject a password whose confirmation differs, before anything is sent.
fn ensure_confirmed(password: &str, confirmation: &str, message: &str) -> Result<(), ApiError> {
    if password == confirmation {
        return Ok(());
    }
    let mut errors = crate::api::ValidationErrors::new();
    errors.insert("password_confirmation".to_string(), vec![message.to_string()]);
    Err(ApiError::ClientError {
        status: 422,
        message: message.to_string(),
        errors: Some(errors),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub refresh_horizon: Duration,
    pub expiry_check_interval: Duration,
    pub inactivity_timeout: Duration,
    pub inactivity_warning: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            refresh_horizon: DEFAULT_REFRESH_HORIZON,
            expiry_check_interval: DEFAULT_EXPIRY_CHECK_INTERVAL,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            inactivity_warning: DEFAULT_INACTIVITY_WARNING,
        }
    }
}

/// What `check_expiration` found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryCheck {
    NoSession,
    /// Expiry could not be decoded; the credential is assumed valid.
    Unknown,
    Valid,
    Refreshed,
    RefreshFailed,
}

pub struct SessionManager {
    store: Arc<CredentialStore>,
    gateway: AuthGateway,
    coordinator: Arc<RefreshCoordinator>,
    client: ApiClient,
    events: broadcast::Sender<SessionEvent>,
    policy: SessionPolicy,
    last_activity: Mutex<Instant>,
}

impl SessionManager {
    pub fn new(
        store: Arc<CredentialStore>,
        gateway: AuthGateway,
        coordinator: Arc<RefreshCoordinator>,
        client: ApiClient,
        events: broadcast::Sender<SessionEvent>,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            coordinator,
            client,
            events,
            policy,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    pub fn session(&self) -> Session {
        self.store.snapshot()
    }

    /// Restore the stored session and bring its credential up to date.
    pub async fn initialize(&self) -> Session {
        let restored = self.store.load();
        if restored.credential.is_some() {
            let check = self.check_expiration().await;
            debug!(?check, "Initial expiry check");
        }
        self.record_activity();
        self.store.snapshot()
    }

    /// Refresh if the credential expires within the horizon or already has.
    pub async fn check_expiration(&self) -> ExpiryCheck {
        let session = self.store.snapshot();
        let Some(expiry) = session.expiry() else {
            return ExpiryCheck::NoSession;
        };

        match expiry {
            Expiry::Unknown => {
                warn!("Credential expiry could not be decoded, assuming valid");
                ExpiryCheck::Unknown
            }
            Expiry::At(at) => {
                let horizon = chrono::Duration::from_std(self.policy.refresh_horizon)
                    .unwrap_or_else(|_| chrono::Duration::minutes(5));
                if !session.needs_refresh(horizon) {
                    return ExpiryCheck::Valid;
                }

                info!(expires_at = %at, "Credential near expiry, refreshing");
                match self.coordinator.request_refresh().await {
                    RefreshOutcome::Refreshed => ExpiryCheck::Refreshed,
                    RefreshOutcome::Failed(_) => ExpiryCheck::RefreshFailed,
                }
            }
        }
    }

    /// Sign in with email and password, replacing any current session.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<User, ApiError> {
        let (credential, user) = self.gateway.login(email, password).await?;
        self.store.save(Session::new(credential, Some(user.clone())));
        self.record_activity();
        info!(user_id = user.id, "Signed in");
        Ok(user)
    }

    /// Sign out. Never fails; the server is told on a best-effort basis.
    pub async fn sign_out(&self) {
        self.sign_out_with(SignInReason::SignedOut).await;
    }

    pub async fn sign_out_with(&self, reason: SignInReason) {
        let credential = self.store.credential();
        self.store.clear();

        if let Some(credential) = credential {
            if let Err(e) = self.gateway.logout(&credential).await {
                warn!(error = %e, "Server sign-out failed, session cleared locally");
            }
        }

        info!(?reason, "Signed out");
        let _ = self.events.send(SessionEvent::SignInRequired { reason });
    }

    /// Verify the stored credential against the server.
    ///
    /// On rejection the session is dropped locally without calling sign-out.
    pub async fn check_auth(&self) -> bool {
        let Some(credential) = self.store.credential() else {
            return false;
        };

        match self.gateway.user(&credential).await {
            Ok(user) => {
                self.store.set_user(user);
                true
            }
            Err(e) => {
                warn!(error = %e, "Stored credential failed verification");
                if self.store.clear() {
                    let _ = self.events.send(SessionEvent::SignInRequired {
                        reason: SignInReason::InvalidCredential,
                    });
                }
                false
            }
        }
    }

    /// Create an account, then sign in with it.
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
        password_confirmation: &str,
    ) -> Result<User, ApiError> {
        ensure_confirmed(password, password_confirmation, "Passwords do not match")?;
        self.gateway
            .register(name, email, password, password_confirmation)
            .await?;
        info!("Account registered, signing in");
        self.sign_in(email, password).await
    }

    /// Ask for a password reset email. Returns the message to show the user.
    pub async fn request_password_reset(&self, email: &str) -> Result<String, ApiError> {
        let message = self.gateway.forgot_password(email).await?;
        Ok(message.unwrap_or_else(|| DEFAULT_RESET_MESSAGE.to_string()))
    }

    /// Set a new password from a reset token, then sign in with it.
    pub async fn reset_password(
        &self,
        token: &str,
        email: &str,
        password: &str,
        password_confirmation: &str,
    ) -> Result<User, ApiError> {
        ensure_confirmed(password, password_confirmation, "Passwords do not match")?;
        self.gateway
            .reset_password(token, email, password, password_confirmation)
            .await?;
        info!("Password reset, signing in");
        self.sign_in(email, password).await
    }

    /// Change the signed-in user's name or email and store the result.
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<User, ApiError> {
        let response = self
            .client
            .put("/user", update, RequestOptions::default())
            .await?;

        // `{ user }`, either bare or inside the envelope
        let mut data = response.data;
        if let Some(user) = data.get_mut("user").map(serde_json::Value::take) {
            data = user;
        }
        let user: User = serde_json::from_value(data)?;
        self.store.set_user(user.clone());
        info!(user_id = user.id, "Profile updated");
        Ok(user)
    }

    /// Change the password of the signed-in user. Returns the message to show the user.
    pub async fn change_password(
        &self,
        current_password: &str,
        new_password: &str,
        new_password_confirmation: &str,
    ) -> Result<String, ApiError> {
        ensure_confirmed(new_password, new_password_confirmation, "New passwords do not match")?;
        let body = serde_json::json!({
            "current_password": current_password,
            "password": new_password,
            "password_confirmation": new_password_confirmation,
        });
        let response = self
            .client
            .put("/user/password", &body, RequestOptions::default())
            .await?;
        info!("Password changed");
        Ok(response
            .message
            .unwrap_or_else(|| DEFAULT_PASSWORD_CHANGED_MESSAGE.to_string()))
    }

    /// Require a signed-in user holding one of `roles`. An empty list admits
    /// any signed-in user; a user without a role counts as `user`.
    pub async fn authorize(&self, roles: &[&str]) -> Result<(), ApiError> {
        if !self.store.is_authenticated() && !self.check_auth().await {
            return Err(ApiError::Unauthorized);
        }
        if roles.is_empty() {
            return Ok(());
        }

        let allowed = match self.store.user() {
            Some(user) => user.has_role(roles),
            None => roles.contains(&"user"),
        };
        if allowed {
            Ok(())
        } else {
            Err(ApiError::Forbidden(ACCESS_DENIED_MESSAGE.to_string()))
        }
    }

    /// Reload the signed-in user's profile through the executor.
    pub async fn fetch_user(&self) -> Result<User, ApiError> {
        let response = self.client.get("/user", RequestOptions::default()).await?;
        let user: User = response.into_typed()?.data;
        self.store.set_user(user.clone());
        Ok(user)
    }

    // ========================================================================
    // Inactivity
    // ========================================================================

    pub fn record_activity(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn time_until_logout(&self) -> Duration {
        let last = *self.last_activity.lock().unwrap_or_else(|e| e.into_inner());
        self.policy
            .inactivity_timeout
            .saturating_sub(last.elapsed())
    }

    /// Periodically run `check_expiration` while a credential is held.
    pub fn spawn_expiry_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let period = self.policy.expiry_check_interval.max(MIN_POLL_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if this.store.credential().is_some() {
                    let check = this.check_expiration().await;
                    debug!(?check, "Periodic expiry check");
                }
            }
        })
    }

    /// Warn before, then sign out at, the inactivity deadline.
    pub fn spawn_inactivity_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let lead = self.policy.inactivity_warning;
        let idle_poll = lead.max(MIN_POLL_INTERVAL);
        tokio::spawn(async move {
            let mut warned = false;
            loop {
                if this.store.credential().is_none() {
                    warned = false;
                    tokio::time::sleep(idle_poll).await;
                    continue;
                }

                let remaining = this.time_until_logout();
                if remaining.is_zero() {
                    info!("Signing out after inactivity");
                    this.sign_out_with(SignInReason::Inactivity).await;
                    warned = false;
                } else if remaining <= lead {
                    if !warned {
                        let _ = this.events.send(SessionEvent::InactivityWarning { remaining });
                        warned = true;
                    }
                    tokio::time::sleep(remaining).await;
                } else {
                    warned = false;
                    tokio::time::sleep(remaining - lead).await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RequestPolicy;
    use crate::auth::session::tests::token_expiring_at;
    use crate::auth::session::Credential;
    use crate::storage::MemoryStore;
    use chrono::Utc;

    /// Manager wired to an unreachable API.
    fn manager(policy: SessionPolicy) -> (Arc<SessionManager>, Arc<CredentialStore>) {
        let store = Arc::new(CredentialStore::new(Arc::new(MemoryStore::new())));
        let (events, _) = broadcast::channel(16);
        let http = reqwest::Client::new();
        let base = "http://127.0.0.1:1";
        let origin = "http://localhost";
        let gateway = AuthGateway::new(http.clone(), base, origin);
        let coordinator = RefreshCoordinator::new(gateway.clone(), store.clone(), events.clone());
        let client = ApiClient::new(
            http,
            base,
            origin,
            RequestPolicy::default(),
            store.clone(),
            coordinator.clone(),
        );
        let manager = SessionManager::new(store.clone(), gateway, coordinator, client, events, policy);
        (Arc::new(manager), store)
    }

    #[tokio::test]
    async fn test_check_expiration_without_session() {
        let (manager, _store) = manager(SessionPolicy::default());
        assert_eq!(manager.check_expiration().await, ExpiryCheck::NoSession);
    }

    #[tokio::test]
    async fn test_check_expiration_valid_and_unknown() {
        let (manager, store) = manager(SessionPolicy::default());

        let later = Utc::now().timestamp() + 3600;
        store.set_credential(Credential::new(token_expiring_at(later)));
        assert_eq!(manager.check_expiration().await, ExpiryCheck::Valid);

        store.set_credential(Credential::new("opaque"));
        assert_eq!(manager.check_expiration().await, ExpiryCheck::Unknown);
        assert!(store.credential().is_some());
    }

    #[tokio::test]
    async fn test_sign_out_always_signals() {
        let (manager, store) = manager(SessionPolicy::default());
        let mut events = manager.subscribe();
        store.set_credential(Credential::new("token"));

        manager.sign_out().await;
        assert!(store.snapshot().is_empty());
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::SignInRequired { reason: SignInReason::SignedOut }
        );

        // Signing out with nothing stored still tells the front end
        manager.sign_out().await;
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::SignInRequired { reason: SignInReason::SignedOut }
        );
    }

    #[tokio::test]
    async fn test_expiry_watch_refreshes_near_expiry() {
        let (manager, store) = manager(SessionPolicy::default());
        let mut events = manager.subscribe();
        let soon = Utc::now().timestamp() + 60;
        store.set_credential(Credential::new(token_expiring_at(soon)));

        let watch = manager.spawn_expiry_watch();

        // The API is unreachable, so the first tick's refresh fails and ends the session
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::SignInRequired { reason: SignInReason::RefreshFailed }
        );
        assert!(store.credential().is_none());
        watch.abort();
    }

    #[tokio::test]
    async fn test_password_mismatch_is_rejected_locally() {
        let (manager, store) = manager(SessionPolicy::default());
        store.set_credential(Credential::new("token"));

        // The API is unreachable, so reaching it would be a network error
        match manager.register("Ada", "ada@example.com", "one", "two").await {
            Err(ApiError::ClientError { status, errors, .. }) => {
                assert_eq!(status, 422);
                assert!(errors.unwrap().contains_key("password_confirmation"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
        assert!(matches!(
            manager.reset_password("t", "ada@example.com", "one", "two").await,
            Err(ApiError::ClientError { .. })
        ));
        match manager.change_password("old", "one", "two").await {
            Err(ApiError::ClientError { message, .. }) => {
                assert_eq!(message, "New passwords do not match")
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_authorize_checks_roles() {
        let (manager, store) = manager(SessionPolicy::default());
        assert!(matches!(manager.authorize(&[]).await, Err(ApiError::Unauthorized)));

        store.save(Session::new(
            Credential::new("token"),
            Some(User {
                id: 1,
                name: "Ada".to_string(),
                email: "ada@example.com".to_string(),
                role: None,
            }),
        ));
        assert!(manager.authorize(&[]).await.is_ok());
        assert!(manager.authorize(&["user", "admin"]).await.is_ok());
        assert!(matches!(
            manager.authorize(&["admin"]).await,
            Err(ApiError::Forbidden(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_until_logout_counts_down() {
        let (manager, _store) = manager(SessionPolicy::default());
        manager.record_activity();
        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert_eq!(manager.time_until_logout(), Duration::from_secs(6 * 60));

        manager.record_activity();
        assert_eq!(manager.time_until_logout(), DEFAULT_INACTIVITY_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_warns_then_signs_out() {
        let (manager, store) = manager(SessionPolicy::default());
        let mut events = manager.subscribe();
        store.set_credential(Credential::new("opaque"));
        manager.record_activity();

        let watch = manager.spawn_inactivity_watch();

        match events.recv().await.unwrap() {
            SessionEvent::InactivityWarning { remaining } => {
                assert!(remaining <= DEFAULT_INACTIVITY_WARNING);
                assert!(!remaining.is_zero());
            }
            other => panic!("expected inactivity warning, got {:?}", other),
        }
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::SignInRequired { reason: SignInReason::Inactivity }
        );
        assert!(store.credential().is_none());
        watch.abort();
    }
}
