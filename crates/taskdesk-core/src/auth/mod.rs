//! Authentication and session management.
//!
//! This module provides:
//! - `CredentialStore`: the signed-in `Session`, written through to durable storage
//! - `RefreshCoordinator`: single-flight credential refresh and the queue of
//!   calls parked behind it
//! - `SessionManager`: startup restore, proactive refresh, sign-in/out and
//!   inactivity auto-logout
//!
//! Front ends learn that the user must sign in again from `SessionEvent`s.

pub mod events;
pub mod gateway;
pub mod lifecycle;
pub mod queue;
pub mod refresh;
pub mod session;
pub mod store;

pub use events::{SessionEvent, SignInReason};
pub use gateway::AuthGateway;
pub use lifecycle::{ExpiryCheck, SessionManager, SessionPolicy};
pub use queue::{PendingCall, PendingQueue, Replay};
pub use refresh::{PendingTicket, RefreshCoordinator, RefreshOutcome};
pub use session::{decode_expiry, Credential, Expiry, Session};
pub use store::CredentialStore;
