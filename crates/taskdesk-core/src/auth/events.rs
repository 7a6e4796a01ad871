use std::time::Duration;

/// Why the user has to sign in again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInReason {
    /// The credential could not be refreshed.
    RefreshFailed,
    /// The server rejected a freshly refreshed credential.
    Unauthorized,
    /// Explicit sign-out.
    SignedOut,
    /// No activity for the configured inactivity timeout.
    Inactivity,
    /// A restored session failed verification against the server.
    InvalidCredential,
}

/// Session notifications for front ends. Navigation to the sign-in entry
/// point is the receiver's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignInRequired { reason: SignInReason },
    Refreshed,
    InactivityWarning { remaining: Duration },
}
