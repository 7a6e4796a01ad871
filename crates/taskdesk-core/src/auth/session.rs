use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::models::User;

/// Bearer credential issued by the API.
///
/// Opaque to the client except for the `exp` claim in its JWT-style payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

/// When a credential stops being accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    At(DateTime<Utc>),
    /// The credential could not be decoded or carries no `exp` claim.
    Unknown,
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read the expiry from the payload segment without verifying the signature.
    pub fn decode_expiry(&self) -> Expiry {
        decode_expiry(&self.0)
    }

    /// True only when the expiry is known and already past.
    pub fn is_known_expired(&self) -> bool {
        match self.decode_expiry() {
            Expiry::At(at) => at <= Utc::now(),
            Expiry::Unknown => false,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "Credential({}…)", prefix)
    }
}

/// Decode the `exp` claim of a `header.payload.signature` token.
pub fn decode_expiry(token: &str) -> Expiry {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) if !payload.is_empty() => payload,
        _ => return Expiry::Unknown,
    };

    let Ok(bytes) = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) else {
        return Expiry::Unknown;
    };
    let Ok(claims) = serde_json::from_slice::<Claims>(&bytes) else {
        return Expiry::Unknown;
    };

    claims
        .exp
        .and_then(|exp| DateTime::from_timestamp(exp, 0))
        .map(Expiry::At)
        .unwrap_or(Expiry::Unknown)
}

/// In-memory view of who is signed in.
///
/// `authenticated` is only ever true while `credential` is present and not
/// known to be expired.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub credential: Option<Credential>,
    pub user: Option<User>,
    pub authenticated: bool,
}

impl Session {
    pub fn new(credential: Credential, user: Option<User>) -> Self {
        let authenticated = !credential.is_known_expired();
        Self {
            credential: Some(credential),
            user,
            authenticated,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.credential.is_none() && self.user.is_none()
    }

    pub fn expiry(&self) -> Option<Expiry> {
        self.credential.as_ref().map(Credential::decode_expiry)
    }

    pub fn is_expired(&self) -> bool {
        self.credential
            .as_ref()
            .map(Credential::is_known_expired)
            .unwrap_or(true)
    }

    /// Check if the credential expires within `horizon` and should be refreshed.
    /// Unknown expiry never needs a refresh.
    pub fn needs_refresh(&self, horizon: Duration) -> bool {
        match self.expiry() {
            Some(Expiry::At(at)) => at <= Utc::now() + horizon,
            _ => false,
        }
    }

    pub fn time_until_expiry(&self) -> Option<Duration> {
        match self.expiry()? {
            Expiry::At(at) => Some(at - Utc::now()),
            Expiry::Unknown => None,
        }
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.time_until_expiry().map(|d| d.num_minutes().max(0))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build an unsigned JWT-shaped token with the given `exp`.
    pub(crate) fn token_expiring_at(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"1","exp":{}}}"#, exp));
        format!("{}.{}.signature", header, payload)
    }

    #[test]
    fn test_decode_expiry() {
        let exp = 1_900_000_000;
        assert_eq!(
            decode_expiry(&token_expiring_at(exp)),
            Expiry::At(DateTime::from_timestamp(exp, 0).unwrap())
        );
    }

    #[test]
    fn test_decode_expiry_tolerates_padding() {
        let payload = base64::engine::general_purpose::URL_SAFE.encode(br#"{"exp":1900000000}"#);
        let token = format!("h.{}.s", payload);
        assert!(matches!(decode_expiry(&token), Expiry::At(_)));
    }

    #[test]
    fn test_decode_expiry_unknown() {
        assert_eq!(decode_expiry("opaque-token"), Expiry::Unknown);
        assert_eq!(decode_expiry("a.b"), Expiry::Unknown);
        assert_eq!(decode_expiry("a.!!!.c"), Expiry::Unknown);
        assert_eq!(decode_expiry("a.b.c.d"), Expiry::Unknown);

        let no_exp = format!("h.{}.s", URL_SAFE_NO_PAD.encode(br#"{"sub":"1"}"#));
        assert_eq!(decode_expiry(&no_exp), Expiry::Unknown);
    }

    #[test]
    fn test_session_new_respects_expiry() {
        let past = Utc::now().timestamp() - 60;
        let session = Session::new(Credential::new(token_expiring_at(past)), None);
        assert!(!session.authenticated);
        assert!(session.is_expired());

        let future = Utc::now().timestamp() + 3600;
        let session = Session::new(Credential::new(token_expiring_at(future)), None);
        assert!(session.authenticated);
        assert!(!session.is_expired());

        // Opaque tokens are assumed valid
        let session = Session::new(Credential::new("opaque"), None);
        assert!(session.authenticated);
    }

    #[test]
    fn test_needs_refresh_horizon() {
        let horizon = Duration::minutes(5);

        let soon = Utc::now().timestamp() + 180;
        let session = Session::new(Credential::new(token_expiring_at(soon)), None);
        assert!(session.needs_refresh(horizon));

        let later = Utc::now().timestamp() + 1800;
        let session = Session::new(Credential::new(token_expiring_at(later)), None);
        assert!(!session.needs_refresh(horizon));
        assert!(session.minutes_until_expiry().unwrap() >= 29);

        let opaque = Session::new(Credential::new("opaque"), None);
        assert!(!opaque.needs_refresh(horizon));
        assert_eq!(opaque.minutes_until_expiry(), None);
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("secret-token-value");
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("token-value"));
    }
}
