//! Admission identity and the rejection response returned to callers.

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

/// Header carrying an API credential.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Seconds a rejected client is told to wait.
pub const RETRY_AFTER_SECS: u64 = 60;

/// Who a request is charged to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// An opaque credential such as an API key.
    Credential(String),
    /// The client's network address.
    Address(IpAddr),
    /// Neither was available.
    Unknown,
}

impl Identity {
    /// Pick the identity for a request: a non-empty credential wins over the
    /// address.
    pub fn resolve(addr: Option<IpAddr>, credential: Option<&str>) -> Self {
        match (credential.map(str::trim).filter(|c| !c.is_empty()), addr) {
            (Some(key), _) => Self::Credential(key.to_string()),
            (None, Some(ip)) => Self::Address(ip),
            (None, None) => Self::Unknown,
        }
    }

    /// Limiter key for this identity.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Credential(key) => write!(f, "apikey:{key}"),
            Self::Address(ip) => write!(f, "{ip}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// JSON body sent with an HTTP 429.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub error: &'static str,
    pub message: &'static str,
    pub retry_after: u64,
}

impl Rejection {
    pub const STATUS: u16 = 429;

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

impl Default for Rejection {
    fn default() -> Self {
        Self {
            error: "rate_limit_exceeded",
            message: "Too many requests. Please try again later.",
            retry_after: RETRY_AFTER_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_takes_precedence() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        let id = Identity::resolve(Some(ip), Some("k-123"));
        assert_eq!(id, Identity::Credential("k-123".into()));
        assert_eq!(id.key(), "apikey:k-123");
    }

    #[test]
    fn blank_credential_falls_back_to_address() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        let id = Identity::resolve(Some(ip), Some("  "));
        assert_eq!(id.key(), "2001:db8::1");
        assert_eq!(Identity::resolve(None, None), Identity::Unknown);
    }

    #[test]
    fn rejection_body() {
        let body: serde_json::Value = serde_json::from_str(&Rejection::default().to_json()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "error": "rate_limit_exceeded",
                "message": "Too many requests. Please try again later.",
                "retry_after": 60
            })
        );
    }
}
