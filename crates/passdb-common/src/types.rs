//! Common types used across passdb

use serde::{Deserialize, Serialize};

/// Placeholder stored for any credential field a line does not provide.
pub const SENTINEL: &str = "nil";

/// A (username, domain, password) triple derived from one input line
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub domain: String,
    pub password: String,
}

impl Credential {
    pub fn new(
        username: impl Into<String>,
        domain: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            domain: domain.into(),
            password: password.into(),
        }
    }

    /// Triple with every field set to [`SENTINEL`]
    pub fn sentinel() -> Self {
        Self::new(SENTINEL, SENTINEL, SENTINEL)
    }

    /// True when every field holds [`SENTINEL`]
    pub fn is_sentinel(&self) -> bool {
        self.username == SENTINEL && self.domain == SENTINEL && self.password == SENTINEL
    }
}

impl Default for Credential {
    fn default() -> Self {
        Self::sentinel()
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.domain, self.password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_detection() {
        assert!(Credential::sentinel().is_sentinel());
        assert!(Credential::default().is_sentinel());
        assert!(!Credential::new("a", SENTINEL, SENTINEL).is_sentinel());
        assert!(!Credential::new(SENTINEL, SENTINEL, "p").is_sentinel());
    }

    #[test]
    fn test_display_round_trips_raw_shape() {
        let cred = Credential::new("alice", "example.com", "pa:ss");
        assert_eq!(cred.to_string(), "alice@example.com:pa:ss");
    }
}
