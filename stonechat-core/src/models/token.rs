use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Persisted bearer token for one credential set. The row is overwritten in
/// place on every refresh.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredToken {
    pub credential_key: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredToken {
    /// True while the token is still usable with `margin` seconds to spare.
    pub fn valid_for(&self, margin_secs: u64) -> bool {
        Utc::now() + Duration::seconds(margin_secs as i64) < self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_in_secs: i64) -> StoredToken {
        StoredToken {
            credential_key: "ringcentral".to_string(),
            access_token: "tok".to_string(),
            refresh_token: None,
            token_type: "bearer".to_string(),
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_valid_inside_margin() {
        assert!(token(3600).valid_for(60));
    }

    #[test]
    fn test_invalid_when_expired() {
        assert!(!token(-10).valid_for(60));
    }

    #[test]
    fn test_invalid_inside_safety_margin() {
        // Expires in 30s with a 60s margin — must not be handed out.
        assert!(!token(30).valid_for(60));
    }
}
