//! Static token validation
//!
//! Production fleets validate tokens through the backend over the message
//! bus; that transport is a deployment concern behind the
//! [`TokenValidator`] port. Standalone nodes use the `[auth.tokens]` table
//! from the configuration file instead.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use strand_config::StaticToken;
use strand_relay_core::{TokenValidation, TokenValidator};

/// Validator backed by the configured token table
pub struct StaticTokenValidator {
    tokens: HashMap<String, StaticToken>,
}

impl StaticTokenValidator {
    pub fn new(tokens: HashMap<String, StaticToken>) -> Self {
        Self { tokens }
    }

    fn validate(&self, token: &str) -> TokenValidation {
        match self.tokens.get(token) {
            Some(grant) => TokenValidation {
                success: true,
                organization_id: Some(grant.organization_id.clone()),
                registered_agent_id: grant.registered_agent_id.clone(),
                expires: grant
                    .ttl_secs
                    .map(|secs| Utc::now() + Duration::seconds(secs as i64)),
                new_token: None,
                message: None,
                impersonated: false,
            },
            None => TokenValidation::rejected("Unknown token"),
        }
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate_portal_token(
        &self,
        token: &str,
    ) -> strand_relay_core::Result<TokenValidation> {
        Ok(self.validate(token))
    }

    async fn validate_agent_token(
        &self,
        token: &str,
    ) -> strand_relay_core::Result<TokenValidation> {
        Ok(self.validate(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_token_is_granted_with_expiry() {
        let mut tokens = HashMap::new();
        tokens.insert(
            "tok".to_string(),
            StaticToken {
                organization_id: "T1".into(),
                registered_agent_id: Some("r-1".into()),
                ttl_secs: Some(3600),
            },
        );
        let validator = StaticTokenValidator::new(tokens);

        let outcome = validator.validate_agent_token("tok").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.organization_id.as_deref(), Some("T1"));
        assert!(outcome.expires.unwrap() > Utc::now());

        let outcome = validator.validate_portal_token("nope").await.unwrap();
        assert!(!outcome.success);
    }
}
