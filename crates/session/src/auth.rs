//! Bearer-token validation.

use std::collections::HashMap;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::AuthError;
use crate::user::{Device, User};

/// Turns an opaque bearer token into a user record.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<User, AuthError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    biz_id: u64,
    user_id: u64,
}

/// RS256 JWT validator with issuer enforcement.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(issuer: &str, public_key_pem: &str) -> Result<Self, AuthError> {
        let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        Ok(Self { key, validation })
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<User, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(User {
            biz_id: data.claims.biz_id,
            user_id: data.claims.user_id,
            device: Device::Unknown,
            auto_close: false,
        })
    }
}

/// Fixed token → user table, for tests and local development.
#[derive(Default)]
pub struct StaticValidator {
    tokens: HashMap<String, User>,
}

impl StaticValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user: User) -> Self {
        self.tokens.insert(token.into(), user);
        self
    }
}

#[async_trait]
impl TokenValidator for StaticValidator {
    async fn validate(&self, token: &str) -> Result<User, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::UnknownToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_validator_lookup() {
        let user = User {
            biz_id: 7,
            user_id: 9,
            device: Device::Unknown,
            auto_close: false,
        };
        let validator = StaticValidator::new().with_token("good", user.clone());

        assert_eq!(validator.validate("good").await.unwrap(), user);
        assert!(matches!(
            validator.validate("bad").await,
            Err(AuthError::UnknownToken)
        ));
    }
}
