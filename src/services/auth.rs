use crate::config::Config;
use crate::error::{AppError, Result};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity carried by bearer tokens issued by the account service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    /// MusicBrainz user name, used as the listen owner.
    pub name: String,
    pub exp: i64,
}

pub struct AuthService {
    jwt_secret: String,
}

impl AuthService {
    pub fn new(config: &Config) -> Self {
        Self::with_secret(config.jwt_secret.clone())
    }

    pub fn with_secret(jwt_secret: String) -> Self {
        Self { jwt_secret }
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AppError::Unauthorized)?;

        if token_data.claims.name.trim().is_empty() {
            return Err(AppError::Unauthorized);
        }

        Ok(token_data.claims)
    }

    #[cfg(test)]
    pub fn issue_token(&self, sub: Uuid, name: &str) -> String {
        use chrono::{Duration, Utc};
        use jsonwebtoken::{encode, EncodingKey, Header};

        let claims = Claims {
            sub,
            name: name.to_string(),
            exp: (Utc::now() + Duration::days(1)).timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .unwrap()
    }
}
