use crate::config::{EnvConfig, JWT_SECRET_KEY, JWT_VALIDITY};
use crate::error::AppError;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;
use validator::Validate;

/// Token lifetime used when `JWT_VALIDITY` is not set.
pub const DEFAULT_TOKEN_VALIDITY_SECS: i64 = 3600;
/// Number of validated tokens remembered per user.
pub const MAX_CACHE_SIZE_PER_USER: usize = 5;

/// Settings for issuing and checking access tokens.
#[derive(Debug, Clone, Validate)]
pub struct JwtSettings {
    /// HMAC secret. HS256 needs at least 256 bits of key material.
    #[validate(length(min = 32, message = "JWT secret key must be at least 32 characters"))]
    pub secret_key: String,
    /// Lifetime of issued tokens, in seconds.
    #[validate(range(min = 1, message = "JWT validity must be positive"))]
    pub token_validity_in_seconds: i64,
    pub token_prefix: String,
}

impl JwtSettings {
    pub fn new(secret_key: impl Into<String>, token_validity_in_seconds: i64) -> Self {
        Self {
            secret_key: secret_key.into(),
            token_validity_in_seconds,
            token_prefix: "Bearer ".to_string(),
        }
    }

    /// Reads `JWT_SECRET_KEY` and `JWT_VALIDITY` from the loaded configuration.
    pub fn from_config(config: &EnvConfig) -> Result<Self, AppError> {
        let secret = config
            .get(JWT_SECRET_KEY)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::MissingSetting(JWT_SECRET_KEY.to_string()))?;
        let validity = match config.get(JWT_VALIDITY) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                AppError::InvalidSetting(format!(
                    "{} must be a number of seconds, got '{}'",
                    JWT_VALIDITY, raw
                ))
            })?,
            None => DEFAULT_TOKEN_VALIDITY_SECS,
        };

        let settings = Self::new(secret, validity);
        settings.validate()?;
        Ok(settings)
    }
}

/// Represents the claims encoded within a JWT.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Subject of the token: the user's email address.
    pub sub: String,
    /// Issued-at timestamp (seconds since epoch).
    pub iat: i64,
    /// Expiration timestamp (seconds since epoch).
    pub exp: i64,
    /// Session the token belongs to, when issued for a tracked session.
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: i64,
}

/// Issues and validates HS256 tokens.
///
/// Keys are derived once at construction. Successful validations are cached per
/// user (bounded by [`MAX_CACHE_SIZE_PER_USER`]); a cached entry is still checked
/// against its expiry on every hit.
pub struct JwtUtil {
    settings: JwtSettings,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    validation_cache: Mutex<HashMap<String, VecDeque<CachedToken>>>,
}

impl JwtUtil {
    pub fn new(settings: JwtSettings) -> Result<Self, AppError> {
        settings.validate()?;
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Ok(Self {
            encoding_key: EncodingKey::from_secret(settings.secret_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(settings.secret_key.as_bytes()),
            validation,
            validation_cache: Mutex::new(HashMap::new()),
            settings,
        })
    }

    pub fn generate_token(&self, subject: &str) -> Result<String, AppError> {
        self.create_token(subject, None)
    }

    pub fn generate_token_with_session_id(
        &self,
        subject: &str,
        session_id: Uuid,
    ) -> Result<String, AppError> {
        self.create_token(subject, Some(session_id.to_string()))
    }

    fn create_token(&self, subject: &str, session_id: Option<String>) -> Result<String, AppError> {
        let now = Utc::now().timestamp();
        let exp = now
            .checked_add(self.settings.token_validity_in_seconds)
            .ok_or_else(|| {
                AppError::InvalidSetting(format!(
                    "{} of {} seconds puts the token expiry out of range",
                    JWT_VALIDITY, self.settings.token_validity_in_seconds
                ))
            })?;
        let claims = Claims {
            sub: subject.to_string(),
            iat: now,
            exp,
            session_id,
        };
        self.encode_claims(&claims)
    }

    fn encode_claims(&self, claims: &Claims) -> Result<String, AppError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| AppError::Token(format!("Failed to generate token: {}", e)))
    }

    /// Verifies signature and expiry, returning the decoded claims.
    pub fn extract_all_claims(&self, token: &str) -> Result<Claims, AppError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| AppError::Token(format!("Invalid token: {}", e)))
    }

    pub fn extract_username(&self, token: &str) -> Result<String, AppError> {
        Ok(self.extract_all_claims(token)?.sub)
    }

    pub fn extract_expiration(&self, token: &str) -> Result<DateTime<Utc>, AppError> {
        let exp = self.extract_all_claims(token)?.exp;
        Utc.timestamp_opt(exp, 0)
            .single()
            .ok_or_else(|| AppError::Token(format!("Invalid expiration timestamp {}", exp)))
    }

    /// True when `token` is signed by us, unexpired, and issued to `username`.
    pub fn validate_token(&self, token: &str, username: &str) -> bool {
        let now = Utc::now().timestamp();
        {
            let mut cache = self.lock_cache();
            if let Some(entries) = cache.get_mut(username) {
                if let Some(pos) = entries.iter().position(|e| e.token == token) {
                    if entries[pos].expires_at > now {
                        return true;
                    }
                    entries.remove(pos);
                    return false;
                }
            }
        }

        let claims = match self.extract_all_claims(token) {
            Ok(claims) => claims,
            Err(e) => {
                debug!("Token rejected for {}: {}", username, e);
                return false;
            }
        };
        if claims.sub != username {
            return false;
        }

        let mut cache = self.lock_cache();
        let entries = cache.entry(username.to_string()).or_default();
        entries.push_back(CachedToken {
            token: token.to_string(),
            expires_at: claims.exp,
        });
        while entries.len() > MAX_CACHE_SIZE_PER_USER {
            entries.pop_front();
        }
        true
    }

    /// Drops expired tokens from the validation cache; returns how many were removed.
    pub fn clear_expired_tokens_from_cache(&self) -> usize {
        let now = Utc::now().timestamp();
        let mut cache = self.lock_cache();
        let mut removed = 0;
        for entries in cache.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.expires_at > now);
            removed += before - entries.len();
        }
        cache.retain(|_, entries| !entries.is_empty());
        removed
    }

    pub fn cached_token_count(&self, username: &str) -> usize {
        self.lock_cache().get(username).map_or(0, VecDeque::len)
    }

    /// Extracts the token from an `Authorization` header value.
    pub fn strip_prefix<'a>(&self, header_value: &'a str) -> Option<&'a str> {
        header_value
            .strip_prefix(self.settings.token_prefix.as_str())
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<CachedToken>>> {
        self.validation_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env_file::EnvFile;
    use pretty_assertions::assert_eq;

    const SECRET: &str = "testSecretKeyWithAtLeast32Characters1234567890";
    const USER: &str = "test@example.com";

    fn util(validity: i64) -> JwtUtil {
        JwtUtil::new(JwtSettings::new(SECRET, validity)).unwrap()
    }

    fn expired_token(util: &JwtUtil, subject: &str) -> String {
        let now = Utc::now().timestamp();
        util.encode_claims(&Claims {
            sub: subject.to_string(),
            iat: now - 7200,
            exp: now - 3600,
            session_id: None,
        })
        .unwrap()
    }

    #[test]
    fn test_generate_and_validate_token() {
        let util = util(3600);
        let token = util.generate_token(USER).unwrap();

        assert!(util.validate_token(&token, USER));
        assert!(!util.validate_token(&token, "other@example.com"));
        assert_eq!(util.extract_username(&token).unwrap(), USER);
    }

    #[test]
    fn test_expiration_follows_validity() {
        let util = util(600);
        let before = Utc::now().timestamp();
        let token = util.generate_token(USER).unwrap();
        let exp = util.extract_expiration(&token).unwrap().timestamp();
        assert!(exp >= before + 600 && exp <= before + 601);
    }

    #[test]
    fn test_session_id_claim() {
        let util = util(3600);
        let session = Uuid::new_v4();
        let token = util.generate_token_with_session_id(USER, session).unwrap();
        let claims = util.extract_all_claims(&token).unwrap();
        assert_eq!(claims.session_id, Some(session.to_string()));

        let plain = util.extract_all_claims(&util.generate_token(USER).unwrap()).unwrap();
        assert_eq!(plain.session_id, None);
    }

    #[test]
    fn test_expired_token_rejected() {
        let util = util(3600);
        let token = expired_token(&util, USER);

        match util.extract_all_claims(&token) {
            Err(AppError::Token(msg)) => assert!(msg.contains("ExpiredSignature")),
            other => panic!("Unexpected result: {:?}", other),
        }
        assert!(!util.validate_token(&token, USER));
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let ours = util(3600);
        let theirs =
            JwtUtil::new(JwtSettings::new("a_completely_different_secret_of_32_chars", 3600)).unwrap();
        let token = theirs.generate_token(USER).unwrap();
        assert!(!ours.validate_token(&token, USER));
        assert!(ours.extract_all_claims(&token).is_err());
    }

    #[test]
    fn test_cache_is_bounded_per_user() {
        let util = util(3600);
        for i in 0..(MAX_CACHE_SIZE_PER_USER + 3) {
            let token = util
                .generate_token_with_session_id(USER, Uuid::new_v4())
                .unwrap();
            assert!(util.validate_token(&token, USER), "token {} should be valid", i);
        }
        assert_eq!(util.cached_token_count(USER), MAX_CACHE_SIZE_PER_USER);
    }

    #[test]
    fn test_clear_expired_tokens_from_cache() {
        let util = util(3600);
        let token = util.generate_token(USER).unwrap();
        assert!(util.validate_token(&token, USER));

        util.lock_cache()
            .get_mut(USER)
            .unwrap()
            .iter_mut()
            .for_each(|e| e.expires_at = Utc::now().timestamp() - 1);

        assert_eq!(util.clear_expired_tokens_from_cache(), 1);
        assert_eq!(util.cached_token_count(USER), 0);
    }

    #[test]
    fn test_strip_prefix() {
        let util = util(3600);
        assert_eq!(util.strip_prefix("Bearer abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(util.strip_prefix("Basic abc"), None);
        assert_eq!(util.strip_prefix("Bearer "), None);
    }

    #[test]
    fn test_settings_from_config() {
        let config = EnvConfig::new(
            EnvFile::parse(&format!("JWT_SECRET_KEY={}\nJWT_VALIDITY=900", SECRET)).unwrap(),
        );
        let settings = JwtSettings::from_config(&config).unwrap();
        assert_eq!(settings.token_validity_in_seconds, 900);
        assert_eq!(settings.token_prefix, "Bearer ");

        let defaulted =
            EnvConfig::new(EnvFile::parse(&format!("JWT_SECRET_KEY={}", SECRET)).unwrap());
        assert_eq!(
            JwtSettings::from_config(&defaulted).unwrap().token_validity_in_seconds,
            DEFAULT_TOKEN_VALIDITY_SECS
        );
    }

    #[test]
    fn test_settings_errors() {
        match JwtSettings::from_config(&EnvConfig::default()) {
            Err(AppError::MissingSetting(key)) => assert_eq!(key, "JWT_SECRET_KEY"),
            other => panic!("Unexpected result: {:?}", other),
        }

        let short = EnvConfig::new(EnvFile::parse("JWT_SECRET_KEY=short").unwrap());
        assert!(matches!(
            JwtSettings::from_config(&short),
            Err(AppError::ValidationError(_))
        ));

        let bad_validity = EnvConfig::new(
            EnvFile::parse(&format!("JWT_SECRET_KEY={}\nJWT_VALIDITY=soon", SECRET)).unwrap(),
        );
        assert!(matches!(
            JwtSettings::from_config(&bad_validity),
            Err(AppError::InvalidSetting(_))
        ));
    }

    #[test]
    fn test_out_of_range_validity_is_an_error() {
        let config = EnvConfig::new(
            EnvFile::parse(&format!(
                "JWT_SECRET_KEY={}\nJWT_VALIDITY=9223372036854775807",
                SECRET
            ))
            .unwrap(),
        );
        let util = JwtUtil::new(JwtSettings::from_config(&config).unwrap()).unwrap();
        match util.generate_token(USER) {
            Err(AppError::InvalidSetting(message)) => assert!(message.contains("JWT_VALIDITY")),
            other => panic!("Unexpected result: {:?}", other),
        }
    }
}
