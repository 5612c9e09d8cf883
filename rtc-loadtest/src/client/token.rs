use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(6 * 60 * 60);

const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// VideoGrant lists what the bearer may do in a room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoGrant {
    pub room_create: bool,
    pub room_join: bool,
    pub room_admin: bool,
    pub room: String,
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub agent: bool,
}

impl VideoGrant {
    /// Join, publish and subscribe in `room`.
    pub fn join(room: impl Into<String>) -> Self {
        VideoGrant {
            room_join: true,
            room: room.into(),
            can_publish: true,
            can_subscribe: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// api key
    pub iss: String,
    /// participant identity
    pub sub: String,
    pub nbf: i64,
    pub exp: i64,
    #[serde(default)]
    pub video: VideoGrant,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

/// AccessToken mints HS256 signed tokens for an api key and secret.
#[derive(Debug, Clone)]
pub struct AccessToken {
    api_key: String,
    api_secret: String,
    identity: String,
    ttl: Duration,
    grant: VideoGrant,
    attributes: HashMap<String, String>,
}

impl AccessToken {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        AccessToken {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            identity: String::new(),
            ttl: DEFAULT_TOKEN_TTL,
            grant: VideoGrant::default(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_grant(mut self, grant: VideoGrant) -> Self {
        self.grant = grant;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn to_jwt(&self) -> Result<String> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(Error::ErrInvalidToken("api key and secret are required".to_owned()));
        }

        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: self.api_key.clone(),
            sub: self.identity.clone(),
            nbf: now,
            exp: now + self.ttl.as_secs() as i64,
            video: self.grant.clone(),
            attributes: self.attributes.clone(),
        };

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(JWT_HEADER),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
        );
        let key = hmac::Key::new(hmac::HMAC_SHA256, self.api_secret.as_bytes());
        let signature = hmac::sign(&key, signing_input.as_bytes());

        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.as_ref())
        ))
    }
}

/// TokenVerifier checks tokens minted for one api key and secret.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    api_key: String,
    api_secret: String,
}

impl TokenVerifier {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        TokenVerifier {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut parts = token.rsplitn(2, '.');
        let (Some(signature), Some(signing_input)) = (parts.next(), parts.next()) else {
            return Err(Error::ErrInvalidToken("malformed token".to_owned()));
        };

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|err| Error::ErrInvalidToken(err.to_string()))?;
        let key = hmac::Key::new(hmac::HMAC_SHA256, self.api_secret.as_bytes());
        hmac::verify(&key, signing_input.as_bytes(), &signature)
            .map_err(|_| Error::ErrInvalidToken("signature mismatch".to_owned()))?;

        let payload = signing_input
            .split('.')
            .nth(1)
            .ok_or_else(|| Error::ErrInvalidToken("malformed token".to_owned()))?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|err| Error::ErrInvalidToken(err.to_string()))?;
        let claims: Claims = serde_json::from_slice(&payload)?;

        if claims.iss != self.api_key {
            return Err(Error::ErrInvalidToken(format!(
                "unknown api key {}",
                claims.iss
            )));
        }
        let now = chrono::Utc::now().timestamp();
        if now < claims.nbf || now >= claims.exp {
            return Err(Error::ErrInvalidToken("token is expired".to_owned()));
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mint_and_verify() {
        let token = AccessToken::new("devkey", "secret")
            .with_identity("abcde_3")
            .with_grant(VideoGrant::join("testroom042"))
            .with_attributes(HashMap::from([("role".to_owned(), "sub".to_owned())]))
            .to_jwt()
            .unwrap();
        assert_eq!(token.split('.').count(), 3);

        let claims = TokenVerifier::new("devkey", "secret").verify(&token).unwrap();
        assert_eq!(claims.iss, "devkey");
        assert_eq!(claims.sub, "abcde_3");
        assert!(claims.video.room_join);
        assert_eq!(claims.video.room, "testroom042");
        assert_eq!(claims.attributes["role"], "sub");
        assert!(claims.exp > claims.nbf);
    }

    #[test]
    fn test_verify_rejects_wrong_secret_and_key() {
        let token = AccessToken::new("devkey", "secret")
            .with_identity("p")
            .to_jwt()
            .unwrap();

        assert!(matches!(
            TokenVerifier::new("devkey", "other").verify(&token),
            Err(Error::ErrInvalidToken(_))
        ));
        assert!(matches!(
            TokenVerifier::new("otherkey", "secret").verify(&token),
            Err(Error::ErrInvalidToken(_))
        ));
        assert!(matches!(
            TokenVerifier::new("devkey", "secret").verify("garbage"),
            Err(Error::ErrInvalidToken(_))
        ));
    }

    #[test]
    fn test_expired_token() {
        let token = AccessToken::new("devkey", "secret")
            .with_ttl(Duration::ZERO)
            .to_jwt()
            .unwrap();
        assert!(TokenVerifier::new("devkey", "secret").verify(&token).is_err());
    }

    #[test]
    fn test_missing_credentials() {
        assert!(AccessToken::new("", "secret").to_jwt().is_err());
    }
}
