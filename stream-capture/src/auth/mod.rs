//! Upstream authentication.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Client;
use tracing::debug;

use crate::{Error, Result};

/// A stream access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub obtained_at: NaiveDateTime,
}

impl AccessToken {
    /// Whether the token is older than `lifetime_minutes` at `now`.
    pub fn is_expired(&self, now: NaiveDateTime, lifetime_minutes: u32) -> bool {
        now > self.obtained_at + chrono::Duration::minutes(lifetime_minutes as i64)
    }
}

/// Obtains stream access tokens.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, now: NaiveDateTime) -> Result<AccessToken>;
}

/// Fetches a token from a URL template carrying the account credentials.
pub struct HttpAuthenticator {
    client: Client,
    url_template: String,
    user: String,
    pass: String,
}

impl HttpAuthenticator {
    pub fn new(
        url_template: impl Into<String>,
        user: impl Into<String>,
        pass: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            url_template: url_template.into(),
            user: user.into(),
            pass: pass.into(),
        }
    }

    fn url(&self) -> String {
        let user = urlencoding::encode(&self.user);
        let pass = urlencoding::encode(&self.pass);
        process_utils::expand_template(
            &self.url_template,
            &[("USERNAME", user.as_ref()), ("PASSWORD", pass.as_ref())],
        )
    }
}

/// Pull the `hash` field out of a token response.
pub fn parse_token_response(body: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    match value.get("hash") {
        Some(serde_json::Value::String(hash)) if !hash.is_empty() => Ok(hash.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => Err(Error::Authentication(
            "response has no hash; check user name, password and auth_url".to_string(),
        )),
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn authenticate(&self, now: NaiveDateTime) -> Result<AccessToken> {
        if self.url_template.is_empty() {
            return Err(Error::Authentication("auth_url is not set".to_string()));
        }

        let body = self
            .client
            .get(self.url())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Authentication(e.to_string()))?
            .text()
            .await?;

        let value = parse_token_response(&body)?;
        debug!("Obtained access token");
        Ok(AccessToken {
            value,
            obtained_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_url_encodes_credentials() {
        let auth = HttpAuthenticator::new(
            "https://auth.example/hash_api.php?username=[USERNAME]&password=[PASSWORD]&site=view247",
            "me@example.com",
            "p&ss word",
        );
        assert_eq!(
            auth.url(),
            "https://auth.example/hash_api.php?username=me%40example.com&password=p%26ss%20word&site=view247"
        );
    }

    #[test]
    fn test_parse_token_response() {
        assert_eq!(parse_token_response(r#"{"hash": "abc123", "valid": 240}"#).unwrap(), "abc123");
        assert!(matches!(
            parse_token_response(r#"{"error": "bad login"}"#),
            Err(Error::Authentication(_))
        ));
        assert!(parse_token_response(r#"{"hash": ""}"#).is_err());
    }

    #[test]
    fn test_token_expiry() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let token = AccessToken {
            value: "abc".to_string(),
            obtained_at: at,
        };
        assert!(!token.is_expired(at + chrono::Duration::minutes(240), 240));
        assert!(token.is_expired(at + chrono::Duration::minutes(241), 240));
    }
}
