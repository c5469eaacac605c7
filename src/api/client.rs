//! Authenticated HTTP client for the chat REST API
//!
//! Wraps reqwest::Client with bearer token injection.

use anyhow::{bail, Context, Result};
use url::Url;

use crate::auth::Credential;
use crate::config::Config;

pub struct ChatClient {
    http: reqwest::Client,
    config: Config,
    token: String,
}

impl ChatClient {
    /// Load config and build a client from the stored session.
    pub fn new() -> Result<Self> {
        let config = Config::load()?;
        let credential = config
            .credential
            .clone()
            .context("No session. Run 'chat-sync login' first.")?;
        Self::with_credential(config, credential)
    }

    /// Build a client for an explicit credential.
    pub fn with_credential(config: Config, credential: Credential) -> Result<Self> {
        if !credential.is_well_formed() {
            bail!("Session token is malformed. Run 'chat-sync login'.");
        }
        if credential.is_expired() {
            bail!("Session expired. Run 'chat-sync login'.");
        }
        Ok(Self {
            http: reqwest::Client::new(),
            config,
            token: credential.token,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Id of the signed-in user.
    pub fn me(&self) -> Result<&str> {
        self.config
            .user_id
            .as_deref()
            .context("Signed-in user unknown. Run 'chat-sync login'.")
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.config.rest_url(path)
    }

    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.url(path)?;
        tracing::debug!("GET {}", url);

        let resp = self
            .http
            .get(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        check_response(resp, url.as_str()).await
    }

    pub async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = self.url(path)?;
        tracing::debug!("POST {}", url);

        let resp = self
            .http
            .post(url.clone())
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        check_response(resp, url.as_str()).await
    }

    pub async fn delete(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.url(path)?;
        tracing::debug!("DELETE {}", url);

        let resp = self
            .http
            .delete(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("DELETE {} failed", url))?;

        check_response(resp, url.as_str()).await
    }
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        bail!(
            "401 Unauthorized for {}. Session may be invalid -- run 'chat-sync login'.",
            url
        );
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_expired_credential() {
        let expired = Credential {
            token: "abc".into(),
            expires_at: Some(1),
        };
        let err = ChatClient::with_credential(Config::default(), expired)
            .err()
            .unwrap();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_me_requires_login() {
        let client =
            ChatClient::with_credential(Config::default(), Credential::new("abc".into(), None))
                .unwrap();
        assert!(client.me().is_err());
        assert_eq!(
            client.url("/api/contacts").unwrap().as_str(),
            "http://localhost:5000/api/contacts"
        );
    }
}
