//! Password login against the chat server, plus session status

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::Credential;
use crate::config::Config;

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    user: LoginUser,
}

#[derive(Debug, Deserialize)]
struct LoginUser {
    #[serde(alias = "_id")]
    id: String,
    #[serde(default, alias = "displayName")]
    name: Option<String>,
}

/// Sign in with email and password and store the session credential.
pub async fn login(email: &str, password: &str, force: bool) -> Result<()> {
    let mut config = Config::load()?;

    if !force {
        if let Some(ref cred) = config.credential {
            if cred.is_valid() {
                println!("Already signed in. Use --force to sign in again.");
                return Ok(());
            }
        }
    }

    let url = config.rest_url("/api/auth/login")?;
    tracing::debug!("POST {}", url);

    let resp = reqwest::Client::new()
        .post(url.clone())
        .json(&serde_json::json!({ "email": email, "password": password }))
        .send()
        .await
        .with_context(|| format!("Login request to {} failed", url))?;

    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::BAD_REQUEST {
        bail!("Login rejected: invalid email or password");
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("Login failed: HTTP {}: {}", status.as_u16(), body);
    }

    let body: LoginResponse = resp.json().await.context("Failed to parse login response")?;
    let credential = Credential::from_token(body.token);
    if !credential.is_valid() {
        bail!("Server returned an unusable session token");
    }

    let name = body.user.name.clone();
    config.set_session(credential, body.user.id.clone(), body.user.name);
    config.save()?;

    println!(
        "Login successful. Signed in as {} ({}).",
        name.as_deref().unwrap_or("(unnamed)"),
        body.user.id
    );
    Ok(())
}

/// Forget the stored session.
pub async fn logout() -> Result<()> {
    let mut config = Config::load()?;
    config.clear_session();
    config.save()?;
    println!("Logged out.");
    Ok(())
}

/// Print the stored session state.
pub async fn status() -> Result<()> {
    let config = Config::load()?;

    println!("Server:      {}", config.server_url);
    match config.socket_url() {
        Ok(url) => println!("Socket:      {}", url),
        Err(e) => println!("Socket:      invalid ({:#})", e),
    }

    match config.credential {
        Some(ref cred) if cred.is_valid() => {
            println!("Session:     valid");
            if let Some(exp) = cred.expires_at {
                println!("  expires_at: {}", exp);
            }
        }
        Some(ref cred) if !cred.is_well_formed() => println!("Session:     malformed"),
        Some(_) => println!("Session:     expired"),
        None => println!("Session:     none"),
    }

    if let Some(ref id) = config.user_id {
        println!(
            "User:        {} ({})",
            config.user_name.as_deref().unwrap_or("(unnamed)"),
            id
        );
    }

    if !config.credential.as_ref().map_or(false, Credential::is_valid) {
        println!("\nRun 'chat-sync login' to authenticate.");
    }

    Ok(())
}
