//! Authentication: session credential and the auth service seam
//!
//! The sync core only needs two things from authentication: the current
//! credential, if any, and whether it is still usable.

pub mod login;
pub mod tokens;

pub use login::{login, logout, status};
pub use tokens::Credential;

use crate::config::Config;

/// Source of session credentials.
pub trait AuthService: Send + Sync {
    fn get_credential(&self) -> Option<Credential>;

    fn is_valid(&self, credential: &Credential) -> bool {
        credential.is_valid()
    }
}

/// Reads the credential from the config file on every call, so a new
/// login is picked up by the next reconnect attempt.
pub struct ConfigAuth;

impl AuthService for ConfigAuth {
    fn get_credential(&self) -> Option<Credential> {
        match Config::load() {
            Ok(config) => config.credential,
            Err(e) => {
                tracing::warn!("Could not load config for credential: {:#}", e);
                None
            }
        }
    }
}

/// Fixed credential.
#[cfg(test)]
pub struct StaticAuth(pub Option<Credential>);

#[cfg(test)]
impl AuthService for StaticAuth {
    fn get_credential(&self) -> Option<Credential> {
        self.0.clone()
    }
}
