use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;

/// A signed-in account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials for {0}")]
    InvalidCredentials(String),
    #[error("account already exists: {0}")]
    AccountExists(String),
    #[error("identity provider error: {0}")]
    Provider(String),
}

/// External identity provider contract.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Create an account. On success the new account is signed in.
    async fn create_account(&self, email: &str, password: &str) -> Result<Identity, AuthError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;

    fn current_identity(&self) -> Option<Identity>;

    /// Receiver tracking the signed-in identity; changes on sign-in and sign-out.
    fn auth_state(&self) -> watch::Receiver<Option<Identity>>;
}

/// In-process account table.
pub struct MemoryIdentityProvider {
    accounts: Mutex<HashMap<String, (String, Identity)>>,
    current: watch::Sender<Option<Identity>>,
}

impl Default for MemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            current: watch::channel(None).0,
        }
    }
}

#[async_trait::async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn create_account(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        if password.len() < 6 {
            return Err(AuthError::Provider("password must be at least 6 characters".into()));
        }
        let identity = {
            let mut accounts = self.accounts.lock().unwrap_or_else(PoisonError::into_inner);
            if accounts.contains_key(email) {
                return Err(AuthError::AccountExists(email.to_string()));
            }
            let identity = Identity {
                uid: ulid::Ulid::new().to_string(),
                email: email.to_string(),
            };
            accounts.insert(email.to_string(), (password.to_string(), identity.clone()));
            identity
        };
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let identity = {
            let accounts = self.accounts.lock().unwrap_or_else(PoisonError::into_inner);
            match accounts.get(email) {
                Some((stored, identity)) if stored == password => identity.clone(),
                _ => return Err(AuthError::InvalidCredentials(email.to_string())),
            }
        };
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.current.send_replace(None);
        Ok(())
    }

    fn current_identity(&self) -> Option<Identity> {
        self.current.borrow().clone()
    }

    fn auth_state(&self) -> watch::Receiver<Option<Identity>> {
        self.current.subscribe()
    }
}
