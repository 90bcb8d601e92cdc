use std::sync::Arc;

use helpq_store::{AuthError, Identity, IdentityProvider};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::listeners::Subscription;

/// Account operations over an identity provider. Sign-up and sign-in never
/// fail loudly: errors are logged and reported as `false` / `None`.
pub struct Accounts {
    provider: Arc<dyn IdentityProvider>,
    cancel: CancellationToken,
}

impl Accounts {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            provider,
            cancel: CancellationToken::new(),
        }
    }

    pub async fn create_account(&self, email: &str, password: &str) -> bool {
        match self.provider.create_account(email, password).await {
            Ok(identity) => {
                info!(uid = %identity.uid, "account created");
                true
            }
            Err(e) => {
                error!(email, error = %e, "account creation failed");
                false
            }
        }
    }

    /// Sign in, or return the current identity if already signed in.
    pub async fn sign_in(&self, email: &str, password: &str) -> Option<Identity> {
        if let Some(current) = self.provider.current_identity() {
            return Some(current);
        }
        if let Err(e) = self.provider.sign_in(email, password).await {
            error!(email, error = %e, "sign-in failed");
        }
        self.provider.current_identity()
    }

    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.provider.sign_out().await
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.provider.current_identity()
    }

    pub fn has_login(&self) -> bool {
        self.provider.current_identity().is_some()
    }

    /// Call `callback(has_login)` for the current state and every change,
    /// but only when `predicate(has_login)` holds.
    pub fn on_auth_state_changed<F, P>(&self, callback: F, predicate: P) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
        P: Fn(bool) -> bool + Send + Sync + 'static,
    {
        let token = self.cancel.child_token();
        let cancel = token.clone();
        let mut rx = self.provider.auth_state();
        tokio::spawn(async move {
            loop {
                let has_login = rx.borrow_and_update().is_some();
                if predicate(has_login) {
                    callback(has_login);
                }
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
        Subscription::from_token(token)
    }
}

impl Drop for Accounts {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
