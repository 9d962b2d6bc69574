use std::future::Future;

use tokio::sync::watch;

use crate::{error::PortalError, models::Identity, subscription::Subscription};

/// External authentication provider.
pub trait AuthProvider: Send + Sync {
    /// Delivers the current auth state immediately, then every change.
    fn on_auth_state_changed(&self) -> Subscription<Option<Identity>>;

    fn sign_out(&self) -> impl Future<Output = Result<(), PortalError>> + Send;
}

/// In-process provider: whoever holds it decides who is signed in.
pub struct LocalAuth {
    state: watch::Sender<Option<Identity>>,
}

impl Default for LocalAuth {
    fn default() -> Self {
        let (state, _) = watch::channel(None);
        Self { state }
    }
}

impl LocalAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, identity: Identity) {
        tracing::info!(uid = %identity.uid, "Signed in");
        self.state.send_replace(Some(identity));
    }

    /// Re-announces the current state to every subscriber, as a token
    /// refresh would.
    pub fn refresh(&self) {
        self.state.send_modify(|_| {});
    }

    pub fn current(&self) -> Option<Identity> {
        self.state.borrow().clone()
    }
}

impl AuthProvider for LocalAuth {
    fn on_auth_state_changed(&self) -> Subscription<Option<Identity>> {
        let mut state = self.state.subscribe();
        Subscription::spawn(move |tx| async move {
            loop {
                let current = state.borrow_and_update().clone();
                if tx.send(current).await.is_err() {
                    return;
                }
                if state.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    async fn sign_out(&self) -> Result<(), PortalError> {
        if let Some(previous) = self.state.send_replace(None) {
            tracing::info!(uid = %previous.uid, "Signed out");
        }
        Ok(())
    }
}
