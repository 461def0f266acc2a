//! Installing a token as the data backend's active session

use std::{error, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Token, TokenRef};

/// A data-backend session credential
///
/// Template tokens from the identity provider carry no refresh token of
/// their own. Refreshing means asking the identity provider for a new token,
/// so `refresh_token` is left empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// The bearer credential for the session
    pub access_token: Token,
    /// Always empty for bridged sessions
    pub refresh_token: String,
}

impl Session {
    /// A session that uses `token` as its access token and has no refresh token
    pub fn from_access_token(token: &TokenRef) -> Self {
        Self {
            access_token: token.to_owned(),
            refresh_token: String::new(),
        }
    }
}

/// A client that can hold an active session
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The error returned when a session cannot be installed
    type Error: error::Error + Send + Sync + 'static;

    /// Installs `session` as the active session
    ///
    /// Installing the session that is already active must succeed without
    /// any observable difference.
    async fn set_session(&self, session: Session) -> Result<(), Self::Error>;
}

#[async_trait]
impl<S: SessionStore + ?Sized> SessionStore for Arc<S> {
    type Error = S::Error;

    async fn set_session(&self, session: Session) -> Result<(), Self::Error> {
        (**self).set_session(session).await
    }
}

/// Installs `token` as the active session credential on `client`
///
/// Safe to call repeatedly with the same token. Failures are returned so that
/// the caller can decide how loudly to complain; the refresh scheduler logs
/// them and carries on.
pub async fn bridge<S: SessionStore + ?Sized>(client: &S, token: &TokenRef) -> Result<(), S::Error> {
    tracing::trace!("installing token as the active backend session");
    client.set_session(Session::from_access_token(token)).await
}
