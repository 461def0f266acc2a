//! Token sources backed by the identity provider

use std::{convert::Infallible, error};

use async_trait::async_trait;

use crate::{TemplateNameRef, Token};

pub mod http;

pub use http::SessionTokenEndpoint;

/// An asynchronous source of identity-provider tokens
///
/// `Ok(None)` means the provider has no credential to give, such as when no
/// user is signed in. That is distinct from a failure to ask.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// The error type returned in the event that retrieving a token fails
    type Error: error::Error + Send + Sync + 'static;

    /// Requests a token minted from the named template
    async fn get_token(&self, template: &TemplateNameRef) -> Result<Option<Token>, Self::Error>;
}

/// A token provider that always hands out the same token
///
/// Useful for demos and tests, or when a token is injected from elsewhere.
#[derive(Clone, Debug)]
pub struct ConstTokenProvider {
    token: Option<Token>,
}

impl ConstTokenProvider {
    /// Constructs a provider that always returns `token`
    pub fn new(token: impl Into<Token>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Constructs a provider that never has a token available
    pub const fn empty() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl TokenProvider for ConstTokenProvider {
    type Error = Infallible;

    async fn get_token(&self, _template: &TemplateNameRef) -> Result<Option<Token>, Self::Error> {
        Ok(self.token.clone())
    }
}
