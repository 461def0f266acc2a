//! A token source that asks the identity provider's backend API for session tokens

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;

use super::TokenProvider;
use crate::{SecretKey, SessionId, TemplateNameRef, Token};

/// Mints template tokens for one identity-provider session
///
/// Issues `POST {api_base}/v1/sessions/{session_id}/tokens/{template}`,
/// authenticated with the provider secret key. A `404 Not Found` means the
/// session no longer exists, which is reported as "no token available".
#[derive(Debug)]
pub struct SessionTokenEndpoint {
    client: reqwest::Client,
    api_base: Url,
    session_id: SessionId,
    secret_key: SecretKey,
}

impl SessionTokenEndpoint {
    /// Constructs a new session token source
    pub fn new(
        client: reqwest::Client,
        api_base: Url,
        session_id: SessionId,
        secret_key: SecretKey,
    ) -> Self {
        Self {
            client,
            api_base,
            session_id,
            secret_key,
        }
    }

    fn token_url(&self, template: &TemplateNameRef) -> Url {
        let mut url = self.api_base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend([
                "v1",
                "sessions",
                self.session_id.as_str(),
                "tokens",
                template.as_str(),
            ]);
        }
        url
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    jwt: Token,
}

/// An error while requesting a token from the identity provider
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// The identity provider answered with an error status
    #[error("identity provider returned {status}: {body}")]
    ErrorWithBody {
        /// The response status
        status: StatusCode,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from identity provider")]
    TokenBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(#[source] reqwest::Error),
    /// Unable to send a token request to the identity provider
    #[error("error sending request to identity provider")]
    RequestSend(#[source] reqwest::Error),
}

#[async_trait]
impl TokenProvider for SessionTokenEndpoint {
    type Error = TokenRequestError;

    #[tracing::instrument(
        err,
        skip(self, template),
        fields(session_id = %self.session_id, template = %template),
    )]
    async fn get_token(&self, template: &TemplateNameRef) -> Result<Option<Token>, Self::Error> {
        tracing::trace!("requesting template token from identity provider");

        let resp = self
            .client
            .post(self.token_url(template))
            .bearer_auth(self.secret_key.as_str())
            .send()
            .await
            .map_err(TokenRequestError::RequestSend)?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received token response from identity provider"
        );

        if status == StatusCode::NOT_FOUND {
            tracing::debug!("identity provider has no such session");
            return Ok(None);
        }

        if !status.is_success() {
            let body = resp
                .text()
                .await
                .map_err(TokenRequestError::BodyReadError)?;
            return Err(TokenRequestError::ErrorWithBody { status, body });
        }

        let body = resp
            .bytes()
            .await
            .map_err(TokenRequestError::BodyReadError)?;
        let resp: TokenResponse = serde_json::from_slice(&body)?;

        if resp.jwt.as_str().is_empty() {
            return Ok(None);
        }

        Ok(Some(resp.jwt))
    }
}
