//! The data-backend client handed out by the client cache

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use reqwest::{header, Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    bridge::{Session, SessionStore},
    cache::ClientFactory,
    ApiKey, TokenRef,
};

/// Connection settings for the data backend
#[derive(Clone, Debug, Deserialize)]
pub struct BackendConfig {
    /// The base URL of the data backend
    pub base_url: Url,
    /// The public key identifying this application
    pub api_key: ApiKey,
    /// Whether to confirm a session with the backend before installing it
    #[serde(default)]
    pub verify_sessions: bool,
}

impl BackendConfig {
    /// Constructs a new configuration
    pub fn new(base_url: Url, api_key: ApiKey) -> Self {
        Self {
            base_url,
            api_key,
            verify_sessions: false,
        }
    }

    /// Confirms each new session against the backend's user endpoint before installing it
    pub fn verifying_sessions(mut self) -> Self {
        self.verify_sessions = true;
        self
    }
}

/// Unable to construct a data-backend client
#[derive(Debug, Error)]
pub enum BuildClientError {
    /// A credential contains bytes that cannot be sent in a header
    #[error("credential cannot be sent as a header value")]
    InvalidHeader(#[from] header::InvalidHeaderValue),
    /// The HTTP client could not be built
    #[error("unable to build HTTP client")]
    Http(#[from] reqwest::Error),
}

/// Unable to install a session on a data-backend client
#[derive(Debug, Error)]
pub enum SessionError {
    /// The backend refused the token
    #[error("data backend rejected the session with status {status}")]
    Rejected {
        /// The response status
        status: StatusCode,
    },
    /// The backend could not be reached
    #[error("error sending session check to data backend")]
    RequestSend(#[from] reqwest::Error),
}

impl ClientFactory for BackendConfig {
    type Client = BackendClient;
    type Error = BuildClientError;

    fn create_client(&self, token: &TokenRef) -> Result<Self::Client, Self::Error> {
        let mut headers = header::HeaderMap::new();

        let mut api_key = header::HeaderValue::from_str(self.api_key.as_str())?;
        api_key.set_sensitive(true);
        headers.insert("apikey", api_key);

        let mut authorization =
            header::HeaderValue::from_str(&format!("Bearer {}", token.as_str()))?;
        authorization.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, authorization);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(BackendClient {
            http,
            base_url: self.base_url.clone(),
            verify_sessions: self.verify_sessions,
            session: ArcSwapOption::empty(),
        })
    }
}

/// A data-backend client that authenticates every call with one bearer token
///
/// The client is stateless transport configuration: dropping it closes
/// nothing that needs draining.
#[derive(Debug)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: Url,
    verify_sessions: bool,
    session: ArcSwapOption<Session>,
}

impl BackendClient {
    /// The base URL of the data backend
    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The session currently installed on this client, if any
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.load_full()
    }

    /// Starts a request against a table of the backend's REST interface
    pub fn rest(&self, method: Method, table: &str) -> RequestBuilder {
        self.http
            .request(method, self.endpoint(["rest", "v1", table]))
    }

    /// Starts a request against an object in blob storage
    ///
    /// `path` may contain `/` separators, such as a path produced by
    /// [`StableId::object_path()`][crate::StableId::object_path()].
    pub fn storage_object(&self, method: Method, bucket: &str, path: &str) -> RequestBuilder {
        let mut url = self.endpoint(["storage", "v1", "object", bucket]);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.extend(path.split('/').filter(|s| !s.is_empty()));
        }
        self.http.request(method, url)
    }

    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn confirm_session(&self, session: &Session) -> Result<(), SessionError> {
        let resp = self
            .http
            .get(self.endpoint(["auth", "v1", "user"]))
            .bearer_auth(session.access_token.as_str())
            .send()
            .await?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received session check response from data backend"
        );

        if status.is_success() {
            Ok(())
        } else {
            Err(SessionError::Rejected { status })
        }
    }
}

#[async_trait]
impl SessionStore for BackendClient {
    type Error = SessionError;

    async fn set_session(&self, session: Session) -> Result<(), Self::Error> {
        if let Some(current) = self.session.load().as_deref() {
            if current.access_token == session.access_token {
                tracing::trace!("session already installed");
                return Ok(());
            }
        }

        if self.verify_sessions {
            self.confirm_session(&session).await?;
        }

        self.session.store(Some(Arc::new(session)));
        tracing::debug!("installed backend session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{bridge::bridge, Token};

    const TOKEN: &str = "aaa.bbb.ccc";

    fn config(server: &MockServer) -> BackendConfig {
        BackendConfig::new(
            server.uri().parse().unwrap(),
            ApiKey::from_static("public-anon-key"),
        )
    }

    #[tokio::test]
    async fn every_request_carries_the_bearer_token_and_api_key() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/crops"))
            .and(header("authorization", "Bearer aaa.bbb.ccc"))
            .and(header("apikey", "public-anon-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let client = config(&server).create_client(&Token::from_static(TOKEN))?;
        let resp = client.rest(Method::GET, "crops").send().await?;

        assert_eq!(resp.status(), StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn storage_paths_keep_their_segments() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/object/images/some-id/photo.jpg"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = config(&server).create_client(&Token::from_static(TOKEN))?;
        let resp = client
            .storage_object(Method::GET, "images", "some-id/photo.jpg")
            .send()
            .await?;

        assert_eq!(resp.status(), StatusCode::OK);
        Ok(())
    }

    #[test]
    fn tokens_that_cannot_be_headers_are_rejected() {
        let config = BackendConfig::new(
            "https://backend.example.com".parse().unwrap(),
            ApiKey::from_static("public-anon-key"),
        );

        let err = config
            .create_client(&Token::from_static("bad\ntoken"))
            .unwrap_err();

        assert!(matches!(err, BuildClientError::InvalidHeader(_)));
    }

    #[tokio::test]
    async fn bridging_installs_the_session_locally() -> Result<()> {
        let config = BackendConfig::new(
            "https://backend.example.com".parse()?,
            ApiKey::from_static("public-anon-key"),
        );
        let client = config.create_client(&Token::from_static(TOKEN))?;

        bridge(&client, &Token::from_static(TOKEN)).await?;

        let session = client.session().unwrap();
        assert_eq!(session.access_token, Token::from_static(TOKEN));
        assert_eq!(session.refresh_token, "");
        Ok(())
    }

    mod when_sessions_are_verified {
        use super::*;

        #[tokio::test]
        async fn repeated_bridging_checks_the_backend_once() -> Result<()> {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/auth/v1/user"))
                .and(header("authorization", "Bearer aaa.bbb.ccc"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;

            let client = config(&server)
                .verifying_sessions()
                .create_client(&Token::from_static(TOKEN))?;

            bridge(&client, &Token::from_static(TOKEN)).await?;
            bridge(&client, &Token::from_static(TOKEN)).await?;

            assert!(client.session().is_some());
            Ok(())
        }

        #[tokio::test]
        async fn rejected_tokens_are_not_installed() -> Result<()> {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/auth/v1/user"))
                .respond_with(ResponseTemplate::new(401))
                .mount(&server)
                .await;

            let client = config(&server)
                .verifying_sessions()
                .create_client(&Token::from_static(TOKEN))?;

            let err = bridge(&client, &Token::from_static(TOKEN))
                .await
                .unwrap_err();

            assert!(matches!(
                err,
                SessionError::Rejected { status } if status == StatusCode::UNAUTHORIZED
            ));
            assert!(client.session().is_none());
            Ok(())
        }
    }
}
