//! Authenticated data-backend clients kept fresh from short-lived identity tokens
//!
//! An application signs its user in with an identity provider, which can mint
//! short-lived signed tokens from a named template. This crate keeps a single
//! data-backend client authenticated with such a token and refreshes the token
//! in the background before it expires.
//!
//! The pieces are usable on their own:
//!
//! * [`token`] reads the expiry out of a token payload without verifying its
//!   signature. The backend verifies the signature on every call, so this is
//!   only used for scheduling.
//! * [`identity`] turns an identity provider's user identifier into a
//!   [`StableId`] in UUID form, fit for keying backend rows and storage paths.
//! * [`cache`] holds the one client built for the current token.
//! * [`bridge`] installs a token as the backend client's active session.
//! * [`scheduler`] is the refresh state machine, free of any timers.
//!
//! A [`SessionManager`] ties them together and owns the timers: a one-shot
//! timer armed [`LEAD_TIME`][token::LEAD_TIME] ahead of expiry, and a
//! fallback interval that catches anything the one-shot missed, such as a
//! machine that slept through it.
//!
//! ```no_run
//! use furrow_session::{
//!     sources::SessionTokenEndpoint, BackendConfig, RefreshConfig, SecretKey, SessionId,
//!     SessionManager, ApiKey,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = SessionTokenEndpoint::new(
//!     reqwest::Client::new(),
//!     "https://api.identity.example.com".parse()?,
//!     SessionId::from_static("sess_2abc"),
//!     SecretKey::from_static("sk_test_123"),
//! );
//!
//! let backend = BackendConfig::new(
//!     "https://project.backend.example.com".parse()?,
//!     ApiKey::from_static("public-anon-key"),
//! );
//!
//! let mut manager = SessionManager::new(provider, backend, RefreshConfig::default());
//! manager.initialize().await;
//!
//! if let Some(client) = manager.client() {
//!     let crops = client.rest(reqwest::Method::GET, "crops").send().await?;
//!     tracing::info!(status = %crops.status(), "listed crops");
//! }
//!
//! manager.teardown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `rustls-tls` (default): use rustls for HTTPS connections.
//! * `default-tls`: use the platform's native TLS implementation instead.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backend;
mod braids;
pub mod bridge;
pub mod cache;
pub mod identity;
mod manager;
pub mod scheduler;
pub mod sources;
pub mod token;

pub use backend::{BackendClient, BackendConfig};
pub use braids::*;
pub use bridge::{Session, SessionStore};
pub use cache::{CachedClient, ClientCache, ClientFactory};
pub use identity::{derive_id, StableId};
pub use manager::{InitOutcome, SessionManager};
pub use scheduler::{RefreshConfig, SchedulerState};
pub use sources::TokenProvider;
pub use token::TokenStatus;
