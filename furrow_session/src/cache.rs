//! A cache of the one authenticated client bound to the current token

use std::{error, fmt, sync::Arc};

use arc_swap::ArcSwapOption;
use furrow_clock::UnixTime;

use crate::{token, Token, TokenRef};

/// Builds clients that send a token as their bearer credential
pub trait ClientFactory: Send + Sync {
    /// The client produced by this factory
    type Client: Send + Sync + 'static;

    /// The error returned when a client cannot be built
    type Error: error::Error + Send + Sync + 'static;

    /// Builds a client that authenticates every call with `token`
    fn create_client(&self, token: &TokenRef) -> Result<Self::Client, Self::Error>;
}

/// The cached client along with the token it was built for
pub struct CachedClient<T> {
    token: Token,
    client: Arc<T>,
    expires_at: Option<UnixTime>,
}

impl<T> CachedClient<T> {
    /// The token the client authenticates with
    #[inline]
    pub fn token(&self) -> &TokenRef {
        &self.token
    }

    /// The client itself
    #[inline]
    pub fn client(&self) -> &Arc<T> {
        &self.client
    }

    /// When the token expires, or `None` if its claims could not be read
    #[inline]
    pub fn expires_at(&self) -> Option<UnixTime> {
        self.expires_at
    }

    /// Whether the token is expired as of `now`
    ///
    /// A token whose claims could not be read is always expired.
    pub fn is_expired_at(&self, now: UnixTime) -> bool {
        self.expires_at.map_or(true, |exp| exp <= now)
    }
}

impl<T> fmt::Debug for CachedClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CachedClient")
            .field("token", &self.token)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Holds at most one authenticated client, keyed by its token
///
/// Asking for a client with the token already cached returns the existing
/// handle. Any other token replaces the cached client; the previous handle is
/// simply released, not closed. Reads never block, and only one task is
/// expected to write.
pub struct ClientCache<F: ClientFactory> {
    factory: F,
    current: ArcSwapOption<CachedClient<F::Client>>,
}

impl<F: ClientFactory> ClientCache<F> {
    /// Constructs an empty cache that builds clients with `factory`
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            current: ArcSwapOption::empty(),
        }
    }

    /// Returns the client for `token`, building and caching one if needed
    ///
    /// # Errors
    ///
    /// Returns the factory's error if a new client cannot be built. The
    /// previously cached client remains in place in that case.
    pub fn get_or_create(&self, token: &TokenRef) -> Result<Arc<F::Client>, F::Error> {
        if let Some(cached) = self.current.load().as_deref() {
            if cached.token.as_str() == token.as_str() {
                tracing::trace!("reusing cached client for current token");
                return Ok(Arc::clone(&cached.client));
            }
        }

        let client = Arc::new(self.factory.create_client(token)?);
        let expires_at = match token::decode(token) {
            Ok(claims) => Some(claims.expires_at()),
            Err(error) => {
                tracing::debug!(
                    error = (&error as &dyn error::Error),
                    "cached token claims are unreadable, treating as expired"
                );
                None
            }
        };

        self.current.store(Some(Arc::new(CachedClient {
            token: token.to_owned(),
            client: Arc::clone(&client),
            expires_at,
        })));

        tracing::debug!(
            expires_at = expires_at.map(|t| t.0),
            "cached new authenticated client"
        );

        Ok(client)
    }

    /// The current cache entry, if any
    pub fn current(&self) -> Option<Arc<CachedClient<F::Client>>> {
        self.current.load_full()
    }

    /// The currently cached client, if any
    pub fn current_client(&self) -> Option<Arc<F::Client>> {
        self.current
            .load()
            .as_deref()
            .map(|cached| Arc::clone(&cached.client))
    }

    /// The token of the currently cached client, if any
    pub fn current_token(&self) -> Option<Token> {
        self.current
            .load()
            .as_deref()
            .map(|cached| cached.token.clone())
    }

    /// The expiry of the currently cached token, if known
    pub fn current_expiry(&self) -> Option<UnixTime> {
        self.current
            .load()
            .as_deref()
            .and_then(|cached| cached.expires_at)
    }

    /// Whether the cache holds a client for exactly `token`
    pub fn holds(&self, token: &TokenRef) -> bool {
        self.current
            .load()
            .as_deref()
            .map_or(false, |cached| cached.token.as_str() == token.as_str())
    }

    /// Whether the cached token is expired as of `now`
    ///
    /// An empty cache counts as expired.
    pub fn is_expired_at(&self, now: UnixTime) -> bool {
        self.current
            .load()
            .as_deref()
            .map_or(true, |cached| cached.is_expired_at(now))
    }

    /// The factory used to build clients
    #[inline]
    pub fn factory(&self) -> &F {
        &self.factory
    }
}

impl<F> fmt::Debug for ClientCache<F>
where
    F: ClientFactory + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientCache")
            .field("factory", &self.factory)
            .field("current", &self.current.load().as_deref())
            .finish()
    }
}
