use std::{error, fmt, sync::Arc, time::Duration};

use furrow_clock::{Clock, System};
use thiserror::Error;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

use crate::{
    bridge::{self, SessionStore},
    cache::{ClientCache, ClientFactory},
    scheduler::{RefreshConfig, RefreshScheduler, SchedulerState, Trigger},
    sources::TokenProvider,
    token, Token, TokenRef,
};

/// The result of asking a session manager to initialize
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitOutcome {
    /// A client is cached and refreshes are scheduled
    Initialized,
    /// The manager was already initialized; nothing was done
    AlreadyInitialized,
    /// The identity provider had no token to give; no client is available
    NoToken,
    /// The identity provider could not be reached; no client is available
    FetchFailed,
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("identity provider failed to provide a token")]
    Provider(#[source] Box<dyn error::Error + Send + Sync + 'static>),
    #[error("identity provider did not respond within {0:?}")]
    TimedOut(Duration),
}

async fn fetch_token<P: TokenProvider + ?Sized>(
    provider: &P,
    config: &RefreshConfig,
) -> Result<Option<Token>, FetchError> {
    let timeout: Duration = config.fetch_timeout.into();
    match time::timeout(timeout, provider.get_token(&config.template)).await {
        Ok(Ok(token)) => Ok(token),
        Ok(Err(error)) => Err(FetchError::Provider(Box::new(error))),
        Err(_) => Err(FetchError::TimedOut(timeout)),
    }
}

/// Caches a client for `token` and installs the token as its session
///
/// Failures are logged and swallowed. If no client can be built, the
/// previously cached client stays in place.
async fn install<F>(cache: &ClientCache<F>, token: &TokenRef)
where
    F: ClientFactory,
    F::Client: SessionStore,
{
    let client = match cache.get_or_create(token) {
        Ok(client) => client,
        Err(error) => {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "unable to build an authenticated client, keeping the previous one"
            );
            return;
        }
    };

    if let Err(error) = bridge::bridge(&*client, token).await {
        tracing::warn!(
            error = (&error as &dyn error::Error),
            "unable to install session on the data backend, continuing with stale credentials"
        );
    }
}

struct Scope {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<RefreshScheduler>,
}

/// Owns an authenticated client and keeps its token fresh
///
/// A manager is the owning scope for one signed-in identity. [`initialize()`]
/// fetches a token, caches a client for it, installs the session and starts
/// a background task holding the refresh timers. [`teardown()`] cancels
/// those timers. No failure in here is raised to the caller: a stale
/// credential is preferred over taking the owning scope down, so problems
/// are reported through logs and [`InitOutcome`].
///
/// Dropping the manager aborts the background task.
///
/// [`initialize()`]: SessionManager::initialize
/// [`teardown()`]: SessionManager::teardown
pub struct SessionManager<P, F: ClientFactory, C = System> {
    provider: Arc<P>,
    cache: Arc<ClientCache<F>>,
    config: RefreshConfig,
    clock: C,
    state: Arc<watch::Sender<SchedulerState>>,
    scheduler: Option<RefreshScheduler>,
    scope: Option<Scope>,
}

impl<P, F> SessionManager<P, F, System>
where
    F: ClientFactory,
{
    /// Constructs a manager using the system clock
    pub fn new(provider: P, factory: F, config: RefreshConfig) -> Self {
        Self::with_clock(provider, ClientCache::new(factory), config, System)
    }
}

impl<P, F, C> SessionManager<P, F, C>
where
    F: ClientFactory,
{
    /// Constructs a manager around an existing cache, using the given clock
    ///
    /// A zero fallback period or re-arm floor is raised to one second.
    pub fn with_clock(
        provider: P,
        cache: impl Into<Arc<ClientCache<F>>>,
        config: RefreshConfig,
        clock: C,
    ) -> Self {
        let config = config.clamped();
        let (state, _) = watch::channel(SchedulerState::Uninitialized);
        Self {
            provider: Arc::new(provider),
            cache: cache.into(),
            scheduler: Some(RefreshScheduler::new(&config)),
            config,
            clock,
            state: Arc::new(state),
            scope: None,
        }
    }

    /// The currently cached client, if any
    pub fn client(&self) -> Option<Arc<F::Client>> {
        self.cache.current_client()
    }

    /// The client cache shared with the refresh task
    #[inline]
    pub fn cache(&self) -> &Arc<ClientCache<F>> {
        &self.cache
    }

    /// The identity provider used to fetch tokens
    #[inline]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The refresh configuration
    #[inline]
    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// The scheduler's current state
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Subscribes to scheduler state changes
    pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Whether a refresh scope is currently running
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.scope.is_some()
    }

    fn publish(&self, state: SchedulerState) {
        self.state.send_replace(state);
    }
}

impl<P, F, C> SessionManager<P, F, C>
where
    P: TokenProvider + 'static,
    F: ClientFactory + 'static,
    F::Client: SessionStore,
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Fetches a token, caches a client for it, and starts refreshing
    ///
    /// Calling this again while initialized does nothing. If the identity
    /// provider has no token, a warning is logged, no timers are armed and
    /// the cache is left untouched.
    pub async fn initialize(&mut self) -> InitOutcome {
        let mut scheduler = match self.scheduler.take() {
            Some(scheduler) => scheduler,
            None => {
                tracing::debug!("session already initialized");
                return InitOutcome::AlreadyInitialized;
            }
        };

        if !scheduler.begin_initialize() {
            tracing::debug!("session already initialized");
            self.scheduler = Some(scheduler);
            return InitOutcome::AlreadyInitialized;
        }
        self.publish(scheduler.state());

        let token = match fetch_token(&*self.provider, &self.config).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                tracing::warn!("identity provider has no token available, session not initialized");
                return self.abandon_initialize(scheduler, InitOutcome::NoToken);
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "unable to fetch initial token, session not initialized"
                );
                return self.abandon_initialize(scheduler, InitOutcome::FetchFailed);
            }
        };

        install(&self.cache, &token).await;

        let claims = token::parse(&token, &self.clock);
        if let Err(error) = &claims {
            tracing::warn!(
                error = (error as &dyn error::Error),
                "initial token claims are unreadable, refreshing immediately"
            );
        }

        let delay = scheduler.token_fetched(&claims).unwrap_or_default();
        self.publish(scheduler.state());

        tracing::debug!(
            delay_secs = delay.as_secs(),
            expires_at = claims.as_ref().ok().map(|c| c.expires_at().0),
            "session initialized, one-shot refresh armed"
        );

        let (shutdown, shutdown_rx) = oneshot::channel();
        let refresher = Refresher {
            provider: Arc::clone(&self.provider),
            cache: Arc::clone(&self.cache),
            config: self.config.clone(),
            clock: self.clock.clone(),
            state: Arc::clone(&self.state),
            scheduler,
            one_shot: Some(Instant::now() + delay),
        };

        let task = tokio::spawn(refresher.run(shutdown_rx));
        self.scope = Some(Scope { shutdown, task });

        InitOutcome::Initialized
    }

    fn abandon_initialize(
        &mut self,
        mut scheduler: RefreshScheduler,
        outcome: InitOutcome,
    ) -> InitOutcome {
        scheduler.fetch_failed();
        self.publish(scheduler.state());
        self.scheduler = Some(scheduler);
        outcome
    }

    /// Cancels both refresh timers and allows a later re-initialization
    ///
    /// Safe to call at any time, including before or after a failed
    /// initialization. The cached client is left in place.
    pub async fn teardown(&mut self) {
        let mut scheduler = match self.scope.take() {
            Some(scope) => {
                // The task may already have exited, in which case nobody is listening.
                let _ = scope.shutdown.send(());
                match scope.task.await {
                    Ok(scheduler) => scheduler,
                    Err(error) => {
                        if error.is_panic() {
                            tracing::error!("refresh task panicked");
                        } else if error.is_cancelled() {
                            tracing::info!("refresh task was cancelled");
                        }
                        RefreshScheduler::new(&self.config)
                    }
                }
            }
            None => self
                .scheduler
                .take()
                .unwrap_or_else(|| RefreshScheduler::new(&self.config)),
        };

        scheduler.torn_down();
        self.publish(scheduler.state());
        self.scheduler = Some(scheduler);
        tracing::debug!("session torn down");
    }
}

impl<P, F: ClientFactory, C> Drop for SessionManager<P, F, C> {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            scope.task.abort();
        }
    }
}

impl<P, F, C> fmt::Debug for SessionManager<P, F, C>
where
    P: fmt::Debug,
    F: ClientFactory + fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("provider", &self.provider)
            .field("cache", &self.cache)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// The background half of a session scope, owning both refresh timers
struct Refresher<P, F: ClientFactory, C> {
    provider: Arc<P>,
    cache: Arc<ClientCache<F>>,
    config: RefreshConfig,
    clock: C,
    state: Arc<watch::Sender<SchedulerState>>,
    scheduler: RefreshScheduler,
    one_shot: Option<Instant>,
}

async fn sleep_until_armed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<P, F, C> Refresher<P, F, C>
where
    P: TokenProvider,
    F: ClientFactory,
    F::Client: SessionStore,
    C: Clock,
{
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> RefreshScheduler {
        let period: Duration = self.config.fallback_period.into();
        let mut fallback = time::interval_at(Instant::now() + period, period);
        fallback.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let trigger = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                () = sleep_until_armed(self.one_shot) => {
                    self.one_shot = None;
                    Trigger::OneShot
                }
                _ = fallback.tick() => Trigger::Fallback,
            };

            let cached_token_expired = self.cache.is_expired_at(self.clock.now());
            if !self.scheduler.timer_fired(trigger, cached_token_expired) {
                tracing::trace!(?trigger, "cached token still valid, no refresh needed");
                continue;
            }
            self.publish();

            tracing::debug!(?trigger, cached_token_expired, "refreshing token");
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                () = self.refresh() => {}
            }
        }

        tracing::debug!("refresh timers cancelled");
        self.scheduler.torn_down();
        self.scheduler
    }

    async fn refresh(&mut self) {
        let token = match fetch_token(&*self.provider, &self.config).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                tracing::warn!("identity provider has no token available, will retry on the next trigger");
                self.scheduler.fetch_failed();
                self.publish();
                return;
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "error refreshing token, will retry on the next trigger"
                );
                self.scheduler.fetch_failed();
                self.publish();
                return;
            }
        };

        if self.cache.holds(&token) {
            tracing::trace!("identity provider returned the current token, rescheduling only");
        } else {
            install(&self.cache, &token).await;
        }

        let claims = token::parse(&token, &self.clock);
        if let Err(error) = &claims {
            tracing::warn!(
                error = (error as &dyn error::Error),
                "refreshed token claims are unreadable"
            );
        }

        if let Some(delay) = self.scheduler.token_fetched(&claims) {
            self.one_shot = Some(Instant::now() + delay);
            tracing::debug!(
                delay_secs = delay.as_secs(),
                expires_at = claims.as_ref().ok().map(|c| c.expires_at().0),
                "one-shot refresh re-armed"
            );
        }
        self.publish();
    }

    fn publish(&self) {
        self.state.send_replace(self.scheduler.state());
    }
}
