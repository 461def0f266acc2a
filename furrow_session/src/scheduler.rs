//! The refresh scheduler as an explicit state machine
//!
//! [`RefreshScheduler`] decides *whether* and *when* to refresh; it owns no
//! timers and performs no I/O. The [`SessionManager`][crate::SessionManager]
//! feeds it discrete events (`token_fetched`, `fetch_failed`, `timer_fired`,
//! `torn_down`) and acts on the answers.
//!
//! ```text
//! Uninitialized ─▶ Initializing ─▶ Armed ◀─▶ Refreshing
//!       ▲               │            │
//!       └───────────────┘            ▼
//!                                 TornDown ─▶ Initializing …
//! ```
//!
//! Two triggers can ask for a refresh: a one-shot timer set for
//! `expiry - lead_time`, and a fallback interval that refreshes only once
//! the cached token has actually expired. The fallback is the recovery path
//! when the one-shot is missed, for example across a suspend and resume, or
//! after a failed refresh, which does not re-arm the one-shot.

use std::time::Duration;

use furrow_clock::DurationSecs;
use serde::Deserialize;

use crate::{
    token::{ParseFailure, ParsedClaims, LEAD_TIME},
    TemplateName,
};

/// Settings for keeping a session's token fresh
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// The identity-provider template used to mint tokens
    pub template: TemplateName,
    /// How long before expiry the one-shot refresh fires
    pub lead_time: DurationSecs,
    /// The period of the fallback interval
    pub fallback_period: DurationSecs,
    /// The shortest delay a refresh may re-arm the one-shot with
    pub min_rearm_delay: DurationSecs,
    /// How long to wait on the identity provider before giving up
    pub fetch_timeout: DurationSecs,
}

impl Default for RefreshConfig {
    /// Default refresh configuration
    ///
    /// Uses the `backend` template, a 300 second lead time, a 5 minute
    /// fallback interval, a 10 second re-arm floor and a 30 second fetch
    /// timeout.
    fn default() -> Self {
        Self {
            template: TemplateName::from_static("backend"),
            lead_time: LEAD_TIME,
            fallback_period: DurationSecs(300),
            min_rearm_delay: DurationSecs(10),
            fetch_timeout: DurationSecs(30),
        }
    }
}

impl RefreshConfig {
    /// Uses a different identity-provider template
    pub fn with_template(mut self, template: impl Into<TemplateName>) -> Self {
        self.template = template.into();
        self
    }

    /// Sets the lead time before expiry
    pub fn with_lead_time(mut self, lead_time: DurationSecs) -> Self {
        self.lead_time = lead_time;
        self
    }

    /// Sets the fallback interval period
    pub fn with_fallback_period(mut self, period: DurationSecs) -> Self {
        self.fallback_period = period;
        self
    }

    /// Sets the floor for one-shot delays re-armed after a refresh
    pub fn with_min_rearm_delay(mut self, delay: DurationSecs) -> Self {
        self.min_rearm_delay = delay;
        self
    }

    /// Sets the identity-provider fetch timeout
    pub fn with_fetch_timeout(mut self, timeout: DurationSecs) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Raises a zero fallback period or re-arm floor to one second
    ///
    /// Timers cannot tick with a zero period, and a zero re-arm floor allows
    /// back-to-back refreshes of a token issued inside the lead window.
    pub fn clamped(mut self) -> Self {
        if self.fallback_period < MIN_PERIOD {
            tracing::warn!(
                fallback_period = self.fallback_period.0,
                "fallback period must be at least one second, clamping"
            );
            self.fallback_period = MIN_PERIOD;
        }

        if self.min_rearm_delay < MIN_PERIOD {
            tracing::warn!(
                min_rearm_delay = self.min_rearm_delay.0,
                "re-arm floor must be at least one second, clamping"
            );
            self.min_rearm_delay = MIN_PERIOD;
        }

        self
    }
}

const MIN_PERIOD: DurationSecs = DurationSecs(1);

/// The lifecycle state of a refresh scheduler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    /// Never initialized, or initialization found no token
    Uninitialized,
    /// Fetching the first token
    Initializing,
    /// Waiting for a trigger
    Armed,
    /// Fetching a replacement token
    Refreshing,
    /// Timers cancelled; may be initialized again
    TornDown,
}

/// What woke the scheduler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// The one-shot timer armed from the token's expiry
    OneShot,
    /// The periodic fallback interval
    Fallback,
}

/// The refresh decision logic, independent of any timers
#[derive(Debug)]
pub struct RefreshScheduler {
    state: SchedulerState,
    lead_time: DurationSecs,
    min_rearm_delay: DurationSecs,
}

impl RefreshScheduler {
    /// Constructs a new, uninitialized scheduler
    pub fn new(config: &RefreshConfig) -> Self {
        Self {
            state: SchedulerState::Uninitialized,
            lead_time: config.lead_time,
            min_rearm_delay: config.min_rearm_delay,
        }
    }

    /// The current state
    #[inline]
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Whether the scheduler is between initialization and teardown
    pub fn is_initialized(&self) -> bool {
        matches!(
            self.state,
            SchedulerState::Initializing | SchedulerState::Armed | SchedulerState::Refreshing
        )
    }

    /// Starts initialization
    ///
    /// Returns `false`, changing nothing, if the scheduler is already
    /// initialized or initializing.
    pub fn begin_initialize(&mut self) -> bool {
        match self.state {
            SchedulerState::Uninitialized | SchedulerState::TornDown => {
                self.state = SchedulerState::Initializing;
                true
            }
            _ => false,
        }
    }

    /// Records a freshly fetched token and returns the one-shot delay to arm
    ///
    /// A zero delay on initialization means "refresh now". After a refresh
    /// the delay is never shorter than the configured re-arm floor, so a
    /// token issued with less than the lead time remaining cannot cause a
    /// tight refresh loop. Returns `None` if no fetch was in progress.
    pub fn token_fetched(
        &mut self,
        claims: &Result<ParsedClaims, ParseFailure>,
    ) -> Option<Duration> {
        let delay = one_shot_delay(claims, self.lead_time);
        let delay = match self.state {
            SchedulerState::Initializing => delay,
            SchedulerState::Refreshing => delay.max(self.min_rearm_delay.into()),
            _ => return None,
        };

        self.state = SchedulerState::Armed;
        Some(delay)
    }

    /// Records a failed or empty token fetch
    ///
    /// A failed initialization leaves the scheduler uninitialized. A failed
    /// refresh returns to waiting without re-arming anything.
    pub fn fetch_failed(&mut self) {
        self.state = match self.state {
            SchedulerState::Initializing => SchedulerState::Uninitialized,
            SchedulerState::Refreshing => SchedulerState::Armed,
            other => other,
        };
    }

    /// Decides whether a timer firing should start a refresh
    ///
    /// The one-shot always refreshes. The fallback interval refreshes only
    /// when the cached token has expired.
    pub fn timer_fired(&mut self, trigger: Trigger, cached_token_expired: bool) -> bool {
        if self.state != SchedulerState::Armed {
            return false;
        }

        let refresh = match trigger {
            Trigger::OneShot => true,
            Trigger::Fallback => cached_token_expired,
        };

        if refresh {
            self.state = SchedulerState::Refreshing;
        }

        refresh
    }

    /// Records teardown; safe from any state
    pub fn torn_down(&mut self) {
        self.state = SchedulerState::TornDown;
    }
}

/// The delay until a token enters its lead window
///
/// Unreadable tokens and tokens already inside the window are due now.
pub fn one_shot_delay(
    claims: &Result<ParsedClaims, ParseFailure>,
    lead_time: DurationSecs,
) -> Duration {
    match claims {
        Ok(claims) => {
            let lead = i64::try_from(lead_time.0).unwrap_or(i64::MAX);
            let secs = claims.seconds_until_expiry().saturating_sub(lead);
            Duration::from_secs(u64::try_from(secs).unwrap_or(0))
        }
        Err(_) => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use furrow_clock::{TestClock, UnixTime};

    use super::*;
    use crate::{token, token::tests::token_expiring_at, Token};

    const NOW: UnixTime = UnixTime(1_700_000_000);

    fn claims_expiring_in(secs: u64) -> Result<ParsedClaims, ParseFailure> {
        let clock = TestClock::new(NOW);
        token::parse(&token_expiring_at(NOW + DurationSecs(secs)), &clock)
    }

    fn unreadable() -> Result<ParsedClaims, ParseFailure> {
        token::parse(&Token::from_static("not-a-jwt"), &TestClock::new(NOW))
    }

    fn armed_scheduler() -> RefreshScheduler {
        let mut scheduler = RefreshScheduler::new(&RefreshConfig::default());
        assert!(scheduler.begin_initialize());
        scheduler.token_fetched(&claims_expiring_in(3_600)).unwrap();
        scheduler
    }

    #[test]
    fn delay_is_expiry_minus_lead_time() {
        assert_eq!(
            one_shot_delay(&claims_expiring_in(400), LEAD_TIME),
            Duration::from_secs(100)
        );
        assert_eq!(
            one_shot_delay(&claims_expiring_in(300), LEAD_TIME),
            Duration::ZERO
        );
        assert_eq!(
            one_shot_delay(&claims_expiring_in(0), LEAD_TIME),
            Duration::ZERO
        );
        assert_eq!(one_shot_delay(&unreadable(), LEAD_TIME), Duration::ZERO);
    }

    #[test]
    fn initialization_is_guarded() {
        let mut scheduler = RefreshScheduler::new(&RefreshConfig::default());

        assert!(scheduler.begin_initialize());
        assert!(!scheduler.begin_initialize());
        assert_eq!(scheduler.state(), SchedulerState::Initializing);
        assert!(scheduler.is_initialized());
    }

    #[test]
    fn first_token_arms_the_one_shot() {
        let mut scheduler = RefreshScheduler::new(&RefreshConfig::default());
        scheduler.begin_initialize();

        let delay = scheduler.token_fetched(&claims_expiring_in(400));

        assert_eq!(delay, Some(Duration::from_secs(100)));
        assert_eq!(scheduler.state(), SchedulerState::Armed);
    }

    #[test]
    fn nearly_expired_first_token_refreshes_immediately() {
        let mut scheduler = RefreshScheduler::new(&RefreshConfig::default());
        scheduler.begin_initialize();

        assert_eq!(
            scheduler.token_fetched(&claims_expiring_in(120)),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn failed_initialization_returns_to_uninitialized() {
        let mut scheduler = RefreshScheduler::new(&RefreshConfig::default());
        scheduler.begin_initialize();
        scheduler.fetch_failed();

        assert_eq!(scheduler.state(), SchedulerState::Uninitialized);
        assert!(scheduler.begin_initialize());
    }

    #[test]
    fn one_shot_always_refreshes() {
        let mut scheduler = armed_scheduler();

        assert!(scheduler.timer_fired(Trigger::OneShot, false));
        assert_eq!(scheduler.state(), SchedulerState::Refreshing);
    }

    #[test]
    fn fallback_refreshes_only_expired_tokens() {
        let mut scheduler = armed_scheduler();

        assert!(!scheduler.timer_fired(Trigger::Fallback, false));
        assert_eq!(scheduler.state(), SchedulerState::Armed);

        assert!(scheduler.timer_fired(Trigger::Fallback, true));
        assert_eq!(scheduler.state(), SchedulerState::Refreshing);
    }

    #[test]
    fn overlapping_triggers_start_one_refresh() {
        let mut scheduler = armed_scheduler();

        assert!(scheduler.timer_fired(Trigger::OneShot, true));
        assert!(!scheduler.timer_fired(Trigger::Fallback, true));
    }

    #[test]
    fn refresh_rearms_no_sooner_than_the_floor() {
        let mut scheduler = armed_scheduler();
        scheduler.timer_fired(Trigger::OneShot, false);

        let delay = scheduler.token_fetched(&claims_expiring_in(60));

        assert_eq!(delay, Some(Duration::from_secs(10)));
        assert_eq!(scheduler.state(), SchedulerState::Armed);
    }

    #[test]
    fn refresh_rearms_from_the_new_expiry() {
        let mut scheduler = armed_scheduler();
        scheduler.timer_fired(Trigger::OneShot, false);

        let delay = scheduler.token_fetched(&claims_expiring_in(3_600));

        assert_eq!(delay, Some(Duration::from_secs(3_300)));
    }

    #[test]
    fn failed_refresh_waits_for_the_next_trigger() {
        let mut scheduler = armed_scheduler();
        scheduler.timer_fired(Trigger::OneShot, false);
        scheduler.fetch_failed();

        assert_eq!(scheduler.state(), SchedulerState::Armed);
        assert!(scheduler.timer_fired(Trigger::Fallback, true));
    }

    #[test]
    fn token_outside_a_fetch_is_ignored() {
        let mut scheduler = armed_scheduler();

        assert_eq!(scheduler.token_fetched(&claims_expiring_in(3_600)), None);
        assert_eq!(scheduler.state(), SchedulerState::Armed);
    }

    #[test]
    fn torn_down_scheduler_ignores_timers_and_can_restart() {
        let mut scheduler = armed_scheduler();
        scheduler.torn_down();

        assert!(!scheduler.timer_fired(Trigger::OneShot, true));
        assert!(!scheduler.timer_fired(Trigger::Fallback, true));
        assert!(!scheduler.is_initialized());
        assert!(scheduler.begin_initialize());
    }

    #[test]
    fn teardown_is_safe_before_initialization() {
        let mut scheduler = RefreshScheduler::new(&RefreshConfig::default());
        scheduler.torn_down();

        assert_eq!(scheduler.state(), SchedulerState::TornDown);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: RefreshConfig =
            serde_json::from_str(r#"{ "template": "crops", "lead_time": 120 }"#).unwrap();

        assert_eq!(config.template, TemplateName::from_static("crops"));
        assert_eq!(config.lead_time, DurationSecs(120));
        assert_eq!(config.fallback_period, DurationSecs(300));
    }

    #[test]
    fn zero_periods_are_clamped_to_one_second() {
        let config = RefreshConfig::default()
            .with_fallback_period(DurationSecs(0))
            .with_min_rearm_delay(DurationSecs(0))
            .clamped();

        assert_eq!(config.fallback_period, DurationSecs(1));
        assert_eq!(config.min_rearm_delay, DurationSecs(1));
    }

    #[test]
    fn clamping_leaves_valid_periods_alone() {
        let config = RefreshConfig::default().clamped();

        assert_eq!(config.fallback_period, DurationSecs(300));
        assert_eq!(config.min_rearm_delay, DurationSecs(10));
    }

    #[test]
    fn clamped_floor_prevents_an_immediate_rearm() {
        let config = RefreshConfig::default()
            .with_min_rearm_delay(DurationSecs(0))
            .clamped();
        let mut scheduler = RefreshScheduler::new(&config);
        scheduler.begin_initialize();
        scheduler.token_fetched(&claims_expiring_in(3_600));
        assert!(scheduler.timer_fired(Trigger::OneShot, false));

        let delay = scheduler.token_fetched(&claims_expiring_in(60));

        assert_eq!(delay, Some(Duration::from_secs(1)));
    }
}
