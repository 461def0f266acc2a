//! Extraction of time-related claims from compact signed tokens
//!
//! The parser reads only the `exp` and `iat` claims out of the payload
//! segment so that refreshes can be scheduled. **No signature verification is
//! performed.** The claims are trusted only because the token is obtained
//! in-process from the identity provider's own client immediately before use;
//! nothing here may be used to make an authorization decision.
//!
//! ```
//! use furrow_clock::{TestClock, UnixTime};
//! use furrow_session::{token, Token};
//!
//! // {"exp":1600,"iat":1000}
//! let raw = Token::from_static("e30.eyJleHAiOjE2MDAsImlhdCI6MTAwMH0.c2ln");
//! let clock = TestClock::new(UnixTime(1_000));
//!
//! let claims = token::parse(&raw, &clock).unwrap();
//! assert_eq!(claims.seconds_until_expiry(), 600);
//! assert!(!claims.expires_soon());
//! ```

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use furrow_clock::{Clock, DurationSecs, UnixTime};
use serde::Deserialize;
use thiserror::Error;

use crate::TokenRef;

/// The margin before expiry at which a token is considered to be expiring soon
pub const LEAD_TIME: DurationSecs = DurationSecs(300);

const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// The token could not be read
///
/// Callers must treat an unreadable token as already expired.
#[derive(Debug, Error)]
pub enum ParseFailure {
    /// The token does not consist of three dot-separated segments
    #[error("token is not made up of three dot-separated segments (found {segments})")]
    Malformed {
        /// The number of segments found
        segments: usize,
    },
    /// The payload segment is not valid base64url
    #[error("token payload is not valid base64url")]
    Base64(#[from] base64::DecodeError),
    /// The payload does not contain the expected claims
    #[error("token payload does not contain readable claims")]
    Json(#[from] serde_json::Error),
}

impl ParseFailure {
    /// An unreadable token is always treated as expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        true
    }

    /// An unreadable token is always due for a refresh
    #[inline]
    pub fn expires_soon(&self) -> bool {
        true
    }

    /// An unreadable token has no time remaining
    #[inline]
    pub fn seconds_until_expiry(&self) -> i64 {
        0
    }

    /// The lifecycle status of an unreadable token
    #[inline]
    pub fn status(&self) -> TokenStatus {
        TokenStatus::Expired
    }
}

/// A token's lifecycle status relative to some point in time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid and outside the lead window
    Fresh,
    /// The token is valid, but within the lead window and due for a refresh
    ExpiringSoon,
    /// The token is no longer valid
    Expired,
}

#[derive(Deserialize)]
struct RawClaims {
    exp: f64,
    #[serde(default)]
    iat: Option<f64>,
}

/// The time-related claims carried by a token, independent of the current time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Claims {
    expires_at: UnixTime,
    issued_at: Option<UnixTime>,
}

impl Claims {
    /// The time at which the token expires
    #[inline]
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// The time at which the token was issued, if the token says
    #[inline]
    pub fn issued_at(&self) -> Option<UnixTime> {
        self.issued_at
    }

    /// Evaluates the claims as of `now`
    pub fn at(self, now: UnixTime) -> ParsedClaims {
        ParsedClaims {
            expires_at: self.expires_at,
            issued_at: self.issued_at,
            seconds_until_expiry: now.seconds_until(self.expires_at),
        }
    }
}

/// Claims evaluated against a particular moment
///
/// These are derived on demand and never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedClaims {
    expires_at: UnixTime,
    issued_at: Option<UnixTime>,
    seconds_until_expiry: i64,
}

impl ParsedClaims {
    /// The time at which the token expires
    #[inline]
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// The time at which the token was issued, if the token says
    #[inline]
    pub fn issued_at(&self) -> Option<UnixTime> {
        self.issued_at
    }

    /// Seconds remaining until expiry; negative once expired
    #[inline]
    pub fn seconds_until_expiry(&self) -> i64 {
        self.seconds_until_expiry
    }

    /// Whether the token has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.seconds_until_expiry <= 0
    }

    /// Whether the token will expire within [`LEAD_TIME`]
    #[inline]
    pub fn expires_soon(&self) -> bool {
        self.seconds_until_expiry < lead_secs(LEAD_TIME)
    }

    /// Whether the token will expire within an arbitrary lead time
    #[inline]
    pub fn expires_within(&self, lead_time: DurationSecs) -> bool {
        self.seconds_until_expiry < lead_secs(lead_time)
    }

    /// The token's lifecycle status
    pub fn status(&self) -> TokenStatus {
        if self.is_expired() {
            TokenStatus::Expired
        } else if self.expires_soon() {
            TokenStatus::ExpiringSoon
        } else {
            TokenStatus::Fresh
        }
    }
}

fn lead_secs(lead_time: DurationSecs) -> i64 {
    i64::try_from(lead_time.0).unwrap_or(i64::MAX)
}

/// Decodes the time-related claims from a token without checking its signature
pub fn decode(token: &TokenRef) -> Result<Claims, ParseFailure> {
    let segments: Vec<&str> = token.as_str().split('.').collect();
    let payload = match segments.as_slice() {
        [_, payload, _] => *payload,
        _ => {
            return Err(ParseFailure::Malformed {
                segments: segments.len(),
            })
        }
    };

    let raw = PAYLOAD_ENGINE.decode(payload)?;
    let claims: RawClaims = serde_json::from_slice(&raw)?;

    Ok(Claims {
        expires_at: numeric_date(claims.exp),
        issued_at: claims.iat.map(numeric_date),
    })
}

/// Parses a token's claims as of the time reported by `clock`
pub fn parse<C: Clock + ?Sized>(token: &TokenRef, clock: &C) -> Result<ParsedClaims, ParseFailure> {
    decode(token).map(|claims| claims.at(clock.now()))
}

/// Reduces a parse result to its lifecycle status, treating failures as expired
pub fn status_of(parsed: &Result<ParsedClaims, ParseFailure>) -> TokenStatus {
    match parsed {
        Ok(claims) => claims.status(),
        Err(failure) => failure.status(),
    }
}

fn numeric_date(value: f64) -> UnixTime {
    // Fractional dates are truncated; dates before the epoch clamp to it.
    if value.is_finite() && value > 0.0 {
        UnixTime(value.trunc() as u64)
    } else {
        UnixTime(0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use furrow_clock::TestClock;

    use super::*;
    use crate::Token;

    pub(crate) fn token_with_payload(payload: &str) -> Token {
        Token::new(format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(payload),
            URL_SAFE_NO_PAD.encode("not-a-real-signature"),
        ))
    }

    pub(crate) fn token_expiring_at(exp: UnixTime) -> Token {
        token_with_payload(&format!(
            r#"{{"exp":{},"iat":{},"sub":"user_2abc"}}"#,
            exp.0,
            exp.0.saturating_sub(3_600)
        ))
    }

    const NOW: UnixTime = UnixTime(1_700_000_000);

    #[test]
    fn token_with_ten_minutes_left_is_fresh() {
        let clock = TestClock::new(NOW);
        let claims = parse(&token_expiring_at(NOW + DurationSecs(600)), &clock).unwrap();

        assert_eq!(claims.seconds_until_expiry(), 600);
        assert!(!claims.expires_soon());
        assert!(!claims.is_expired());
        assert_eq!(claims.status(), TokenStatus::Fresh);
        assert_eq!(claims.issued_at(), Some(UnixTime(NOW.0 + 600 - 3_600)));
    }

    #[test]
    fn token_with_one_minute_left_expires_soon() {
        let clock = TestClock::new(NOW);
        let claims = parse(&token_expiring_at(NOW + DurationSecs(60)), &clock).unwrap();

        assert_eq!(claims.seconds_until_expiry(), 60);
        assert!(claims.expires_soon());
        assert!(!claims.is_expired());
        assert_eq!(claims.status(), TokenStatus::ExpiringSoon);
    }

    #[test]
    fn token_is_expired_at_its_expiry_instant() {
        let clock = TestClock::new(NOW);
        let claims = parse(&token_expiring_at(NOW), &clock).unwrap();

        assert_eq!(claims.seconds_until_expiry(), 0);
        assert!(claims.is_expired());
    }

    #[test]
    fn token_in_the_past_has_negative_time_remaining() {
        let clock = TestClock::new(NOW);
        let claims = parse(&token_expiring_at(NOW - DurationSecs(90)), &clock).unwrap();

        assert_eq!(claims.seconds_until_expiry(), -90);
        assert_eq!(claims.status(), TokenStatus::Expired);
    }

    #[test]
    fn claims_are_recomputed_as_time_passes() {
        let clock = TestClock::new(NOW);
        let token = token_expiring_at(NOW + DurationSecs(600));

        assert_eq!(status_of(&parse(&token, &clock)), TokenStatus::Fresh);
        clock.inc(400);
        assert_eq!(status_of(&parse(&token, &clock)), TokenStatus::ExpiringSoon);
        clock.inc(200);
        assert_eq!(status_of(&parse(&token, &clock)), TokenStatus::Expired);
    }

    #[test]
    fn padded_payloads_are_accepted() {
        let token = Token::from_static("e30.eyJleHAiOjE2MDAwfQ.c2ln");
        let padded = Token::from_static("e30.eyJleHAiOjE2MDAwfQ==.c2ln");

        assert_eq!(decode(&token).unwrap().expires_at(), UnixTime(16_000));
        assert_eq!(decode(&padded).unwrap().expires_at(), UnixTime(16_000));
    }

    #[test]
    fn missing_issued_at_is_tolerated() {
        let claims = decode(&token_with_payload(r#"{"exp":1600}"#)).unwrap();
        assert_eq!(claims.issued_at(), None);
    }

    #[test]
    fn fractional_dates_are_truncated() {
        let claims = decode(&token_with_payload(r#"{"exp":1600.9,"iat":1000.2}"#)).unwrap();
        assert_eq!(claims.expires_at(), UnixTime(1_600));
        assert_eq!(claims.issued_at(), Some(UnixTime(1_000)));
    }

    mod when_token_cannot_be_read {
        use super::*;

        #[test]
        fn not_a_jwt_is_treated_as_expired() {
            let clock = TestClock::new(NOW);
            let parsed = parse(&Token::from_static("not-a-jwt"), &clock);

            assert!(matches!(parsed, Err(ParseFailure::Malformed { segments: 1 })));
            assert_eq!(status_of(&parsed), TokenStatus::Expired);
            let failure = parsed.unwrap_err();
            assert!(failure.is_expired());
            assert!(failure.expires_soon());
            assert_eq!(failure.seconds_until_expiry(), 0);
        }

        #[test]
        fn payload_must_be_base64() {
            let parsed = decode(&Token::from_static("a.!!!.c"));
            assert!(matches!(parsed, Err(ParseFailure::Base64(_))));
        }

        #[test]
        fn payload_must_be_json() {
            let parsed = decode(&token_with_payload("exp=1600"));
            assert!(matches!(parsed, Err(ParseFailure::Json(_))));
        }

        #[test]
        fn payload_must_carry_an_expiry() {
            let parsed = decode(&token_with_payload(r#"{"iat":1000}"#));
            assert!(matches!(parsed, Err(ParseFailure::Json(_))));
        }

        #[test]
        fn extra_segments_are_rejected() {
            let parsed = decode(&Token::from_static("a.b.c.d.e"));
            assert!(matches!(parsed, Err(ParseFailure::Malformed { segments: 5 })));
        }
    }
}
