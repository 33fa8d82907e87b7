// The prefixes provide type safety: an opaque credential can never be
// mistaken for one of another kind.

pub const DEVICE_ID_PREFIX: &str = "dev-";
pub const DEVICE_ID_LENGTH: usize = 24;

pub const SESSION_ID_PREFIX: &str = "ses-";
pub const SESSION_ID_LENGTH: usize = 24;

pub const REQUEST_ID_PREFIX: &str = "req-";
pub const REQUEST_ID_LENGTH: usize = 32;

pub const CODE_PREFIX: &str = "cod-";
pub const CODE_LENGTH: usize = 48;

// Doubles as the `jti` of issued JWT access tokens.
pub const TOKEN_ID_PREFIX: &str = "tok-";
pub const TOKEN_ID_LENGTH: usize = 32;

pub const REFRESH_TOKEN_PREFIX: &str = "ref-";
pub const REFRESH_TOKEN_LENGTH: usize = 48;

pub const SECOND: u64 = 1000;
pub const MINUTE: u64 = 60 * SECOND;
pub const HOUR: u64 = 60 * MINUTE;
pub const DAY: u64 = 24 * HOUR;
pub const WEEK: u64 = 7 * DAY;
pub const YEAR: u64 = 365 * DAY;
pub const MONTH: u64 = YEAR / 12;

/// 7 days
pub const AUTHENTICATION_MAX_AGE: u64 = 7 * DAY;

/// 60 minutes
pub const TOKEN_MAX_AGE: u64 = 60 * MINUTE;

/// 5 minutes
pub const PAR_EXPIRES_IN: u64 = 5 * MINUTE;

/// 5 minutes
pub const AUTHORIZATION_INACTIVITY_TIMEOUT: u64 = 5 * MINUTE;

/// 1 minute. An authorization code must be redeemed promptly.
pub const CODE_EXPIRES_IN: u64 = MINUTE;

/// 59 seconds (should be less than a minute)
///
/// <https://datatracker.ietf.org/doc/html/rfc9101#section-10.2>
pub const JAR_MAX_AGE: u64 = 59 * SECOND;

/// 1 minute
pub const CLIENT_ASSERTION_MAX_AGE: u64 = MINUTE;

/// 3 minutes
pub const DPOP_NONCE_MAX_AGE: u64 = 3 * MINUTE;

/// 5 seconds
pub const SESSION_FIXATION_MAX_AGE: u64 = 5 * SECOND;

/// 1 day
pub const CODE_CHALLENGE_REPLAY_TIMEFRAME: u64 = DAY;

/// 1 month
pub const AUTHENTICATED_REFRESH_INACTIVITY_TIMEOUT: u64 = MONTH;

/// 1 year
pub const AUTHENTICATED_REFRESH_LIFETIME: u64 = YEAR;

/// 2 days
pub const UNAUTHENTICATED_REFRESH_INACTIVITY_TIMEOUT: u64 = 2 * DAY;

/// 1 week
pub const UNAUTHENTICATED_REFRESH_LIFETIME: u64 = WEEK;

/// Leeway applied when validating `exp` / `iat` / `nbf` of inbound JWTs.
pub const JWT_CLOCK_TOLERANCE: u64 = 30 * SECOND;

/// Minimum elapsed time for a sign-in attempt, successful or not.
pub const SIGN_IN_TIMING_FLOOR: u64 = 400;

/// Minimum elapsed time for an introspection response, active or not.
pub const INTROSPECTION_TIMING_FLOOR: u64 = 750;
