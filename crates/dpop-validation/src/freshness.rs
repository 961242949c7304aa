//! Time-window arithmetic shared by `iat` and server nonce checks

use std::fmt;
use std::time::Duration;

use tracing::debug;

/// Which edge of the validity window a timestamp fell outside of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationFailure {
    /// `now > issued_at + validity + skew`
    Expired,
    /// The timestamp lies further in the future than the skew permits
    TooFarInFuture,
}

impl fmt::Display for ExpirationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => write!(f, "Expiration has already happened"),
            Self::TooFarInFuture => write!(f, "Creation time was too far in the future"),
        }
    }
}

/// Locate `issued_at` relative to the window `[issued_at - skew, issued_at + validity + skew]`
///
/// Both edges are inclusive. With `skew == 0` any timestamp later than `now`
/// is rejected while `now == issued_at` passes. Timestamps are Unix seconds,
/// so sub-second parts of `validity` and `skew` are ignored.
pub fn check_expiration(
    now: i64,
    validity: Duration,
    skew: Duration,
    issued_at: i64,
) -> Result<(), ExpirationFailure> {
    let validity = saturating_secs(validity);
    let skew = saturating_secs(skew);

    if now > issued_at.saturating_add(validity).saturating_add(skew) {
        return Err(ExpirationFailure::Expired);
    }

    let too_new = if skew > 0 {
        now < issued_at.saturating_sub(skew)
    } else {
        now < issued_at
    };
    if too_new {
        return Err(ExpirationFailure::TooFarInFuture);
    }

    Ok(())
}

/// `true` when `issued_at` is outside the accepted window at time `now`
///
/// The failing boundary is traced; the verdict is the only output.
pub fn is_expired(now: i64, validity: Duration, skew: Duration, issued_at: i64) -> bool {
    match check_expiration(now, validity, skew, issued_at) {
        Ok(()) => false,
        Err(failure) => {
            debug!(
                now,
                issued_at,
                validity_secs = validity.as_secs(),
                skew_secs = skew.as_secs(),
                boundary = %failure,
                "{failure}"
            );
            true
        }
    }
}

fn saturating_secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}
