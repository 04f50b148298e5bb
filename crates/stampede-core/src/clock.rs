//! Time plumbing: duration-string parsing, think-time sampling, and
//! cancellation-aware sleeps used throughout the engine.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// DurationSpec
// ---------------------------------------------------------------------------

/// A duration as it appears in a test plan: either a bare number (seconds)
/// or a human-readable string such as `"500ms"` or `"5s"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationSpec {
    /// Plain number of seconds (fractions allowed).
    Seconds(f64),
    /// A humantime-formatted string, e.g. `"250ms"`, `"2s"`, `"1m 30s"`.
    Text(String),
}

impl DurationSpec {
    /// Resolve the spec into a concrete [`Duration`].
    ///
    /// Negative numbers and unparseable strings are config errors.
    pub fn as_duration(&self) -> Result<Duration, EngineError> {
        match self {
            DurationSpec::Seconds(secs) => {
                if *secs < 0.0 || !secs.is_finite() {
                    return Err(EngineError::Config(format!(
                        "invalid duration: {secs}"
                    )));
                }
                Ok(Duration::from_secs_f64(*secs))
            }
            DurationSpec::Text(s) => humantime::parse_duration(s.trim())
                .map_err(|e| EngineError::Config(format!("invalid duration \"{s}\": {e}"))),
        }
    }
}

impl From<Duration> for DurationSpec {
    fn from(d: Duration) -> Self {
        DurationSpec::Seconds(d.as_secs_f64())
    }
}

// ---------------------------------------------------------------------------
// ThinkTime
// ---------------------------------------------------------------------------

/// Fallback range used when a think-time string cannot be parsed.
const FALLBACK_MIN_MS: u64 = 1000;
const FALLBACK_MAX_MS: u64 = 3000;

/// A resolved think-time: either a fixed pause or a uniform range.
///
/// Plans may write a number (seconds), a single duration string (`"5s"`,
/// `"500ms"`) or a range (`"1-3s"`, `"100-500ms"`). Ranges sample uniformly
/// in milliseconds each time [`ThinkTime::sample`] is called.
#[derive(Debug, Clone, PartialEq)]
pub enum ThinkTime {
    Fixed(Duration),
    Range(Duration, Duration),
}

impl ThinkTime {
    /// Resolve a [`DurationSpec`]-shaped value leniently: on parse failure a
    /// warning is logged and the `[1s, 3s]` fallback range is used, matching
    /// the forgiving behaviour expected of pacing configuration.
    pub fn resolve(spec: &DurationSpec) -> ThinkTime {
        match spec {
            DurationSpec::Seconds(secs) if *secs >= 0.0 && secs.is_finite() => {
                ThinkTime::Fixed(Duration::from_secs_f64(*secs))
            }
            DurationSpec::Seconds(secs) => {
                tracing::warn!(value = *secs, "invalid think time, using 1-3s fallback");
                ThinkTime::Range(
                    Duration::from_millis(FALLBACK_MIN_MS),
                    Duration::from_millis(FALLBACK_MAX_MS),
                )
            }
            DurationSpec::Text(s) => Self::parse_str(s),
        }
    }

    fn parse_str(s: &str) -> ThinkTime {
        let s = s.trim();
        // Range form: "1-3s" / "100-500ms"; the unit lives on the upper bound.
        if let Some((lo, hi)) = s.split_once('-') {
            if let Ok(hi_dur) = humantime::parse_duration(hi.trim()) {
                let unit = hi.trim().trim_start_matches(|c: char| {
                    c.is_ascii_digit() || c == '.'
                });
                let lo_text = format!("{}{}", lo.trim(), unit);
                if let Ok(lo_dur) = humantime::parse_duration(&lo_text) {
                    if lo_dur <= hi_dur {
                        return ThinkTime::Range(lo_dur, hi_dur);
                    }
                }
            }
        } else if let Ok(dur) = humantime::parse_duration(s) {
            return ThinkTime::Fixed(dur);
        }

        tracing::warn!(value = %s, "unparseable think time, using 1-3s fallback");
        ThinkTime::Range(
            Duration::from_millis(FALLBACK_MIN_MS),
            Duration::from_millis(FALLBACK_MAX_MS),
        )
    }

    /// Produce the concrete pause for one application of this think time.
    pub fn sample(&self) -> Duration {
        match self {
            ThinkTime::Fixed(d) => *d,
            ThinkTime::Range(lo, hi) => {
                let lo_ms = lo.as_millis() as u64;
                let hi_ms = hi.as_millis() as u64;
                if hi_ms <= lo_ms {
                    return *lo;
                }
                Duration::from_millis(rand::thread_rng().gen_range(lo_ms..=hi_ms))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cancellable sleep
// ---------------------------------------------------------------------------

/// Sleep for `duration`, returning early if `cancel` fires.
///
/// Returns `true` when the full duration elapsed, `false` when cancelled.
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // DurationSpec
    // -----------------------------------------------------------------------

    #[test]
    fn duration_from_seconds_number() {
        let spec = DurationSpec::Seconds(2.5);
        assert_eq!(spec.as_duration().unwrap(), Duration::from_millis(2500));
    }

    #[test]
    fn duration_from_text() {
        let spec = DurationSpec::Text("300ms".to_string());
        assert_eq!(spec.as_duration().unwrap(), Duration::from_millis(300));
    }

    #[test]
    fn duration_negative_is_config_error() {
        let spec = DurationSpec::Seconds(-1.0);
        assert!(matches!(spec.as_duration(), Err(EngineError::Config(_))));
    }

    #[test]
    fn duration_bad_text_is_config_error() {
        let spec = DurationSpec::Text("not a duration".to_string());
        assert!(matches!(spec.as_duration(), Err(EngineError::Config(_))));
    }

    #[test]
    fn duration_spec_deserializes_number_and_string() {
        let n: DurationSpec = serde_json::from_str("5").unwrap();
        assert_eq!(n.as_duration().unwrap(), Duration::from_secs(5));
        let s: DurationSpec = serde_json::from_str("\"150ms\"").unwrap();
        assert_eq!(s.as_duration().unwrap(), Duration::from_millis(150));
    }

    // -----------------------------------------------------------------------
    // ThinkTime
    // -----------------------------------------------------------------------

    #[test]
    fn think_time_number_is_seconds() {
        let tt = ThinkTime::resolve(&DurationSpec::Seconds(2.0));
        assert_eq!(tt, ThinkTime::Fixed(Duration::from_secs(2)));
    }

    #[test]
    fn think_time_single_duration_string() {
        let tt = ThinkTime::resolve(&DurationSpec::Text("500ms".to_string()));
        assert_eq!(tt, ThinkTime::Fixed(Duration::from_millis(500)));
    }

    #[test]
    fn think_time_range_seconds() {
        let tt = ThinkTime::resolve(&DurationSpec::Text("1-3s".to_string()));
        assert_eq!(
            tt,
            ThinkTime::Range(Duration::from_secs(1), Duration::from_secs(3))
        );
    }

    #[test]
    fn think_time_range_millis() {
        let tt = ThinkTime::resolve(&DurationSpec::Text("100-500ms".to_string()));
        assert_eq!(
            tt,
            ThinkTime::Range(Duration::from_millis(100), Duration::from_millis(500))
        );
    }

    #[test]
    fn think_time_garbage_falls_back_to_default_range() {
        let tt = ThinkTime::resolve(&DurationSpec::Text("soon-ish".to_string()));
        assert_eq!(
            tt,
            ThinkTime::Range(Duration::from_millis(1000), Duration::from_millis(3000))
        );
    }

    #[test]
    fn think_time_inverted_range_falls_back() {
        let tt = ThinkTime::resolve(&DurationSpec::Text("5-2s".to_string()));
        assert_eq!(
            tt,
            ThinkTime::Range(Duration::from_millis(1000), Duration::from_millis(3000))
        );
    }

    #[test]
    fn sample_fixed_returns_exact_value() {
        let tt = ThinkTime::Fixed(Duration::from_millis(250));
        assert_eq!(tt.sample(), Duration::from_millis(250));
    }

    #[test]
    fn sample_range_stays_within_bounds() {
        let tt = ThinkTime::Range(Duration::from_millis(100), Duration::from_millis(500));
        for _ in 0..100 {
            let d = tt.sample();
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(500));
        }
    }

    // -----------------------------------------------------------------------
    // sleep_cancellable
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn sleep_completes_when_not_cancelled() {
        let cancel = CancellationToken::new();
        let completed = sleep_cancellable(Duration::from_millis(10), &cancel).await;
        assert!(completed);
    }

    #[tokio::test]
    async fn sleep_returns_false_when_cancelled() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            token.cancel();
        });
        let completed = sleep_cancellable(Duration::from_secs(5), &cancel).await;
        assert!(!completed);
    }

    #[tokio::test]
    async fn zero_sleep_respects_prior_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep_cancellable(Duration::ZERO, &cancel).await);
    }
}
