use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::topology::Delay;

/// Results older than this are considered stale
pub const FRESHNESS_WINDOW_SECS: i64 = 120;

/// Last benchmark of one policy, keyed by policy hash
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyBenchmark {
    #[serde(rename = "lastTestScoreInMS", default)]
    pub last_test_score_in_ms: f64,
    #[serde(default)]
    pub last_test_error_message: Option<String>,
    /// Seconds since the Unix epoch
    #[serde(default)]
    pub last_test_date: f64,
}

impl PolicyBenchmark {
    pub fn delay(&self) -> Delay {
        let failed = self
            .last_test_error_message
            .as_deref()
            .map(|message| !message.is_empty())
            .unwrap_or(false);
        if self.last_test_score_in_ms == 0.0 && failed {
            Delay::NO_DATA
        } else {
            Delay::from_raw(self.last_test_score_in_ms.round() as i64)
        }
    }

    pub fn tested_at(&self) -> Option<DateTime<Utc>> {
        if self.last_test_date <= 0.0 {
            return None;
        }
        DateTime::from_timestamp_millis((self.last_test_date * 1000.0) as i64)
    }

    /// Unknown, timed out, or older than the freshness window.
    pub fn needs_retest(&self, now: DateTime<Utc>) -> bool {
        if self.delay().raw() <= 0 {
            return true;
        }
        match self.tested_at() {
            Some(at) => (now - at).num_seconds() > FRESHNESS_WINDOW_SECS,
            None => true,
        }
    }
}

/// Strip an optional `prefix:` from a benchmark key.
pub fn normalize_policy_hash(key: &str) -> &str {
    key.rsplit_once(':').map(|(_, hash)| hash).unwrap_or(key)
}

/// Benchmark results re-keyed by bare policy hash
pub fn normalize_benchmarks(
    raw: HashMap<String, PolicyBenchmark>,
) -> HashMap<String, PolicyBenchmark> {
    raw.into_iter()
        .map(|(key, benchmark)| (normalize_policy_hash(&key).to_string(), benchmark))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bench(score: f64, error: Option<&str>, age_secs: i64) -> PolicyBenchmark {
        let now = Utc::now();
        PolicyBenchmark {
            last_test_score_in_ms: score,
            last_test_error_message: error.map(str::to_string),
            last_test_date: (now - Duration::seconds(age_secs)).timestamp() as f64,
        }
    }

    #[test]
    fn test_delay_derivation() {
        assert_eq!(bench(0.0, Some("timeout"), 0).delay(), Delay::NO_DATA);
        assert_eq!(bench(0.0, None, 0).delay(), Delay::TIMED_OUT);
        assert_eq!(bench(87.6, None, 0).delay(), Delay::ms(88));
    }

    #[test]
    fn test_needs_retest() {
        let now = Utc::now();
        assert!(!bench(80.0, None, 30).needs_retest(now));
        assert!(bench(80.0, None, 300).needs_retest(now));
        assert!(bench(0.0, Some("failed"), 1).needs_retest(now));
    }

    #[test]
    fn test_decode_and_normalize() {
        let raw = r#"{
            "policy:9f8e": {"lastTestScoreInMS": 120.0, "lastTestErrorMessage": null, "lastTestDate": 1700000000.5},
            "abcd": {"lastTestScoreInMS": 0, "lastTestErrorMessage": "timeout", "lastTestDate": 0}
        }"#;
        let decoded: HashMap<String, PolicyBenchmark> = serde_json::from_str(raw).unwrap();
        let normalized = normalize_benchmarks(decoded);
        assert_eq!(normalized["9f8e"].delay(), Delay::ms(120));
        assert_eq!(normalized["abcd"].tested_at(), None);
    }
}
