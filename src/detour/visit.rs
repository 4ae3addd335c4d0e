//! Per-host visit counters and the hysteresis predicates built on them

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};

/// `blocked - direct` at or above this classifies a host as blocked
pub const DEFAULT_BLOCKED_DELTA: i8 = 2;
/// `direct - blocked` at or above this classifies a host as direct
pub const DEFAULT_DIRECT_DELTA: i8 = 2;

/// Hysteresis thresholds for the two predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub blocked_delta: i8,
    pub direct_delta: i8,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            blocked_delta: DEFAULT_BLOCKED_DELTA,
            direct_delta: DEFAULT_DIRECT_DELTA,
        }
    }
}

/// Outcome counters for one host.
///
/// Both counters are non-negative and saturate at `i8::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitCounter {
    /// Successful direct connections
    #[serde(default)]
    pub direct: i8,
    /// Successful detoured connections
    #[serde(rename = "block", default)]
    pub blocked: i8,
    /// Day of the most recent update
    #[serde(rename = "recent", with = "date_format", default = "today")]
    pub last_seen: NaiveDate,
}

impl VisitCounter {
    pub fn new() -> Self {
        Self::with_counts(0, 0)
    }

    pub fn with_counts(direct: i8, blocked: i8) -> Self {
        Self {
            direct: direct.max(0),
            blocked: blocked.max(0),
            last_seen: today(),
        }
    }

    /// A clean direct connection: the host is reachable right now, so all
    /// accumulated blocked evidence is dropped.
    pub fn record_direct(&mut self) {
        self.direct = self.direct.saturating_add(1);
        self.blocked = 0;
        self.last_seen = today();
    }

    /// A clean detoured connection. Leaves `direct` untouched.
    pub fn record_blocked(&mut self) {
        self.blocked = self.blocked.saturating_add(1);
        self.last_seen = today();
    }

    pub fn as_blocked(&self, blocked_delta: i8) -> bool {
        i16::from(self.blocked) - i16::from(self.direct) >= i16::from(blocked_delta)
    }

    pub fn as_direct(&self, direct_delta: i8) -> bool {
        self.blocked == 0 || i16::from(self.direct) - i16::from(self.blocked) >= i16::from(direct_delta)
    }

    /// Ever detoured since the last clean direct visit
    pub fn once_blocked(&self) -> bool {
        self.blocked > 0
    }

    /// Carries no information and is never persisted
    pub fn is_empty(&self) -> bool {
        self.direct == 0 && self.blocked == 0
    }

    pub fn is_stale(&self, now: NaiveDate, max_age_days: u32) -> bool {
        (now - self.last_seen).num_days() > i64::from(max_age_days)
    }

    /// Clamp counters that came from disk back into range
    pub(crate) fn normalize(&mut self) {
        self.direct = self.direct.max(0);
        self.blocked = self.blocked.max(0);
    }
}

impl Default for VisitCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Day-precision dates stored as `YYYY-MM-DD`
pub(crate) mod date_format {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d";

    pub fn serialize<S>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&date.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveDate::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_counter_is_direct() {
        let vc = VisitCounter::new();
        assert!(vc.is_empty());
        assert!(vc.as_direct(DEFAULT_DIRECT_DELTA));
        assert!(!vc.as_blocked(DEFAULT_BLOCKED_DELTA));
        assert!(!vc.once_blocked());
    }

    #[test]
    fn test_blocked_after_delta_detours() {
        let mut vc = VisitCounter::new();
        vc.record_blocked();
        assert!(!vc.as_blocked(DEFAULT_BLOCKED_DELTA));
        assert!(!vc.as_direct(DEFAULT_DIRECT_DELTA));
        vc.record_blocked();
        assert!(vc.as_blocked(DEFAULT_BLOCKED_DELTA));
        assert!(vc.once_blocked());
    }

    #[test]
    fn test_direct_visit_clears_blocked() {
        let mut vc = VisitCounter::with_counts(1, 5);
        assert!(vc.as_blocked(DEFAULT_BLOCKED_DELTA));

        vc.record_direct();
        assert_eq!(vc.blocked, 0);
        assert_eq!(vc.direct, 2);
        assert!(!vc.as_blocked(DEFAULT_BLOCKED_DELTA));
        assert!(vc.as_direct(DEFAULT_DIRECT_DELTA));
    }

    #[test]
    fn test_proxy_visit_keeps_direct() {
        let mut vc = VisitCounter::with_counts(3, 0);
        vc.record_blocked();
        assert_eq!(vc.direct, 3);
        assert_eq!(vc.blocked, 1);
        // 3 - 1 >= 2
        assert!(vc.as_direct(DEFAULT_DIRECT_DELTA));
    }

    #[test]
    fn test_counters_saturate() {
        let mut vc = VisitCounter::with_counts(i8::MAX, 0);
        vc.record_direct();
        assert_eq!(vc.direct, i8::MAX);

        let mut vc = VisitCounter::with_counts(0, i8::MAX);
        vc.record_blocked();
        assert_eq!(vc.blocked, i8::MAX);
        assert!(vc.as_blocked(DEFAULT_BLOCKED_DELTA));
    }

    #[test]
    fn test_custom_thresholds() {
        let vc = VisitCounter::with_counts(0, 2);
        assert!(vc.as_blocked(2));
        assert!(!vc.as_blocked(3));
    }

    #[test]
    fn test_staleness() {
        let mut vc = VisitCounter::with_counts(1, 0);
        vc.last_seen = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let now = NaiveDate::from_ymd_opt(2024, 1, 12).unwrap();
        assert!(vc.is_stale(now, 10));
        assert!(!vc.is_stale(now, 11));
    }

    #[test]
    fn test_json_format() {
        let vc: VisitCounter =
            serde_json::from_str(r#"{"direct": 2, "block": 1, "recent": "2024-03-05"}"#).unwrap();
        assert_eq!(vc.direct, 2);
        assert_eq!(vc.blocked, 1);
        assert_eq!(vc.last_seen, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());

        let json = serde_json::to_string(&vc).unwrap();
        assert!(json.contains(r#""recent":"2024-03-05""#));
        assert!(json.contains(r#""block":1"#));
    }

    #[test]
    fn test_missing_fields_default() {
        let vc: VisitCounter = serde_json::from_str(r#"{"block": 3, "extra": true}"#).unwrap();
        assert_eq!(vc.direct, 0);
        assert_eq!(vc.blocked, 3);
    }

    #[test]
    fn test_malformed_date_rejected() {
        let result: Result<VisitCounter, _> =
            serde_json::from_str(r#"{"direct": 1, "block": 0, "recent": "05/03/2024"}"#);
        assert!(result.is_err());
    }
}
