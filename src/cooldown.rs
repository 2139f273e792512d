// src/cooldown.rs
use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// Per-rule cooldown gate.
/// - A rule that never fired is never cooling down.
/// - Inside `cooldown_minutes` since the last firing, the rule is suppressed.
/// - A clock that moved backwards (negative elapsed) counts as still cooling down.
/// - State is updated explicitly via `record`.
#[derive(Debug, Clone, Default)]
pub struct CooldownTracker {
    last_fired: HashMap<String, DateTime<Utc>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `rule_id` is still cooling down at `now`. Does NOT mutate state.
    pub fn is_cooling_down(
        &self,
        rule_id: &str,
        cooldown_minutes: u32,
        now: DateTime<Utc>,
    ) -> bool {
        match self.last_fired.get(rule_id) {
            None => false,
            Some(last) => {
                let elapsed = now.signed_duration_since(*last);
                elapsed < Duration::zero()
                    || elapsed < Duration::minutes(i64::from(cooldown_minutes))
            }
        }
    }

    /// Time left before `rule_id` may fire again; `None` when it may fire now.
    pub fn remaining(
        &self,
        rule_id: &str,
        cooldown_minutes: u32,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let last = *self.last_fired.get(rule_id)?;
        // Computed on durations so a firing recorded near the end of the
        // representable range cannot overflow a timestamp.
        let window = Duration::minutes(i64::from(cooldown_minutes));
        if now < last {
            // Clock went backwards: report the full window from the recorded firing.
            return Some(window.max(Duration::seconds(1)));
        }
        let left = window - now.signed_duration_since(last);
        (left > Duration::zero()).then_some(left)
    }

    /// Record that `rule_id` fired at `now`.
    pub fn record(&mut self, rule_id: &str, now: DateTime<Utc>) {
        self.last_fired.insert(rule_id.to_string(), now);
    }

    pub fn last_fired(&self, rule_id: &str) -> Option<DateTime<Utc>> {
        self.last_fired.get(rule_id).copied()
    }

    /// Returns true if an entry was removed.
    pub fn clear(&mut self, rule_id: &str) -> bool {
        self.last_fired.remove(rule_id).is_some()
    }

    /// Drop entries for rules that are no longer known.
    pub fn retain_rules<F: Fn(&str) -> bool>(&mut self, keep: F) {
        self.last_fired.retain(|id, _| keep(id));
    }

    pub fn len(&self) -> usize {
        self.last_fired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_fired.is_empty()
    }

    /// Sorted snapshot, handy for diffs in tests and the admin surface.
    pub fn snapshot(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut v: Vec<_> = self
            .last_fired
            .iter()
            .map(|(k, t)| (k.clone(), *t))
            .collect();
        v.sort();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap()
    }

    #[test]
    fn first_firing_passes() {
        let cd = CooldownTracker::new();
        assert!(!cd.is_cooling_down("r", 30, t0()));
        assert!(cd.remaining("r", 30, t0()).is_none());
    }

    #[test]
    fn inside_cooldown_blocked() {
        let mut cd = CooldownTracker::new();
        cd.record("r", t0());
        let t1 = t0() + Duration::minutes(29) + Duration::seconds(59);
        assert!(cd.is_cooling_down("r", 30, t1));
        assert_eq!(cd.remaining("r", 30, t1), Some(Duration::seconds(1)));
    }

    #[test]
    fn boundary_passes() {
        let mut cd = CooldownTracker::new();
        cd.record("r", t0());
        assert!(!cd.is_cooling_down("r", 30, t0() + Duration::minutes(30)));
    }

    #[test]
    fn zero_cooldown_allows_same_instant() {
        let mut cd = CooldownTracker::new();
        cd.record("r", t0());
        assert!(!cd.is_cooling_down("r", 0, t0()));
    }

    #[test]
    fn clock_going_backwards_stays_blocked() {
        let mut cd = CooldownTracker::new();
        cd.record("r", t0());
        let earlier = t0() - Duration::hours(5);
        assert!(cd.is_cooling_down("r", 0, earlier));
        assert!(cd.is_cooling_down("r", 30, earlier));
        assert!(cd.remaining("r", 30, earlier).is_some());
    }

    #[test]
    fn firing_at_end_of_time_stays_blocked() {
        let mut cd = CooldownTracker::new();
        let last = DateTime::<Utc>::MAX_UTC - Duration::minutes(1);
        cd.record("r", last);
        assert!(cd.is_cooling_down("r", 30, last));
        assert_eq!(cd.remaining("r", 30, last), Some(Duration::minutes(30)));
        assert_eq!(
            cd.remaining("r", 30, DateTime::<Utc>::MAX_UTC),
            Some(Duration::minutes(29))
        );
        assert!(cd.remaining("r", 0, last).is_none());
    }

    #[test]
    fn clear_and_retain() {
        let mut cd = CooldownTracker::new();
        cd.record("a", t0());
        cd.record("b", t0());
        assert!(cd.clear("a"));
        assert!(!cd.clear("a"));
        cd.retain_rules(|id| id != "b");
        assert!(cd.is_empty());
    }
}
