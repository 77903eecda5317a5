//! Eviction policy engine
//!
//! One policy engine drives every bounded level. A `put` that leaves a level
//! above its start ratio (by bytes) or above its element cap triggers a pass
//! that runs until both the byte and element hysteresis targets are met.
//! Victim selection is a pure function over an index snapshot so levels can
//! release their locks before acting on the plan.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// Which entries to favour for retention.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Favour recently touched entries: evict oldest access time first.
    #[default]
    Newest,
    /// Favour large entries: evict smallest first.
    Largest,
    /// Favour small entries: evict largest first.
    Smallest,
    /// Favour thumbnails: evict non-thumbnails first, oldest first.
    Thumbnail,
}

/// How a level propagates entries to the tier below.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritebackMode {
    /// Push synchronously, blocking the triggering operation.
    Eager,
    /// Queue for a background worker; overflow drops the job.
    Lazy,
    /// Drop on eviction, skip on population.
    #[default]
    Never,
}

/// Per-level limits and thresholds.
#[derive(Clone, Debug)]
pub struct EvictionPolicy {
    /// 0 = unlimited
    pub max_bytes: u64,
    /// 0 = unlimited
    pub max_elements: u64,
    pub evict_start_ratio: f64,
    pub evict_stop_ratio: f64,
    pub alarm_free_ratio: f64,
    pub priority: Priority,
}

impl EvictionPolicy {
    pub fn new(
        max_bytes: u64,
        max_elements: u64,
        evict_start_ratio: f64,
        evict_hysteresis: f64,
        alarm_free_ratio: f64,
        priority: Priority,
    ) -> Self {
        Self {
            max_bytes,
            max_elements,
            evict_start_ratio,
            evict_stop_ratio: (evict_start_ratio - evict_hysteresis).max(0.0),
            alarm_free_ratio,
            priority,
        }
    }

    /// Unlimited sink, typically the originals store.
    pub fn unbounded() -> Self {
        Self {
            max_bytes: 0,
            max_elements: 0,
            evict_start_ratio: 1.0,
            evict_stop_ratio: 1.0,
            alarm_free_ratio: 0.0,
            priority: Priority::Newest,
        }
    }

    /// Whether a single entry of this size can ever be stored here.
    pub fn admits(&self, entry_size: u64) -> bool {
        self.max_bytes == 0 || entry_size <= self.max_bytes
    }

    /// Whether the given occupancy triggers an eviction pass.
    pub fn should_evict(&self, used_bytes: u64, element_count: u64) -> bool {
        let over_bytes = self.max_bytes > 0
            && used_bytes as f64 > self.max_bytes as f64 * self.evict_start_ratio;
        let over_elements = self.max_elements > 0 && element_count > self.max_elements;
        over_bytes || over_elements
    }

    /// Byte occupancy a pass must reach before it stops.
    pub fn byte_target(&self) -> u64 {
        (self.max_bytes as f64 * self.evict_stop_ratio) as u64
    }

    /// Element count a pass must reach before it stops; the same hysteresis
    /// ratio applies to elements as to bytes.
    pub fn element_target(&self) -> u64 {
        if self.evict_start_ratio <= 0.0 {
            return self.max_elements;
        }
        (self.max_elements as f64 * self.evict_stop_ratio / self.evict_start_ratio) as u64
    }

    fn settled(&self, used_bytes: u64, element_count: u64) -> bool {
        let bytes_ok = self.max_bytes == 0 || used_bytes <= self.byte_target();
        let elements_ok = self.max_elements == 0 || element_count <= self.element_target();
        bytes_ok && elements_ok
    }
}

/// One candidate row from a level's index snapshot.
#[derive(Clone, Debug)]
pub struct VictimCandidate {
    pub key: String,
    pub size: u64,
    pub atime: u64,
    pub is_thumbnail: bool,
}

/// Select the keys a level must remove to settle below its targets.
///
/// Candidates are ordered most-evictable first according to the policy
/// priority; ties break on smaller size, then key, so the plan is
/// deterministic. Returns an empty plan when no pass is due, which makes
/// eviction idempotent.
pub fn plan_victims(
    policy: &EvictionPolicy,
    mut candidates: Vec<VictimCandidate>,
    used_bytes: u64,
    element_count: u64,
) -> Vec<VictimCandidate> {
    if !policy.should_evict(used_bytes, element_count) {
        return Vec::new();
    }

    match policy.priority {
        Priority::Newest => {
            candidates.sort_by(|a, b| {
                (a.atime, a.size, &a.key).cmp(&(b.atime, b.size, &b.key))
            });
        }
        Priority::Largest => {
            candidates.sort_by(|a, b| {
                (a.size, a.atime, &a.key).cmp(&(b.size, b.atime, &b.key))
            });
        }
        Priority::Smallest => {
            candidates.sort_by(|a, b| {
                (std::cmp::Reverse(a.size), a.atime, &a.key)
                    .cmp(&(std::cmp::Reverse(b.size), b.atime, &b.key))
            });
        }
        Priority::Thumbnail => {
            candidates.sort_by(|a, b| {
                (a.is_thumbnail, a.atime, a.size, &a.key)
                    .cmp(&(b.is_thumbnail, b.atime, b.size, &b.key))
            });
        }
    }

    let mut bytes = used_bytes;
    let mut count = element_count;
    let mut plan = Vec::new();
    for candidate in candidates {
        if policy.settled(bytes, count) {
            break;
        }
        bytes = bytes.saturating_sub(candidate.size);
        count = count.saturating_sub(1);
        plan.push(candidate);
    }
    plan
}

// =============================================================================
// Alarms
// =============================================================================

/// Raised when a level's free space drops below its alarm ratio.
/// Observability only, never alters cache behaviour.
#[derive(Clone, Debug)]
pub struct AlarmEvent {
    pub level: &'static str,
    pub used_bytes: u64,
    pub max_bytes: u64,
}

/// Destination for alarm events.
pub type AlarmSink = mpsc::UnboundedSender<AlarmEvent>;

/// Check occupancy against the alarm threshold, emitting an event when it
/// trips. Returns whether the alarm is currently raised.
pub fn check_alarm(
    policy: &EvictionPolicy,
    level: &'static str,
    used_bytes: u64,
    sink: Option<&AlarmSink>,
) -> bool {
    if policy.max_bytes == 0 || policy.alarm_free_ratio <= 0.0 {
        return false;
    }
    let free = policy.max_bytes.saturating_sub(used_bytes) as f64;
    if free / policy.max_bytes as f64 >= policy.alarm_free_ratio {
        return false;
    }
    warn!(
        level,
        used_bytes,
        max_bytes = policy.max_bytes,
        "cache level free space below alarm threshold"
    );
    if let Some(sink) = sink {
        let _ = sink.send(AlarmEvent {
            level,
            used_bytes,
            max_bytes: policy.max_bytes,
        });
    }
    true
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: &str, size: u64, atime: u64, thumb: bool) -> VictimCandidate {
        VictimCandidate {
            key: key.into(),
            size,
            atime,
            is_thumbnail: thumb,
        }
    }

    fn policy(max_bytes: u64, priority: Priority) -> EvictionPolicy {
        EvictionPolicy::new(max_bytes, 0, 0.8, 0.2, 0.1, priority)
    }

    #[test]
    fn test_stop_ratio_clamped() {
        let p = EvictionPolicy::new(100, 0, 0.1, 0.5, 0.1, Priority::Newest);
        assert_eq!(p.evict_stop_ratio, 0.0);
    }

    #[test]
    fn test_trigger_is_strictly_above_start() {
        let p = policy(1000, Priority::Newest);
        assert!(!p.should_evict(800, 1));
        assert!(p.should_evict(801, 1));
    }

    #[test]
    fn test_unbounded_never_triggers() {
        let p = EvictionPolicy::unbounded();
        assert!(!p.should_evict(u64::MAX / 2, u64::MAX / 2));
        assert!(p.admits(u64::MAX / 2));
    }

    #[test]
    fn test_element_trigger_and_target() {
        let p = EvictionPolicy::new(0, 100, 0.8, 0.2, 0.1, Priority::Newest);
        assert!(!p.should_evict(0, 100));
        assert!(p.should_evict(0, 101));
        // 100 * 0.6 / 0.8 = 75
        assert_eq!(p.element_target(), 75);
    }

    #[test]
    fn test_newest_evicts_oldest_atime_first() {
        let p = policy(1000, Priority::Newest);
        // 12 entries of 100 bytes with increasing atime: used = 1200.
        let candidates: Vec<_> = (0..12)
            .map(|i| candidate(&format!("k{i}"), 100, 1000 + i, false))
            .collect();
        let plan = plan_victims(&p, candidates, 1200, 12);
        // Settle at <= 600 bytes: remove the 6 oldest.
        assert_eq!(plan.len(), 6);
        for (i, victim) in plan.iter().enumerate() {
            assert_eq!(victim.key, format!("k{i}"));
        }
    }

    #[test]
    fn test_scenario_nine_inserts() {
        // After the 9th 100-byte insert (used 900 > 800) the three oldest go.
        let p = policy(1000, Priority::Newest);
        let candidates: Vec<_> = (0..9)
            .map(|i| candidate(&format!("k{i}"), 100, 1000 + i, false))
            .collect();
        let plan = plan_victims(&p, candidates, 900, 9);
        let keys: Vec<_> = plan.iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["k0", "k1", "k2"]);
    }

    #[test]
    fn test_largest_retains_large() {
        let p = policy(100, Priority::Largest);
        let candidates = vec![
            candidate("small", 10, 5, false),
            candidate("big", 60, 1, false),
            candidate("mid", 40, 3, false),
        ];
        let plan = plan_victims(&p, candidates, 110, 3);
        assert_eq!(plan[0].key, "small");
    }

    #[test]
    fn test_smallest_retains_small() {
        let p = policy(100, Priority::Smallest);
        let candidates = vec![
            candidate("small", 10, 5, false),
            candidate("big", 60, 1, false),
            candidate("mid", 40, 3, false),
        ];
        let plan = plan_victims(&p, candidates, 110, 3);
        assert_eq!(plan[0].key, "big");
    }

    #[test]
    fn test_thumbnail_priority_spares_thumbnails() {
        let p = policy(100, Priority::Thumbnail);
        let candidates = vec![
            candidate("thumb-old", 40, 1, true),
            candidate("plain-new", 40, 9, false),
            candidate("plain-old", 40, 2, false),
        ];
        let plan = plan_victims(&p, candidates, 120, 3);
        assert_eq!(plan[0].key, "plain-old");
        assert_eq!(plan[1].key, "plain-new");
    }

    #[test]
    fn test_plan_is_empty_below_threshold() {
        let p = policy(1000, Priority::Newest);
        let candidates = vec![candidate("a", 100, 1, false)];
        assert!(plan_victims(&p, candidates, 100, 1).is_empty());
    }

    #[test]
    fn test_ties_break_on_size_then_key() {
        let p = policy(100, Priority::Newest);
        let candidates = vec![
            candidate("b", 50, 7, false),
            candidate("a", 50, 7, false),
            candidate("c", 10, 7, false),
        ];
        let plan = plan_victims(&p, candidates, 110, 3);
        assert_eq!(plan[0].key, "c");
        assert_eq!(plan[1].key, "a");
    }

    #[test]
    fn test_alarm_threshold() {
        let p = EvictionPolicy::new(1000, 0, 0.8, 0.2, 0.1, Priority::Newest);
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(!check_alarm(&p, "memory", 500, Some(&tx)));
        assert!(check_alarm(&p, "memory", 950, Some(&tx)));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.level, "memory");
        assert_eq!(event.used_bytes, 950);
    }

    #[test]
    fn test_alarm_disabled_when_unbounded() {
        let p = EvictionPolicy::unbounded();
        assert!(!check_alarm(&p, "store", u64::MAX / 2, None));
    }
}
