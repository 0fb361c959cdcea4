//! Once-per-process telemetry deduplication
//!
//! Selection reasons and non-strict fallback warnings are logged once per
//! unique message, keyed by `(topic, message hash)`. State lives in one
//! process-wide set with an explicit lifecycle so tests can reset it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use lazy_static::lazy_static;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

lazy_static! {
    static ref SEEN: Mutex<FxHashSet<(String, u64)>> = Mutex::new(FxHashSet::default());
}

fn hash_message(message: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    message.hash(&mut hasher);
    hasher.finish()
}

/// Clear all dedup state. Call at runtime startup.
pub fn init_logging_state() {
    SEEN.lock().clear();
}

/// Clear all dedup state. Test hook; identical to `init_logging_state`
/// but named for intent at call sites.
pub fn reset_logging_state() {
    SEEN.lock().clear();
}

/// Record `(topic, message)`; returns true the first time this pair is seen.
fn first_sighting(topic: &str, message: &str) -> bool {
    SEEN.lock().insert((topic.to_string(), hash_message(message)))
}

/// Log a warning once per unique `(topic, message)` pair
pub fn warn_once(topic: &str, message: &str) {
    if first_sighting(topic, message) {
        log::warn!("[{}] {}", topic, message);
    }
}

/// Log the selection reason for an `(op, variant)` once per program run,
/// keyed by variant string so per-call selection stays silent.
pub fn log_selection_once(op: &str, variant: &str, reason: &str) {
    let topic = format!("select:{}", op);
    if first_sighting(&topic, variant) {
        log::info!("[Select] {} -> {} ({})", op, variant, reason);
    }
}

/// Unconditional trace-channel message
pub fn trace(channel: &str, message: &str) {
    log::trace!("[{}] {}", channel, message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedups_by_topic_and_message() {
        reset_logging_state();
        assert!(first_sighting("t1", "m1"));
        assert!(!first_sighting("t1", "m1"));
        assert!(first_sighting("t1", "m2"));
        assert!(first_sighting("t2", "m1"));
    }

    #[test]
    fn reset_clears_seen_pairs() {
        reset_logging_state();
        assert!(first_sighting("topic", "msg"));
        reset_logging_state();
        assert!(first_sighting("topic", "msg"));
    }
}
