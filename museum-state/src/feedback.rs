//! Command feedback tracking.
//!
//! While a scene runs, every bus command that expects an acknowledgement is
//! registered here before it is published. The device answers on the expected
//! topic; answers are matched to the oldest outstanding command on that topic.
//! Commands left unanswered past their deadline are expired by
//! [`FeedbackTracker::sweep`]. Outcomes are observability only and never feed
//! back into the show.
//!
//! Accounting: `acknowledged + timed_out + pending == tracked` at all times.
//! Withdrawn entries and entries abandoned by [`FeedbackTracker::disable`] are
//! removed from `tracked`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::TrackerConfig;

/// A command waiting for its acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFeedback {
    pub source_topic: String,
    pub expected_topic: String,
    pub command: String,
    pub sent_at: Instant,
    pub deadline: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reply", rename_all = "snake_case")]
pub enum FeedbackOutcome {
    /// The device answered `OK`
    Acknowledged,
    /// The device answered with anything else
    Rejected(String),
}

/// An acknowledgement matched to its command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackResolution {
    pub source_topic: String,
    pub command: String,
    pub latency: Duration,
    pub outcome: FeedbackOutcome,
}

/// A command that was never acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedbackTimeout {
    pub source_topic: String,
    pub expected_topic: String,
    pub command: String,
}

impl fmt::Display for FeedbackTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no response to {} = {} (expected on {})",
            self.source_topic, self.command, self.expected_topic
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedbackStats {
    pub tracked: u64,
    /// Every matched reply, positive or not
    pub acknowledged: u64,
    /// Subset of `acknowledged` that carried an error reply
    pub negative: u64,
    pub timed_out: u64,
    pub pending: u64,
    /// Entries dropped when tracking was disabled mid-flight
    pub abandoned: u64,
    pub last_latency: Option<Duration>,
}

impl fmt::Display for FeedbackStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Feedback Stats:")?;
        writeln!(f, "  Tracked: {}", self.tracked)?;
        writeln!(
            f,
            "  Acknowledged: {} ({} negative)",
            self.acknowledged, self.negative
        )?;
        writeln!(f, "  Timed out: {}", self.timed_out)?;
        writeln!(f, "  Pending: {}", self.pending)?;
        if let Some(latency) = self.last_latency {
            writeln!(f, "  Last latency: {:.3}s", latency.as_secs_f64())?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Inner {
    enabled: bool,
    /// Keyed by expected topic; oldest first
    pending: HashMap<String, VecDeque<PendingFeedback>>,
    stats: FeedbackStats,
}

impl Inner {
    fn pending_count(&self) -> u64 {
        self.pending.values().map(|queue| queue.len() as u64).sum()
    }

    fn refresh_pending(&mut self) {
        self.stats.pending = self.pending_count();
    }
}

/// Correlates published commands with device acknowledgements.
///
/// Tracking is off until [`enable`](Self::enable) is called at scene start;
/// [`disable`](Self::disable) at scene end drops whatever is still pending.
pub struct FeedbackTracker {
    config: TrackerConfig,
    inner: Mutex<Inner>,
}

impl FeedbackTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn enable(&self) {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            inner.enabled = true;
            tracing::info!("Feedback tracking enabled");
        }
    }

    /// Stop tracking and abandon every pending entry.
    pub fn disable(&self) {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return;
        }
        inner.enabled = false;

        let abandoned: Vec<PendingFeedback> =
            inner.pending.drain().flat_map(|(_, queue)| queue).collect();
        for entry in &abandoned {
            tracing::warn!(
                "Scene ended with pending feedback on {} (command {})",
                entry.source_topic,
                entry.command
            );
        }
        let count = abandoned.len() as u64;
        inner.stats.tracked -= count;
        inner.stats.abandoned += count;
        inner.refresh_pending();
        tracing::info!("Feedback tracking disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Topic a command to `source_topic` is acknowledged on, if any.
    pub fn expected_topic_for(&self, source_topic: &str) -> Option<String> {
        bus_gateway::topics::feedback_topic_for(source_topic)
    }

    /// Register an expectation. Returns false (and does nothing) while disabled.
    pub fn track(&self, source_topic: &str, expected_topic: &str, command: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return false;
        }

        inner
            .pending
            .entry(expected_topic.to_string())
            .or_default()
            .push_back(PendingFeedback {
                source_topic: source_topic.to_string(),
                expected_topic: expected_topic.to_string(),
                command: command.to_string(),
                sent_at: now,
                deadline: now + self.config.timeout,
            });
        inner.stats.tracked += 1;
        inner.refresh_pending();

        tracing::debug!(
            "Sent: {} -> expecting feedback on {}",
            source_topic,
            expected_topic
        );
        true
    }

    /// Roll back the newest expectation for a command whose publish failed.
    pub fn withdraw(&self, source_topic: &str, expected_topic: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(queue) = inner.pending.get_mut(expected_topic) else {
            return false;
        };
        let Some(position) = queue
            .iter()
            .rposition(|entry| entry.source_topic == source_topic)
        else {
            return false;
        };
        queue.remove(position);
        if queue.is_empty() {
            inner.pending.remove(expected_topic);
        }
        inner.stats.tracked -= 1;
        inner.refresh_pending();
        true
    }

    /// Match an inbound feedback message to the oldest pending command.
    ///
    /// Entries already past their deadline count as timed out, not as
    /// acknowledged, even if the sweeper has not run yet.
    pub fn handle(&self, topic: &str, payload: &str, now: Instant) -> Option<FeedbackResolution> {
        let mut inner = self.inner.lock();

        let mut resolved = None;
        let mut expired = Vec::new();
        if let Some(queue) = inner.pending.get_mut(topic) {
            while let Some(entry) = queue.pop_front() {
                if entry.deadline <= now {
                    expired.push(entry);
                    continue;
                }
                resolved = Some(entry);
                break;
            }
            if queue.is_empty() {
                inner.pending.remove(topic);
            }
        }

        for entry in &expired {
            log_timeout(entry);
        }
        inner.stats.timed_out += expired.len() as u64;

        let Some(entry) = resolved else {
            inner.refresh_pending();
            tracing::debug!("Received feedback on {} with no pending command", topic);
            return None;
        };

        let latency = now.saturating_duration_since(entry.sent_at);
        let reply = payload.trim();
        let outcome = if reply.eq_ignore_ascii_case("OK") {
            tracing::info!(
                "Feedback OK: {} ({:.3}s)",
                entry.source_topic,
                latency.as_secs_f64()
            );
            FeedbackOutcome::Acknowledged
        } else {
            tracing::warn!(
                "Feedback ERROR: {} -> {} ({:.3}s)",
                entry.source_topic,
                reply,
                latency.as_secs_f64()
            );
            inner.stats.negative += 1;
            FeedbackOutcome::Rejected(reply.to_string())
        };

        inner.stats.acknowledged += 1;
        inner.stats.last_latency = Some(latency);
        inner.refresh_pending();

        Some(FeedbackResolution {
            source_topic: entry.source_topic,
            command: entry.command,
            latency,
            outcome,
        })
    }

    /// Expire every entry whose deadline has passed.
    pub fn sweep(&self, now: Instant) -> Vec<FeedbackTimeout> {
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();

        inner.pending.retain(|_, queue| {
            while queue.front().is_some_and(|entry| entry.deadline <= now) {
                if let Some(entry) = queue.pop_front() {
                    expired.push(entry);
                }
            }
            !queue.is_empty()
        });

        if expired.is_empty() {
            return Vec::new();
        }
        inner.stats.timed_out += expired.len() as u64;
        inner.refresh_pending();

        expired.sort_by_key(|entry| entry.deadline);
        expired
            .into_iter()
            .map(|entry| {
                log_timeout(&entry);
                FeedbackTimeout {
                    source_topic: entry.source_topic,
                    expected_topic: entry.expected_topic,
                    command: entry.command,
                }
            })
            .collect()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .lock()
            .pending
            .values()
            .filter_map(|queue| queue.front().map(|entry| entry.deadline))
            .min()
    }

    pub fn pending(&self) -> Vec<PendingFeedback> {
        let inner = self.inner.lock();
        let mut pending: Vec<PendingFeedback> =
            inner.pending.values().flatten().cloned().collect();
        pending.sort_by_key(|entry| entry.sent_at);
        pending
    }

    pub fn stats(&self) -> FeedbackStats {
        self.inner.lock().stats.clone()
    }
}

impl Default for FeedbackTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

fn log_timeout(entry: &PendingFeedback) {
    tracing::error!(
        "FEEDBACK TIMEOUT: no response from device. Topic: {}, Command: {}, Expected: {}",
        entry.source_topic,
        entry.command,
        entry.expected_topic
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_tracker() -> FeedbackTracker {
        let tracker = FeedbackTracker::default();
        tracker.enable();
        tracker
    }

    #[test]
    fn test_disabled_tracker_ignores_commands() {
        let tracker = FeedbackTracker::default();
        assert!(!tracker.track("room1/light", "room1/light/feedback", "ON", Instant::now()));
        assert_eq!(tracker.stats(), FeedbackStats::default());
    }

    #[test]
    fn test_fifo_per_topic() {
        let tracker = enabled_tracker();
        let start = Instant::now();
        tracker.track("room1/light", "room1/light/feedback", "ON", start);
        tracker.track(
            "room1/light",
            "room1/light/feedback",
            "OFF",
            start + Duration::from_millis(100),
        );

        let first = tracker
            .handle("room1/light/feedback", "OK", start + Duration::from_millis(200))
            .unwrap();
        assert_eq!(first.command, "ON");
        assert_eq!(first.latency, Duration::from_millis(200));

        let second = tracker
            .handle("room1/light/feedback", "OK", start + Duration::from_millis(250))
            .unwrap();
        assert_eq!(second.command, "OFF");
        assert_eq!(tracker.stats().pending, 0);
    }

    #[test]
    fn test_error_reply_is_negative_acknowledgement() {
        let tracker = enabled_tracker();
        let start = Instant::now();
        tracker.track("room1/motor1", "room1/motor1/feedback", "ON:50:L:0", start);

        let resolution = tracker
            .handle("room1/motor1/feedback", "ERR:STALL", start + Duration::from_millis(50))
            .unwrap();
        assert_eq!(
            resolution.outcome,
            FeedbackOutcome::Rejected("ERR:STALL".to_string())
        );
        let stats = tracker.stats();
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.negative, 1);
    }

    #[test]
    fn test_unmatched_feedback_is_informational() {
        let tracker = enabled_tracker();
        assert!(tracker
            .handle("room1/light/feedback", "OK", Instant::now())
            .is_none());
        assert_eq!(tracker.stats().acknowledged, 0);
    }

    #[test]
    fn test_withdraw_rolls_back_newest() {
        let tracker = enabled_tracker();
        let now = Instant::now();
        tracker.track("room1/light", "room1/light/feedback", "ON", now);
        tracker.track("room1/light", "room1/light/feedback", "OFF", now);

        assert!(tracker.withdraw("room1/light", "room1/light/feedback"));
        let pending = tracker.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].command, "ON");
        assert_eq!(tracker.stats().tracked, 1);
        assert!(!tracker.withdraw("room1/fog", "room1/fog/feedback"));
    }

    #[test]
    fn test_disable_abandons_pending() {
        let tracker = enabled_tracker();
        let now = Instant::now();
        tracker.track("room1/light", "room1/light/feedback", "ON", now);
        tracker.disable();

        let stats = tracker.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.tracked, 0);
        assert_eq!(stats.abandoned, 1);
        assert!(!tracker.is_enabled());
        assert!(tracker.next_deadline().is_none());
    }

    #[test]
    fn test_late_feedback_counts_as_timeout() {
        let tracker = enabled_tracker();
        let start = Instant::now();
        tracker.track("room1/light", "room1/light/feedback", "ON", start);

        assert!(tracker
            .handle("room1/light/feedback", "OK", start + Duration::from_millis(1500))
            .is_none());
        let stats = tracker.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.acknowledged, 0);
    }

    #[test]
    fn test_expected_topic_for_uses_topic_rules() {
        let tracker = FeedbackTracker::default();
        assert_eq!(
            tracker.expected_topic_for("room1/light").as_deref(),
            Some("room1/light/feedback")
        );
        assert_eq!(tracker.expected_topic_for("room1/STOP"), None);
    }
}
