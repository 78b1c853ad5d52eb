//! Processing tracker.
//!
//! Folds the [`ComponentEvent`] stream into the health signals a UI needs:
//!
//! - the set of components with outstanding work
//! - the set of components in connectivity trouble, and a global flag that
//!   is `true` while that set is non-empty
//! - the most recent component error
//!
//! A component is in trouble when more than `timeout_threshold` of its
//! timeouts fall inside the sliding `window`, or when an explicit
//! connectivity issue was reported for it. A success for the component
//! forgets its timeouts.

use crate::bus::{EventBus, Subscription};
use crate::event::{ActivityBus, ComponentEvent, ErrorClass, EventKind, Severity};
use crate::supervisor::TaskGroup;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Tracker tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// How long a timeout counts against its component
    pub window: Duration,
    /// More timeouts than this inside the window raise the issue flag
    pub timeout_threshold: usize,
    /// How often aged-out timeouts are swept
    pub sweep_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            timeout_threshold: 3,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Last error seen for a component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedError {
    pub component: String,
    pub major: bool,
    pub message: String,
}

#[derive(Default)]
struct TrackerState {
    ongoing: BTreeSet<String>,
    timeouts: HashMap<String, VecDeque<Instant>>,
    reported: BTreeSet<String>,
}

/// Derives "ongoing" and "connectivity issue" signals from component activity
pub struct ProcessingTracker {
    config: TrackerConfig,
    state: Mutex<TrackerState>,
    ongoing: EventBus<BTreeSet<String>>,
    issues: EventBus<BTreeSet<String>>,
    conn_issues: EventBus<bool>,
    errors: EventBus<TrackedError>,
    tasks: TaskGroup,
}

impl ProcessingTracker {
    pub fn new(config: TrackerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(TrackerState::default()),
            ongoing: EventBus::seeded(BTreeSet::new()),
            issues: EventBus::seeded(BTreeSet::new()),
            conn_issues: EventBus::seeded(false),
            errors: EventBus::stream(),
            tasks: TaskGroup::new("tracker"),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Report that `component` started or finished work
    pub fn notify_ongoing(&self, component: &str, ongoing: bool) {
        self.record(&ComponentEvent::ongoing(component, ongoing));
    }

    /// Report a failure of `component`
    pub fn notify_error(&self, component: &str, class: ErrorClass, severity: Severity, message: &str) {
        self.record(&ComponentEvent::error(component, class, severity, message));
    }

    /// Report a success of `component`
    pub fn notify_success(&self, component: &str) {
        self.record(&ComponentEvent::recovered(component));
    }

    /// Explicit connectivity flag for `component` (API layer)
    pub fn report_conn_issue(&self, component: &str, issue: bool) {
        self.record(&ComponentEvent::conn_issue(component, issue));
    }

    /// Fold one event into the derived signals
    pub fn record(&self, event: &ComponentEvent) {
        let component = event.component.as_str();
        let mut state = self.lock();

        match &event.kind {
            EventKind::Ongoing(true) => {
                if state.ongoing.insert(component.to_string()) {
                    self.ongoing.publish(state.ongoing.clone());
                }
            }
            EventKind::Ongoing(false) => {
                if state.ongoing.remove(component) {
                    self.ongoing.publish(state.ongoing.clone());
                }
            }
            EventKind::Error { major, class, message } => {
                if *class == ErrorClass::Timeout {
                    state
                        .timeouts
                        .entry(component.to_string())
                        .or_default()
                        .push_back(event.timestamp);
                    debug!("{}: timeout recorded", component);
                }
                self.errors.publish(TrackedError {
                    component: component.to_string(),
                    major: *major,
                    message: message.clone(),
                });
            }
            EventKind::Recovered => {
                state.timeouts.remove(component);
            }
            EventKind::ConnIssue(true) => {
                state.reported.insert(component.to_string());
            }
            EventKind::ConnIssue(false) => {
                state.reported.remove(component);
            }
        }

        self.recompute(&mut state);
    }

    /// Drop timeouts that left the window and re-derive the issue flag
    pub fn prune(&self) {
        let mut state = self.lock();
        self.recompute(&mut state);
    }

    /// Components currently doing work
    pub fn ongoing(&self) -> BTreeSet<String> {
        self.lock().ongoing.clone()
    }

    /// Components currently in connectivity trouble
    pub fn conn_issue_set(&self) -> BTreeSet<String> {
        self.issues.latest().unwrap_or_default()
    }

    pub fn has_conn_issues(&self) -> bool {
        self.conn_issues.latest().unwrap_or(false)
    }

    pub fn subscribe_ongoing(&self) -> Subscription<BTreeSet<String>> {
        self.ongoing.subscribe()
    }

    pub fn subscribe_conn_issues(&self) -> Subscription<bool> {
        self.conn_issues.subscribe()
    }

    pub fn subscribe_issue_set(&self) -> Subscription<BTreeSet<String>> {
        self.issues.subscribe()
    }

    pub fn subscribe_errors(&self) -> Subscription<TrackedError> {
        self.errors.subscribe()
    }

    /// Consume `activity` in a supervised background task
    pub fn listen(self: &Arc<Self>, activity: &ActivityBus) {
        let mut events = activity.subscribe();
        let tracker: Weak<Self> = Arc::downgrade(self);

        self.tasks.spawn("listener", async move {
            while let Some(event) = events.recv().await {
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                tracker.record(&event);
            }
        });
    }

    /// Periodically age out timeouts so the flag clears without new events
    pub fn start_sweeper(self: &Arc<Self>) {
        let tracker: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        self.tasks.spawn("sweeper", async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                tracker.prune();
            }
        });
    }

    pub fn shutdown(&self) {
        self.tasks.shutdown();
    }

    fn recompute(&self, state: &mut TrackerState) {
        let now = Instant::now();
        let window = self.config.window;

        state.timeouts.retain(|_, stamps| {
            while stamps
                .front()
                .is_some_and(|t| now.saturating_duration_since(*t) > window)
            {
                stamps.pop_front();
            }
            !stamps.is_empty()
        });

        let mut issues: BTreeSet<String> = state
            .timeouts
            .iter()
            .filter(|(_, stamps)| stamps.len() > self.config.timeout_threshold)
            .map(|(component, _)| component.clone())
            .collect();
        issues.extend(state.reported.iter().cloned());

        let flag = !issues.is_empty();
        if self.issues.publish(issues) {
            debug!("conn issue set changed");
        }
        if self.conn_issues.publish(flag) {
            if flag {
                warn!("Connectivity issues detected");
            } else {
                info!("Connectivity issues cleared");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ProcessingTracker {
    fn drop(&mut self) {
        self.tasks.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn timeout(tracker: &ProcessingTracker, component: &str) {
        tracker.notify_error(component, ErrorClass::Timeout, Severity::Minor, "timed out");
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_timeouts_raise_and_age_out() {
        let tracker = ProcessingTracker::new(TrackerConfig::default());
        let mut flag = tracker.subscribe_conn_issues();
        assert_eq!(flag.try_recv(), Some(false));

        for _ in 0..3 {
            timeout(&tracker, "lease");
            advance(Duration::from_secs(2)).await;
        }
        assert!(!tracker.has_conn_issues());

        timeout(&tracker, "lease");
        assert!(tracker.has_conn_issues());
        assert_eq!(tracker.conn_issue_set(), BTreeSet::from(["lease".to_string()]));
        assert_eq!(flag.try_recv(), Some(true));

        advance(Duration::from_secs(31)).await;
        tracker.prune();
        assert!(!tracker.has_conn_issues());
        assert_eq!(flag.try_recv(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_spread_over_components_do_not_count() {
        let tracker = ProcessingTracker::new(TrackerConfig::default());
        for component in ["lease", "api", "turnOn", "queryStatus"] {
            timeout(&tracker, component);
        }
        assert!(!tracker.has_conn_issues());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_component() {
        let tracker = ProcessingTracker::new(TrackerConfig::default());
        for _ in 0..4 {
            timeout(&tracker, "lease");
        }
        assert!(tracker.has_conn_issues());

        tracker.notify_success("lease");
        assert!(!tracker.has_conn_issues());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_clears_flag_without_new_events() {
        let tracker = ProcessingTracker::new(TrackerConfig::default());
        tracker.start_sweeper();
        for _ in 0..4 {
            timeout(&tracker, "lease");
        }
        assert!(tracker.has_conn_issues());

        let mut flag = tracker.subscribe_conn_issues();
        assert_eq!(flag.recv().await, Some(true));
        assert_eq!(flag.recv().await, Some(false));
    }

    #[test]
    fn test_reported_issue_is_explicit() {
        let tracker = ProcessingTracker::new(TrackerConfig::default());
        tracker.report_conn_issue("api", true);
        assert!(tracker.has_conn_issues());

        tracker.report_conn_issue("api", false);
        assert!(!tracker.has_conn_issues());
    }

    #[test]
    fn test_ongoing_set_is_deduplicated() {
        let tracker = ProcessingTracker::new(TrackerConfig::default());
        let mut ongoing = tracker.subscribe_ongoing();

        tracker.notify_ongoing("turnOn", true);
        tracker.notify_ongoing("turnOn", true);
        tracker.notify_ongoing("newLease", true);
        tracker.notify_ongoing("turnOn", false);

        let seen = ongoing.drain();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen.last(), Some(&BTreeSet::from(["newLease".to_string()])));
    }

    #[tokio::test]
    async fn test_listen_consumes_activity_bus() {
        let tracker = ProcessingTracker::new(TrackerConfig::default());
        let activity = ActivityBus::stream();
        tracker.listen(&activity);

        let mut errors = tracker.subscribe_errors();
        activity.publish(ComponentEvent::error(
            "newLease",
            ErrorClass::Failure,
            Severity::Major,
            "too many devices",
        ));

        let error = errors.recv().await.unwrap();
        assert_eq!(error.component, "newLease");
        assert!(error.major);
    }
}
