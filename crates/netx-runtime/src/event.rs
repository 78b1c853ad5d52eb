//! Component activity events.
//!
//! Every component reports what it is doing as a [`ComponentEvent`] tagged
//! with its own name. Only the processing tracker consumes them.

use crate::bus::EventBus;
use std::fmt;
use tokio::time::Instant;

/// Stream of activity events shared by all components
pub type ActivityBus = EventBus<ComponentEvent>;

/// How bad a failure is for the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    #[default]
    Minor,
    Major,
}

impl Severity {
    pub fn is_major(&self) -> bool {
        matches!(self, Severity::Major)
    }
}

/// Failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Operation did not complete in time
    Timeout,
    /// Any other failure
    Failure,
}

/// What happened in a component
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Work started (`true`) or settled (`false`)
    Ongoing(bool),
    /// Work failed
    Error {
        major: bool,
        class: ErrorClass,
        message: String,
    },
    /// Work succeeded; clears recorded timeouts of the component
    Recovered,
    /// Explicit connectivity report (API layer)
    ConnIssue(bool),
}

/// A single activity report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentEvent {
    pub component: String,
    pub kind: EventKind,
    pub timestamp: Instant,
}

impl ComponentEvent {
    pub fn new(component: impl Into<String>, kind: EventKind) -> Self {
        Self {
            component: component.into(),
            kind,
            timestamp: Instant::now(),
        }
    }

    pub fn ongoing(component: impl Into<String>, ongoing: bool) -> Self {
        Self::new(component, EventKind::Ongoing(ongoing))
    }

    pub fn error(
        component: impl Into<String>,
        class: ErrorClass,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            component,
            EventKind::Error {
                major: severity.is_major(),
                class,
                message: message.into(),
            },
        )
    }

    pub fn recovered(component: impl Into<String>) -> Self {
        Self::new(component, EventKind::Recovered)
    }

    pub fn conn_issue(component: impl Into<String>, issue: bool) -> Self {
        Self::new(component, EventKind::ConnIssue(issue))
    }

    /// Is this a timeout report?
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Error { class: ErrorClass::Timeout, .. }
        )
    }
}

impl fmt::Display for ComponentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EventKind::Ongoing(on) => write!(f, "{}: ongoing={}", self.component, on),
            EventKind::Error { major, class, message } => write!(
                f,
                "{}: {:?} ({}): {}",
                self.component,
                class,
                if *major { "major" } else { "minor" },
                message
            ),
            EventKind::Recovered => write!(f, "{}: recovered", self.component),
            EventKind::ConnIssue(issue) => write!(f, "{}: conn issue={}", self.component, issue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        let ev = ComponentEvent::error("lease", ErrorClass::Timeout, Severity::Minor, "slow");
        assert!(ev.is_timeout());

        let ev = ComponentEvent::error("lease", ErrorClass::Failure, Severity::Major, "boom");
        assert!(!ev.is_timeout());
        assert!(matches!(ev.kind, EventKind::Error { major: true, .. }));
    }

    #[test]
    fn test_display() {
        let ev = ComponentEvent::ongoing("turnOn", true);
        assert_eq!(ev.to_string(), "turnOn: ongoing=true");
    }
}
