//! Per-session event coordination.
//!
//! Each attached interactive session owns one bus subscription. Events
//! matching the session's current focus are handed to the session's UI;
//! everything else is buffered into bounded per-package tails so a detail
//! pane can show recent history the moment it opens. The subscription is
//! deregistered when the coordinator is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::bus::{LogBus, LogEvent, Subscription};

/// Capacity of each per-package in-session tail, in events.
pub const SESSION_TAIL_CAPACITY: usize = 1024;

/// Routes bus events for one attached session.
pub struct SessionCoordinator {
    bus: Arc<LogBus>,
    subscription: Subscription,
    focus: Option<String>,
    tails: HashMap<String, VecDeque<LogEvent>>,
}

impl SessionCoordinator {
    /// Attach a new session to the bus.
    #[must_use]
    pub fn attach(bus: Arc<LogBus>) -> Self {
        let subscription = bus.subscribe();
        tracing::debug!(subscriber = %subscription.id(), "session attached");
        Self {
            bus,
            subscription,
            focus: None,
            tails: HashMap::new(),
        }
    }

    /// Focus on one package (its events are forwarded), or on everything
    /// (`None` forwards every event).
    pub fn set_focus(&mut self, focus: Option<String>) {
        self.focus = focus;
    }

    /// The current focus, if any.
    #[must_use]
    pub fn focus(&self) -> Option<&str> {
        self.focus.as_deref()
    }

    /// Wait for the next event matching the focus, buffering the rest.
    ///
    /// Returns `None` when the subscription has been torn down.
    pub async fn next_focused(&mut self) -> Option<LogEvent> {
        loop {
            let event = self.subscription.recv().await?;
            if self.matches_focus(&event) {
                return Some(event);
            }
            self.buffer(event);
        }
    }

    /// Take the buffered tail for one package.
    #[must_use]
    pub fn take_tail(&mut self, key: &str) -> Vec<LogEvent> {
        self.tails
            .remove(key)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Events dropped because this session's inbox was full.
    #[must_use]
    pub fn drop_count(&self) -> u64 {
        self.subscription.drop_count()
    }

    fn matches_focus(&self, event: &LogEvent) -> bool {
        self.focus
            .as_deref()
            .map_or(true, |focus| focus == event.package_key)
    }

    fn buffer(&mut self, event: LogEvent) {
        let tail = self.tails.entry(event.package_key.clone()).or_default();
        if tail.len() == SESSION_TAIL_CAPACITY {
            tail.pop_front();
        }
        tail.push_back(event);
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.subscription.id());
        tracing::debug!(subscriber = %self.subscription.id(), "session detached");
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("focus", &self.focus)
            .field("buffered_packages", &self.tails.len())
            .finish()
    }
}
