// Leading + trailing throttle for progress commits of a single job

use std::time::Duration;

use tokio::time::Instant;

/// What the caller must do after registering an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Commit the current state right away
    CommitNow,
    /// Commit at `at` unless the ticket is invalidated first
    ScheduleTrailing { at: Instant, ticket: u64 },
    /// A trailing commit is already scheduled and will carry this update
    Coalesced,
}

#[derive(Debug)]
pub struct Throttle {
    window: Duration,
    last_commit: Option<Instant>,
    trailing: Option<u64>,
    next_ticket: u64,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_commit: None,
            trailing: None,
            next_ticket: 0,
        }
    }

    /// Register an update at `now`. `flush` bypasses the window and
    /// cancels any pending trailing commit.
    pub fn on_update(&mut self, now: Instant, flush: bool) -> ThrottleDecision {
        if flush {
            self.trailing = None;
            self.last_commit = Some(now);
            return ThrottleDecision::CommitNow;
        }

        if self.trailing.is_some() {
            return ThrottleDecision::Coalesced;
        }

        match self.last_commit {
            Some(last) if now < last + self.window => {
                self.next_ticket += 1;
                self.trailing = Some(self.next_ticket);
                ThrottleDecision::ScheduleTrailing {
                    at: last + self.window,
                    ticket: self.next_ticket,
                }
            }
            _ => {
                self.last_commit = Some(now);
                ThrottleDecision::CommitNow
            }
        }
    }

    /// Trailing timer for `ticket` fired; true when the commit is still owed
    pub fn on_trailing(&mut self, ticket: u64, now: Instant) -> bool {
        if self.trailing != Some(ticket) {
            return false;
        }
        self.trailing = None;
        self.last_commit = Some(now);
        true
    }
}
