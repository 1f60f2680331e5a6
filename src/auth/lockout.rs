//! Failed-login accounting.
//!
//! The policy is a pure function of the stored counters and the current time;
//! callers persist the resulting [`Decision`] with one conditional update and
//! re-evaluate from fresh state when that update loses a race.

use chrono::{DateTime, Duration, Utc};

use crate::store::{AccountStatus, UserRecord};

pub const DEFAULT_LOCK_THRESHOLD: i32 = 5;
pub const DEFAULT_LOCK_DURATION_MINS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordCheck {
    Matched,
    Mismatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The account is inside its lock window; nothing changes.
    RejectLocked { until: DateTime<Utc> },
    Increment { failures: i32 },
    Lock { failures: i32, until: DateTime<Utc> },
    Reset,
}

#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    pub threshold: i32,
    pub lock_duration: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_LOCK_THRESHOLD,
            lock_duration: Duration::minutes(DEFAULT_LOCK_DURATION_MINS),
        }
    }
}

impl LockoutPolicy {
    pub fn new(threshold: i32, lock_duration: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            lock_duration,
        }
    }

    pub fn is_locked(&self, locked_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        locked_until.is_some_and(|until| now < until)
    }

    pub fn evaluate(
        &self,
        current_failures: i32,
        locked_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        check: PasswordCheck,
    ) -> Decision {
        if let Some(until) = locked_until.filter(|until| now < *until) {
            return Decision::RejectLocked { until };
        }

        match check {
            PasswordCheck::Matched => Decision::Reset,
            PasswordCheck::Mismatched => {
                // An expired lock starts a fresh window.
                let base = if locked_until.is_some() {
                    0
                } else {
                    current_failures.max(0)
                };
                let failures = base.saturating_add(1);
                if failures >= self.threshold {
                    Decision::Lock {
                        failures,
                        until: now + self.lock_duration,
                    }
                } else {
                    Decision::Increment { failures }
                }
            }
        }
    }
}

impl Decision {
    /// Writes the decision into a user record. `RejectLocked` leaves it untouched.
    pub fn apply(&self, user: &mut UserRecord) {
        match *self {
            Decision::RejectLocked { .. } => {}
            Decision::Increment { failures } => {
                user.failed_login_attempts = failures;
                user.account_locked_until = None;
                if user.account_status == AccountStatus::Locked {
                    user.account_status = AccountStatus::Active;
                }
            }
            Decision::Lock { failures, until } => {
                user.failed_login_attempts = failures;
                user.account_locked_until = Some(until);
                user.account_status = AccountStatus::Locked;
            }
            Decision::Reset => {
                user.failed_login_attempts = 0;
                user.account_locked_until = None;
                if user.account_status == AccountStatus::Locked {
                    user.account_status = AccountStatus::Active;
                }
            }
        }
    }
}
