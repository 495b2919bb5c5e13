//! Reconnection guardian.
//!
//! Watches disconnect outcomes of a guarded session and schedules reconnect
//! attempts. Transient connect-phase failures get a short quick-retry path;
//! everything else goes through the configured interval with an optional
//! attempt cap. User-requested disconnects never trigger a reconnect.

use super::DisconnectReason;
use crate::timer::{TimerFired, TimerKind, Timers};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Quick-retry tuning for connect-phase failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianPolicy {
    pub max_quick_retry: u32,
    pub quick_retry_delay_ms: u64,
    /// Host status codes treated as transient when seen during connect
    pub transient_statuses: Vec<i32>,
}

impl Default for GuardianPolicy {
    fn default() -> Self {
        Self {
            max_quick_retry: 2,
            quick_retry_delay_ms: 300,
            transient_statuses: vec![133, 8, 19, 22, 34, 62],
        }
    }
}

impl GuardianPolicy {
    pub fn is_transient(&self, status: i32) -> bool {
        self.transient_statuses.contains(&status)
    }
}

/// Snapshot of guardian counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GuardianStatus {
    pub guarding: bool,
    pub paused: bool,
    pub reconnecting: bool,
    pub quick_retries: u32,
    pub reconnect_attempts: u32,
}

pub type ReconnectAction = Arc<dyn Fn() + Send + Sync>;

pub struct ReconnectionGuardian {
    policy: GuardianPolicy,
    interval: Duration,
    /// Negative means unlimited
    max_attempts: i32,
    reconnect: ReconnectAction,
    timers: Timers,
    guarding: bool,
    paused: bool,
    reconnecting: bool,
    quick_retry_count: u32,
    reconnect_count: u32,
}

impl ReconnectionGuardian {
    pub fn new(
        policy: GuardianPolicy,
        interval: Duration,
        max_attempts: i32,
        reconnect: ReconnectAction,
        timers: Timers,
    ) -> Self {
        Self {
            policy,
            interval,
            max_attempts,
            reconnect,
            timers,
            guarding: false,
            paused: false,
            reconnecting: false,
            quick_retry_count: 0,
            reconnect_count: 0,
        }
    }

    pub fn start(&mut self) {
        if !self.guarding {
            info!("guardian: started");
        }
        self.guarding = true;
    }

    pub fn stop(&mut self) {
        if self.guarding {
            info!("guardian: stopped");
        }
        self.guarding = false;
        self.paused = false;
        self.reconnecting = false;
        self.quick_retry_count = 0;
        self.reconnect_count = 0;
        self.timers.cancel(TimerKind::Reconnect);
    }

    /// Suspend while the app is in the background. Counters survive.
    pub fn pause(&mut self) {
        if !self.guarding || self.paused {
            return;
        }
        debug!("guardian: paused");
        self.paused = true;
        self.reconnecting = false;
        self.timers.cancel(TimerKind::Reconnect);
    }

    /// Leave the paused state and, when the link is down, reconnect at once.
    pub fn resume(&mut self, connected: bool) {
        if !self.paused {
            return;
        }
        debug!("guardian: resumed");
        self.paused = false;
        if self.guarding && !connected && !self.reconnecting {
            self.schedule(Duration::ZERO);
        }
    }

    pub fn on_connected(&mut self) {
        self.quick_retry_count = 0;
        self.reconnect_count = 0;
        self.reconnecting = false;
        self.timers.cancel(TimerKind::Reconnect);
    }

    pub fn on_disconnected(&mut self, reason: DisconnectReason, status: i32, connect_phase: bool) {
        self.reconnecting = false;
        if reason == DisconnectReason::UserRequest || !self.guarding || self.paused {
            return;
        }

        if connect_phase
            && self.policy.is_transient(status)
            && self.quick_retry_count < self.policy.max_quick_retry
        {
            self.quick_retry_count += 1;
            info!(
                "guardian: transient status {}, quick retry {}/{}",
                status, self.quick_retry_count, self.policy.max_quick_retry
            );
            self.schedule(Duration::from_millis(self.policy.quick_retry_delay_ms));
            return;
        }

        self.quick_retry_count = 0;
        if self.max_attempts >= 0 && self.reconnect_count >= self.max_attempts as u32 {
            info!(
                "guardian: giving up after {} reconnect attempt(s)",
                self.reconnect_count
            );
            return;
        }
        self.reconnect_count += 1;
        info!(
            "guardian: reconnect attempt {} in {:?} ({:?}, status {})",
            self.reconnect_count, self.interval, reason, status
        );
        self.schedule(self.interval);
    }

    /// Route a `Reconnect` expiry.
    pub fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.accept(fired) {
            return;
        }
        if self.guarding && !self.paused {
            debug!("guardian: reconnecting");
            (self.reconnect)();
        } else {
            self.reconnecting = false;
        }
    }

    pub fn is_guarding(&self) -> bool {
        self.guarding
    }

    pub fn status(&self) -> GuardianStatus {
        GuardianStatus {
            guarding: self.guarding,
            paused: self.paused,
            reconnecting: self.reconnecting,
            quick_retries: self.quick_retry_count,
            reconnect_attempts: self.reconnect_count,
        }
    }

    fn schedule(&mut self, delay: Duration) {
        self.reconnecting = true;
        self.timers.arm(TimerKind::Reconnect, delay);
    }
}
