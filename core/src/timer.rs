//! Scheduled callbacks for actor-confined state.
//!
//! A timer never touches state itself. When it elapses it posts a
//! [`TimerFired`] back through the owner's ingress channel, so expiry is
//! handled on the same consumer as every other event. Re-arming or
//! cancelling a kind retires its token; a late expiry carrying a retired
//! token is rejected by [`Timers::accept`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Connect-phase deadline
    ConnectTimeout,
    /// Short pause between link-up and service discovery
    DiscoverySettle,
    /// Forced local teardown when link-down never arrives after `disconnect()`
    DisconnectGrace,
    /// Per-request deadline of the in-flight operation
    OperationTimeout,
    /// Guardian reconnect (quick or standard path)
    Reconnect,
    /// End of the assist scan started while connecting
    AssistTimeout,
    /// Scanner on-window
    ScanWindow,
    /// Scanner off-window
    IdleWindow,
}

/// Expiry notice posted back to the owning actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    token: u64,
}

/// Delivers a [`TimerFired`] onto the owner's channel.
pub type TimerPost = Arc<dyn Fn(TimerFired) + Send + Sync>;

/// One pending timer per [`TimerKind`].
pub struct Timers {
    post: TimerPost,
    next_token: u64,
    armed: HashMap<TimerKind, (u64, JoinHandle<()>)>,
}

impl Timers {
    pub fn new(post: TimerPost) -> Self {
        Self {
            post,
            next_token: 0,
            armed: HashMap::new(),
        }
    }

    /// Arm `kind`, replacing any pending timer of the same kind.
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);
        self.next_token += 1;
        let fired = TimerFired {
            kind,
            token: self.next_token,
        };
        let post = Arc::clone(&self.post);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            post(fired);
        });
        self.armed.insert(kind, (fired.token, task));
    }

    /// Cancel `kind`. Returns whether a timer was pending.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.armed.remove(&kind) {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, task)) in self.armed.drain() {
            task.abort();
        }
    }

    /// Consume an expiry. `false` means it was cancelled or superseded.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.armed.get(&fired.kind) {
            Some((token, _)) if *token == fired.token => {
                self.armed.remove(&fired.kind);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
