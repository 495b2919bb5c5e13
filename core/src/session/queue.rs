//! Serialized GATT operation queue
//!
//! The link accepts a single outstanding request, so the queue keeps at most
//! one task in flight. Pending tasks are ordered by priority, then creation
//! time. A failed or timed-out task is put back under its original key until
//! its retry budget is spent. A chunked write holds the in-flight slot for
//! its whole transfer and is never retried.

use super::task::{OperationTask, Priority, TaskId, TaskKind};
use crate::host::{HostCapability, HostError, LinkHandle, GATT_SUCCESS};
use crate::timer::{TimerFired, TimerKind, Timers};
use crate::BleError;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
struct ChunkCursor {
    index: usize,
    bytes_sent: usize,
}

struct InFlight {
    task: OperationTask,
    chunk: Option<ChunkCursor>,
}

/// Final outcome of a read, write or subscription change. Retried attempts
/// and intermediate chunks produce none; neither do cancellations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Read {
        characteristic: Uuid,
        success: bool,
    },
    Write {
        characteristic: Uuid,
        success: bool,
    },
    Subscription {
        characteristic: Uuid,
        enabled: bool,
        success: bool,
    },
}

impl Settled {
    fn of(kind: &TaskKind, success: bool) -> Option<Self> {
        match kind {
            TaskKind::Read { characteristic, .. } => Some(Settled::Read {
                characteristic: *characteristic,
                success,
            }),
            TaskKind::Write { characteristic, .. }
            | TaskKind::ChunkedWrite { characteristic, .. } => Some(Settled::Write {
                characteristic: *characteristic,
                success,
            }),
            TaskKind::EnableNotification {
                characteristic,
                enable,
                ..
            } => Some(Settled::Subscription {
                characteristic: *characteristic,
                enabled: *enable,
                success,
            }),
            TaskKind::RequestMtu { .. } => None,
        }
    }
}

enum Step {
    Finish,
    Fail { retryable: bool, cause: BleError },
    NextChunk,
}

pub struct OperationQueue {
    host: Arc<dyn HostCapability>,
    handle: Option<LinkHandle>,
    pending: BTreeMap<(Priority, Instant, TaskId), OperationTask>,
    in_flight: Option<InFlight>,
    timeout: Duration,
    timers: Timers,
    /// Tasks that failed for good since the last drain
    failures: Vec<BleError>,
    settled: Vec<Settled>,
}

impl OperationQueue {
    pub fn new(host: Arc<dyn HostCapability>, timeout: Duration, timers: Timers) -> Self {
        Self {
            host,
            handle: None,
            pending: BTreeMap::new(),
            in_flight: None,
            timeout,
            timers,
            failures: Vec::new(),
            settled: Vec::new(),
        }
    }

    /// Bind to a link and start draining.
    pub fn attach(&mut self, handle: LinkHandle) {
        self.handle = Some(handle);
        self.process_next();
    }

    /// Unbind and cancel everything.
    pub fn detach(&mut self) {
        self.handle = None;
        self.clear();
    }

    pub fn enqueue(&mut self, task: OperationTask) {
        debug!("queue: enqueued {} #{}", task.name(), task.id());
        self.pending.insert(task.queue_key(), task);
        self.process_next();
    }

    /// Completion of the in-flight request with the status the host reported.
    pub fn on_completion(&mut self, status: i32) {
        let success = status == GATT_SUCCESS;
        let step = match self.in_flight.as_mut() {
            None => {
                debug!("queue: completion with nothing in flight");
                return;
            }
            Some(InFlight {
                task,
                chunk: Some(cursor),
            }) => {
                if success {
                    advance_chunk(task, cursor)
                } else {
                    Step::Fail {
                        retryable: false,
                        cause: BleError::OperationFailed(status),
                    }
                }
            }
            Some(InFlight { chunk: None, .. }) => {
                if success {
                    Step::Finish
                } else {
                    Step::Fail {
                        retryable: true,
                        cause: BleError::OperationFailed(status),
                    }
                }
            }
        };
        self.timers.cancel(TimerKind::OperationTimeout);

        match step {
            Step::Finish => self.finish_current(),
            Step::Fail { retryable, cause } => self.fail_current(retryable, cause),
            Step::NextChunk => self.issue_or_fail(),
        }
        self.process_next();
    }

    /// Route an `OperationTimeout` expiry. Stale expiries are ignored.
    pub fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.accept(fired) {
            return;
        }
        self.fail_current(true, BleError::OperationTimeout);
        self.process_next();
    }

    pub fn current_task(&self) -> Option<&OperationTask> {
        self.in_flight.as_ref().map(|current| &current.task)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    /// Errors of tasks that exhausted their retry budget.
    pub fn take_failures(&mut self) -> Vec<BleError> {
        std::mem::take(&mut self.failures)
    }

    /// Final outcomes since the last drain, in completion order.
    pub fn take_settled(&mut self) -> Vec<Settled> {
        std::mem::take(&mut self.settled)
    }

    /// Cancel every pending and in-flight task; each completion sees `false`.
    pub fn clear(&mut self) {
        self.timers.cancel(TimerKind::OperationTimeout);
        let mut cancelled: Vec<OperationTask> =
            self.in_flight.take().map(|current| current.task).into_iter().collect();
        cancelled.extend(std::mem::take(&mut self.pending).into_values());

        if !cancelled.is_empty() {
            debug!("queue: cancelling {} task(s)", cancelled.len());
        }
        for task in cancelled {
            task.finish(false);
        }
    }

    fn process_next(&mut self) {
        while self.in_flight.is_none() {
            if self.handle.is_none() {
                return;
            }
            let Some((_, task)) = self.pending.pop_first() else {
                return;
            };

            let chunk = match task.kind() {
                TaskKind::ChunkedWrite { chunks, total, .. } => {
                    if chunks.is_empty() {
                        debug!("queue: chunked write #{} has nothing to send", task.id());
                        self.settled.extend(Settled::of(task.kind(), true));
                        task.finish(true);
                        continue;
                    }
                    debug!(
                        "queue: chunked write #{} start, {} bytes in {} chunks",
                        task.id(),
                        total,
                        chunks.len()
                    );
                    Some(ChunkCursor::default())
                }
                _ => None,
            };

            self.in_flight = Some(InFlight { task, chunk });
            self.issue_or_fail();
        }
    }

    fn issue_or_fail(&mut self) {
        let Some(handle) = self.handle else {
            self.fail_current(false, BleError::Closed);
            return;
        };
        match self.issue_current(handle) {
            Ok(()) => self.timers.arm(TimerKind::OperationTimeout, self.timeout),
            Err(HostError::NotFound(uuid)) => self.fail_current(false, BleError::NotFound(uuid)),
            Err(e) => {
                warn!("queue: host rejected request: {}", e);
                self.fail_current(true, BleError::OperationFailed(-1));
            }
        }
    }

    fn issue_current(&self, handle: LinkHandle) -> Result<(), HostError> {
        let Some(current) = &self.in_flight else {
            return Ok(());
        };
        let host = &self.host;

        match current.task.kind() {
            TaskKind::Read {
                service,
                characteristic,
            } => host.read_characteristic(handle, *service, *characteristic),
            TaskKind::Write {
                service,
                characteristic,
                data,
                mode,
            } => host.write_characteristic(handle, *service, *characteristic, data, *mode),
            TaskKind::ChunkedWrite {
                service,
                characteristic,
                chunks,
                mode,
                ..
            } => {
                let index = current.chunk.map(|cursor| cursor.index).unwrap_or(0);
                let chunk = chunks
                    .get(index)
                    .ok_or_else(|| HostError::Rejected(format!("no chunk {}", index)))?;
                debug!(
                    "queue: sending chunk {}/{} ({} bytes)",
                    index + 1,
                    chunks.len(),
                    chunk.len()
                );
                host.write_characteristic(handle, *service, *characteristic, chunk, *mode)
            }
            TaskKind::EnableNotification {
                service,
                characteristic,
                enable,
                indication,
            } => host.set_notification(handle, *service, *characteristic, *enable, *indication),
            TaskKind::RequestMtu { mtu } => host.request_mtu(handle, *mtu),
        }
    }

    fn finish_current(&mut self) {
        if let Some(current) = self.in_flight.take() {
            debug!(
                "queue: {} #{} completed",
                current.task.name(),
                current.task.id()
            );
            self.settled.extend(Settled::of(current.task.kind(), true));
            current.task.finish(true);
        }
    }

    fn fail_current(&mut self, retryable: bool, cause: BleError) {
        self.timers.cancel(TimerKind::OperationTimeout);
        let Some(InFlight { mut task, chunk }) = self.in_flight.take() else {
            return;
        };

        if let Some(cursor) = chunk {
            warn!(
                "queue: chunked write #{} failed at chunk {}: {}",
                task.id(),
                cursor.index + 1,
                cause
            );
            self.settled.extend(Settled::of(task.kind(), false));
            self.failures.push(cause);
            task.finish(false);
            return;
        }

        if retryable && task.retry_count < task.max_retry() {
            task.retry_count += 1;
            warn!(
                "queue: retrying {} #{} ({}/{}): {}",
                task.name(),
                task.id(),
                task.retry_count,
                task.max_retry(),
                cause
            );
            self.pending.insert(task.queue_key(), task);
        } else {
            warn!("queue: {} #{} failed: {}", task.name(), task.id(), cause);
            self.settled.extend(Settled::of(task.kind(), false));
            self.failures.push(cause);
            task.finish(false);
        }
    }
}

fn advance_chunk(task: &mut OperationTask, cursor: &mut ChunkCursor) -> Step {
    let TaskKind::ChunkedWrite {
        chunks,
        total,
        progress,
        ..
    } = task.kind_mut()
    else {
        return Step::Finish;
    };

    cursor.bytes_sent += chunks.get(cursor.index).map_or(0, Vec::len);
    cursor.index += 1;
    if let Some(progress) = progress.as_mut() {
        progress(cursor.bytes_sent, *total);
    }

    if cursor.index >= chunks.len() {
        Step::Finish
    } else {
        Step::NextChunk
    }
}
