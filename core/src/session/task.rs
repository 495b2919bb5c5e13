//! Queued GATT operations.

use crate::host::WriteMode;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::error;
use uuid::Uuid;

/// Default retry budget for every operation kind except chunked writes.
pub const DEFAULT_MAX_RETRY: u32 = 3;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

pub type TaskId = u64;

/// Terminal outcome callback, invoked exactly once.
pub type Completion = Box<dyn FnOnce(bool) + Send>;

/// Chunked-write progress: `(bytes_sent, total_bytes)`.
pub type Progress = Box<dyn FnMut(usize, usize) + Send>;

/// Dispatch priority. Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    High,
    Normal,
    Low,
}

pub enum TaskKind {
    Read {
        service: Uuid,
        characteristic: Uuid,
    },
    Write {
        service: Uuid,
        characteristic: Uuid,
        data: Vec<u8>,
        mode: WriteMode,
    },
    /// One queue slot for the whole transfer; chunks go out in order.
    ChunkedWrite {
        service: Uuid,
        characteristic: Uuid,
        chunks: Vec<Vec<u8>>,
        mode: WriteMode,
        total: usize,
        progress: Option<Progress>,
    },
    EnableNotification {
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
        indication: bool,
    },
    RequestMtu {
        mtu: u16,
    },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Read { .. } => "Read",
            TaskKind::Write { .. } => "Write",
            TaskKind::ChunkedWrite { .. } => "ChunkedWrite",
            TaskKind::EnableNotification { .. } => "EnableNotification",
            TaskKind::RequestMtu { .. } => "RequestMtu",
        }
    }

    pub fn characteristic(&self) -> Option<Uuid> {
        match self {
            TaskKind::Read { characteristic, .. }
            | TaskKind::Write { characteristic, .. }
            | TaskKind::ChunkedWrite { characteristic, .. }
            | TaskKind::EnableNotification { characteristic, .. } => Some(*characteristic),
            TaskKind::RequestMtu { .. } => None,
        }
    }
}

pub struct OperationTask {
    id: TaskId,
    priority: Priority,
    created_at: Instant,
    pub(crate) retry_count: u32,
    max_retry: u32,
    kind: TaskKind,
    completion: Option<Completion>,
}

impl OperationTask {
    fn new(kind: TaskKind, priority: Priority, max_retry: u32) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            priority,
            created_at: Instant::now(),
            retry_count: 0,
            max_retry,
            kind,
            completion: None,
        }
    }

    pub fn read(service: Uuid, characteristic: Uuid) -> Self {
        Self::new(
            TaskKind::Read {
                service,
                characteristic,
            },
            Priority::Normal,
            DEFAULT_MAX_RETRY,
        )
    }

    pub fn write(service: Uuid, characteristic: Uuid, data: Vec<u8>, mode: WriteMode) -> Self {
        Self::new(
            TaskKind::Write {
                service,
                characteristic,
                data,
                mode,
            },
            Priority::Normal,
            DEFAULT_MAX_RETRY,
        )
    }

    /// Split `data` into `chunk_size` pieces. Never retried as a whole.
    pub fn chunked_write(
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        chunk_size: usize,
        mode: WriteMode,
    ) -> Self {
        Self::new(
            TaskKind::ChunkedWrite {
                service,
                characteristic,
                chunks: split_chunks(data, chunk_size),
                mode,
                total: data.len(),
                progress: None,
            },
            Priority::Normal,
            0,
        )
    }

    pub fn enable_notification(
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
        indication: bool,
    ) -> Self {
        Self::new(
            TaskKind::EnableNotification {
                service,
                characteristic,
                enable,
                indication,
            },
            Priority::High,
            DEFAULT_MAX_RETRY,
        )
    }

    pub fn request_mtu(mtu: u16) -> Self {
        Self::new(TaskKind::RequestMtu { mtu }, Priority::High, DEFAULT_MAX_RETRY)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_completion(mut self, completion: impl FnOnce(bool) + Send + 'static) -> Self {
        self.completion = Some(Box::new(completion));
        self
    }

    pub(crate) fn with_boxed_completion(mut self, completion: Option<Completion>) -> Self {
        self.completion = completion;
        self
    }

    /// Attach a progress callback. Ignored for anything but chunked writes.
    pub fn with_progress(mut self, callback: impl FnMut(usize, usize) + Send + 'static) -> Self {
        self.set_progress(Some(Box::new(callback)));
        self
    }

    pub(crate) fn set_progress(&mut self, callback: Option<Progress>) {
        if let TaskKind::ChunkedWrite { progress, .. } = &mut self.kind {
            *progress = callback;
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut TaskKind {
        &mut self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub(crate) fn queue_key(&self) -> (Priority, Instant, TaskId) {
        (self.priority, self.created_at, self.id)
    }

    /// Deliver the terminal outcome. A panicking callback is logged and
    /// contained.
    pub(crate) fn finish(mut self, success: bool) {
        if let Some(completion) = self.completion.take() {
            if catch_unwind(AssertUnwindSafe(|| completion(success))).is_err() {
                error!("queue: completion callback for {} #{} panicked", self.name(), self.id);
            }
        }
    }
}

impl fmt::Debug for OperationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTask")
            .field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .field("max_retry", &self.max_retry)
            .finish()
    }
}

/// Split a payload into pieces of at most `chunk_size` bytes. A zero chunk
/// size keeps the payload whole.
pub fn split_chunks(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    if chunk_size == 0 {
        return vec![data.to_vec()];
    }
    data.chunks(chunk_size).map(<[u8]>::to_vec).collect()
}

/// Caller-facing write, resolved into a `Write` or `ChunkedWrite` task by
/// the session once the payload capacity is known.
pub struct WriteRequest {
    pub characteristic: Uuid,
    pub data: Vec<u8>,
    pub preference: Option<WriteMode>,
    pub priority: Priority,
    pub(crate) completion: Option<Completion>,
    pub(crate) progress: Option<Progress>,
}

impl WriteRequest {
    pub fn new(characteristic: Uuid, data: impl Into<Vec<u8>>) -> Self {
        Self {
            characteristic,
            data: data.into(),
            preference: None,
            priority: Priority::Normal,
            completion: None,
            progress: None,
        }
    }

    pub fn with_mode(mut self, mode: WriteMode) -> Self {
        self.preference = Some(mode);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn on_complete(mut self, completion: impl FnOnce(bool) + Send + 'static) -> Self {
        self.completion = Some(Box::new(completion));
        self
    }

    pub fn on_progress(mut self, callback: impl FnMut(usize, usize) + Send + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }
}
