//! The closed sets of events and queries that flow over the bus.

use foreman_db::models::{DependencyResolution, Task, TaskCheckpoint};

use crate::capture::TaskLogs;

/// Everything that can be broadcast on the bus.
///
/// Payloads carry owned snapshots; subscribers must treat them as frozen.
#[derive(Debug, Clone)]
pub enum Event {
    TaskDelegated {
        task: Task,
    },
    TaskDependencyAdded {
        task_id: String,
        depends_on_task_id: String,
    },
    TaskDependencyFailed {
        task_id: String,
        failed_dependency_id: String,
        requested_dependencies: Vec<String>,
        error: String,
    },
    TaskDependencyResolved {
        task_id: String,
        depends_on_task_id: String,
        resolution: DependencyResolution,
    },
    TaskQueued {
        task: Task,
    },
    TaskUnblocked {
        task_id: String,
        task: Task,
    },
    TaskStarting {
        task: Task,
    },
    TaskStarted {
        task_id: String,
        worker_id: String,
    },
    TaskCompleted {
        task_id: String,
        exit_code: i64,
        duration_ms: i64,
    },
    TaskFailed {
        task_id: String,
        exit_code: i64,
        error: Option<String>,
    },
    TaskCancelled {
        task_id: String,
        reason: Option<String>,
    },
    TaskTimeout {
        task_id: String,
        timeout_ms: i64,
    },
    TaskCancellationRequested {
        task_id: String,
        reason: Option<String>,
    },
    WorkerSpawned {
        worker_id: String,
        task_id: String,
        pid: u32,
    },
    WorkerKilled {
        worker_id: String,
        task_id: String,
        reason: String,
    },
    CheckpointCreated {
        task_id: String,
        checkpoint: TaskCheckpoint,
    },
    RecoveryStarted,
    RecoveryCompleted {
        tasks_recovered: usize,
        tasks_marked_failed: usize,
    },
    RequeueTask {
        task: Task,
    },
    TaskDeleted {
        task_id: String,
    },
    TaskResumed {
        original_task_id: String,
        checkpoint_used: bool,
    },
}

/// Discriminant used for subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskDelegated,
    TaskDependencyAdded,
    TaskDependencyFailed,
    TaskDependencyResolved,
    TaskQueued,
    TaskUnblocked,
    TaskStarting,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskTimeout,
    TaskCancellationRequested,
    WorkerSpawned,
    WorkerKilled,
    CheckpointCreated,
    RecoveryStarted,
    RecoveryCompleted,
    RequeueTask,
    TaskDeleted,
    TaskResumed,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TaskDelegated { .. } => EventKind::TaskDelegated,
            Self::TaskDependencyAdded { .. } => EventKind::TaskDependencyAdded,
            Self::TaskDependencyFailed { .. } => EventKind::TaskDependencyFailed,
            Self::TaskDependencyResolved { .. } => EventKind::TaskDependencyResolved,
            Self::TaskQueued { .. } => EventKind::TaskQueued,
            Self::TaskUnblocked { .. } => EventKind::TaskUnblocked,
            Self::TaskStarting { .. } => EventKind::TaskStarting,
            Self::TaskStarted { .. } => EventKind::TaskStarted,
            Self::TaskCompleted { .. } => EventKind::TaskCompleted,
            Self::TaskFailed { .. } => EventKind::TaskFailed,
            Self::TaskCancelled { .. } => EventKind::TaskCancelled,
            Self::TaskTimeout { .. } => EventKind::TaskTimeout,
            Self::TaskCancellationRequested { .. } => EventKind::TaskCancellationRequested,
            Self::WorkerSpawned { .. } => EventKind::WorkerSpawned,
            Self::WorkerKilled { .. } => EventKind::WorkerKilled,
            Self::CheckpointCreated { .. } => EventKind::CheckpointCreated,
            Self::RecoveryStarted => EventKind::RecoveryStarted,
            Self::RecoveryCompleted { .. } => EventKind::RecoveryCompleted,
            Self::RequeueTask { .. } => EventKind::RequeueTask,
            Self::TaskDeleted { .. } => EventKind::TaskDeleted,
            Self::TaskResumed { .. } => EventKind::TaskResumed,
        }
    }
}

/// A typed query with exactly one responder.
#[derive(Debug, Clone)]
pub enum Query {
    /// Pop the next runnable task off the priority queue.
    NextTask,
    /// Fetch one task by id, or every task when `task_id` is `None`.
    TaskStatus { task_id: Option<String> },
    /// Fetch captured output for a task, optionally only the last `tail`
    /// chunks of each stream.
    TaskLogs {
        task_id: String,
        tail: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    NextTask,
    TaskStatus,
    TaskLogs,
}

impl Query {
    pub fn kind(&self) -> QueryKind {
        match self {
            Self::NextTask => QueryKind::NextTask,
            Self::TaskStatus { .. } => QueryKind::TaskStatus,
            Self::TaskLogs { .. } => QueryKind::TaskLogs,
        }
    }
}

/// The value a responder returns for its query kind.
#[derive(Debug, Clone)]
pub enum QueryReply {
    NextTask(Option<Task>),
    Tasks(Vec<Task>),
    Logs(TaskLogs),
}
