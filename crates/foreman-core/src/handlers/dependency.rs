//! Dependency handler: validates and persists dependency edges, resolves
//! them on terminal events, unblocks waiters, and enriches continuation
//! prompts.
//!
//! Construction goes through a factory that loads the whole dependency
//! table, builds the in-memory graph, and only then subscribes — no event
//! can observe uninitialized state. The pipeline ordering on delegation is
//! strict: validation against the graph first, the repository write only
//! after validation passes, the graph update only after the write commits,
//! and `TaskDependencyAdded` only for edges that were persisted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use foreman_db::models::{
    DependencyResolution, Task, TaskCheckpoint, TaskPatch, TaskStatus,
};
use foreman_db::repo::{CheckpointRepository, DependencyRepository, TaskRepository};
use foreman_db::{Error, Result};

use crate::bus::{Event, EventBus, EventKind};
use crate::graph::DependencyGraph;

/// Default bound on the longest dependency chain.
pub const MAX_DEPENDENCY_CHAIN_DEPTH: usize = 100;
/// Default wait for a checkpoint when enriching a continuation.
pub const DEFAULT_ENRICH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DependencyHandlerConfig {
    pub max_chain_depth: usize,
    pub enrich_timeout: Duration,
}

impl Default for DependencyHandlerConfig {
    fn default() -> Self {
        Self {
            max_chain_depth: MAX_DEPENDENCY_CHAIN_DEPTH,
            enrich_timeout: DEFAULT_ENRICH_TIMEOUT,
        }
    }
}

/// How a proposed edge failed validation.
enum ValidationFailure {
    Cycle(String),
    Depth(String),
}

pub struct DependencyHandler {
    bus: Arc<EventBus>,
    deps: DependencyRepository,
    tasks: TaskRepository,
    checkpoints: Option<CheckpointRepository>,
    graph: Mutex<DependencyGraph>,
    config: DependencyHandlerConfig,
}

impl DependencyHandler {
    /// Factory: read the dependency table, build the graph, subscribe,
    /// return the fully constructed handler.
    pub async fn register(
        bus: Arc<EventBus>,
        deps: DependencyRepository,
        tasks: TaskRepository,
        checkpoints: Option<CheckpointRepository>,
        config: DependencyHandlerConfig,
    ) -> Result<Arc<Self>> {
        let edges = deps.find_all_unbounded().await?;
        let graph = DependencyGraph::from_edges(&edges);
        info!(edges = edges.len(), "dependency graph initialized");

        let handler = Arc::new(Self {
            bus,
            deps,
            tasks,
            checkpoints,
            graph: Mutex::new(graph),
            config,
        });

        {
            let handler_ref = Arc::clone(&handler);
            handler.bus.subscribe(EventKind::TaskDelegated, move |event| {
                let handler_ref = Arc::clone(&handler_ref);
                Box::pin(async move {
                    if let Event::TaskDelegated { task } = event {
                        handler_ref.on_task_delegated(&task).await?;
                    }
                    Ok(())
                })
            })?;
        }

        let terminal = [
            (EventKind::TaskCompleted, DependencyResolution::Completed),
            (EventKind::TaskFailed, DependencyResolution::Failed),
            (EventKind::TaskCancelled, DependencyResolution::Cancelled),
            (EventKind::TaskTimeout, DependencyResolution::Failed),
        ];
        for (kind, resolution) in terminal {
            let handler_ref = Arc::clone(&handler);
            handler.bus.subscribe(kind, move |event| {
                let handler_ref = Arc::clone(&handler_ref);
                Box::pin(async move {
                    let task_id = match &event {
                        Event::TaskCompleted { task_id, .. }
                        | Event::TaskFailed { task_id, .. }
                        | Event::TaskCancelled { task_id, .. }
                        | Event::TaskTimeout { task_id, .. } => task_id.clone(),
                        _ => return Ok(()),
                    };
                    handler_ref.on_task_terminal(&task_id, resolution).await
                })
            })?;
        }

        {
            let handler_ref = Arc::clone(&handler);
            handler.bus.subscribe(EventKind::TaskDeleted, move |event| {
                let handler_ref = Arc::clone(&handler_ref);
                Box::pin(async move {
                    if let Event::TaskDeleted { task_id } = event {
                        handler_ref.graph.lock().await.remove_task(&task_id);
                    }
                    Ok(())
                })
            })?;
        }

        Ok(handler)
    }

    /// Edge count currently mirrored in the graph.
    pub async fn graph_size(&self) -> usize {
        self.graph.lock().await.size()
    }

    /// Cycle probe against the live graph (used by invariant tests).
    pub async fn would_create_cycle(&self, task: &str, dep: &str) -> bool {
        self.graph.lock().await.would_create_cycle(task, dep)
    }

    /// Longest chain below `task` in the live graph.
    pub async fn max_depth(&self, task: &str) -> usize {
        self.graph.lock().await.max_depth(task)
    }

    // -----------------------------------------------------------------
    // Delegation path
    // -----------------------------------------------------------------

    async fn on_task_delegated(&self, task: &Task) -> Result<()> {
        if task.depends_on.is_empty() {
            return Ok(());
        }

        // Read-only validation against the in-memory graph, fail-fast on
        // the first rejected edge. No database write happens on failure.
        if let Some(failure) = self.validate_edges(task).await {
            let (dep_id, message) = match &failure {
                ValidationFailure::Cycle(dep) => (
                    dep.clone(),
                    format!("dependency ({} -> {dep}) would create cycle", task.id),
                ),
                ValidationFailure::Depth(dep) => (
                    dep.clone(),
                    format!(
                        "dependency ({} -> {dep}) would exceed max chain depth {}",
                        task.id, self.config.max_chain_depth
                    ),
                ),
            };
            warn!(task_id = %task.id, failed_dependency = %dep_id, "{message}");
            self.bus
                .emit(Event::TaskDependencyFailed {
                    task_id: task.id.clone(),
                    failed_dependency_id: dep_id,
                    requested_dependencies: task.depends_on.clone(),
                    error: message.clone(),
                })
                .await?;
            return Err(Error::invalid_operation(message));
        }

        // Persist the whole batch; storage-level violations (missing
        // endpoint, duplicate, cap) roll the batch back atomically.
        let inserted = match self.deps.add_dependencies(&task.id, &task.depends_on).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(task_id = %task.id, error = %err, "failed to persist dependency batch");
                self.bus
                    .emit(Event::TaskDependencyFailed {
                        task_id: task.id.clone(),
                        failed_dependency_id: task
                            .depends_on
                            .first()
                            .cloned()
                            .unwrap_or_default(),
                        requested_dependencies: task.depends_on.clone(),
                        error: err.to_string(),
                    })
                    .await?;
                return Err(err);
            }
        };

        // Graph strictly after the committed write, events strictly after
        // the graph.
        {
            let mut graph = self.graph.lock().await;
            for edge in &inserted {
                graph.add_edge(&edge.task_id, &edge.depends_on_task_id);
            }
        }
        for edge in &inserted {
            self.bus
                .emit(Event::TaskDependencyAdded {
                    task_id: edge.task_id.clone(),
                    depends_on_task_id: edge.depends_on_task_id.clone(),
                })
                .await?;
        }

        // A dependency may already be terminal by the time the edge lands;
        // resolve those immediately so the task does not wait forever.
        for dep_id in &task.depends_on {
            let Some(dep_task) = self.tasks.find_by_id(dep_id).await? else {
                continue;
            };
            if let Some(resolution) = resolution_for_status(dep_task.status) {
                self.deps.resolve_edge(&task.id, dep_id, resolution).await?;
                self.bus
                    .emit(Event::TaskDependencyResolved {
                        task_id: task.id.clone(),
                        depends_on_task_id: dep_id.clone(),
                        resolution,
                    })
                    .await?;
            }
        }

        Ok(())
    }

    async fn validate_edges(&self, task: &Task) -> Option<ValidationFailure> {
        let mut graph = self.graph.lock().await;
        for dep_id in &task.depends_on {
            if graph.would_create_cycle(&task.id, dep_id) {
                return Some(ValidationFailure::Cycle(dep_id.clone()));
            }
            if 1 + graph.max_depth(dep_id) > self.config.max_chain_depth {
                return Some(ValidationFailure::Depth(dep_id.clone()));
            }
        }
        None
    }

    // -----------------------------------------------------------------
    // Terminal path
    // -----------------------------------------------------------------

    async fn on_task_terminal(
        &self,
        task_id: &str,
        resolution: DependencyResolution,
    ) -> Result<()> {
        let dependents = self.deps.get_dependents(task_id).await?;
        if dependents.is_empty() {
            return Ok(());
        }

        let changed = self
            .deps
            .resolve_dependencies_batch(task_id, resolution)
            .await?;
        debug!(task_id, resolution = %resolution, changed, "resolved dependency batch");

        for edge in dependents {
            if edge.resolution != DependencyResolution::Pending {
                continue;
            }
            self.bus
                .emit(Event::TaskDependencyResolved {
                    task_id: edge.task_id.clone(),
                    depends_on_task_id: task_id.to_string(),
                    resolution,
                })
                .await?;

            if self.deps.is_blocked(&edge.task_id).await? {
                continue;
            }

            let Some(dependent) = self.tasks.find_by_id(&edge.task_id).await? else {
                warn!(task_id = %edge.task_id, "unblocked task no longer exists");
                continue;
            };
            if dependent.status != TaskStatus::Queued {
                debug!(
                    task_id = %dependent.id,
                    status = %dependent.status,
                    "unblocked task is not queued, skipping"
                );
                continue;
            }

            let dependent = self.maybe_enrich(dependent).await;
            self.bus
                .emit(Event::TaskUnblocked {
                    task_id: dependent.id.clone(),
                    task: dependent,
                })
                .await?;
        }

        Ok(())
    }

    // -----------------------------------------------------------------
    // Continuation enrichment
    // -----------------------------------------------------------------

    /// Enrich the prompt of an unblocked continuation task with the latest
    /// checkpoint of its `continue_from` target.
    ///
    /// Checkpoint creation and dependency resolution are peer subscribers
    /// to the same terminal event, so the lookup subscribes to
    /// `CheckpointCreated` first and only then probes the repository —
    /// whichever settles first wins, bounded by a timeout. Enrichment is
    /// best-effort: on timeout the task proceeds unenriched.
    async fn maybe_enrich(&self, task: Task) -> Task {
        let Some(checkpoints) = &self.checkpoints else {
            return task;
        };
        let Some(target) = task.continue_from.clone() else {
            return task;
        };

        let (tx, mut rx) = tokio::sync::mpsc::channel::<TaskCheckpoint>(1);
        let subscription = {
            let target = target.clone();
            self.bus.subscribe(EventKind::CheckpointCreated, move |event| {
                let tx = tx.clone();
                let target = target.clone();
                Box::pin(async move {
                    if let Event::CheckpointCreated { task_id, checkpoint } = event {
                        if task_id == target {
                            let _ = tx.try_send(checkpoint);
                        }
                    }
                    Ok(())
                })
            })
        };
        let subscription = match subscription {
            Ok(id) => id,
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "could not watch for checkpoint, skipping enrichment");
                return task;
            }
        };

        let existing = match checkpoints.find_latest(&target).await {
            Ok(found) => found,
            Err(err) => {
                warn!(target = %target, error = %err, "checkpoint probe failed");
                None
            }
        };
        let checkpoint = match existing {
            Some(found) => Some(found),
            None => tokio::time::timeout(self.config.enrich_timeout, rx.recv())
                .await
                .ok()
                .flatten(),
        };
        self.bus.unsubscribe(subscription);

        let Some(checkpoint) = checkpoint else {
            warn!(
                task_id = %task.id,
                target = %target,
                "no checkpoint arrived in time, proceeding without enrichment"
            );
            return task;
        };

        let dep_prompt = match self.tasks.find_by_id(&target).await {
            Ok(Some(dep)) => dep.prompt,
            _ => String::new(),
        };

        let enriched = build_enriched_prompt(&dep_prompt, &checkpoint, &task.prompt);
        match self
            .tasks
            .update(
                &task.id,
                TaskPatch {
                    prompt: Some(enriched),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(updated) => {
                debug!(task_id = %updated.id, "continuation prompt enriched");
                updated
            }
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "failed to persist enriched prompt");
                task
            }
        }
    }
}

fn resolution_for_status(status: TaskStatus) -> Option<DependencyResolution> {
    match status {
        TaskStatus::Completed => Some(DependencyResolution::Completed),
        TaskStatus::Failed => Some(DependencyResolution::Failed),
        TaskStatus::Cancelled => Some(DependencyResolution::Cancelled),
        TaskStatus::Queued | TaskStatus::Running => None,
    }
}

fn build_enriched_prompt(
    dep_prompt: &str,
    checkpoint: &TaskCheckpoint,
    original_prompt: &str,
) -> String {
    let mut sections = vec!["DEPENDENCY CONTEXT:".to_string()];
    if !dep_prompt.is_empty() {
        sections.push(format!("Task: {dep_prompt}"));
    }
    if let Some(output) = &checkpoint.output_summary {
        sections.push(format!("Output: {output}"));
    }
    if let Some(error) = &checkpoint.error_summary {
        sections.push(format!("Error: {error}"));
    }
    if let Some(git) = &checkpoint.git_state {
        sections.push(format!("git: {}@{}", git.branch, git.commit));
        if !git.dirty_files.is_empty() {
            sections.push(format!("Dirty files: {}", git.dirty_files.join(", ")));
        }
    }
    sections.push(String::new());
    sections.push(format!("YOUR TASK: {original_prompt}"));
    sections.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use foreman_db::models::{CheckpointType, GitState};

    #[test]
    fn enriched_prompt_contains_every_section() {
        let checkpoint = TaskCheckpoint {
            id: 1,
            task_id: "dep".into(),
            checkpoint_type: CheckpointType::Completed,
            output_summary: Some("schema ready".into()),
            error_summary: None,
            git_state: Some(GitState {
                branch: "main".into(),
                commit: "abc".into(),
                dirty_files: vec!["schema.sql".into()],
            }),
            context: None,
            created_at: Utc::now(),
        };

        let prompt = build_enriched_prompt("Set up DB", &checkpoint, "Seed data");
        assert!(prompt.contains("DEPENDENCY CONTEXT:"));
        assert!(prompt.contains("Set up DB"));
        assert!(prompt.contains("schema ready"));
        assert!(prompt.contains("main"));
        assert!(prompt.contains("abc"));
        assert!(prompt.contains("schema.sql"));
        assert!(prompt.contains("YOUR TASK: Seed data"));
    }

    #[test]
    fn resolution_mapping_covers_terminal_statuses() {
        assert_eq!(
            resolution_for_status(TaskStatus::Completed),
            Some(DependencyResolution::Completed)
        );
        assert_eq!(
            resolution_for_status(TaskStatus::Failed),
            Some(DependencyResolution::Failed)
        );
        assert_eq!(
            resolution_for_status(TaskStatus::Cancelled),
            Some(DependencyResolution::Cancelled)
        );
        assert_eq!(resolution_for_status(TaskStatus::Running), None);
        assert_eq!(resolution_for_status(TaskStatus::Queued), None);
    }
}
