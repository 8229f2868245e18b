//! Schedule engine: periodic due-poll that materializes tasks from
//! schedule templates.
//!
//! Every tick asks the repository for due schedules, delegates a task per
//! due instant, records the execution, and advances `next_run_at` (cron
//! expressions are evaluated in the schedule's timezone). Missed runs —
//! instants that passed while the daemon was down — follow the schedule's
//! policy: skip past them, catch each one up, or expire the schedule.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use foreman_db::models::{
    MissedRunPolicy, Schedule, ScheduleStatus, ScheduleType, TaskTemplate,
};
use foreman_db::repo::ScheduleRepository;
use foreman_db::{Error, Result};

use crate::manager::{DelegateRequest, TaskManager};

/// Default wake interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Upper bound on catch-up dispatches per schedule per tick.
pub const DEFAULT_CATCHUP_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct ScheduleEngineConfig {
    pub poll_interval: Duration,
    pub catchup_limit: usize,
}

impl Default for ScheduleEngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            catchup_limit: DEFAULT_CATCHUP_LIMIT,
        }
    }
}

pub struct ScheduleEngine {
    schedules: ScheduleRepository,
    manager: Arc<TaskManager>,
    config: ScheduleEngineConfig,
    shutdown: CancellationToken,
}

impl ScheduleEngine {
    pub fn new(
        schedules: ScheduleRepository,
        manager: Arc<TaskManager>,
        config: ScheduleEngineConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            schedules,
            manager,
            config,
            shutdown,
        })
    }

    /// Spawn the periodic poll loop. Stops when the shutdown token fires.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => {
                        debug!("schedule engine stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(err) = engine.tick().await {
                            warn!(error = %err, "schedule poll failed");
                        }
                    }
                }
            }
        })
    }

    /// One poll: evaluate every due schedule. Returns the number of tasks
    /// dispatched.
    pub async fn tick(&self) -> Result<usize> {
        let now = Utc::now();
        let due = self.schedules.find_due(now).await?;
        let mut dispatched = 0;
        for schedule in due {
            let schedule_id = schedule.id.clone();
            match self.run_schedule(schedule, now).await {
                Ok(count) => dispatched += count,
                Err(err) => warn!(schedule_id = %schedule_id, error = %err, "schedule run failed"),
            }
        }
        Ok(dispatched)
    }

    async fn run_schedule(&self, mut schedule: Schedule, now: DateTime<Utc>) -> Result<usize> {
        if schedule.expires_at.is_some_and(|at| at <= now) {
            info!(schedule_id = %schedule.id, name = %schedule.name, "schedule expired");
            schedule.status = ScheduleStatus::Expired;
            schedule.next_run_at = None;
            self.schedules.update(&schedule).await?;
            return Ok(0);
        }

        let due_at = schedule.next_run_at.unwrap_or(now);
        let grace = chrono::Duration::from_std(self.config.poll_interval * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let missed = now - due_at > grace;

        if missed && schedule.missed_run_policy == MissedRunPolicy::Fail {
            warn!(
                schedule_id = %schedule.id,
                due_at = %due_at,
                "missed run with fail policy, expiring schedule"
            );
            self.schedules
                .record_execution(
                    &schedule.id,
                    None,
                    "error",
                    Some(&format!("missed scheduled run at {due_at}")),
                )
                .await?;
            schedule.status = ScheduleStatus::Expired;
            schedule.next_run_at = None;
            self.schedules.update(&schedule).await?;
            return Ok(0);
        }

        // Which instants to dispatch this tick. `skip` collapses any
        // missed backlog into a single run; `catchup` replays each missed
        // cron instant.
        let instants: Vec<DateTime<Utc>> =
            if missed && schedule.missed_run_policy == MissedRunPolicy::Catchup {
                match self.missed_instants(&schedule, due_at, now) {
                    Ok(list) if !list.is_empty() => list,
                    Ok(_) => vec![now],
                    Err(err) => {
                        warn!(schedule_id = %schedule.id, error = %err, "failed to expand missed instants");
                        vec![now]
                    }
                }
            } else {
                vec![now]
            };

        let mut dispatched = 0;
        for instant in &instants {
            let request = delegate_request_from(&schedule.template);
            match self.manager.delegate(request).await {
                Ok(task) => {
                    dispatched += 1;
                    schedule.run_count += 1;
                    self.schedules
                        .record_execution(&schedule.id, Some(&task.id), "dispatched", None)
                        .await?;
                    debug!(
                        schedule_id = %schedule.id,
                        task_id = %task.id,
                        instant = %instant,
                        "schedule dispatched task"
                    );
                }
                Err(err) => {
                    warn!(schedule_id = %schedule.id, error = %err, "schedule dispatch failed");
                    self.schedules
                        .record_execution(&schedule.id, None, "error", Some(&err.to_string()))
                        .await?;
                }
            }
            if schedule
                .max_runs
                .is_some_and(|max| schedule.run_count >= max)
            {
                break;
            }
        }

        schedule.last_run_at = Some(now);
        let exhausted = schedule
            .max_runs
            .is_some_and(|max| schedule.run_count >= max);
        if exhausted || schedule.schedule_type == ScheduleType::Once {
            schedule.status = ScheduleStatus::Completed;
            schedule.next_run_at = None;
        } else {
            schedule.next_run_at = self.next_occurrence(&schedule, now)?;
            if schedule.next_run_at.is_none() {
                schedule.status = ScheduleStatus::Completed;
            }
        }
        self.schedules.update(&schedule).await?;

        Ok(dispatched)
    }

    /// The next cron occurrence after `after`, evaluated in the schedule's
    /// timezone.
    fn next_occurrence(
        &self,
        schedule: &Schedule,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(expression) = &schedule.cron_expression else {
            return Ok(None);
        };
        let cron = cron::Schedule::from_str(expression).map_err(|e| {
            Error::invalid_operation(format!("invalid cron expression {expression:?}: {e}"))
        })?;
        let tz = parse_timezone(&schedule.timezone);
        Ok(cron
            .after(&after.with_timezone(&tz))
            .next()
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Every cron instant in `(from, to]`, bounded by the catch-up limit.
    fn missed_instants(
        &self,
        schedule: &Schedule,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let Some(expression) = &schedule.cron_expression else {
            return Ok(Vec::new());
        };
        let cron = cron::Schedule::from_str(expression).map_err(|e| {
            Error::invalid_operation(format!("invalid cron expression {expression:?}: {e}"))
        })?;
        let tz = parse_timezone(&schedule.timezone);

        let mut instants = Vec::new();
        for occurrence in cron.after(&from.with_timezone(&tz)) {
            let utc = occurrence.with_timezone(&Utc);
            if utc > to || instants.len() >= self.config.catchup_limit {
                break;
            }
            instants.push(utc);
        }
        Ok(instants)
    }
}

fn parse_timezone(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        warn!(timezone = name, "unknown timezone, falling back to UTC");
        Tz::UTC
    })
}

fn delegate_request_from(template: &TaskTemplate) -> DelegateRequest {
    DelegateRequest {
        prompt: template.prompt.clone(),
        priority: Some(template.priority),
        working_directory: template.working_directory.clone(),
        timeout_ms: template.timeout_ms,
        max_output_buffer: template.max_output_buffer,
        worktree: template.worktree.clone(),
        depends_on: Vec::new(),
        continue_from: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timezone_parsing_falls_back_to_utc() {
        assert_eq!(parse_timezone("Europe/Berlin"), chrono_tz::Europe::Berlin);
        assert_eq!(parse_timezone("Not/AZone"), Tz::UTC);
    }

    #[test]
    fn template_maps_onto_delegate_request() {
        let template = TaskTemplate {
            prompt: "sweep the floors".into(),
            priority: foreman_db::models::Priority::P2,
            working_directory: Some("/srv/shop".into()),
            timeout_ms: Some(1000),
            max_output_buffer: None,
            worktree: None,
        };
        let request = delegate_request_from(&template);
        assert_eq!(request.prompt, "sweep the floors");
        assert_eq!(request.priority, Some(foreman_db::models::Priority::P2));
        assert_eq!(request.working_directory.as_deref(), Some("/srv/shop"));
        assert!(request.depends_on.is_empty());
    }
}
