//! Named periodic tasks on top of `tokio-cron-scheduler`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task {name:?} is already registered")]
    DuplicateTask { name: String },
    #[error("scheduler: {0}")]
    Cron(#[from] JobSchedulerError),
}

/// Registry of periodic tasks keyed by name. Names are unique among the
/// registered tasks.
pub struct TaskScheduler {
    inner: JobScheduler,
    tasks: BTreeMap<String, Uuid>,
}

impl TaskScheduler {
    pub async fn new() -> Result<Self, SchedulerError> {
        Ok(Self {
            inner: JobScheduler::new().await?,
            tasks: BTreeMap::new(),
        })
    }

    /// Registers `task` to fire every `every`. A task that returns an error is
    /// logged and stays armed for its next tick.
    pub async fn add_interval_task<F, Fut>(
        &mut self,
        name: &str,
        every: Duration,
        task: F,
    ) -> Result<Uuid, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.tasks.contains_key(name) {
            return Err(SchedulerError::DuplicateTask {
                name: name.to_string(),
            });
        }

        let task = Arc::new(task);
        let task_name: Arc<str> = Arc::from(name);
        let job = Job::new_repeated_async(every, move |_job_id, _sched| {
            let task = Arc::clone(&task);
            let task_name = Arc::clone(&task_name);
            Box::pin(async move {
                if let Err(err) = task().await {
                    error!(task = %task_name, "scheduled task failed: {err:#}");
                }
            })
        })?;

        let job_id = self.inner.add(job).await?;
        self.tasks.insert(name.to_string(), job_id);
        info!(task = name, every_secs = every.as_secs(), "scheduled task registered");
        Ok(job_id)
    }

    /// Unregisters `name` so it can be registered again. Returns `false` if
    /// no such task exists.
    pub async fn remove_task(&mut self, name: &str) -> Result<bool, SchedulerError> {
        let Some(job_id) = self.tasks.get(name).copied() else {
            return Ok(false);
        };
        self.inner.remove(&job_id).await?;
        self.tasks.remove(name);
        info!(task = name, "scheduled task removed");
        Ok(true)
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.inner.start().await?;
        info!(tasks = self.tasks.len(), "scheduler started");
        Ok(())
    }

    /// Stops further ticks. A run already in flight is left to finish.
    pub async fn shutdown(&mut self) -> Result<(), SchedulerError> {
        self.inner.shutdown().await?;
        info!("scheduler stopped");
        Ok(())
    }
}
