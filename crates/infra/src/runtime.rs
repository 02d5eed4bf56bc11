//! Runtime wiring: adapters + state machine + background executor.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use portage_auth::OwnerDirectory;
use portage_migration::{
    Codecs, JobRepository, MigrationPorts, MigrationStateMachine, MigrationTask, ProjectCatalog,
    TaskOutcome,
};

use crate::blob::FsBlobStage;
use crate::config::MigrationConfig;
use crate::notifications::{GatedNotifier, NotificationGate, Notifier};
use crate::repository::{InMemoryJobRepository, PostgresJobRepository};
use crate::tasks::{
    InMemoryTaskStore, InlineTaskRunner, QueuedTaskRunner, Task, TaskExecutor, TaskExecutorHandle,
    TaskResult,
};

/// Executor handler driving the state machine for one queued task.
///
/// A rolled-back run is reported as a failure so the task's retry policy
/// schedules the next attempt; skipped runs count as done.
pub fn task_handler(
    machine: Arc<MigrationStateMachine>,
) -> impl Fn(&Task) -> TaskResult + Send + Sync + 'static {
    move |task| match machine.run_task(task.job_id, task.task) {
        Ok(TaskOutcome::Completed) | Ok(TaskOutcome::Skipped) => TaskResult::Success,
        Ok(TaskOutcome::RolledBack(reason)) => TaskResult::Failure(reason),
        Err(e) => {
            error!(job_id = %task.job_id, task = %task.task, error = %e, "task could not reach the job");
            TaskResult::Failure(e.to_string())
        }
    }
}

/// Point an [`InlineTaskRunner`] at a state machine.
///
/// The runner only holds a weak reference, since the machine owns the runner.
pub fn bind_inline(runner: &InlineTaskRunner, machine: &Arc<MigrationStateMachine>) -> bool {
    let machine = Arc::downgrade(machine);
    runner.bind(move |job_id, task| {
        let machine = machine
            .upgrade()
            .ok_or_else(|| "state machine dropped".to_string())?;
        match machine.run_task(job_id, task) {
            Ok(TaskOutcome::RolledBack(reason)) => Err(reason),
            Ok(_) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    })
}

/// A fully wired migration service.
pub struct MigrationRuntime {
    config: MigrationConfig,
    machine: Arc<MigrationStateMachine>,
    gate: Arc<NotificationGate>,
    notifier: Arc<GatedNotifier<Arc<dyn Notifier>>>,
    task_store: Arc<InMemoryTaskStore>,
    // Declared last: dropped after the repository that blocks on it.
    db_runtime: Option<tokio::runtime::Runtime>,
}

impl MigrationRuntime {
    /// Compose the runtime described by `config`.
    ///
    /// With a `database_url` this starts a private tokio runtime for the
    /// Postgres repository, so it must not be called from async code.
    pub fn build(
        config: MigrationConfig,
        directory: Arc<dyn OwnerDirectory>,
        catalog: Arc<dyn ProjectCatalog>,
        codecs: Codecs,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.blob_root).with_context(|| {
            format!("failed to create blob root {}", config.blob_root.display())
        })?;
        let blobs = Arc::new(FsBlobStage::new(config.blob_root.clone()));

        let (repository, db_runtime) = match &config.database_url {
            Some(url) => {
                let rt = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .thread_name("portage-db")
                    .build()
                    .context("failed to start database runtime")?;
                let repo = PostgresJobRepository::connect_lazy(url, rt.handle().clone())
                    .context("failed to configure Postgres pool")?;
                rt.block_on(repo.ensure_schema())
                    .context("failed to apply job schema")?;
                info!("using Postgres job repository");
                let repo: Arc<dyn JobRepository> = Arc::new(repo);
                (repo, Some(rt))
            }
            None => {
                info!("using in-memory job repository");
                let repo: Arc<dyn JobRepository> = InMemoryJobRepository::arc();
                (repo, None)
            }
        };

        let task_store = InMemoryTaskStore::arc();
        let tasks = Arc::new(QueuedTaskRunner::new(task_store.clone(), config.retry_policy()));

        let gate = NotificationGate::arc();
        let notifier = Arc::new(GatedNotifier::new(notifier, gate.clone()));

        let ports = MigrationPorts {
            repository,
            blobs,
            tasks,
            notifications: gate.clone(),
            directory,
            catalog,
            codecs,
        };
        let machine = Arc::new(MigrationStateMachine::new(ports, config.processing_mode()));
        info!(mode = ?machine.mode(), blob_root = %config.blob_root.display(), "migration runtime ready");

        Ok(Self {
            config,
            machine,
            gate,
            notifier,
            task_store,
            db_runtime,
        })
    }

    /// Start the background executor for queued import/export tasks.
    pub fn spawn_executor(&self) -> anyhow::Result<TaskExecutorHandle> {
        let mut executor = TaskExecutor::new(self.task_store.clone());
        for name in [MigrationTask::IMPORT, MigrationTask::EXPORT] {
            executor.register_handler(name, task_handler(self.machine.clone()));
        }
        executor
            .spawn(self.config.executor_config())
            .context("failed to spawn task executor")
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn machine(&self) -> &Arc<MigrationStateMachine> {
        &self.machine
    }

    pub fn gate(&self) -> &Arc<NotificationGate> {
        &self.gate
    }

    /// Outbound notifications, silenced while an import is materialized.
    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.notifier.clone()
    }

    /// Deliveries dropped by the gate so far.
    pub fn suppressed_notifications(&self) -> u64 {
        self.notifier.suppressed_count()
    }

    pub fn task_store(&self) -> &Arc<InMemoryTaskStore> {
        &self.task_store
    }

    pub fn uses_database(&self) -> bool {
        self.db_runtime.is_some()
    }
}

impl core::fmt::Debug for MigrationRuntime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MigrationRuntime")
            .field("config", &self.config)
            .field("machine", &self.machine)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}
