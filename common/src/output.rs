use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::{validate_output_spec, JobConf, OutputConfig};
use crate::coordinator::CommitCoordinator;
use crate::error::CommitResult;
use crate::identity::{resolve_attempt_identity, resolve_job_identity, TaskContext};
use crate::locator::{attempt_staging_locator, final_locator};
use crate::store::TableStore;
use crate::writer::AttemptWriter;

/// Lo que el framework de ejecución necesita para escribir la salida de un job.
#[async_trait]
pub trait OutputFormat: Send + Sync {
    /// Se llama una vez antes de que corra cualquier tarea. No toca el store.
    fn validate_output_spec(&self, conf: &JobConf) -> CommitResult<OutputConfig>;

    /// Un writer abierto por intento de tarea.
    async fn open_writer(&self, ctx: &TaskContext) -> CommitResult<AttemptWriter>;

    /// Un coordinador por job.
    fn commit_coordinator(&self, conf: &JobConf) -> CommitResult<CommitCoordinator>;
}

/// Salida a una tabla append-only, con staging por intento y commit al final del job.
#[derive(Clone)]
pub struct StagedTableOutput {
    store: Arc<dyn TableStore>,
}

impl StagedTableOutput {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl OutputFormat for StagedTableOutput {
    fn validate_output_spec(&self, conf: &JobConf) -> CommitResult<OutputConfig> {
        validate_output_spec(conf)
    }

    async fn open_writer(&self, ctx: &TaskContext) -> CommitResult<AttemptWriter> {
        let output = validate_output_spec(&ctx.conf)?;
        let job = resolve_job_identity(&ctx.conf)?;
        let attempt = resolve_attempt_identity(ctx)?;
        let final_table = final_locator(&ctx.conf)?;
        let table = attempt_staging_locator(&attempt, &final_table, &job);

        debug!(
            "abriendo writer para {} (slot {}, ordinal {}) en {}",
            attempt.attempt_id, attempt.task_slot, attempt.ordinal, table
        );
        let mut writer = AttemptWriter::new(self.store.clone(), attempt, table, &output);
        writer.open().await?;
        Ok(writer)
    }

    fn commit_coordinator(&self, conf: &JobConf) -> CommitResult<CommitCoordinator> {
        let output = validate_output_spec(conf)?;
        let job = resolve_job_identity(conf)?;
        Ok(CommitCoordinator::new(
            self.store.clone(),
            job,
            final_locator(conf)?,
            output.retry,
        ))
    }
}
