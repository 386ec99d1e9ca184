use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tracing::{debug, info, warn};

use crate::cleanup::CleanupSupervisor;
use crate::error::{CleanupWarning, CommitError, CommitResult, StoreError};
use crate::identity::{parse_attempt, AttemptIdentity, JobIdentity};
use crate::locator::{
    attempt_id_from_staging_table, staging_area_locator, staging_table_name, DatasetLocator,
    TableLocator,
};
use crate::retry::{retry, retry_absent_ok, RetryPolicy};
use crate::schema::TableSchema;
use crate::store::{job_merged_label, StagedState, TableStore, JOB_MERGED_VALUE, STATE_LABEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Open,
    CommitCandidate,
    Committed,
    Aborted,
}

impl From<StagedState> for CommitStatus {
    fn from(s: StagedState) -> Self {
        match s {
            StagedState::Open => CommitStatus::Open,
            StagedState::Candidate => CommitStatus::CommitCandidate,
            StagedState::Committed => CommitStatus::Committed,
        }
    }
}

/// Estado de un intento, reconstruido siempre desde el store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub attempt_id: String,
    pub staging: TableLocator,
    pub status: CommitStatus,
}

/// Resultado de un `commit_job` exitoso.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobCommitOutcome {
    /// Intentos mergeados en esta llamada.
    pub merged: Vec<String>,
    /// Ganadores que ya estaban mergeados de una llamada anterior.
    pub already_committed: Vec<String>,
    /// Tablas de intentos que no ganaron y se descartan con el área.
    pub discarded: Vec<String>,
    /// Una llamada anterior ya había mergeado el job; sólo quedaba limpiar.
    pub already_complete: bool,
    pub cleanup_warning: Option<CleanupWarning>,
}

/// Lógica de commit en dos fases de un job.
///
/// Los commits por tarea sólo verifican que la tabla de staging del intento
/// esté marcada como candidata; los datos no se mueven hasta `commit_job`,
/// que lista el área de staging (fuente de verdad), copia cada tabla ganadora
/// al destino final, la marca `committed`, deja en la tabla final el label
/// `staged_job_<jobId>=merged` y recién entonces borra el área entera.
/// Como el estado vive en el store, un coordinador nuevo puede retomar un
/// `commit_job` interrumpido sin duplicar filas ya mergeadas. Cada copia
/// lleva un id fijo por tabla de staging, así que un append repetido tras
/// una respuesta perdida no duplica filas.
///
/// `commit_job` y `abort_job` no deben correr en paralelo para el mismo job.
#[derive(Clone)]
pub struct CommitCoordinator {
    store: Arc<dyn TableStore>,
    job: JobIdentity,
    final_table: TableLocator,
    staging_area: DatasetLocator,
    retry: RetryPolicy,
    cleanup: CleanupSupervisor,
}

impl CommitCoordinator {
    pub fn new(
        store: Arc<dyn TableStore>,
        job: JobIdentity,
        final_table: TableLocator,
        retry: RetryPolicy,
    ) -> Self {
        let staging_area = staging_area_locator(&job, &final_table);
        let cleanup = CleanupSupervisor::new(store.clone(), retry);
        Self {
            store,
            job,
            final_table,
            staging_area,
            retry,
            cleanup,
        }
    }

    pub fn job(&self) -> &JobIdentity {
        &self.job
    }

    pub fn final_table(&self) -> &TableLocator {
        &self.final_table
    }

    pub fn staging_area(&self) -> &DatasetLocator {
        &self.staging_area
    }

    fn staging_table(&self, attempt_id: &str) -> TableLocator {
        self.staging_area
            .table(staging_table_name(&self.final_table, attempt_id))
    }

    /// Lee el CommitRecord de un intento. Una tabla ausente es un intento abortado.
    pub async fn record(&self, attempt_id: &str) -> CommitResult<CommitRecord> {
        let attempt = parse_attempt(&self.job, attempt_id)?;
        let staging = self.staging_table(&attempt.attempt_id);
        let store = &self.store;

        let status = match retry(self.retry, "get_table", || store.get_table(&staging)).await {
            Ok(info) => info
                .staged_state()
                .map(CommitStatus::from)
                .unwrap_or(CommitStatus::Open),
            Err(StoreError::NotFound(_)) => CommitStatus::Aborted,
            Err(e) => return Err(e.into_commit_error("get_table")),
        };

        Ok(CommitRecord {
            attempt_id: attempt.attempt_id,
            staging,
            status,
        })
    }

    /// Commit de un intento: sólo registra la intención. Exige que el writer
    /// haya cerrado limpio.
    pub async fn commit_task(&self, attempt_id: &str) -> CommitResult<CommitRecord> {
        let record = self.record(attempt_id).await?;
        if record.status != CommitStatus::CommitCandidate {
            return Err(CommitError::IllegalState(format!(
                "commit_task de {} en estado {:?} (se esperaba CommitCandidate)",
                record.attempt_id, record.status
            )));
        }

        info!(
            "commit_task {}: {} queda como candidata",
            record.attempt_id, record.staging
        );
        Ok(record)
    }

    /// Descarta la salida de un intento fallido, cancelado o perdedor.
    /// Borrar una tabla que no existe no es error.
    pub async fn abort_task(&self, attempt_id: &str) -> CommitResult<CommitRecord> {
        let attempt = parse_attempt(&self.job, attempt_id)?;
        let staging = self.staging_table(&attempt.attempt_id);
        let store = &self.store;

        retry_absent_ok(self.retry, "delete_table", || store.delete_table(&staging))
            .await
            .map_err(|e| e.into_commit_error("delete_table"))?;

        info!("abort_task {}: {} eliminada", attempt.attempt_id, staging);
        Ok(CommitRecord {
            attempt_id: attempt.attempt_id,
            staging,
            status: CommitStatus::Aborted,
        })
    }

    /// Todos los CommitRecord presentes en el área de staging.
    pub async fn records(&self) -> CommitResult<Vec<CommitRecord>> {
        let tables = self.list_staging_tables().await?;
        let mut out = Vec::with_capacity(tables.len());
        for name in tables {
            if let Some(id) = attempt_id_from_staging_table(&self.final_table, &name) {
                out.push(self.record(id).await?);
            }
        }
        Ok(out)
    }

    async fn list_staging_tables(&self) -> CommitResult<Vec<String>> {
        let store = &self.store;
        match retry(self.retry, "list_tables", || store.list_tables(&self.staging_area)).await {
            Ok(tables) => Ok(tables),
            Err(StoreError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e.into_commit_error("list_tables")),
        }
    }

    /// Mergea las tablas de los intentos ganadores en el destino final y borra
    /// el área de staging. Se puede volver a llamar después de un
    /// `PartialCommit` (sólo se reintentan los ganadores que faltan) o de una
    /// limpieza incompleta (sólo se limpia). Sin la marca de merge, un área
    /// ausente con ganadores es `IllegalState`.
    pub async fn commit_job<S: AsRef<str>>(&self, winners: &[S]) -> CommitResult<JobCommitOutcome> {
        let winners = self.check_winners(winners)?;
        let mut outcome = JobCommitOutcome::default();
        let store = &self.store;

        // 0) el merge ya terminó en una llamada anterior: sólo falta limpiar
        if self.merge_marked().await? {
            info!(
                "commit_job {}: ya estaba mergeado en {}, sólo se limpia {}",
                self.job.job_id, self.final_table, self.staging_area
            );
            outcome.already_complete = true;
            outcome.cleanup_warning = self.cleanup.reclaim(&self.staging_area).await;
            return Ok(outcome);
        }

        // 1) el listado del área es la fuente de verdad
        let tables = match retry(self.retry, "list_tables", || store.list_tables(&self.staging_area))
            .await
        {
            Ok(tables) => tables,
            Err(StoreError::NotFound(_)) if winners.is_empty() => {
                info!("commit_job {}: sin ganadores ni área, nada que hacer", self.job.job_id);
                return Ok(outcome);
            }
            Err(StoreError::NotFound(_)) => {
                return Err(CommitError::IllegalState(format!(
                    "el área {} no existe y el job no figura como mergeado en {}",
                    self.staging_area, self.final_table
                )));
            }
            Err(e) => {
                warn!(
                    "commit_job {}: no se pudo enumerar {}: {}",
                    self.job.job_id, self.staging_area, e
                );
                return Err(CommitError::JobCommitFatal {
                    area: self.staging_area.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        // 2) tabla -> intento, quedándonos con los ganadores
        let winner_ids: HashSet<&str> = winners.iter().map(|w| w.attempt_id.as_str()).collect();
        let mut present: HashSet<&str> = HashSet::new();
        for name in &tables {
            match attempt_id_from_staging_table(&self.final_table, name) {
                Some(id) if winner_ids.contains(id) => {
                    present.insert(id);
                }
                Some(id) => outcome.discarded.push(id.to_string()),
                None => warn!("tabla ajena {} en el área {}", name, self.staging_area),
            }
        }

        let missing: Vec<&str> = winners
            .iter()
            .map(|w| w.attempt_id.as_str())
            .filter(|id| !present.contains(id))
            .collect();
        if !missing.is_empty() {
            return Err(CommitError::IllegalState(format!(
                "ganadores sin tabla de staging: {}",
                missing.join(", ")
            )));
        }

        // 3a) estado de cada ganador antes de mover nada
        let mut failed: Vec<(String, String)> = Vec::new();
        let mut pending: Vec<(&AttemptIdentity, TableLocator, TableSchema)> = Vec::new();
        for w in &winners {
            let staging = self.staging_table(&w.attempt_id);
            match retry(self.retry, "get_table", || store.get_table(&staging)).await {
                Ok(info) => match info.staged_state() {
                    Some(StagedState::Committed) => {
                        debug!("{} ya estaba mergeada", staging);
                        outcome.already_committed.push(w.attempt_id.clone());
                    }
                    Some(StagedState::Candidate) => pending.push((w, staging, info.schema)),
                    other => {
                        return Err(CommitError::IllegalState(format!(
                            "el ganador {} no cerró su writer (estado {:?})",
                            w.attempt_id, other
                        )))
                    }
                },
                Err(e) => failed.push((w.attempt_id.clone(), e.to_string())),
            }
        }

        // 3b) merge, marcando cada tabla sólo después de que la copia terminó
        let mut final_ready = false;
        for (w, staging, schema) in pending {
            if !final_ready {
                if let Err(e) = self.ensure_final_table(&schema).await {
                    failed.push((w.attempt_id.clone(), e.to_string()));
                    continue;
                }
                final_ready = true;
            }

            match self.merge_one(&staging).await {
                Ok(copy_job) => {
                    info!(
                        "commit_job {}: {} mergeada en {} ({})",
                        self.job.job_id, staging, self.final_table, copy_job
                    );
                    outcome.merged.push(w.attempt_id.clone());
                }
                Err(e) => {
                    warn!("commit_job {}: falló el merge de {}: {}", self.job.job_id, staging, e);
                    failed.push((w.attempt_id.clone(), e.to_string()));
                }
            }
        }

        if !failed.is_empty() {
            let mut merged = outcome.already_committed;
            merged.extend(outcome.merged);
            return Err(CommitError::PartialCommit { merged, failed });
        }

        // 4) marca durable del merge completo, antes de borrar nada
        if !winners.is_empty() {
            self.mark_merged().await?;
        }

        // 5) limpieza del área completa, ganadores incluidos
        outcome.cleanup_warning = self.cleanup.reclaim(&self.staging_area).await;
        if let Some(w) = &outcome.cleanup_warning {
            warn!("commit_job {} terminó con aviso: {}", self.job.job_id, w);
        }

        info!(
            "commit_job {}: {} mergeadas, {} ya estaban, {} descartadas",
            self.job.job_id,
            outcome.merged.len(),
            outcome.already_committed.len(),
            outcome.discarded.len()
        );
        Ok(outcome)
    }

    /// Descarta todo lo escrito por el job. Nunca mergea nada.
    pub async fn abort_job(&self) -> Option<CleanupWarning> {
        info!("abort_job {}: limpiando {}", self.job.job_id, self.staging_area);
        self.cleanup.reclaim(&self.staging_area).await
    }

    fn check_winners<S: AsRef<str>>(&self, winners: &[S]) -> CommitResult<Vec<AttemptIdentity>> {
        let mut slots: HashMap<String, String> = HashMap::new();
        let mut out = Vec::with_capacity(winners.len());

        for w in winners {
            let attempt = parse_attempt(&self.job, w.as_ref())?;
            match slots.get(&attempt.task_slot) {
                Some(prev) if *prev == attempt.attempt_id => continue,
                Some(prev) => {
                    return Err(CommitError::IllegalState(format!(
                        "dos ganadores para el slot {}: {} y {}",
                        attempt.task_slot, prev, attempt.attempt_id
                    )))
                }
                None => {
                    slots.insert(attempt.task_slot.clone(), attempt.attempt_id.clone());
                    out.push(attempt);
                }
            }
        }
        Ok(out)
    }

    async fn ensure_final_table(&self, schema: &TableSchema) -> CommitResult<()> {
        let store = &self.store;
        let dataset = self.final_table.dataset_locator();

        match retry(self.retry, "create_dataset", || store.create_dataset(&dataset)).await {
            Ok(()) | Err(StoreError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into_commit_error("create_dataset")),
        }
        match retry(self.retry, "create_table", || {
            store.create_table(&self.final_table, schema)
        })
        .await
        {
            Ok(()) => {
                info!("tabla final {} creada", self.final_table);
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into_commit_error("create_table")),
        }
    }

    async fn merge_marked(&self) -> CommitResult<bool> {
        let store = &self.store;
        let label = job_merged_label(&self.job.job_id);

        match retry(self.retry, "get_table", || store.get_table(&self.final_table)).await {
            Ok(info) => Ok(info.labels.get(&label).map(String::as_str) == Some(JOB_MERGED_VALUE)),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into_commit_error("get_table")),
        }
    }

    async fn mark_merged(&self) -> CommitResult<()> {
        let store = &self.store;
        let label = job_merged_label(&self.job.job_id);

        retry(self.retry, "set_label", || {
            store.set_label(&self.final_table, &label, JOB_MERGED_VALUE)
        })
        .await
        .map_err(|e| e.into_commit_error("set_label"))
    }

    async fn merge_one(&self, staging: &TableLocator) -> CommitResult<String> {
        let store = &self.store;
        // el mismo id en cada reintento: el store no copia dos veces
        let copy_id = format!("copy_{}_{}", self.job.job_id, staging.table);

        let copy_job = retry(self.retry, "append_table", || {
            store.append_table(staging, &self.final_table, &copy_id)
        })
        .await
        .map_err(|e| e.into_commit_error("append_table"))?;

        retry(self.retry, "set_label", || {
            store.set_label(staging, STATE_LABEL, StagedState::Committed.as_label())
        })
        .await
        .map_err(|e| e.into_commit_error("set_label"))?;

        Ok(copy_job)
    }
}
