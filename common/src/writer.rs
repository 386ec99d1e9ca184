use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::OutputConfig;
use crate::error::{CommitError, CommitResult, StoreError, StoreResult};
use crate::identity::AttemptIdentity;
use crate::locator::TableLocator;
use crate::retry::{retry, RetryPolicy};
use crate::schema::TableSchema;
use crate::store::{Record, StagedState, TableStore, STATE_LABEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Created,
    Open,
    /// Hay un batch escribiéndose en segundo plano.
    Flushing,
    Closed,
    Failed,
}

impl WriterState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WriterState::Closed | WriterState::Failed)
    }
}

/// Escribe las filas de un único intento de tarea en su tabla de staging privada.
///
/// Las filas se acumulan en memoria y se mandan al store en batches de
/// `write_buffer_size`. Como mucho hay un batch en vuelo; `close` espera a que
/// termine y manda lo que quede. Si un batch falla (después de los reintentos)
/// el writer queda en `Failed` y cualquier escritura posterior devuelve
/// `WriterClosed`.
pub struct AttemptWriter {
    store: Arc<dyn TableStore>,
    attempt: AttemptIdentity,
    table: TableLocator,
    schema: TableSchema,
    buffer: Vec<Record>,
    buffer_size: usize,
    retry: RetryPolicy,
    in_flight: Option<JoinHandle<StoreResult<usize>>>,
    state: WriterState,
    rows_flushed: u64,
}

impl AttemptWriter {
    pub fn new(
        store: Arc<dyn TableStore>,
        attempt: AttemptIdentity,
        table: TableLocator,
        output: &OutputConfig,
    ) -> Self {
        let buffer_size = output.write_buffer_size.max(1);
        Self {
            store,
            attempt,
            table,
            schema: output.output_schema.clone(),
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
            retry: output.retry,
            in_flight: None,
            state: WriterState::Created,
            rows_flushed: 0,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn attempt(&self) -> &AttemptIdentity {
        &self.attempt
    }

    pub fn table(&self) -> &TableLocator {
        &self.table
    }

    /// Filas confirmadas por el store hasta ahora.
    pub fn rows_flushed(&self) -> u64 {
        self.rows_flushed
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Crea el área de staging y la tabla del intento si no existen,
    /// y marca la tabla como `open`.
    pub async fn open(&mut self) -> CommitResult<()> {
        if self.state != WriterState::Created {
            return Err(CommitError::IllegalState(format!(
                "open sobre writer de {} en estado {:?}",
                self.attempt.attempt_id, self.state
            )));
        }

        if let Err(e) = self.schema.validate() {
            self.state = WriterState::Failed;
            return Err(e);
        }

        match self.create_staging_table().await {
            Ok(()) => {
                self.state = WriterState::Open;
                info!(
                    "writer abierto para {} en {} (buffer={})",
                    self.attempt.attempt_id, self.table, self.buffer_size
                );
                Ok(())
            }
            Err(e) => {
                self.state = WriterState::Failed;
                warn!("no se pudo abrir {}: {}", self.table, e);
                Err(e)
            }
        }
    }

    async fn create_staging_table(&self) -> CommitResult<()> {
        let area = self.table.dataset_locator();
        let store = &self.store;

        match retry(self.retry, "create_dataset", || store.create_dataset(&area)).await {
            Ok(()) | Err(StoreError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into_commit_error("create_dataset")),
        }

        match retry(self.retry, "create_table", || {
            store.create_table(&self.table, &self.schema)
        })
        .await
        {
            Ok(()) | Err(StoreError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into_commit_error("create_table")),
        }

        retry(self.retry, "set_label", || {
            store.set_label(&self.table, STATE_LABEL, StagedState::Open.as_label())
        })
        .await
        .map_err(|e| e.into_commit_error("set_label"))
    }

    /// Agrega una fila al buffer; si se llena, lanza un flush en segundo plano.
    pub async fn write(&mut self, row: Record) -> CommitResult<()> {
        match self.state {
            WriterState::Open | WriterState::Flushing => {}
            WriterState::Created => {
                return Err(CommitError::IllegalState(format!(
                    "write antes de open en {}",
                    self.attempt.attempt_id
                )))
            }
            WriterState::Closed | WriterState::Failed => {
                return Err(CommitError::WriterClosed(self.attempt.attempt_id.clone()))
            }
        }

        // si el batch anterior ya terminó, recogemos su resultado ahora
        if self.in_flight.as_ref().is_some_and(|h| h.is_finished()) {
            self.await_in_flight().await?;
        }

        self.buffer.push(row);
        if self.buffer.len() >= self.buffer_size {
            self.start_flush().await?;
        }
        Ok(())
    }

    async fn start_flush(&mut self) -> CommitResult<()> {
        self.await_in_flight().await?;

        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.buffer_size));
        let store = self.store.clone();
        let table = self.table.clone();
        let policy = self.retry;

        debug!("flush de {} filas a {}", batch.len(), table);
        self.in_flight = Some(tokio::spawn(async move {
            let n = batch.len();
            retry(policy, "insert_rows", || store.insert_rows(&table, &batch)).await?;
            Ok(n)
        }));
        self.state = WriterState::Flushing;
        Ok(())
    }

    /// Espera el batch en vuelo, si lo hay. Un fallo deja el writer en `Failed`.
    async fn await_in_flight(&mut self) -> CommitResult<()> {
        let Some(handle) = self.in_flight.take() else {
            return Ok(());
        };

        let result = match handle.await {
            Ok(Ok(n)) => {
                self.rows_flushed += n as u64;
                Ok(())
            }
            Ok(Err(e)) => Err(e.into_commit_error("insert_rows")),
            Err(join) => Err(CommitError::StoreUnavailable {
                op: "insert_rows".into(),
                reason: format!("el flush en segundo plano terminó mal: {join}"),
            }),
        };

        match result {
            Ok(()) => {
                if self.state == WriterState::Flushing {
                    self.state = WriterState::Open;
                }
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Manda lo que quede en el buffer, espera los flush pendientes y marca la
    /// tabla como candidata a commit. Sobre un writer ya cerrado o fallido no
    /// hace nada y devuelve el estado terminal.
    pub async fn close(&mut self) -> CommitResult<WriterState> {
        match self.state {
            WriterState::Closed | WriterState::Failed => return Ok(self.state),
            WriterState::Created => {
                return Err(CommitError::IllegalState(format!(
                    "close antes de open en {}",
                    self.attempt.attempt_id
                )))
            }
            WriterState::Open | WriterState::Flushing => {}
        }

        self.await_in_flight().await?;

        if !self.buffer.is_empty() {
            let batch = std::mem::take(&mut self.buffer);
            let store = &self.store;
            let flushed = retry(self.retry, "insert_rows", || {
                store.insert_rows(&self.table, &batch)
            })
            .await;
            if let Err(e) = flushed {
                let e = e.into_commit_error("insert_rows");
                self.fail(&e);
                return Err(e);
            }
            self.rows_flushed += batch.len() as u64;
        }

        let store = &self.store;
        let marked = retry(self.retry, "set_label", || {
            store.set_label(&self.table, STATE_LABEL, StagedState::Candidate.as_label())
        })
        .await;
        if let Err(e) = marked {
            let e = e.into_commit_error("set_label");
            self.fail(&e);
            return Err(e);
        }

        self.state = WriterState::Closed;
        info!(
            "writer de {} cerrado: {} filas en {} (candidato a commit)",
            self.attempt.attempt_id, self.rows_flushed, self.table
        );
        Ok(self.state)
    }

    fn fail(&mut self, e: &CommitError) {
        warn!("writer de {} pasa a FAILED: {}", self.attempt.attempt_id, e);
        self.state = WriterState::Failed;
        self.buffer.clear();
    }
}

impl Drop for AttemptWriter {
    fn drop(&mut self) {
        // intento cancelado: no hay obligación de mandar lo pendiente
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
        if !self.state.is_terminal() {
            debug!(
                "writer de {} descartado sin close ({} filas en buffer)",
                self.attempt.attempt_id,
                self.buffer.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{tests::valid_conf, validate_output_spec, OUTPUT_WRITE_BUFFER_SIZE_KEY};
    use crate::identity::{parse_attempt, JobIdentity};
    use crate::locator::{attempt_staging_locator, final_locator};
    use crate::memory::{MemoryTableStore, StoreOp};
    use serde_json::json;

    async fn writer_with(store: &MemoryTableStore, buffer: usize) -> AttemptWriter {
        let conf = valid_conf().with(OUTPUT_WRITE_BUFFER_SIZE_KEY, buffer.to_string());
        let output = validate_output_spec(&conf).unwrap();
        let job = JobIdentity {
            job_id: "job_20140820_0001".into(),
        };
        let attempt = parse_attempt(&job, "attempt-1").unwrap();
        let table = attempt_staging_locator(&attempt, &final_locator(&conf).unwrap(), &job);

        let mut w = AttemptWriter::new(Arc::new(store.clone()), attempt, table, &output);
        w.open().await.unwrap();
        w
    }

    fn row(i: u64) -> Record {
        json!({ "word": format!("w{i}"), "count": i })
    }

    #[tokio::test]
    async fn open_crea_tabla_de_staging_marcada_open() {
        let store = MemoryTableStore::new();
        let w = writer_with(&store, 10).await;

        let info = store.get_table(w.table()).await.unwrap();
        assert_eq!(info.staged_state(), Some(StagedState::Open));
        assert_eq!(w.state(), WriterState::Open);
    }

    #[tokio::test]
    async fn write_y_close_mandan_todas_las_filas_en_orden() {
        let store = MemoryTableStore::new();
        let mut w = writer_with(&store, 2).await;

        for i in 0..5 {
            w.write(row(i)).await.unwrap();
        }
        assert_eq!(w.close().await.unwrap(), WriterState::Closed);

        let rows = store.peek_rows(w.table()).unwrap();
        assert_eq!(rows, (0..5).map(row).collect::<Vec<_>>());
        assert_eq!(w.rows_flushed(), 5);

        let info = store.get_table(w.table()).await.unwrap();
        assert_eq!(info.staged_state(), Some(StagedState::Candidate));
    }

    #[tokio::test]
    async fn close_es_idempotente() {
        let store = MemoryTableStore::new();
        let mut w = writer_with(&store, 10).await;
        w.write(row(1)).await.unwrap();

        assert_eq!(w.close().await.unwrap(), WriterState::Closed);
        let calls = store.calls();
        assert_eq!(w.close().await.unwrap(), WriterState::Closed);
        assert_eq!(store.calls(), calls);
        assert_eq!(store.peek_rows(w.table()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn write_despues_de_close_falla() {
        let store = MemoryTableStore::new();
        let mut w = writer_with(&store, 10).await;
        w.close().await.unwrap();

        assert!(matches!(
            w.write(row(1)).await,
            Err(CommitError::WriterClosed(_))
        ));
    }

    #[tokio::test]
    async fn flush_fallido_se_reintenta() {
        let store = MemoryTableStore::new();
        let mut w = writer_with(&store, 2).await;
        // 2 fallos con 3 intentos por defecto: alcanza
        store.fail_next(StoreOp::InsertRows, 2);

        w.write(row(1)).await.unwrap();
        w.write(row(2)).await.unwrap();
        w.close().await.unwrap();

        assert_eq!(store.peek_rows(w.table()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn flush_agotado_deja_el_writer_en_failed() {
        let store = MemoryTableStore::new();
        let mut w = writer_with(&store, 2).await;
        store.fail_next(StoreOp::InsertRows, 10);

        w.write(row(1)).await.unwrap();
        w.write(row(2)).await.unwrap(); // lanza el flush en segundo plano

        // el error aparece al cerrar (o en alguna escritura intermedia)
        let err = w.close().await.unwrap_err();
        assert!(matches!(err, CommitError::StoreUnavailable { .. }));
        assert_eq!(w.state(), WriterState::Failed);

        assert!(matches!(
            w.write(row(3)).await,
            Err(CommitError::WriterClosed(_))
        ));
        // close sobre Failed devuelve el estado terminal
        assert_eq!(w.close().await.unwrap(), WriterState::Failed);

        // la tabla nunca llegó a candidata
        let info = store.get_table(w.table()).await.unwrap();
        assert_eq!(info.staged_state(), Some(StagedState::Open));
    }

    #[tokio::test]
    async fn open_con_store_caido_falla_con_store_unavailable() {
        let store = MemoryTableStore::new();
        store.fail_next(StoreOp::CreateDataset, 10);

        let conf = valid_conf();
        let output = validate_output_spec(&conf).unwrap();
        let job = JobIdentity {
            job_id: "job_20140820_0001".into(),
        };
        let attempt = parse_attempt(&job, "attempt-9").unwrap();
        let table = attempt_staging_locator(&attempt, &final_locator(&conf).unwrap(), &job);
        let mut w = AttemptWriter::new(Arc::new(store.clone()), attempt, table, &output);

        assert!(matches!(
            w.open().await,
            Err(CommitError::StoreUnavailable { .. })
        ));
        assert_eq!(w.state(), WriterState::Failed);
    }

    #[tokio::test]
    async fn open_con_schema_vacio_falla_con_schema_error() {
        let store = MemoryTableStore::new();
        let conf = valid_conf();
        let mut output = validate_output_spec(&conf).unwrap();
        output.output_schema.fields.clear();

        let job = JobIdentity {
            job_id: "job_20140820_0001".into(),
        };
        let attempt = parse_attempt(&job, "attempt-1").unwrap();
        let table = attempt_staging_locator(&attempt, &final_locator(&conf).unwrap(), &job);
        let mut w = AttemptWriter::new(Arc::new(store.clone()), attempt, table, &output);

        assert!(matches!(w.open().await, Err(CommitError::Schema(_))));
        assert_eq!(store.calls(), 0);
    }
}
