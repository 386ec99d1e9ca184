use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::StoreResult;
use crate::locator::{DatasetLocator, TableLocator};
use crate::schema::TableSchema;

/// Una fila de salida. Usamos JSON igual que el resto del workspace.
pub type Record = Value;

/// Label de cada tabla de staging con el estado de su CommitRecord.
pub const STATE_LABEL: &str = "staged_state";

/// Valor del label que deja `commit_job` en la tabla final cuando terminó de
/// mergear todos los ganadores de un job.
pub const JOB_MERGED_VALUE: &str = "merged";

/// Label de la tabla final que marca el merge completo de un job.
pub fn job_merged_label(job_id: &str) -> String {
    format!("staged_job_{job_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagedState {
    /// Writer abierto; contenido indeterminado.
    Open,
    /// El writer cerró limpio; puede mergearse.
    Candidate,
    /// Ya se copió al destino final.
    Committed,
}

impl StagedState {
    pub fn as_label(self) -> &'static str {
        match self {
            StagedState::Open => "open",
            StagedState::Candidate => "candidate",
            StagedState::Committed => "committed",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "open" => Some(StagedState::Open),
            "candidate" => Some(StagedState::Candidate),
            "committed" => Some(StagedState::Committed),
            _ => None,
        }
    }
}

/// Metadatos de una tabla tal como los devuelve el store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub locator: TableLocator,
    pub schema: TableSchema,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub num_rows: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl TableInfo {
    pub fn staged_state(&self) -> Option<StagedState> {
        self.labels
            .get(STATE_LABEL)
            .and_then(|s| StagedState::from_label(s))
    }
}

/// El store tabular append-only remoto. Cada llamada puede fallar con
/// `Unavailable` de forma transitoria; los reintentos son del llamador.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Crea el dataset; `AlreadyExists` si ya estaba.
    async fn create_dataset(&self, dataset: &DatasetLocator) -> StoreResult<()>;

    /// Borra un dataset vacío; `Rejected` si todavía tiene tablas.
    async fn delete_dataset(&self, dataset: &DatasetLocator) -> StoreResult<()>;

    async fn list_tables(&self, dataset: &DatasetLocator) -> StoreResult<Vec<String>>;

    /// Crea la tabla; el dataset tiene que existir.
    async fn create_table(&self, table: &TableLocator, schema: &TableSchema) -> StoreResult<()>;

    async fn get_table(&self, table: &TableLocator) -> StoreResult<TableInfo>;

    async fn insert_rows(&self, table: &TableLocator, rows: &[Record]) -> StoreResult<()>;

    async fn read_rows(&self, table: &TableLocator) -> StoreResult<Vec<Record>>;

    async fn set_label(&self, table: &TableLocator, key: &str, value: &str) -> StoreResult<()>;

    /// Copia (append) todo el contenido de `source` al final de `destination`.
    /// `copy_id` identifica el job de copia: si ya se aplicó uno con el mismo
    /// id, no se vuelve a copiar. Devuelve el id del job.
    async fn append_table(
        &self,
        source: &TableLocator,
        destination: &TableLocator,
        copy_id: &str,
    ) -> StoreResult<String>;

    async fn delete_table(&self, table: &TableLocator) -> StoreResult<()>;
}
