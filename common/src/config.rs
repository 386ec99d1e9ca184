use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use crate::error::{CommitError, CommitResult};
use crate::retry::{RetryPolicy, DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BACKOFF_MS};
use crate::schema::TableSchema;

pub const JOB_ID_KEY: &str = "staged.job.id";
pub const JOB_DIR_KEY: &str = "staged.job.dir";
pub const OUTPUT_PROJECT_ID_KEY: &str = "staged.output.project.id";
pub const OUTPUT_DATASET_ID_KEY: &str = "staged.output.dataset.id";
pub const OUTPUT_TABLE_ID_KEY: &str = "staged.output.table.id";
pub const OUTPUT_TABLE_SCHEMA_KEY: &str = "staged.output.table.schema";
pub const OUTPUT_WRITE_BUFFER_SIZE_KEY: &str = "staged.output.buffer.size";
pub const STORE_RETRY_ATTEMPTS_KEY: &str = "staged.store.retry.attempts";
pub const STORE_RETRY_BACKOFF_MS_KEY: &str = "staged.store.retry.backoff.ms";

pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 100;

/// Claves sin las cuales no se puede escribir nada.
pub const MANDATORY_OUTPUT_KEYS: [&str; 4] = [
    OUTPUT_PROJECT_ID_KEY,
    OUTPUT_DATASET_ID_KEY,
    OUTPUT_TABLE_ID_KEY,
    OUTPUT_TABLE_SCHEMA_KEY,
];

/// Configuración clave→valor del job, tal como la entrega el framework.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobConf {
    entries: BTreeMap<String, String>,
}

impl JobConf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lee un JSON plano `{"clave": "valor", ...}`.
    pub fn from_json_file(path: impl AsRef<Path>) -> CommitResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| CommitError::Config(format!("no se pudo leer {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| CommitError::Config(format!("JSON inválido en {}: {e}", path.display())))
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_string(), value.into());
    }

    /// Valor de la clave; ausente o vacío (tras trim) se trata igual.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> CommitResult<&str> {
        self.get(key)
            .ok_or_else(|| CommitError::Config(format!("falta la clave obligatoria {key}")))
    }

    fn get_positive(&self, key: &str, default: u64) -> CommitResult<u64> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        let n: i64 = raw
            .parse()
            .map_err(|_| CommitError::Config(format!("{key} no es un entero: {raw:?}")))?;
        if n < 1 {
            return Err(CommitError::Config(format!(
                "{key} debe ser un entero positivo (es {n})"
            )));
        }
        Ok(n as u64)
    }

    fn get_non_negative(&self, key: &str, default: u64) -> CommitResult<u64> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| CommitError::Config(format!("{key} no es un entero >= 0: {raw:?}"))),
        }
    }
}

/// Configuración de salida ya validada; se pasa explícita a cada componente.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub final_project: String,
    pub final_dataset: String,
    pub final_table: String,
    pub output_schema: TableSchema,
    pub write_buffer_size: usize,
    pub retry: RetryPolicy,
}

/// Chequeo previo a correr cualquier tarea. No hace llamadas al store.
pub fn validate_output_spec(conf: &JobConf) -> CommitResult<OutputConfig> {
    let missing: Vec<&str> = MANDATORY_OUTPUT_KEYS
        .iter()
        .copied()
        .filter(|k| conf.get(k).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(CommitError::Config(format!(
            "faltan claves obligatorias: {}",
            missing.join(", ")
        )));
    }

    let output_schema = TableSchema::parse(conf.require(OUTPUT_TABLE_SCHEMA_KEY)?)?;
    let write_buffer_size =
        conf.get_positive(OUTPUT_WRITE_BUFFER_SIZE_KEY, DEFAULT_WRITE_BUFFER_SIZE as u64)? as usize;
    let retry = RetryPolicy {
        max_attempts: conf.get_positive(STORE_RETRY_ATTEMPTS_KEY, DEFAULT_RETRY_ATTEMPTS as u64)?
            as u32,
        initial_backoff: Duration::from_millis(
            conf.get_non_negative(STORE_RETRY_BACKOFF_MS_KEY, DEFAULT_RETRY_BACKOFF_MS)?,
        ),
    };

    Ok(OutputConfig {
        final_project: conf.require(OUTPUT_PROJECT_ID_KEY)?.to_string(),
        final_dataset: conf.require(OUTPUT_DATASET_ID_KEY)?.to_string(),
        final_table: conf.require(OUTPUT_TABLE_ID_KEY)?.to_string(),
        output_schema,
        write_buffer_size,
        retry,
    })
}
