use thiserror::Error;

/// Errores del protocolo de escritura por etapas.
#[derive(Error, Debug)]
pub enum CommitError {
    /// Configuración ausente o mal formada. Falla antes de que corra cualquier tarea.
    #[error("configuración inválida: {0}")]
    Config(String),

    #[error("schema de salida inválido: {0}")]
    Schema(String),

    /// Fallo transitorio del store que agotó los reintentos.
    #[error("store no disponible durante {op}: {reason}")]
    StoreUnavailable { op: String, reason: String },

    #[error("el writer de {0} ya está cerrado o falló")]
    WriterClosed(String),

    #[error("estado ilegal: {0}")]
    IllegalState(String),

    /// Se mergearon algunos ganadores pero no todos. Se puede reintentar commit_job.
    #[error("commit parcial: {} mergeadas, {} fallidas ({})", .merged.len(), .failed.len(), describe(.failed))]
    PartialCommit {
        merged: Vec<String>,
        failed: Vec<(String, String)>,
    },

    /// El área de staging no se pudo enumerar; no se limpia nada.
    #[error("no se pudo enumerar el área de staging {area}: {reason}")]
    JobCommitFatal { area: String, reason: String },

    /// Errores del store que no son transitorios (tabla rechazada, etc.)
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type CommitResult<T> = Result<T, CommitError>;

/// Error del store remoto. Sólo `Unavailable` se reintenta.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no existe: {0}")]
    NotFound(String),
    #[error("ya existe: {0}")]
    AlreadyExists(String),
    #[error("store no disponible: {0}")]
    Unavailable(String),
    #[error("operación rechazada: {0}")]
    Rejected(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    /// Convierte el error de una operación de datos en el error del protocolo.
    pub fn into_commit_error(self, op: &str) -> CommitError {
        match self {
            StoreError::Unavailable(reason) => CommitError::StoreUnavailable {
                op: op.to_string(),
                reason,
            },
            other => CommitError::Store(other),
        }
    }
}

/// Aviso no fatal: la limpieza best-effort dejó recursos sin borrar.
/// Nunca bloquea el resultado de un commit o abort.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("limpieza incompleta de {area}: {}", describe(.failures))]
pub struct CleanupWarning {
    pub area: String,
    pub failures: Vec<(String, String)>,
}

fn describe(entries: &[(String, String)]) -> String {
    entries
        .iter()
        .map(|(what, why)| format!("{what}: {why}"))
        .collect::<Vec<_>>()
        .join("; ")
}
