use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::locator::TableLocator;
use crate::schema::TableSchema;
use crate::store::Record;

/* --------- Mensajes HTTP entre el servicio tablestore y sus clientes --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTableRequest {
    pub schema: TableSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTablesResponse {
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsPayload {
    pub rows: Vec<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetLabelRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyRequest {
    pub source: TableLocator,
    pub destination: TableLocator,
    /// Id del job de copia; repetirlo no vuelve a copiar.
    pub copy_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyResponse {
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Unavailable,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&StoreError> for ErrorBody {
    fn from(e: &StoreError) -> Self {
        let (kind, message) = match e {
            StoreError::NotFound(m) => (ErrorKind::NotFound, m),
            StoreError::AlreadyExists(m) => (ErrorKind::AlreadyExists, m),
            StoreError::Unavailable(m) => (ErrorKind::Unavailable, m),
            StoreError::Rejected(m) => (ErrorKind::Rejected, m),
        };
        ErrorBody {
            kind,
            message: message.clone(),
        }
    }
}

impl From<ErrorBody> for StoreError {
    fn from(body: ErrorBody) -> Self {
        match body.kind {
            ErrorKind::NotFound => StoreError::NotFound(body.message),
            ErrorKind::AlreadyExists => StoreError::AlreadyExists(body.message),
            ErrorKind::Unavailable => StoreError::Unavailable(body.message),
            ErrorKind::Rejected => StoreError::Rejected(body.message),
        }
    }
}
