use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use crate::error::{StoreError, StoreResult};
use crate::locator::{DatasetLocator, TableLocator};
use crate::schema::TableSchema;
use crate::store::{Record, TableInfo, TableStore};

/// Operaciones del store, para inyectar fallos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOp {
    CreateDataset,
    DeleteDataset,
    ListTables,
    CreateTable,
    GetTable,
    InsertRows,
    ReadRows,
    SetLabel,
    AppendTable,
    DeleteTable,
}

#[derive(Debug, Clone)]
struct StoredTable {
    schema: TableSchema,
    labels: BTreeMap<String, String>,
    rows: Vec<Record>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    datasets: HashMap<DatasetLocator, BTreeMap<String, StoredTable>>,
    // (op, tabla) -> fallos pendientes; tabla None = cualquiera
    faults: HashMap<(StoreOp, Option<String>), u32>,
    // ids de jobs de copia ya aplicados
    copy_jobs: HashSet<String>,
    calls: u64,
}

/// Store en memoria. Lo usan los tests y el servicio `tablestore`.
#[derive(Debug, Clone, Default)]
pub struct MemoryTableStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Las próximas `n` llamadas a `op` fallan con `Unavailable`.
    pub fn fail_next(&self, op: StoreOp, n: u32) {
        self.lock().faults.insert((op, None), n);
    }

    /// Igual que `fail_next` pero sólo cuando la tabla principal de la llamada es `table`.
    pub fn fail_next_on(&self, op: StoreOp, table: &str, n: u32) {
        self.lock().faults.insert((op, Some(table.to_string())), n);
    }

    /// Cantidad total de llamadas recibidas.
    pub fn calls(&self) -> u64 {
        self.lock().calls
    }

    pub fn has_dataset(&self, dataset: &DatasetLocator) -> bool {
        self.lock().datasets.contains_key(dataset)
    }

    /// Filas de una tabla sin pasar por el contador ni por los fallos.
    pub fn peek_rows(&self, table: &TableLocator) -> Option<Vec<Record>> {
        self.lock()
            .datasets
            .get(&table.dataset_locator())
            .and_then(|tables| tables.get(&table.table))
            .map(|t| t.rows.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // un panic en un test no debería envenenar al resto
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cuenta la llamada y aplica los fallos inyectados.
    fn enter(&self, op: StoreOp, table: Option<&str>) -> StoreResult<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        inner.calls += 1;

        let mut keys = vec![(op, None)];
        if let Some(t) = table {
            keys.insert(0, (op, Some(t.to_string())));
        }
        for key in keys {
            if let Some(left) = inner.faults.get_mut(&key) {
                if *left > 0 {
                    *left -= 1;
                    return Err(StoreError::Unavailable(format!("fallo inyectado en {op:?}")));
                }
            }
        }
        Ok(inner)
    }
}

impl Inner {
    fn dataset(&self, dataset: &DatasetLocator) -> StoreResult<&BTreeMap<String, StoredTable>> {
        self.datasets
            .get(dataset)
            .ok_or_else(|| StoreError::NotFound(format!("dataset {dataset}")))
    }

    fn table(&self, table: &TableLocator) -> StoreResult<&StoredTable> {
        self.dataset(&table.dataset_locator())?
            .get(&table.table)
            .ok_or_else(|| StoreError::NotFound(format!("tabla {table}")))
    }

    fn table_mut(&mut self, table: &TableLocator) -> StoreResult<&mut StoredTable> {
        self.datasets
            .get_mut(&table.dataset_locator())
            .and_then(|tables| tables.get_mut(&table.table))
            .ok_or_else(|| StoreError::NotFound(format!("tabla {table}")))
    }
}

fn check_rows(table: &TableLocator, schema: &TableSchema, rows: &[Record]) -> StoreResult<()> {
    for (i, row) in rows.iter().enumerate() {
        let obj = row.as_object().ok_or_else(|| {
            StoreError::Rejected(format!("fila {i} para {table} no es un objeto JSON"))
        })?;
        for key in obj.keys() {
            if !schema.fields.iter().any(|f| f.name.eq_ignore_ascii_case(key)) {
                return Err(StoreError::Rejected(format!(
                    "fila {i} para {table}: campo desconocido {key:?}"
                )));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn create_dataset(&self, dataset: &DatasetLocator) -> StoreResult<()> {
        let mut inner = self.enter(StoreOp::CreateDataset, None)?;
        if inner.datasets.contains_key(dataset) {
            return Err(StoreError::AlreadyExists(format!("dataset {dataset}")));
        }
        inner.datasets.insert(dataset.clone(), BTreeMap::new());
        Ok(())
    }

    async fn delete_dataset(&self, dataset: &DatasetLocator) -> StoreResult<()> {
        let mut inner = self.enter(StoreOp::DeleteDataset, None)?;
        let remaining = inner.dataset(dataset)?.len();
        if remaining > 0 {
            return Err(StoreError::Rejected(format!(
                "dataset {dataset} todavía tiene {remaining} tablas"
            )));
        }
        inner.datasets.remove(dataset);
        Ok(())
    }

    async fn list_tables(&self, dataset: &DatasetLocator) -> StoreResult<Vec<String>> {
        let inner = self.enter(StoreOp::ListTables, None)?;
        Ok(inner.dataset(dataset)?.keys().cloned().collect())
    }

    async fn create_table(&self, table: &TableLocator, schema: &TableSchema) -> StoreResult<()> {
        let mut inner = self.enter(StoreOp::CreateTable, Some(&table.table))?;
        schema
            .validate()
            .map_err(|e| StoreError::Rejected(e.to_string()))?;

        let tables = inner
            .datasets
            .get_mut(&table.dataset_locator())
            .ok_or_else(|| StoreError::NotFound(format!("dataset {}", table.dataset_locator())))?;
        if tables.contains_key(&table.table) {
            return Err(StoreError::AlreadyExists(format!("tabla {table}")));
        }

        let now = Utc::now();
        tables.insert(
            table.table.clone(),
            StoredTable {
                schema: schema.clone(),
                labels: BTreeMap::new(),
                rows: Vec::new(),
                created_at: now,
                modified_at: now,
            },
        );
        Ok(())
    }

    async fn get_table(&self, table: &TableLocator) -> StoreResult<TableInfo> {
        let inner = self.enter(StoreOp::GetTable, Some(&table.table))?;
        let t = inner.table(table)?;
        Ok(TableInfo {
            locator: table.clone(),
            schema: t.schema.clone(),
            labels: t.labels.clone(),
            num_rows: t.rows.len() as u64,
            created_at: t.created_at,
            modified_at: t.modified_at,
        })
    }

    async fn insert_rows(&self, table: &TableLocator, rows: &[Record]) -> StoreResult<()> {
        let mut inner = self.enter(StoreOp::InsertRows, Some(&table.table))?;
        let t = inner.table_mut(table)?;
        check_rows(table, &t.schema, rows)?;
        t.rows.extend_from_slice(rows);
        t.modified_at = Utc::now();
        Ok(())
    }

    async fn read_rows(&self, table: &TableLocator) -> StoreResult<Vec<Record>> {
        let inner = self.enter(StoreOp::ReadRows, Some(&table.table))?;
        Ok(inner.table(table)?.rows.clone())
    }

    async fn set_label(&self, table: &TableLocator, key: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.enter(StoreOp::SetLabel, Some(&table.table))?;
        let t = inner.table_mut(table)?;
        t.labels.insert(key.to_string(), value.to_string());
        t.modified_at = Utc::now();
        Ok(())
    }

    async fn append_table(
        &self,
        source: &TableLocator,
        destination: &TableLocator,
        copy_id: &str,
    ) -> StoreResult<String> {
        let mut inner = self.enter(StoreOp::AppendTable, Some(&source.table))?;
        if inner.copy_jobs.contains(copy_id) {
            return Ok(copy_id.to_string());
        }

        let (schema, rows) = {
            let src = inner.table(source)?;
            (src.schema.clone(), src.rows.clone())
        };
        let dst = inner.table_mut(destination)?;
        if dst.schema != schema {
            return Err(StoreError::Rejected(format!(
                "schema de {source} no coincide con {destination}"
            )));
        }
        dst.rows.extend(rows);
        dst.modified_at = Utc::now();
        inner.copy_jobs.insert(copy_id.to_string());

        Ok(copy_id.to_string())
    }

    async fn delete_table(&self, table: &TableLocator) -> StoreResult<()> {
        let mut inner = self.enter(StoreOp::DeleteTable, Some(&table.table))?;
        inner
            .datasets
            .get_mut(&table.dataset_locator())
            .and_then(|tables| tables.remove(&table.table))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("tabla {table}")))
    }
}
