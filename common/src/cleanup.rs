use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{CleanupWarning, StoreError};
use crate::locator::DatasetLocator;
use crate::retry::{retry, retry_absent_ok, RetryPolicy};
use crate::store::TableStore;

/// Borrado idempotente del área de staging de un job.
#[derive(Clone)]
pub struct CleanupSupervisor {
    store: Arc<dyn TableStore>,
    retry: RetryPolicy,
}

impl CleanupSupervisor {
    pub fn new(store: Arc<dyn TableStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Borra todas las tablas del área y después el área. Lo que ya no existe
    /// se ignora. Los fallos no cortan la limpieza: se juntan y se devuelven
    /// como aviso.
    pub async fn reclaim(&self, area: &DatasetLocator) -> Option<CleanupWarning> {
        let store = &self.store;

        let tables = match retry(self.retry, "list_tables", || store.list_tables(area)).await {
            Ok(tables) => tables,
            Err(StoreError::NotFound(_)) => {
                info!("área de staging {} ya no existe, nada que limpiar", area);
                return None;
            }
            Err(e) => {
                warn!("no se pudo listar {} para limpiar: {}", area, e);
                return Some(CleanupWarning {
                    area: area.to_string(),
                    failures: vec![(area.to_string(), e.to_string())],
                });
            }
        };

        let mut failures = Vec::new();

        for name in &tables {
            let table = area.table(name.as_str());
            if let Err(e) = retry_absent_ok(self.retry, "delete_table", || store.delete_table(&table)).await {
                warn!("no se pudo borrar la tabla de staging {}: {}", table, e);
                failures.push((table.to_string(), e.to_string()));
            }
        }

        if let Err(e) = retry_absent_ok(self.retry, "delete_dataset", || store.delete_dataset(area)).await {
            warn!("no se pudo borrar el área de staging {}: {}", area, e);
            failures.push((area.to_string(), e.to_string()));
        }

        if failures.is_empty() {
            info!("área de staging {} eliminada ({} tablas)", area, tables.len());
            None
        } else {
            Some(CleanupWarning {
                area: area.to_string(),
                failures,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryTableStore, StoreOp};
    use crate::schema::TableSchema;

    fn area() -> DatasetLocator {
        DatasetLocator {
            project: "proj".into(),
            dataset: "ds_hadoop_temporary_job_20140820_0001".into(),
        }
    }

    async fn seeded(store: &MemoryTableStore, tables: &[&str]) {
        let schema = TableSchema::parse(r#"[{"name":"word","type":"STRING"}]"#).unwrap();
        store.create_dataset(&area()).await.unwrap();
        for t in tables {
            store.create_table(&area().table(*t), &schema).await.unwrap();
        }
    }

    fn supervisor(store: &MemoryTableStore) -> CleanupSupervisor {
        CleanupSupervisor::new(Arc::new(store.clone()), RetryPolicy::immediate(2))
    }

    #[tokio::test]
    async fn reclaim_borra_tablas_y_area() {
        let store = MemoryTableStore::new();
        seeded(&store, &["tbl_a", "tbl_b"]).await;

        assert_eq!(supervisor(&store).reclaim(&area()).await, None);
        assert!(!store.has_dataset(&area()));
    }

    #[tokio::test]
    async fn reclaim_dos_veces_es_idempotente() {
        let store = MemoryTableStore::new();
        seeded(&store, &["tbl_a"]).await;
        let sup = supervisor(&store);

        assert_eq!(sup.reclaim(&area()).await, None);
        assert_eq!(sup.reclaim(&area()).await, None);
        assert!(!store.has_dataset(&area()));
    }

    #[tokio::test]
    async fn reclaim_sobre_area_inexistente_no_falla() {
        let store = MemoryTableStore::new();
        assert_eq!(supervisor(&store).reclaim(&area()).await, None);
    }

    #[tokio::test]
    async fn reclaim_junta_fallos_como_aviso_y_sigue() {
        let store = MemoryTableStore::new();
        seeded(&store, &["tbl_a", "tbl_b"]).await;
        store.fail_next_on(StoreOp::DeleteTable, "tbl_a", 2);

        let warning = supervisor(&store).reclaim(&area()).await.unwrap();

        // tbl_a no se pudo borrar, y por eso tampoco el área
        assert_eq!(warning.failures.len(), 2);
        assert!(warning.failures[0].0.ends_with("tbl_a"));
        assert!(store.peek_rows(&area().table("tbl_b")).is_none());
        assert!(store.has_dataset(&area()));

        // un segundo intento termina el trabajo
        assert_eq!(supervisor(&store).reclaim(&area()).await, None);
        assert!(!store.has_dataset(&area()));
    }
}
