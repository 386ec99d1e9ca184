use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{JobConf, OUTPUT_DATASET_ID_KEY, OUTPUT_PROJECT_ID_KEY, OUTPUT_TABLE_ID_KEY};
use crate::error::CommitResult;
use crate::identity::{AttemptIdentity, JobIdentity};

/// Se agrega al dataset final, seguido del job id, para nombrar el área de staging.
pub const STAGING_SUFFIX: &str = "_hadoop_temporary_";

/// Un dataset (namespace) dentro de un proyecto.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetLocator {
    pub project: String,
    pub dataset: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableLocator {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl DatasetLocator {
    pub fn table(&self, table: impl Into<String>) -> TableLocator {
        TableLocator {
            project: self.project.clone(),
            dataset: self.dataset.clone(),
            table: table.into(),
        }
    }
}

impl TableLocator {
    pub fn dataset_locator(&self) -> DatasetLocator {
        DatasetLocator {
            project: self.project.clone(),
            dataset: self.dataset.clone(),
        }
    }
}

impl fmt::Display for DatasetLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project, self.dataset)
    }
}

impl fmt::Display for TableLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.project, self.dataset, self.table)
    }
}

/// Destino final elegido por el usuario.
pub fn final_locator(conf: &JobConf) -> CommitResult<TableLocator> {
    Ok(TableLocator {
        project: conf.require(OUTPUT_PROJECT_ID_KEY)?.to_string(),
        dataset: conf.require(OUTPUT_DATASET_ID_KEY)?.to_string(),
        table: conf.require(OUTPUT_TABLE_ID_KEY)?.to_string(),
    })
}

/// `<dataset final><sufijo><job id>`, en el mismo proyecto que el destino.
pub fn staging_area_locator(job: &JobIdentity, final_table: &TableLocator) -> DatasetLocator {
    DatasetLocator {
        project: final_table.project.clone(),
        dataset: format!("{}{}{}", final_table.dataset, STAGING_SUFFIX, job.job_id),
    }
}

/// `<tabla final>_<attempt id>` dentro del área de staging del job.
pub fn attempt_staging_locator(
    attempt: &AttemptIdentity,
    final_table: &TableLocator,
    job: &JobIdentity,
) -> TableLocator {
    staging_area_locator(job, final_table).table(staging_table_name(final_table, &attempt.attempt_id))
}

pub fn staging_table_name(final_table: &TableLocator, attempt_id: &str) -> String {
    format!("{}_{}", final_table.table, attempt_id)
}

/// Inversa de `staging_table_name`: recupera el attempt id de una tabla listada
/// en el área de staging. `None` si la tabla no sigue el esquema de nombres.
pub fn attempt_id_from_staging_table<'a>(
    final_table: &TableLocator,
    staging_table: &'a str,
) -> Option<&'a str> {
    staging_table
        .strip_prefix(final_table.table.as_str())
        .and_then(|rest| rest.strip_prefix('_'))
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::valid_conf;
    use crate::error::CommitError;
    use crate::identity::parse_attempt;
    use std::collections::HashSet;

    fn job() -> JobIdentity {
        JobIdentity {
            job_id: "job_20140820_0001".into(),
        }
    }

    fn final_tbl() -> TableLocator {
        TableLocator {
            project: "proj".into(),
            dataset: "ds".into(),
            table: "tbl".into(),
        }
    }

    #[test]
    fn final_locator_lee_la_conf() {
        assert_eq!(final_locator(&valid_conf()).unwrap(), final_tbl());
    }

    #[test]
    fn final_locator_falla_con_campo_vacio() {
        let conf = valid_conf().with(OUTPUT_TABLE_ID_KEY, "");
        assert!(matches!(final_locator(&conf), Err(CommitError::Config(_))));
    }

    #[test]
    fn staging_area_usa_sufijo_y_job_id() {
        let area = staging_area_locator(&job(), &final_tbl());
        assert_eq!(area.project, "proj");
        assert_eq!(area.dataset, "ds_hadoop_temporary_job_20140820_0001");
    }

    #[test]
    fn attempt_staging_locator_es_determinista() {
        let a = parse_attempt(&job(), "attempt-1").unwrap();
        let l1 = attempt_staging_locator(&a, &final_tbl(), &job());
        let l2 = attempt_staging_locator(&a.clone(), &final_tbl(), &job());

        assert_eq!(l1, l2);
        assert_eq!(l1.table, "tbl_attempt-1");
        assert_eq!(l1.dataset, "ds_hadoop_temporary_job_20140820_0001");
    }

    #[test]
    fn attempt_staging_locator_es_inyectivo() {
        let ids = [
            "attempt-1",
            "attempt-2",
            "attempt-10",
            "attempt_20140820_0001_r_000001_0",
            "attempt_20140820_0001_r_000001_1",
            "attempt_20140820_0001_m_000001_0",
            "1",
            "_1",
        ];

        let mut names = HashSet::new();
        for id in ids {
            let a = parse_attempt(&job(), id).unwrap();
            let loc = attempt_staging_locator(&a, &final_tbl(), &job());
            assert!(names.insert(loc.table.clone()), "colisión en {id}");
            // y se puede invertir
            assert_eq!(attempt_id_from_staging_table(&final_tbl(), &loc.table), Some(id));
        }
    }

    #[test]
    fn attempt_id_from_staging_table_ignora_tablas_ajenas() {
        assert_eq!(attempt_id_from_staging_table(&final_tbl(), "otra_tabla"), None);
        assert_eq!(attempt_id_from_staging_table(&final_tbl(), "tbl"), None);
        assert_eq!(attempt_id_from_staging_table(&final_tbl(), "tbl_"), None);
    }
}
