use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{JobConf, JOB_DIR_KEY, JOB_ID_KEY};
use crate::error::{CommitError, CommitResult};

static JOB_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^job_([A-Za-z0-9]+)_([0-9]+)$").expect("regex de job"));

static ATTEMPT_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("regex de attempt"));

/// attempt_<jt>_<job>_<m|r>_<task>_<n>
static STRUCTURED_ATTEMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^attempt_([A-Za-z0-9]+)_([0-9]+)_([mr])_([0-9]+)_([0-9]+)$")
        .expect("regex de attempt estructurado")
});

pub type JobId = String;
pub type AttemptId = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentity {
    pub job_id: JobId,
}

/// Un intento concreto de una tarea. Reintentos y duplicados especulativos
/// comparten `task_slot` pero nunca `attempt_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptIdentity {
    pub job_id: JobId,
    pub attempt_id: AttemptId,
    pub task_slot: String,
    pub ordinal: u32,
}

/// Lo que el framework le entrega a cada intento de tarea.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub conf: JobConf,
    pub attempt_token: Option<String>,
}

impl TaskContext {
    pub fn new(conf: JobConf, attempt_token: impl Into<String>) -> Self {
        Self {
            conf,
            attempt_token: Some(attempt_token.into()),
        }
    }
}

/// Obtiene el id del job desde la configuración. Si no hay id explícito,
/// usa el último segmento del directorio del job.
pub fn resolve_job_identity(conf: &JobConf) -> CommitResult<JobIdentity> {
    let token = match conf.get(JOB_ID_KEY) {
        Some(id) => id,
        None => conf
            .get(JOB_DIR_KEY)
            .and_then(|dir| dir.trim_end_matches('/').rsplit('/').next())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                CommitError::Config(format!(
                    "no se encontró identidad del job ({JOB_ID_KEY} ni {JOB_DIR_KEY})"
                ))
            })?,
    };

    if !JOB_TOKEN.is_match(token) {
        return Err(CommitError::Config(format!(
            "id de job mal formado: {token:?} (se esperaba job_<id>_<número>)"
        )));
    }

    Ok(JobIdentity {
        job_id: token.to_string(),
    })
}

pub fn resolve_attempt_identity(ctx: &TaskContext) -> CommitResult<AttemptIdentity> {
    let job = resolve_job_identity(&ctx.conf)?;

    let token = ctx
        .attempt_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CommitError::Config("el contexto de la tarea no trae attempt id".into()))?;

    parse_attempt(&job, token)
}

/// Interpreta un attempt id dentro de un job. Los ids estructurados aportan
/// slot y ordinal; el resto es su propio slot con ordinal 0.
pub fn parse_attempt(job: &JobIdentity, token: &str) -> CommitResult<AttemptIdentity> {
    if !ATTEMPT_TOKEN.is_match(token) {
        return Err(CommitError::Config(format!(
            "attempt id no utilizable como nombre de tabla: {token:?}"
        )));
    }

    let (task_slot, ordinal) = match STRUCTURED_ATTEMPT.captures(token) {
        Some(caps) => {
            let owner = format!("job_{}_{}", &caps[1], &caps[2]);
            if owner != job.job_id {
                return Err(CommitError::Config(format!(
                    "el attempt {token} pertenece a {owner}, no a {}",
                    job.job_id
                )));
            }
            let ordinal = caps[5]
                .parse()
                .map_err(|_| CommitError::Config(format!("ordinal fuera de rango en {token}")))?;
            (
                format!("task_{}_{}_{}_{}", &caps[1], &caps[2], &caps[3], &caps[4]),
                ordinal,
            )
        }
        None => (token.to_string(), 0),
    };

    Ok(AttemptIdentity {
        job_id: job.job_id.clone(),
        attempt_id: token.to_string(),
        task_slot,
        ordinal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobIdentity {
        JobIdentity {
            job_id: "job_201408201023_0001".into(),
        }
    }

    #[test]
    fn resolve_job_identity_usa_id_explicito() {
        let conf = JobConf::new().with(JOB_ID_KEY, "job_20140820_0001");
        assert_eq!(resolve_job_identity(&conf).unwrap().job_id, "job_20140820_0001");
    }

    #[test]
    fn resolve_job_identity_cae_al_directorio_del_job() {
        let conf = JobConf::new().with(JOB_DIR_KEY, "//some/stuff/job_201408201023_0001/");
        assert_eq!(
            resolve_job_identity(&conf).unwrap().job_id,
            "job_201408201023_0001"
        );
    }

    #[test]
    fn resolve_job_identity_falla_sin_identidad() {
        assert!(matches!(
            resolve_job_identity(&JobConf::new()),
            Err(CommitError::Config(_))
        ));
    }

    #[test]
    fn resolve_job_identity_rechaza_gramatica_invalida() {
        for bad in ["invalid_job_format", "job_2014", "job__0001", "job_2014_00a1", "job_a-b_1"] {
            let conf = JobConf::new().with(JOB_DIR_KEY, format!("//some/stuff/{bad}"));
            assert!(
                matches!(resolve_job_identity(&conf), Err(CommitError::Config(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn resolve_attempt_identity_exige_token() {
        let conf = JobConf::new().with(JOB_ID_KEY, "job_20140820_0001");
        let ctx = TaskContext {
            conf,
            attempt_token: None,
        };
        assert!(matches!(
            resolve_attempt_identity(&ctx),
            Err(CommitError::Config(_))
        ));
    }

    #[test]
    fn parse_attempt_estructurado_extrae_slot_y_ordinal() {
        let a = parse_attempt(&job(), "attempt_201408201023_0001_r_000003_2").unwrap();
        assert_eq!(a.task_slot, "task_201408201023_0001_r_000003");
        assert_eq!(a.ordinal, 2);

        let b = parse_attempt(&job(), "attempt_201408201023_0001_r_000003_0").unwrap();
        assert_eq!(a.task_slot, b.task_slot);
        assert_ne!(a.attempt_id, b.attempt_id);
    }

    #[test]
    fn parse_attempt_opaco_es_su_propio_slot() {
        let a = parse_attempt(&job(), "attempt-1").unwrap();
        assert_eq!(a.task_slot, "attempt-1");
        assert_eq!(a.ordinal, 0);
    }

    #[test]
    fn parse_attempt_rechaza_tokens_invalidos_y_de_otro_job() {
        assert!(parse_attempt(&job(), "attempt 1").is_err());
        assert!(parse_attempt(&job(), "a.b").is_err());
        assert!(parse_attempt(&job(), "attempt_201408201023_0002_m_000001_0").is_err());
    }
}
