use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use common::{
    CommitCoordinator, HttpTableStore, JobCommitOutcome, JobConf, OutputFormat, Record,
    StagedTableOutput, TableLocator, TableStore, TaskContext,
};
use std::{collections::BTreeMap, env, path::PathBuf, sync::Arc};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{info, warn};

use crate::input;

const DEFAULT_CLIENT_CONCURRENCY: usize = 2;

/// - En Docker: STORE_URL=http://tablestore:8080
/// - Local: default http://localhost:8080
fn store_base_url() -> String {
    env::var("STORE_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

fn client_concurrency() -> usize {
    env::var("CLIENT_CONCURRENCY")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_CLIENT_CONCURRENCY)
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para escribir la salida de un job en el tablestore con commit en dos fases")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Valida la configuración de salida sin tocar el store
    Validate {
        #[arg(long, value_name = "JSON")]
        conf: PathBuf,
    },
    /// Corre un job: un archivo de entrada por tarea, luego commit del job
    Run {
        #[arg(long, value_name = "JSON")]
        conf: PathBuf,

        /// Patrón de archivos de entrada (.csv o JSONL)
        #[arg(long, value_name = "GLOB")]
        input: String,

        /// Lanza un duplicado especulativo por tarea; gana el primero que cierra
        #[arg(long)]
        speculate: bool,

        /// Hace fallar el primer intento de esa tarea a mitad de escritura
        #[arg(long, value_name = "SLOT")]
        fail_slot: Option<usize>,
    },
    /// Commit de un job cuyos intentos ya cerraron
    Commit {
        #[arg(long, value_name = "JSON")]
        conf: PathBuf,

        /// Intentos ganadores, uno por tarea
        #[arg(long = "winner", value_name = "ATTEMPT_ID", required = true)]
        winners: Vec<String>,
    },
    /// Aborta el job y borra su área de staging
    Abort {
        #[arg(long, value_name = "JSON")]
        conf: PathBuf,
    },
    /// Estado de cada intento que tiene tabla de staging
    Status {
        #[arg(long, value_name = "JSON")]
        conf: PathBuf,
    },
    /// Muestra metadatos y filas de una tabla
    Show {
        #[arg(long)]
        project: String,
        #[arg(long)]
        dataset: String,
        #[arg(long)]
        table: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let base_url = store_base_url();
    let store: Arc<dyn TableStore> = Arc::new(HttpTableStore::new(base_url.clone()));
    let output = StagedTableOutput::new(store.clone());

    match cli.command {
        Commands::Validate { conf } => {
            let conf = JobConf::from_json_file(&conf)?;
            let out = output.validate_output_spec(&conf)?;
            println!("Configuración válida:");
            println!(
                "  destino: {}:{}.{}",
                out.final_project, out.final_dataset, out.final_table
            );
            println!("  campos: {}", out.output_schema.fields.len());
            println!("  buffer: {} filas", out.write_buffer_size);
            println!(
                "  reintentos: {} (backoff inicial {:?})",
                out.retry.max_attempts, out.retry.initial_backoff
            );
        }

        Commands::Run {
            conf,
            input,
            speculate,
            fail_slot,
        } => {
            let conf = JobConf::from_json_file(&conf)?;
            let files = input::expand_input(&input)?;
            if files.is_empty() {
                bail!("el patrón {input} no encontró archivos");
            }
            info!(
                "corriendo job con {} tareas contra {} (concurrency={})",
                files.len(),
                base_url,
                client_concurrency()
            );
            let plan = RunPlan {
                files,
                speculate,
                fail_slot,
                concurrency: client_concurrency(),
            };
            let outcome = run_job(&output, &conf, plan).await?;
            print_outcome(&outcome);
        }

        Commands::Commit { conf, winners } => {
            let conf = JobConf::from_json_file(&conf)?;
            let coordinator = output.commit_coordinator(&conf)?;
            for w in &winners {
                coordinator.commit_task(w).await?;
            }
            let outcome = coordinator.commit_job(&winners).await?;
            print_outcome(&outcome);
        }

        Commands::Abort { conf } => {
            let conf = JobConf::from_json_file(&conf)?;
            let coordinator = output.commit_coordinator(&conf)?;
            match coordinator.abort_job().await {
                None => println!("Job {} abortado.", coordinator.job().job_id),
                Some(w) => println!("Job {} abortado con avisos: {}", coordinator.job().job_id, w),
            }
        }

        Commands::Status { conf } => {
            let conf = JobConf::from_json_file(&conf)?;
            let coordinator = output.commit_coordinator(&conf)?;
            let records = coordinator.records().await?;
            println!(
                "Job {} (staging {}):",
                coordinator.job().job_id,
                coordinator.staging_area()
            );
            if records.is_empty() {
                println!("  (sin intentos en staging)");
            }
            for r in records {
                println!("  {:<40} {:?}", r.attempt_id, r.status);
            }
        }

        Commands::Show {
            project,
            dataset,
            table,
            limit,
        } => {
            let locator = TableLocator {
                project,
                dataset,
                table,
            };
            let info = store.get_table(&locator).await?;
            println!("Tabla {}:", info.locator);
            println!("  filas: {}", info.num_rows);
            println!("  esquema: {}", info.schema.to_json());
            println!("  labels: {:?}", info.labels);
            println!("  creada: {}", info.created_at);
            println!("  modificada: {}", info.modified_at);

            let rows = store.read_rows(&locator).await?;
            for row in rows.iter().take(limit) {
                println!("    {}", row);
            }
            if rows.len() > limit {
                println!("    ... ({} más)", rows.len() - limit);
            }
        }
    }

    Ok(())
}

fn print_outcome(outcome: &JobCommitOutcome) {
    if outcome.already_complete {
        println!("El job ya estaba completo; no se movieron datos.");
        return;
    }
    println!("Commit del job terminado:");
    println!("  mergeados: {:?}", outcome.merged);
    if !outcome.already_committed.is_empty() {
        println!("  ya commiteados antes: {:?}", outcome.already_committed);
    }
    if !outcome.discarded.is_empty() {
        println!("  descartados: {:?}", outcome.discarded);
    }
    if let Some(w) = &outcome.cleanup_warning {
        println!("  aviso de limpieza: {}", w);
    }
}

/* --------- Ejecución local de tareas --------- */

pub struct RunPlan {
    pub files: Vec<PathBuf>,
    pub speculate: bool,
    pub fail_slot: Option<usize>,
    pub concurrency: usize,
}

/// Arma un attempt id con la forma `attempt_<id>_<n>_r_<slot>_<ordinal>`.
pub fn attempt_token(job_id: &str, slot: usize, ordinal: u32) -> String {
    let base = job_id.strip_prefix("job_").unwrap_or(job_id);
    format!("attempt_{base}_r_{slot:06}_{ordinal}")
}

/// Corre todas las tareas en paralelo (hasta `concurrency`), elige un ganador
/// por slot y hace el commit del job. Si alguna tarea se queda sin intento
/// exitoso el job se aborta.
pub async fn run_job(
    output: &StagedTableOutput,
    conf: &JobConf,
    plan: RunPlan,
) -> Result<JobCommitOutcome> {
    let schema = output.validate_output_spec(conf)?.output_schema;
    let coordinator = output.commit_coordinator(conf)?;
    let job_id = coordinator.job().job_id.clone();
    let copies: u32 = if plan.speculate { 2 } else { 1 };
    let sem = Arc::new(Semaphore::new(plan.concurrency.max(1)));

    let mut tasks = JoinSet::new();
    for (slot, path) in plan.files.iter().enumerate() {
        let records = Arc::new(input::read_records(path, &schema)?);
        for copy in 0..copies {
            let sem = sem.clone();
            let output = output.clone();
            let coordinator = coordinator.clone();
            let conf = conf.clone();
            let records = records.clone();
            let job_id = job_id.clone();
            let crash_first = plan.fail_slot == Some(slot) && copy == 0;

            tasks.spawn(async move {
                // se libera al terminar el slot
                let _permit = sem.acquire_owned().await?;
                run_slot(
                    &output,
                    &coordinator,
                    &conf,
                    SlotRun {
                        job_id,
                        slot,
                        first_ordinal: copy,
                        retry_stride: copies,
                        crash_first,
                    },
                    &records,
                )
                .await
            });
        }
    }

    // el primer intento que cierra gana su slot
    let mut winners: BTreeMap<usize, String> = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((slot, token))) => {
                if let Some(w) = winners.get(&slot) {
                    info!("{} terminó después de {}; se aborta", token, w);
                    // un perdedor sin abortar sólo deja basura que reclama la limpieza
                    if let Err(e) = coordinator.abort_task(&token).await {
                        warn!("no se pudo abortar {}: {}", token, e);
                    }
                } else {
                    winners.insert(slot, token);
                }
            }
            Ok(Err(e)) => warn!("tarea sin intento exitoso: {e:#}"),
            Err(e) => warn!("panic o join error en tarea: {e:?}"),
        }
    }

    let missing: Vec<usize> = (0..plan.files.len())
        .filter(|s| !winners.contains_key(s))
        .collect();
    if !missing.is_empty() {
        if let Some(w) = coordinator.abort_job().await {
            warn!("{}", w);
        }
        bail!("tareas sin ganador {:?}; job abortado", missing);
    }

    for token in winners.values() {
        coordinator.commit_task(token).await?;
    }
    let winners: Vec<String> = winners.into_values().collect();
    Ok(coordinator.commit_job(&winners).await?)
}

struct SlotRun {
    job_id: String,
    slot: usize,
    first_ordinal: u32,
    retry_stride: u32,
    crash_first: bool,
}

/// Un intento y, si falla, un reintento con otro ordinal. El intento fallido
/// se aborta antes de reintentar.
async fn run_slot(
    output: &StagedTableOutput,
    coordinator: &CommitCoordinator,
    conf: &JobConf,
    run: SlotRun,
    records: &[Record],
) -> Result<(usize, String)> {
    let ordinals = [run.first_ordinal, run.first_ordinal + run.retry_stride];

    for (i, ordinal) in ordinals.into_iter().enumerate() {
        let token = attempt_token(&run.job_id, run.slot, ordinal);
        let crash = run.crash_first && i == 0;

        match run_attempt(output, conf, &token, records, crash).await {
            Ok(rows) => {
                info!("intento {} cerrado con {} filas", token, rows);
                return Ok((run.slot, token));
            }
            Err(e) => {
                warn!("intento {} falló: {e:#}", token);
                if let Err(e) = coordinator.abort_task(&token).await {
                    warn!("no se pudo abortar {}: {}", token, e);
                }
            }
        }
    }

    Err(anyhow!("slot {} agotó sus intentos", run.slot))
}

async fn run_attempt(
    output: &StagedTableOutput,
    conf: &JobConf,
    token: &str,
    records: &[Record],
    crash: bool,
) -> Result<u64> {
    let mut writer = output
        .open_writer(&TaskContext::new(conf.clone(), token))
        .await?;

    let cut = if crash { records.len() / 2 } else { records.len() };
    for rec in &records[..cut] {
        writer.write(rec.clone()).await?;
    }
    if crash {
        // el writer se descarta sin close, como un proceso que muere
        bail!("fallo simulado tras {} filas", cut);
    }

    writer.close().await?;
    Ok(writer.rows_flushed())
}
