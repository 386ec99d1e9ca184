use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::{StoreError, StoreResult};

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;

/// Reintentos acotados para llamadas al store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Intentos totales, incluido el primero. Siempre >= 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Sin espera entre intentos (tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
        }
    }
}

/// Ejecuta `f` hasta que tenga éxito, falle con un error no transitorio
/// o se agoten los intentos. El backoff se duplica en cada reintento.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, op: &str, mut f: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                warn!(
                    "{} falló (intento {}/{}): {}; reintentando en {:?}",
                    op, attempt, policy.max_attempts, e, backoff
                );
                if !backoff.is_zero() {
                    sleep(backoff).await;
                }
                backoff *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Como `retry`, pero un `NotFound` cuenta como éxito (operaciones de borrado).
pub async fn retry_absent_ok<F, Fut>(policy: RetryPolicy, op: &str, f: F) -> StoreResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<()>>,
{
    match retry(policy, op, f).await {
        Err(StoreError::NotFound(_)) => Ok(()),
        other => other,
    }
}
