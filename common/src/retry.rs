//! Reintentos con backoff exponencial "difuso".
//!
//! La espera tras el intento fallido n es `min(max_sleep, base_sleep * 2^(n-1)) * f`,
//! con `f` sacado de una normal N(1, 0.2) y recortado a [0, 2]. Con los valores por
//! defecto (1s / 60s) eso da [0, 2000]ms, [0, 4000]ms, ... hasta [0, 120000]ms.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use rand_distr::StandardNormal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

pub const BASE_SLEEP: Duration = Duration::from_millis(1_000);
pub const MAX_SLEEP: Duration = Duration::from_millis(60_000);
pub const DEFAULT_MAX_TRIES: u32 = 10;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Los primeros `quiet_tries` reintentos se loguean en DEBUG; el resto en WARN.
    pub quiet_tries: u32,
    /// Intentos totales, incluida la primera ejecución.
    pub max_tries: u32,
    pub base_sleep: Duration,
    pub max_sleep: Duration,
    pub message_on_retry: Option<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            quiet_tries: 0,
            max_tries: DEFAULT_MAX_TRIES,
            base_sleep: BASE_SLEEP,
            max_sleep: MAX_SLEEP,
            message_on_retry: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(quiet_tries: u32, max_tries: u32) -> Self {
        Self {
            quiet_tries,
            max_tries,
            ..Self::default()
        }
    }

    /// Cambia la escala del backoff (la fórmula no cambia).
    pub fn with_backoff(mut self, base_sleep: Duration, max_sleep: Duration) -> Self {
        self.base_sleep = base_sleep;
        self.max_sleep = max_sleep;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message_on_retry = Some(message.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_tries == 0 {
            return Err(IngestError::Config("max_tries debe ser > 0".to_string()));
        }
        Ok(())
    }
}

/// El intento `n_try` (empezando en 1) se considera "silencioso".
pub fn is_quiet_attempt(n_try: u32, quiet_tries: u32) -> bool {
    n_try <= quiet_tries
}

/// Espera antes del reintento `n_try` (empezando en 1) con la escala por defecto.
pub fn next_retry_sleep(n_try: u32) -> Duration {
    next_retry_sleep_with(n_try, BASE_SLEEP, MAX_SLEEP)
}

pub fn next_retry_sleep_with(n_try: u32, base_sleep: Duration, max_sleep: Duration) -> Duration {
    let exponent = n_try.saturating_sub(1).min(32) as i32;
    let uncapped = base_sleep.as_millis() as f64 * 2f64.powi(exponent);
    let capped = uncapped.min(max_sleep.as_millis() as f64);
    Duration::from_millis((capped * fuzzy_multiplier()) as u64)
}

/// N(1, 0.2) recortada a [0, 2].
fn fuzzy_multiplier() -> f64 {
    let gaussian: f64 = rand::thread_rng().sample(StandardNormal);
    (1.0 + 0.2 * gaussian).clamp(0.0, 2.0)
}

/// Igual que [`retry_with`] sin callback de limpieza ni cancelación.
pub async fn retry<T, F, Fut, P>(policy: &RetryPolicy, op: F, should_retry: P) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&IngestError) -> bool,
{
    retry_with(policy, op, should_retry, None, None).await
}

/// Ejecuta `op` hasta que tenga éxito, se agoten los intentos o `should_retry`
/// rechace el error. `op` recibe el número de intento (empezando en 1).
///
/// - Después de cada fallo se llama a `cleanup` (si hay).
/// - Si `cancel` se dispara antes de un intento o durante la espera, se llama a
///   `cleanup` y se devuelve [`IngestError::Cancelled`] sin más intentos.
/// - Al agotar los intentos se devuelve el último error tal cual.
pub async fn retry_with<T, F, Fut, P>(
    policy: &RetryPolicy,
    mut op: F,
    should_retry: P,
    mut cleanup: Option<&mut (dyn FnMut() + Send)>,
    cancel: Option<&CancellationToken>,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&IngestError) -> bool,
{
    policy.validate()?;
    let max_retries = policy.max_tries - 1;
    let mut n_try: u32 = 0;

    loop {
        if cancel.is_some_and(|token| token.is_cancelled()) {
            if let Some(cb) = cleanup.as_deref_mut() {
                cb();
            }
            return Err(IngestError::Cancelled { attempts: n_try });
        }

        n_try += 1;
        let err = match op(n_try).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if let Some(cb) = cleanup.as_deref_mut() {
            cb();
        }

        if n_try >= policy.max_tries || !should_retry(&err) {
            return Err(err);
        }

        let sleep = next_retry_sleep_with(n_try, policy.base_sleep, policy.max_sleep);
        let message = policy.message_on_retry.as_deref().unwrap_or("Operación fallida");
        if is_quiet_attempt(n_try, policy.quiet_tries) {
            debug!(error = %err, "{message}, reintentando ({n_try} de {max_retries}) en {}ms", sleep.as_millis());
        } else {
            warn!(error = %err, "{message}, reintentando ({n_try} de {max_retries}) en {}ms", sleep.as_millis());
        }

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = token.cancelled() => {
                        if let Some(cb) = cleanup.as_deref_mut() {
                            cb();
                        }
                        return Err(IngestError::Cancelled { attempts: n_try });
                    }
                }
            }
            None => tokio::time::sleep(sleep).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn retry_devuelve_el_primer_exito() {
        let calls = AtomicU32::new(0);
        let out = retry(&RetryPolicy::new(0, 5), |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(IngestError::Transient(format!("intento {n}")))
                } else {
                    Ok(n * 10)
                }
            }
        }, IngestError::is_transient)
        .await
        .unwrap();

        assert_eq!(out, 30);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn agotar_intentos_devuelve_el_ultimo_error_sin_envolver() {
        let err = retry(&RetryPolicy::new(0, 4), |n| async move {
            Err::<(), _>(IngestError::Transient(format!("intento {n}")))
        }, IngestError::is_transient)
        .await
        .unwrap_err();

        match err {
            IngestError::Transient(msg) => assert_eq!(msg, "intento 4"),
            other => panic!("error inesperado: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn error_no_reintentable_corta_en_el_primer_intento() {
        let calls = AtomicU32::new(0);
        let err = retry(&RetryPolicy::new(0, 10), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(IngestError::UnknownTask("t1".to_string())) }
        }, IngestError::is_transient)
        .await
        .unwrap_err();

        assert!(matches!(err, IngestError::UnknownTask(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_se_llama_tras_cada_fallo() {
        let mut cleanups = 0;
        let mut cleanup = || cleanups += 1;
        let _ = retry_with(
            &RetryPolicy::new(0, 3),
            |_| async { Err::<(), _>(IngestError::Transient("x".to_string())) },
            IngestError::is_transient,
            Some(&mut cleanup),
            None,
        )
        .await;

        assert_eq!(cleanups, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelar_durante_la_espera_corta_y_limpia() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let cleanups = Arc::new(AtomicU32::new(0));

        let token_for_op = token.clone();
        let calls_for_op = calls.clone();
        let cleanups_cb = cleanups.clone();
        let mut cleanup = move || {
            cleanups_cb.fetch_add(1, Ordering::SeqCst);
        };

        let err = retry_with(
            &RetryPolicy::new(0, 10),
            |_| {
                calls_for_op.fetch_add(1, Ordering::SeqCst);
                // cancelamos mientras el executor espera el siguiente intento
                token_for_op.cancel();
                async { Err::<(), _>(IngestError::Transient("caído".to_string())) }
            },
            IngestError::is_transient,
            Some(&mut cleanup),
            Some(&token),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, IngestError::Cancelled { attempts: 1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // una vez por el fallo y otra por la cancelación
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn max_tries_cero_es_configuracion_invalida() {
        let err = retry(&RetryPolicy::new(0, 0), |_| async { Ok(()) }, |_| true)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn intentos_silenciosos_hasta_quiet_tries() {
        assert!(is_quiet_attempt(1, 2));
        assert!(is_quiet_attempt(2, 2));
        assert!(!is_quiet_attempt(3, 2));
        assert!(!is_quiet_attempt(1, 0));
    }

    #[test]
    fn media_del_backoff_cerca_del_valor_nominal() {
        for n in 1..=8u32 {
            let nominal = (1_000f64 * 2f64.powi(n as i32 - 1)).min(60_000.0);
            let samples = 2_000;
            let total: f64 = (0..samples)
                .map(|_| next_retry_sleep(n).as_millis() as f64)
                .sum();
            let mean = total / samples as f64;
            // desvío de la media muestral ~ 0.2 * nominal / sqrt(2000) ≈ 0.0045 * nominal
            assert!(
                (mean - nominal).abs() < nominal * 0.05,
                "n={n} media={mean} nominal={nominal}"
            );
        }
    }

    proptest! {
        #[test]
        fn backoff_dentro_de_los_limites(n in 1u32..=8) {
            let upper = (1_000u64 << n).min(120_000);
            for _ in 0..50 {
                let sleep = next_retry_sleep(n).as_millis() as u64;
                prop_assert!(sleep <= upper, "n={} sleep={} upper={}", n, sleep, upper);
            }
        }

        #[test]
        fn backoff_topa_en_120s(n in 7u32..64) {
            prop_assert!(next_retry_sleep(n).as_millis() <= 120_000);
        }
    }
}
