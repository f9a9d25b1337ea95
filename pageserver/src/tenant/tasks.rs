//! This module contains per-tenant background processes, e.g. compaction and GC.

use std::future::Future;
use std::num::NonZeroUsize;
use std::ops::{ControlFlow, RangeInclusive};
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use rand::Rng;
use scopeguard::defer;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::*;
use utils::backoff::exponential_backoff_duration_seconds;

use crate::metrics::{BACKGROUND_LOOP_PERIOD_OVERRUN_COUNT, TENANT_TASK_EVENTS};
use crate::tenant::timeline::{CompactionError, GcError};
use crate::tenant::Tenant;

/// Semaphore limiting concurrent background tasks (across all tenants).
///
/// We use 3/4 of the available cores, to avoid blocking all threads in case we do any
/// CPU-heavy work.
static CONCURRENT_BACKGROUND_TASKS: Lazy<Semaphore> = Lazy::new(|| {
    let total_threads = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    let permits = std::cmp::max(1, total_threads * 3 / 4);
    Semaphore::new(permits)
});

/// Recheck interval of a loop disabled by a zero period.
const RECHECK_CONFIG_INTERVAL: Duration = Duration::from_secs(10);

const MAX_BACKOFF_SECS: f64 = 300.0;

#[derive(
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    strum_macros::IntoStaticStr,
    strum_macros::Display,
    enum_map::Enum,
)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum BackgroundLoopKind {
    Compaction,
    Gc,
}

/// Acquires a semaphore permit, to limit concurrent background jobs.
async fn acquire_concurrency_permit(
    loop_kind: BackgroundLoopKind,
    cancel: &CancellationToken,
) -> Result<SemaphorePermit<'static>, Cancelled> {
    let started_at = Instant::now();
    let permit = tokio::select! {
        permit = CONCURRENT_BACKGROUND_TASKS.acquire() => permit.map_err(|_| Cancelled)?,
        _ = cancel.cancelled() => return Err(Cancelled),
    };
    let waited = started_at.elapsed();
    if waited > Duration::from_secs(1) {
        debug!(task = %loop_kind, waited_ms = waited.as_millis(), "waited for a background task permit");
    }
    Ok(permit)
}

/// Start per tenant background loops: compaction and GC.
///
/// The loops run on the task tracker of the tenant and stop when the tenant is shut down.
pub fn start_background_loops(tenant: &Arc<Tenant>) {
    let tenant_id = tenant.tenant_id;

    tenant.background_tasks.spawn({
        let tenant = Arc::clone(tenant);
        let cancel = tenant.cancel.clone();
        async move {
            TENANT_TASK_EVENTS.with_label_values(&["start"]).inc();
            defer!(TENANT_TASK_EVENTS.with_label_values(&["stop"]).inc());
            compaction_loop(tenant, cancel)
                .instrument(info_span!(
                    "compaction_loop",
                    %tenant_id,
                    task = %BackgroundLoopKind::Compaction
                ))
                .await;
        }
    });

    tenant.background_tasks.spawn({
        let tenant = Arc::clone(tenant);
        let cancel = tenant.cancel.clone();
        async move {
            TENANT_TASK_EVENTS.with_label_values(&["start"]).inc();
            defer!(TENANT_TASK_EVENTS.with_label_values(&["stop"]).inc());
            gc_loop(tenant, cancel)
                .instrument(info_span!("gc_loop", %tenant_id, task = %BackgroundLoopKind::Gc))
                .await;
        }
    });
}

///
/// Compaction task's main loop
///
async fn compaction_loop(tenant: Arc<Tenant>, cancel: CancellationToken) {
    const BASE_BACKOFF_SECS: f64 = 1.0;

    let mut error_run = 0; // consecutive errors

    // Stagger the compaction loop across tenants.
    if sleep_random(tenant.get_compaction_period(), &cancel)
        .await
        .is_err()
    {
        return;
    }

    loop {
        // Refresh the period. If compaction is disabled, check again in a bit.
        let period = tenant.get_compaction_period();
        if period == Duration::ZERO {
            debug!("automatic compaction is disabled");
            if sleep_cancellable(RECHECK_CONFIG_INTERVAL, &cancel).await.is_break() {
                return;
            }
            continue;
        }

        let sleep_duration = {
            let Ok(_permit) =
                acquire_concurrency_permit(BackgroundLoopKind::Compaction, &cancel).await
            else {
                return;
            };
            let iteration = Iteration {
                started_at: Instant::now(),
                period,
                kind: BackgroundLoopKind::Compaction,
            };
            let IterationResult { output, elapsed } =
                iteration.run(tenant.compaction_iteration(&cancel)).await;

            match output {
                Ok(()) => {
                    error_run = 0;
                    debug!(elapsed_ms = elapsed.as_millis(), "compaction iteration complete");
                    period
                }
                Err(CompactionError::ShuttingDown) => return,
                Err(e) => {
                    error_run += 1;
                    let wait_duration = Duration::from_secs_f64(
                        exponential_backoff_duration_seconds(
                            error_run,
                            BASE_BACKOFF_SECS,
                            MAX_BACKOFF_SECS,
                        ),
                    );
                    error!(
                        "Compaction failed {error_run} times, retrying in {wait_duration:?}: {e:#}"
                    );
                    wait_duration
                }
            }
        };

        if sleep_cancellable(sleep_duration, &cancel).await.is_break() {
            return;
        }
    }
}

///
/// GC task's main loop
///
async fn gc_loop(tenant: Arc<Tenant>, cancel: CancellationToken) {
    let mut error_run = 0; // consecutive errors
    let mut first = true;

    loop {
        let period = tenant.get_gc_period();

        if first {
            first = false;
            if sleep_random(period, &cancel).await.is_err() {
                break;
            }
        }

        let gc_horizon = tenant.get_gc_horizon();
        let sleep_duration = if period == Duration::ZERO || gc_horizon == 0 {
            debug!("automatic GC is disabled");
            // check again in a bit, in case it's been enabled again.
            RECHECK_CONFIG_INTERVAL
        } else {
            let Ok(_permit) = acquire_concurrency_permit(BackgroundLoopKind::Gc, &cancel).await
            else {
                break;
            };
            let iteration = Iteration {
                started_at: Instant::now(),
                period,
                kind: BackgroundLoopKind::Gc,
            };
            // Run gc
            let IterationResult { output, elapsed: _ } = iteration
                .run(tenant.gc_iteration(None, gc_horizon, tenant.get_pitr_interval(), &cancel))
                .await;
            match output {
                Ok(_) => {
                    error_run = 0;
                    period
                }
                Err(e) => {
                    error_run += 1;
                    let wait_duration = Duration::from_secs_f64(
                        exponential_backoff_duration_seconds(error_run, 1.0, MAX_BACKOFF_SECS),
                    );

                    if matches!(e, GcError::TimelineCancelled) {
                        // Timeline was cancelled during gc. We might either be in an event
                        // that affects the entire tenant (tenant shutdown), or in one that
                        // affects the timeline only (timeline deletion).
                        // Therefore, don't exit the loop.
                        info!("Gc failed {error_run} times, retrying in {wait_duration:?}: {e:?}");
                    } else {
                        error!("Gc failed {error_run} times, retrying in {wait_duration:?}: {e:?}");
                    }

                    wait_duration
                }
            }
        };

        if sleep_cancellable(sleep_duration, &cancel).await.is_break() {
            break;
        }
    }
}

async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> ControlFlow<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => ControlFlow::Continue(()),
        _ = cancel.cancelled() => ControlFlow::Break(()),
    }
}

#[derive(thiserror::Error, Debug)]
#[error("cancelled")]
pub(crate) struct Cancelled;

/// Sleeps for a random interval up to the given max value.
///
/// This delay prevents a thundering herd of background tasks and will likely keep them running on
/// different periods for more stable load.
pub(crate) async fn sleep_random(
    max: Duration,
    cancel: &CancellationToken,
) -> Result<Duration, Cancelled> {
    sleep_random_range(Duration::ZERO..=max, cancel).await
}

/// Sleeps for a random interval in the given range. Returns the duration.
pub(crate) async fn sleep_random_range(
    interval: RangeInclusive<Duration>,
    cancel: &CancellationToken,
) -> Result<Duration, Cancelled> {
    let delay = rand::thread_rng().gen_range(interval);
    if delay == Duration::ZERO {
        return Ok(delay);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(delay) => Ok(delay),
    }
}

struct Iteration {
    started_at: Instant,
    period: Duration,
    kind: BackgroundLoopKind,
}

struct IterationResult<O> {
    output: O,
    elapsed: Duration,
}

impl Iteration {
    #[instrument(skip_all)]
    pub(crate) async fn run<F: Future<Output = O>, O>(self, fut: F) -> IterationResult<O> {
        let mut fut = pin!(fut);

        // Wrap `fut` into a future that logs a message every `period` so that we get a
        // very obvious breadcrumb in the logs _while_ a slow iteration is happening.
        let output = loop {
            match tokio::time::timeout(self.period, &mut fut).await {
                Ok(r) => break r,
                Err(_) => info!("still running"),
            }
        };
        let elapsed = self.started_at.elapsed();
        warn_when_period_overrun(elapsed, self.period, self.kind);

        IterationResult { output, elapsed }
    }
}

// NB: the `task` and `period` are used for metrics labels.
pub(crate) fn warn_when_period_overrun(
    elapsed: Duration,
    period: Duration,
    task: BackgroundLoopKind,
) {
    // Duration::ZERO will happen because it's the "disable [bgtask]" value.
    if elapsed >= period && period != Duration::ZERO {
        // humantime does no significant digits clamping whereas Duration's debug is a bit more
        // intelligent. however it makes sense to keep the "configuration format" for period, even
        // though there's no way to output the actual config value.
        info!(
            ?elapsed,
            period = %humantime::format_duration(period),
            ?task,
            "task iteration took longer than the configured period"
        );
        BACKGROUND_LOOP_PERIOD_OVERRUN_COUNT
            .with_label_values(&[task.into(), &format!("{}", period.as_secs())])
            .inc();
    }
}
