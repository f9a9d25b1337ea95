use std::sync::Arc;
use std::time::Duration;

/// Gates are used to implement safe shutdown.
///
/// Users of a resource call `enter()` to acquire a [`GateGuard`], and the owner of
/// the resource calls `close()` when they want to ensure that all holders of guards
/// have released them, and that no future guards will be issued.
///
/// Holders of a guard are expected to also watch a `CancellationToken` cancelled before
/// `close()`, otherwise closing can block indefinitely.
#[derive(Debug)]
pub struct Gate {
    sem: Arc<tokio::sync::Semaphore>,
}

/// RAII guard for a [`Gate`]: as long as this exists, calls to [`Gate::close`] will
/// not complete.
#[derive(Debug)]
pub struct GateGuard {
    // Record the span where the gate was entered, so that we can identify who was blocking Gate::close
    span_at_enter: tracing::Span,
    sem: Arc<tokio::sync::Semaphore>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if self.sem.available_permits() == 0 {
            self.span_at_enter
                .in_scope(|| tracing::debug!("released gate while it is being closed"));
        }
        // the permit was forgotten on enter; give it back now
        self.sem.add_permits(1);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("gate is closed")]
    GateClosed,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            sem: Arc::new(tokio::sync::Semaphore::new(Self::MAX_UNITS as usize)),
        }
    }
}

impl Gate {
    const MAX_UNITS: u32 = u32::MAX >> 3;

    /// Acquire a guard that will prevent close() calls from completing. If close()
    /// was already called, this will return an error which should be interpreted
    /// as "shutting down".
    pub fn enter(&self) -> Result<GateGuard, GateError> {
        let permit = self.sem.try_acquire().map_err(|_| GateError::GateClosed)?;
        permit.forget();

        Ok(GateGuard {
            span_at_enter: tracing::Span::current(),
            sem: self.sem.clone(),
        })
    }

    /// Wait for all guards to be dropped, then refuse any further `enter()`.
    ///
    /// Calling this more than once is fine.
    pub async fn close(&self) {
        let started_at = std::time::Instant::now();
        let mut do_close = std::pin::pin!(self.do_close());

        let nag_after = Duration::from_secs(1);
        if tokio::time::timeout(nag_after, &mut do_close).await.is_ok() {
            return;
        }

        tracing::info!(
            elapsed_ms = started_at.elapsed().as_millis(),
            "closing gate is taking longer than expected"
        );
        do_close.await;
        tracing::info!(
            elapsed_ms = started_at.elapsed().as_millis(),
            "close completed"
        );
    }

    /// Whether [`Self::close`] has finished waiting for all users.
    pub fn close_complete(&self) -> bool {
        self.sem.is_closed()
    }

    async fn do_close(&self) {
        match self.sem.acquire_many(Self::MAX_UNITS).await {
            Ok(_permit) => {
                // While holding all units, close the semaphore. All subsequent calls to enter() will fail.
                self.sem.close();
            }
            Err(_closed) => {
                tracing::debug!("double close");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_unused() {
        let gate = Gate::default();
        gate.close().await;
        assert!(gate.close_complete());
    }

    #[tokio::test]
    async fn close_idle() {
        let gate = Gate::default();
        let guard = gate.enter().unwrap();
        drop(guard);
        gate.close().await;

        gate.enter().expect_err("enter should fail after close");
    }

    #[tokio::test(start_paused = true)]
    async fn close_busy_gate() {
        let gate = Gate::default();
        let forever = Duration::from_secs(24 * 7 * 365);

        let guard =
            tracing::info_span!("i am holding back the gate").in_scope(|| gate.enter().unwrap());

        let mut close_fut = std::pin::pin!(gate.close());

        tokio::time::timeout(forever, &mut close_fut)
            .await
            .unwrap_err();

        // a queued close() makes the semaphore unfair towards new entries
        gate.enter()
            .expect_err("enter should fail after entering close");

        drop(guard);
        close_fut.await;

        gate.enter().expect_err("enter should fail finishing close");
    }
}
