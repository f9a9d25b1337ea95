//! Test-only fault injection.
//!
//! Code under test marks interesting points with [`failpoint!`]. In test builds the
//! macro consults the [`Failpoints`] registry of the tenant and either returns an
//! error from the enclosing function or pauses until the test releases it. In other
//! builds it expands to nothing.

/// Named points at which a test can inject a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum FailpointKind {
    /// Ancestor detach: after the tenant-wide detach lock and the timeline locks are taken.
    DetachAfterLocking,
    /// Ancestor detach: after one batch of layers has been prepared and persisted.
    DetachAfterBatch,
    /// Ancestor detach: all layers are prepared, the ancestor link is still in place.
    DetachBeforeAttach,
    /// Ancestor detach: the index without the ancestor link has been uploaded.
    DetachAfterAttach,
    /// Ancestor detach: before a sibling timeline is reparented.
    DetachReparentTimeline,
    /// Ancestor detach: reparenting is done, the saga has not been marked complete.
    DetachBeforeCompletion,
    /// Layer download: bytes are written to the temporary file, before the rename.
    LayerDownloadBeforeRename,
    /// L0 compaction: new layers are uploaded but not yet swapped into the layer map.
    CompactionAfterUpload,
}

/// Marks a fault injection point.
///
/// `$failpoints` is an expression evaluating to a [`Failpoints`] (or a smart pointer to
/// one), `$map_err` turns the hit [`FailpointKind`] into the error returned from the
/// enclosing function. Only evaluated in test builds.
#[macro_export]
macro_rules! failpoint {
    ($failpoints:expr, $kind:ident, $map_err:expr) => {{
        #[cfg(test)]
        {
            if let Some(kind) = $failpoints
                .hit($crate::failpoint_support::FailpointKind::$kind)
                .await
            {
                return Err(($map_err)(kind));
            }
        }
    }};
}

#[cfg(test)]
pub use self::registry::{FailpointAction, Failpoints};

#[cfg(test)]
mod registry {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use tokio::sync::Notify;

    use super::FailpointKind;

    #[derive(Debug, Clone)]
    pub enum FailpointAction {
        /// Every hit returns an error until the failpoint is disarmed.
        ReturnError,
        /// Every hit waits for one `notify_one` on the given `Notify`.
        Pause(Arc<Notify>),
    }

    #[derive(Debug, Default)]
    pub struct Failpoints {
        armed: Mutex<HashMap<FailpointKind, FailpointAction>>,
        hits: Mutex<HashMap<FailpointKind, usize>>,
        hit_notify: Notify,
    }

    impl Failpoints {
        pub fn arm(&self, kind: FailpointKind, action: FailpointAction) {
            self.armed.lock().unwrap().insert(kind, action);
        }

        pub fn disarm(&self, kind: FailpointKind) {
            self.armed.lock().unwrap().remove(&kind);
        }

        pub fn disarm_all(&self) {
            self.armed.lock().unwrap().clear();
        }

        /// How many times the point was passed, armed or not.
        pub fn hit_count(&self, kind: FailpointKind) -> usize {
            self.hits.lock().unwrap().get(&kind).copied().unwrap_or(0)
        }

        /// Waits until the point has been reached at least `count` times.
        pub async fn wait_for_hits(&self, kind: FailpointKind, count: usize) {
            loop {
                let notified = self.hit_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.hit_count(kind) >= count {
                    return;
                }
                notified.await;
            }
        }

        /// Called by [`failpoint!`]; returns the kind if the caller should fail.
        pub async fn hit(&self, kind: FailpointKind) -> Option<FailpointKind> {
            *self.hits.lock().unwrap().entry(kind).or_default() += 1;
            self.hit_notify.notify_waiters();

            let action = self.armed.lock().unwrap().get(&kind).cloned();
            match action {
                None => None,
                Some(FailpointAction::ReturnError) => {
                    tracing::info!("failpoint {kind}: returning error");
                    Some(kind)
                }
                Some(FailpointAction::Pause(notify)) => {
                    tracing::info!("failpoint {kind}: paused");
                    notify.notified().await;
                    tracing::info!("failpoint {kind}: resumed");
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Notify;

    use super::*;

    async fn guarded(fp: &Failpoints) -> Result<u32, FailpointKind> {
        crate::failpoint!(fp, CompactionAfterUpload, |k| k);
        Ok(1)
    }

    #[tokio::test]
    async fn return_error_until_disarmed() {
        let fp = Failpoints::default();
        assert_eq!(guarded(&fp).await, Ok(1));

        fp.arm(FailpointKind::CompactionAfterUpload, FailpointAction::ReturnError);
        assert_eq!(
            guarded(&fp).await,
            Err(FailpointKind::CompactionAfterUpload)
        );
        assert_eq!(
            guarded(&fp).await,
            Err(FailpointKind::CompactionAfterUpload)
        );

        fp.disarm(FailpointKind::CompactionAfterUpload);
        assert_eq!(guarded(&fp).await, Ok(1));
        assert_eq!(fp.hit_count(FailpointKind::CompactionAfterUpload), 4);
    }

    #[tokio::test]
    async fn pause_until_notified() {
        let fp = Arc::new(Failpoints::default());
        let resume = Arc::new(Notify::new());
        fp.arm(
            FailpointKind::CompactionAfterUpload,
            FailpointAction::Pause(resume.clone()),
        );

        let task = tokio::spawn({
            let fp = fp.clone();
            async move { guarded(&fp).await }
        });

        fp.wait_for_hits(FailpointKind::CompactionAfterUpload, 1)
            .await;
        assert!(!task.is_finished());

        resume.notify_one();
        assert_eq!(task.await.unwrap(), Ok(1));
    }
}
