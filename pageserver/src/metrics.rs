use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use metrics::{
    register_histogram_vec, register_int_counter_vec, register_uint_gauge_vec, Histogram,
    HistogramVec, IntCounterVec, UIntGauge, UIntGaugeVec,
};
use once_cell::sync::Lazy;
use strum::IntoEnumIterator;
use utils::id::{TenantId, TimelineId};

/// Prometheus histogram buckets (in seconds) for operations that may take from
/// a millisecond to minutes: flushes, compactions, gc and detaches.
fn get_buckets_for_storage_operations() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0,
    ]
}

/// Operations timed per timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::EnumIter, strum_macros::IntoStaticStr)]
pub enum StorageTimeOperation {
    #[strum(serialize = "layer flush")]
    LayerFlush,
    #[strum(serialize = "compact")]
    Compact,
    #[strum(serialize = "create images")]
    CreateImages,
    #[strum(serialize = "gc")]
    Gc,
    #[strum(serialize = "detach ancestor")]
    DetachAncestor,
}

static STORAGE_TIME_PER_TIMELINE: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "pageserver_storage_operations_seconds",
        "Time spent on storage operations with operation, tenant and timeline dimensions",
        &["operation", "tenant_id", "timeline_id"],
        get_buckets_for_storage_operations(),
    )
    .expect("failed to define a metric")
});

static RESIDENT_PHYSICAL_SIZE: Lazy<UIntGaugeVec> = Lazy::new(|| {
    register_uint_gauge_vec!(
        "pageserver_resident_physical_size",
        "The size of the layer files present in the pageserver's filesystem.",
        &["tenant_id", "timeline_id"]
    )
    .expect("failed to define a metric")
});

static REMOTE_PHYSICAL_SIZE: Lazy<UIntGaugeVec> = Lazy::new(|| {
    register_uint_gauge_vec!(
        "pageserver_remote_physical_size",
        "The size of the layer files of the timeline that are only present in the remote storage.",
        &["tenant_id", "timeline_id"]
    )
    .expect("failed to define a metric")
});

static REMOTE_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pageserver_remote_operations_total",
        "Number of remote storage operations, by file kind, operation kind and outcome",
        &["tenant_id", "timeline_id", "file_kind", "op_kind", "status"]
    )
    .expect("failed to define a metric")
});

pub(crate) static TENANT_TASK_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pageserver_tenant_task_events",
        "Number of task start/stop/fail events.",
        &["event"],
    )
    .expect("Failed to register tenant_task_events metric")
});

pub(crate) static BACKGROUND_LOOP_PERIOD_OVERRUN_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pageserver_background_loop_period_overrun_count",
        "Incremented whenever warn_when_period_overrun() logs a warning.",
        &["task", "period"],
    )
    .expect("failed to define a metric")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::EnumIter, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RemoteOpKind {
    Upload,
    Download,
    Delete,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::EnumIter, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RemoteOpFileKind {
    Layer,
    Index,
}

const REMOTE_OP_STATUSES: [&str; 2] = ["success", "failure"];

pub struct StorageTimeMetricsTimer {
    histogram: Histogram,
    start: Instant,
}

impl StorageTimeMetricsTimer {
    /// Record the time from creation to now.
    pub fn stop_and_record(self) {
        self.histogram
            .observe(self.start.elapsed().as_secs_f64());
    }
}

#[derive(Debug)]
pub struct TimelineMetrics {
    tenant_id: String,
    timeline_id: String,
    storage_time: Vec<Histogram>,
    pub resident_physical_size_gauge: UIntGauge,
    pub remote_physical_size_gauge: UIntGauge,
    shutdown: AtomicBool,
}

impl TimelineMetrics {
    pub fn new(tenant_id: &TenantId, timeline_id: &TimelineId) -> Self {
        let tenant_id = tenant_id.to_string();
        let timeline_id = timeline_id.to_string();

        let storage_time = StorageTimeOperation::iter()
            .map(|op| {
                let op: &'static str = op.into();
                STORAGE_TIME_PER_TIMELINE.with_label_values(&[op, &tenant_id, &timeline_id])
            })
            .collect();
        let resident_physical_size_gauge =
            RESIDENT_PHYSICAL_SIZE.with_label_values(&[&tenant_id, &timeline_id]);
        let remote_physical_size_gauge =
            REMOTE_PHYSICAL_SIZE.with_label_values(&[&tenant_id, &timeline_id]);

        TimelineMetrics {
            tenant_id,
            timeline_id,
            storage_time,
            resident_physical_size_gauge,
            remote_physical_size_gauge,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Starts timing a new operation.
    ///
    /// Note: unlike [`metrics::Histogram::start_timer`] the returned timer does not
    /// record on drop, failed operations are not timed.
    pub fn start_timer(&self, op: StorageTimeOperation) -> StorageTimeMetricsTimer {
        StorageTimeMetricsTimer {
            histogram: self.storage_time[op as usize].clone(),
            start: Instant::now(),
        }
    }

    pub fn remote_operation(&self, file_kind: RemoteOpFileKind, op_kind: RemoteOpKind, ok: bool) {
        let status = if ok {
            REMOTE_OP_STATUSES[0]
        } else {
            REMOTE_OP_STATUSES[1]
        };
        let file_kind: &'static str = file_kind.into();
        let op_kind: &'static str = op_kind.into();
        REMOTE_OPERATIONS
            .with_label_values(&[&self.tenant_id, &self.timeline_id, file_kind, op_kind, status])
            .inc();
    }

    pub fn resident_physical_size_get(&self) -> u64 {
        self.resident_physical_size_gauge.get()
    }

    pub fn remote_physical_size_get(&self) -> u64 {
        self.remote_physical_size_gauge.get()
    }

    /// Removes every label set of this timeline. Gauges handed out earlier keep
    /// working but are no longer exported.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        let tenant_id = &self.tenant_id;
        let timeline_id = &self.timeline_id;

        let _ = RESIDENT_PHYSICAL_SIZE.remove_label_values(&[tenant_id, timeline_id]);
        let _ = REMOTE_PHYSICAL_SIZE.remove_label_values(&[tenant_id, timeline_id]);

        for op in StorageTimeOperation::iter() {
            let op: &'static str = op.into();
            let _ = STORAGE_TIME_PER_TIMELINE.remove_label_values(&[op, tenant_id, timeline_id]);
        }

        for file_kind in RemoteOpFileKind::iter() {
            let file_kind: &'static str = file_kind.into();
            for op_kind in RemoteOpKind::iter() {
                let op_kind: &'static str = op_kind.into();
                for status in REMOTE_OP_STATUSES {
                    let _ = REMOTE_OPERATIONS.remove_label_values(&[
                        tenant_id,
                        timeline_id,
                        file_kind,
                        op_kind,
                        status,
                    ]);
                }
            }
        }
    }
}

impl Drop for TimelineMetrics {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_removes_timeline_label_sets() {
        let tenant_id = TenantId::generate();
        let timeline_id = TimelineId::generate();
        let metrics = TimelineMetrics::new(&tenant_id, &timeline_id);

        metrics.resident_physical_size_gauge.add(10);
        metrics.remote_operation(RemoteOpFileKind::Layer, RemoteOpKind::Upload, true);

        let labels = [tenant_id.to_string(), timeline_id.to_string()];
        let labels = [labels[0].as_str(), labels[1].as_str()];
        assert_eq!(RESIDENT_PHYSICAL_SIZE.with_label_values(&labels).get(), 10);

        metrics.shutdown();

        // a fresh gauge is created for the removed label set
        assert_eq!(RESIDENT_PHYSICAL_SIZE.with_label_values(&labels).get(), 0);
        let _ = RESIDENT_PHYSICAL_SIZE.remove_label_values(&labels);
    }
}
